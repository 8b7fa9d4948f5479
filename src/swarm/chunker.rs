//! Overlapping word-window chunker
//!
//! Splits a document into windows of at most `max_chunk_size` words, each
//! preceded by up to `overlap_size` words carried over from the prior window.
//! Every chunk gets:
//! - A content type (text/code/data/mixed)
//! - A complexity score in [0, 1]
//! - Frequency-ranked keywords and an extractive summary
//! - Previous/next links and a bounded set of related chunk ids
//!
//! Chunk contents are exact slices of the source, so `reconstruct` gives back
//! the original text byte for byte.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::analysis::{self, ContentType};
use crate::error::{PipelineError, Result};
use crate::processor::ProcessingResult;

// ============================================================================
// Core Types
// ============================================================================

/// Processing sub-state of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Error,
}

impl ChunkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Error)
    }

    fn can_transition_to(&self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Error)
                | (Processing, Pending)
                | (Error, Pending)
        )
    }
}

/// One entry of a chunk's append-only history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHistoryEntry {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub result: Option<String>,
}

/// A chunk of a document with derived metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// `{document_id}:{position}`
    pub id: String,
    pub document_id: String,
    /// 0-based position within the document
    pub position: usize,
    /// Exact slice of the source, overlap included
    pub content: String,
    pub word_count: usize,
    /// Words at the start of `content` shared with the previous chunk
    pub overlap_words: usize,
    pub byte_start: usize,
    pub byte_end: usize,
    pub content_type: ContentType,
    pub complexity: f64,
    pub keywords: Vec<String>,
    pub summary: String,
    /// blake3 of `content`, hex encoded
    pub checksum: String,
    pub previous_chunk_id: Option<String>,
    pub next_chunk_id: Option<String>,
    pub related_chunk_ids: Vec<String>,
    pub status: ChunkStatus,
    pub assigned_worker: Option<String>,
    pub task_id: Option<String>,
    pub result: Option<ProcessingResult>,
    pub error: Option<String>,
    pub history: Vec<ChunkHistoryEntry>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    /// Create a bare chunk; analysis fields are filled by the `Chunker`
    pub fn new(document_id: &str, position: usize, content: String) -> Self {
        let checksum = blake3::hash(content.as_bytes()).to_hex().to_string();
        Self {
            id: format!("{}:{}", document_id, position),
            document_id: document_id.to_string(),
            position,
            word_count: analysis::word_count(&content),
            byte_end: content.len(),
            content,
            overlap_words: 0,
            byte_start: 0,
            content_type: ContentType::Text,
            complexity: 0.0,
            keywords: Vec::new(),
            summary: String::new(),
            checksum,
            previous_chunk_id: None,
            next_chunk_id: None,
            related_chunk_ids: Vec::new(),
            status: ChunkStatus::Pending,
            assigned_worker: None,
            task_id: None,
            result: None,
            error: None,
            history: Vec::new(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Content without the words carried over from the previous chunk
    pub fn body(&self) -> &str {
        if self.overlap_words == 0 {
            return &self.content;
        }
        let spans = analysis::word_spans(&self.content);
        match spans.get(self.overlap_words) {
            Some(span) => &self.content[span.start..],
            None => "",
        }
    }

    /// Append a history entry
    pub fn record(&mut self, agent_id: &str, action: &str, result: Option<String>) {
        self.history.push(ChunkHistoryEntry {
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
            action: action.to_string(),
            result,
        });
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: ChunkStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::transition("chunk", self.status, next));
        }
        self.status = next;
        Ok(())
    }
}

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Maximum new words per chunk
    pub max_chunk_size: usize,
    /// Words carried over from the previous window
    pub overlap_size: usize,
    /// Related chunk ids kept per chunk
    pub related_top_k: usize,
    /// Minimum keyword Jaccard for a relationship
    pub similarity_threshold: f64,
    pub keywords_per_chunk: usize,
    pub summary_sentences: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 500,
            overlap_size: 50,
            related_top_k: 5,
            similarity_threshold: 0.2,
            keywords_per_chunk: 10,
            summary_sentences: 2,
        }
    }
}

impl ChunkConfig {
    pub fn with_window(mut self, max_chunk_size: usize, overlap_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self.overlap_size = overlap_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 {
            return Err(PipelineError::invalid("max_chunk_size must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(PipelineError::invalid(
                "similarity_threshold must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Chunker
// ============================================================================

/// Word range of one chunk before analysis
struct Window {
    position: usize,
    byte_start: usize,
    byte_end: usize,
    words: usize,
    overlap_words: usize,
}

pub struct Chunker {
    config: ChunkConfig,
}

impl Chunker {
    pub fn new(config: ChunkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Split `text` into linked, analyzed chunks owned by `document_id`
    pub fn chunk_document(&self, document_id: &str, text: &str) -> Result<Vec<Chunk>> {
        let spans = analysis::word_spans(text);
        if spans.is_empty() {
            return Err(PipelineError::invalid("document has no content"));
        }

        let windows = self.windows(&spans);
        let mut chunks: Vec<Chunk> = windows
            .par_iter()
            .map(|w| self.build_chunk(document_id, text, w))
            .collect();

        self.link(&mut chunks);

        debug!(
            "Chunked document {} into {} chunks ({} words)",
            document_id,
            chunks.len(),
            spans.len()
        );
        Ok(chunks)
    }

    fn windows(&self, spans: &[std::ops::Range<usize>]) -> Vec<Window> {
        let max = self.config.max_chunk_size.max(1);
        let mut windows = Vec::with_capacity(spans.len() / max + 1);
        let mut body_start = 0;

        while body_start < spans.len() {
            let body_end = (body_start + max).min(spans.len());
            let start = body_start.saturating_sub(self.config.overlap_size);
            windows.push(Window {
                position: windows.len(),
                byte_start: spans[start].start,
                byte_end: spans[body_end - 1].end,
                words: body_end - start,
                overlap_words: body_start - start,
            });
            body_start = body_end;
        }

        windows
    }

    fn build_chunk(&self, document_id: &str, text: &str, window: &Window) -> Chunk {
        let content = text[window.byte_start..window.byte_end].to_string();
        let keywords = analysis::extract_keywords(&content, self.config.keywords_per_chunk);
        let summary = analysis::summarize(&content, &keywords, self.config.summary_sentences);

        let mut chunk = Chunk::new(document_id, window.position, content);
        chunk.word_count = window.words;
        chunk.overlap_words = window.overlap_words;
        chunk.byte_start = window.byte_start;
        chunk.byte_end = window.byte_end;
        chunk.content_type = analysis::classify(&chunk.content);
        chunk.complexity = analysis::complexity(&chunk.content);
        chunk.keywords = keywords;
        chunk.summary = summary;
        chunk
    }

    /// Previous/next links plus top-k related chunks by keyword Jaccard
    fn link(&self, chunks: &mut [Chunk]) {
        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let threshold = self.config.similarity_threshold;
        let top_k = self.config.related_top_k;

        let related: Vec<Vec<String>> = {
            let view: &[Chunk] = chunks;
            (0..view.len())
                .into_par_iter()
                .map(|i| {
                    let mut scored: Vec<(usize, f64)> = (0..view.len())
                        .filter(|&j| j != i)
                        .map(|j| (j, analysis::jaccard(&view[i].keywords, &view[j].keywords)))
                        .filter(|(_, sim)| *sim > threshold)
                        .collect();
                    scored.sort_by(|a, b| {
                        b.1.partial_cmp(&a.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.0.abs_diff(i).cmp(&b.0.abs_diff(i)))
                            .then_with(|| a.0.cmp(&b.0))
                    });
                    scored
                        .into_iter()
                        .take(top_k)
                        .map(|(j, _)| ids[j].clone())
                        .collect()
                })
                .collect()
        };

        let last = chunks.len().saturating_sub(1);
        for (i, (chunk, related)) in chunks.iter_mut().zip(related).enumerate() {
            chunk.previous_chunk_id = (i > 0).then(|| ids[i - 1].clone());
            chunk.next_chunk_id = (i < last).then(|| ids[i + 1].clone());
            chunk.related_chunk_ids = related;
        }
    }
}

// ============================================================================
// Reconstruction
// ============================================================================

/// Number of words at the head of `next` that repeat the tail of `prev`,
/// searching no further than `bound` words.
pub fn boundary_overlap(prev: &str, next: &str, bound: usize) -> usize {
    let p = analysis::word_spans(prev);
    let n = analysis::word_spans(next);
    let max_k = bound.min(p.len()).min(n.len());

    for k in (1..=max_k).rev() {
        let tail = &prev[p[p.len() - k].start..];
        let head = &next[..n[k - 1].end];
        if tail == head {
            return k;
        }
    }
    0
}

/// Rebuild a document from its chunks (any order; sorted by position)
pub fn reconstruct(chunks: &[Chunk]) -> Result<String> {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.position);

    let Some(first) = ordered.first() else {
        return Ok(String::new());
    };

    for (expected, chunk) in ordered.iter().enumerate() {
        if chunk.position != expected {
            return Err(PipelineError::invalid(format!(
                "chunk positions are not contiguous: missing position {}",
                expected
            )));
        }
        if chunk.document_id != first.document_id {
            return Err(PipelineError::invalid(
                "chunks belong to different documents",
            ));
        }
    }

    let mut text = first.content.clone();
    for pair in ordered.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        let k = boundary_overlap(&prev.content, &next.content, next.overlap_words);
        if k == 0 {
            text.push_str(&next.content);
        } else {
            let spans = analysis::word_spans(&next.content);
            text.push_str(&next.content[spans[k - 1].end..]);
        }
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_words(n: usize) -> String {
        (0..n)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn chunker(max: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkConfig::default().with_window(max, overlap)).unwrap()
    }

    #[test]
    fn test_thousand_words_three_chunks() {
        let text = numbered_words(1000);
        let chunks = chunker(400, 100).chunk_document("doc", &text).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].overlap_words, 0);
        assert_eq!(chunks[1].overlap_words, 100);
        assert_eq!(chunks[2].overlap_words, 100);

        // chunk 2 starts with the last 100 words of chunk 1
        let first_words: Vec<&str> = chunks[0].content.split_whitespace().collect();
        let second_words: Vec<&str> = chunks[1].content.split_whitespace().collect();
        assert_eq!(&first_words[300..], &second_words[..100]);
        let third_words: Vec<&str> = chunks[2].content.split_whitespace().collect();
        assert_eq!(&second_words[second_words.len() - 100..], &third_words[..100]);
    }

    #[test]
    fn test_links_and_ids() {
        let text = numbered_words(50);
        let chunks = chunker(20, 5).chunk_document("doc-1", &text).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].id, "doc-1:0");
        assert_eq!(chunks[0].previous_chunk_id, None);
        assert_eq!(chunks[0].next_chunk_id.as_deref(), Some("doc-1:1"));
        assert_eq!(chunks[1].previous_chunk_id.as_deref(), Some("doc-1:0"));
        assert_eq!(chunks[2].next_chunk_id, None);
    }

    #[test]
    fn test_reconstruct_exact() {
        let text = "  Intro line.\n\nSecond   paragraph\twith tabs and    spaces.\nEnd ";
        let chunks = chunker(3, 2).chunk_document("doc", text).unwrap();
        assert!(chunks.len() > 2);
        assert_eq!(reconstruct(&chunks).unwrap(), text);
    }

    #[test]
    fn test_reconstruct_repeated_words() {
        let text = "a a a a a a a";
        let chunks = chunker(2, 1).chunk_document("doc", text).unwrap();
        assert_eq!(reconstruct(&chunks).unwrap(), text);
    }

    #[test]
    fn test_reconstruct_unordered_input() {
        let text = numbered_words(30);
        let mut chunks = chunker(10, 3).chunk_document("doc", &text).unwrap();
        chunks.reverse();
        assert_eq!(reconstruct(&chunks).unwrap(), text);
    }

    #[test]
    fn test_reconstruct_rejects_gaps() {
        let text = numbered_words(30);
        let mut chunks = chunker(10, 3).chunk_document("doc", &text).unwrap();
        chunks.remove(1);
        assert!(reconstruct(&chunks).is_err());
    }

    #[test]
    fn test_empty_document_rejected() {
        assert!(chunker(10, 2).chunk_document("doc", "   \n ").is_err());
    }

    #[test]
    fn test_overlap_larger_than_window() {
        let text = numbered_words(10);
        let chunks = chunker(2, 5).chunk_document("doc", &text).unwrap();
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[1].overlap_words, 2);
        assert_eq!(chunks[4].overlap_words, 5);
        assert_eq!(reconstruct(&chunks).unwrap(), text);
    }

    #[test]
    fn test_body_strips_overlap() {
        let text = numbered_words(10);
        let chunks = chunker(5, 2).chunk_document("doc", &text).unwrap();
        assert_eq!(chunks[1].body(), "word5 word6 word7 word8 word9");
    }

    #[test]
    fn test_related_chunks_bounded() {
        let section = "neural network training gradient descent optimizer loss";
        let other = "medieval castle architecture stone walls towers moat";
        let text = format!("{} {} {} {}", section, other, section, other);
        let config = ChunkConfig {
            related_top_k: 1,
            similarity_threshold: 0.5,
            ..ChunkConfig::default().with_window(7, 0)
        };
        let chunks = Chunker::new(config)
            .unwrap()
            .chunk_document("doc", &text)
            .unwrap();

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].related_chunk_ids, vec!["doc:2".to_string()]);
        assert_eq!(chunks[1].related_chunk_ids, vec!["doc:3".to_string()]);
    }

    #[test]
    fn test_status_transitions() {
        let mut chunk = Chunk::new("doc", 0, "hello world".into());
        assert!(chunk.transition(ChunkStatus::Completed).is_err());
        chunk.transition(ChunkStatus::Processing).unwrap();
        chunk.transition(ChunkStatus::Error).unwrap();
        chunk.transition(ChunkStatus::Pending).unwrap();
        assert_eq!(chunk.status, ChunkStatus::Pending);
    }

    #[test]
    fn test_history_is_append_only() {
        let mut chunk = Chunk::new("doc", 0, "hello world".into());
        chunk.record("worker-1", "assigned", None);
        chunk.record("worker-1", "completed", Some("ok".into()));
        assert_eq!(chunk.history.len(), 2);
        assert_eq!(chunk.history[1].action, "completed");
    }

    #[test]
    fn test_checksum_is_blake3() {
        let chunk = Chunk::new("doc", 0, "abc".into());
        assert_eq!(chunk.checksum, blake3::hash(b"abc").to_hex().to_string());
    }
}
