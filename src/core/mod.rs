//! Core module - documents and the pipeline engine
//!
//! Contains the document model, the entity store seam, and the engine that
//! drives a document from ingestion to a delivered report.

mod engine;
mod store;

pub use engine::PipelineEngine;
pub use store::{Entity, EntityStore, InMemoryStore, PipelineStore};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::swarm::ChunkStatus;

/// Aggregate processing status of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    #[default]
    Pending,
    Chunking,
    Processing,
    Completed,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Chunking => "chunking",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Error => "error",
        }
    }

    /// Chunking has finished, one way or the other
    pub fn is_chunked(&self) -> bool {
        !matches!(self, DocumentStatus::Pending | DocumentStatus::Chunking)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Error)
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied description of a document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub domain: Option<String>,
    pub doc_type: Option<String>,
    pub extra: HashMap<String, String>,
}

impl DocumentMetadata {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_type(mut self, doc_type: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// An ingested document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// UUID v4
    pub id: String,
    pub title: String,
    pub domain: Option<String>,
    pub doc_type: Option<String>,
    pub word_count: usize,
    pub size_bytes: usize,
    /// blake3 of `content`, hex encoded
    pub checksum: String,
    /// Ingested text with surrounding whitespace trimmed
    pub content: String,
    /// Chunk ids in position order
    pub chunk_ids: Vec<String>,
    pub status: DocumentStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl Document {
    pub fn new(content: &str, metadata: DocumentMetadata) -> Result<Self> {
        let content = content.trim();
        if content.is_empty() {
            return Err(PipelineError::invalid("document content is empty"));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        Ok(Self {
            title: metadata
                .title
                .unwrap_or_else(|| format!("Document {}", &id[..8])),
            id,
            domain: metadata.domain,
            doc_type: metadata.doc_type,
            word_count: crate::swarm::analysis::word_count(content),
            size_bytes: content.len(),
            checksum: blake3::hash(content.as_bytes()).to_hex().to_string(),
            content: content.to_string(),
            chunk_ids: Vec::new(),
            status: DocumentStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
            metadata: metadata.extra,
        })
    }

    pub fn set_status(&mut self, status: DocumentStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Chunk progress of one document
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub processing: usize,
    pub failed: usize,
    pub pending: usize,
    /// Share of chunks in a terminal state, 0..=100
    pub percentage: f64,
}

impl Progress {
    pub fn from_statuses(statuses: impl IntoIterator<Item = ChunkStatus>) -> Self {
        let mut progress = Progress::default();
        for status in statuses {
            progress.total += 1;
            match status {
                ChunkStatus::Pending => progress.pending += 1,
                ChunkStatus::Processing => progress.processing += 1,
                ChunkStatus::Completed => progress.completed += 1,
                ChunkStatus::Error => progress.failed += 1,
            }
        }
        progress.percentage = if progress.total == 0 {
            0.0
        } else {
            (progress.completed + progress.failed) as f64 / progress.total as f64 * 100.0
        };
        progress
    }

    pub fn is_done(&self) -> bool {
        self.total > 0 && self.completed + self.failed == self.total
    }
}

/// Engine-wide queue view
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Chunks of this document waiting for a worker
    pub queued: usize,
    /// Chunks of every document waiting for a worker
    pub queued_total: usize,
    pub available_workers: usize,
    pub free_capacity: usize,
}

/// Answer to a status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStatusReport {
    pub document: Document,
    pub progress: Progress,
    pub queue_status: QueueStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_rejects_blank_content() {
        assert!(Document::new("   \n\t", DocumentMetadata::default()).is_err());
    }

    #[test]
    fn test_document_trims_and_hashes() {
        let doc = Document::new("  hello world \n", DocumentMetadata::titled("greeting")).unwrap();
        assert_eq!(doc.content, "hello world");
        assert_eq!(doc.word_count, 2);
        assert_eq!(doc.title, "greeting");
        assert_eq!(doc.checksum, blake3::hash(b"hello world").to_hex().to_string());
        assert_eq!(doc.status, DocumentStatus::Pending);
    }

    #[test]
    fn test_progress_counts() {
        let progress = Progress::from_statuses([
            ChunkStatus::Completed,
            ChunkStatus::Error,
            ChunkStatus::Processing,
            ChunkStatus::Pending,
        ]);
        assert_eq!(progress.total, 4);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.failed, 1);
        assert!((progress.percentage - 50.0).abs() < 1e-9);
        assert!(!progress.is_done());
    }

    #[test]
    fn test_empty_progress() {
        let progress = Progress::from_statuses([]);
        assert_eq!(progress.percentage, 0.0);
        assert!(!progress.is_done());
    }
}
