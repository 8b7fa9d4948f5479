//! Text analysis primitives shared by the chunker, processors and evaluators
//!
//! Everything here is deterministic and allocation-light:
//! - Word spans that keep trailing whitespace (exact reconstruction)
//! - Term extraction with stop-word removal
//! - Sentence splitting and extractive summaries
//! - Complexity scoring and content-type classification

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// Content Type
// ============================================================================

/// Detected content type of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Code,
    Data,
    Mixed,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Code => "code",
            ContentType::Data => "data",
            ContentType::Mixed => "mixed",
        }
    }

    pub fn all() -> [ContentType; 4] {
        [
            ContentType::Text,
            ContentType::Code,
            ContentType::Data,
            ContentType::Mixed,
        ]
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Words & Terms
// ============================================================================

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "also", "am", "an", "and", "any",
    "are", "as", "at", "be", "because", "been", "before", "being", "below", "between", "both",
    "but", "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few",
    "for", "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers",
    "him", "his", "how", "however", "i", "if", "in", "into", "is", "it", "its", "itself", "just",
    "may", "me", "might", "more", "most", "must", "my", "no", "nor", "not", "now", "of", "off",
    "on", "once", "one", "only", "or", "other", "our", "ours", "out", "over", "own", "same",
    "shall", "she", "should", "so", "some", "such", "than", "that", "the", "their", "theirs",
    "them", "then", "there", "these", "they", "this", "those", "through", "thus", "to", "too",
    "under", "until", "up", "upon", "us", "very", "was", "we", "were", "what", "when", "where",
    "which", "while", "who", "whom", "why", "will", "with", "within", "would", "yet", "you",
    "your", "yours",
];

pub fn is_stop_word(term: &str) -> bool {
    STOP_WORDS.binary_search(&term).is_ok()
}

/// Byte spans of each word in `text`.
///
/// A span covers the word plus its trailing whitespace; the first span also
/// absorbs any leading whitespace. Concatenating every span yields `text`.
pub fn word_spans(text: &str) -> Vec<Range<usize>> {
    let mut starts = Vec::new();
    let mut prev_ws = true;
    for (i, c) in text.char_indices() {
        let ws = c.is_whitespace();
        if !ws && prev_ws {
            starts.push(i);
        }
        prev_ws = ws;
    }

    if starts.is_empty() {
        return Vec::new();
    }
    starts[0] = 0;

    starts
        .iter()
        .enumerate()
        .map(|(k, &start)| {
            let end = starts.get(k + 1).copied().unwrap_or(text.len());
            start..end
        })
        .collect()
}

/// Compile a pattern once per call site; an invalid pattern yields None
pub fn cached_regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Lowercased, NFC-normalized alphanumeric terms in reading order
pub fn terms(text: &str) -> Vec<String> {
    let normalized: String = text.nfc().collect();
    normalized
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Terms worth indexing: length >= 3, not numeric, not a stop word
pub fn content_terms(text: &str) -> Vec<String> {
    terms(text)
        .into_iter()
        .filter(|t| t.chars().count() >= 3)
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !is_stop_word(t))
        .collect()
}

/// Frequency-ranked keywords; ties are broken alphabetically
pub fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for term in content_terms(text) {
        *counts.entry(term).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(t, _)| t).collect()
}

/// Jaccard index of two term lists; 0.0 when both are empty
pub fn jaccard<S: AsRef<str>>(a: &[S], b: &[S]) -> f64 {
    let a: HashSet<&str> = a.iter().map(|s| s.as_ref()).collect();
    let b: HashSet<&str> = b.iter().map(|s| s.as_ref()).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

// ============================================================================
// Sentences & Summaries
// ============================================================================

/// Split into trimmed sentences on terminal punctuation or blank lines
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    let mut iter = text.char_indices().peekable();
    while let Some((i, c)) = iter.next() {
        let boundary = match c {
            '.' | '!' | '?' => iter.peek().map_or(true, |(_, next)| next.is_whitespace()),
            '\n' => iter.peek().map_or(false, |(_, next)| *next == '\n'),
            _ => false,
        };
        if boundary {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if sentence.chars().any(|c| c.is_alphanumeric()) {
                sentences.push(sentence);
            }
            start = end;
        }
    }

    if start < bytes.len() {
        let tail = text[start..].trim();
        if tail.chars().any(|c| c.is_alphanumeric()) {
            sentences.push(tail);
        }
    }

    sentences
}

const SUMMARY_MAX_CHARS: usize = 280;

/// Extractive summary: the `max_sentences` sentences with the highest keyword
/// density, emitted in their original order.
pub fn summarize(text: &str, keywords: &[String], max_sentences: usize) -> String {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return truncate_chars(text.trim(), SUMMARY_MAX_CHARS);
    }

    let keyword_set: HashSet<&str> = keywords.iter().map(String::as_str).collect();
    let mut scored: Vec<(usize, f64)> = sentences
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let words = terms(s);
            if words.is_empty() {
                return (i, 0.0);
            }
            let hits = words
                .iter()
                .filter(|w| keyword_set.contains(w.as_str()))
                .count();
            (i, hits as f64 / words.len() as f64)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    let mut picked: Vec<usize> = scored
        .into_iter()
        .take(max_sentences.max(1))
        .map(|(i, _)| i)
        .collect();
    picked.sort_unstable();

    let summary = picked
        .into_iter()
        .map(|i| sentences[i])
        .collect::<Vec<_>>()
        .join(" ");
    truncate_chars(&summary, SUMMARY_MAX_CHARS)
}

/// Truncate on a char boundary, appending an ellipsis when shortened
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

// ============================================================================
// Complexity
// ============================================================================

/// Deepest bracket or indentation nesting observed
pub fn max_nesting_depth(text: &str) -> usize {
    let mut depth: i64 = 0;
    let mut max_bracket: i64 = 0;
    for c in text.chars() {
        match c {
            '{' | '[' | '(' => {
                depth += 1;
                max_bracket = max_bracket.max(depth);
            }
            '}' | ']' | ')' => depth = (depth - 1).max(0),
            _ => {}
        }
    }

    let max_indent = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let spaces: usize = l
                .chars()
                .take_while(|c| c.is_whitespace())
                .map(|c| if c == '\t' { 4 } else { 1 })
                .sum();
            spaces / 4
        })
        .max()
        .unwrap_or(0);

    (max_bracket as usize).max(max_indent)
}

/// Complexity in [0, 1] from sentence length, vocabulary richness and nesting
pub fn complexity(text: &str) -> f64 {
    let words = terms(text);
    if words.is_empty() {
        return 0.0;
    }

    let sentences = split_sentences(text).len().max(1);
    let avg_sentence = words.len() as f64 / sentences as f64;
    let sentence_signal = (avg_sentence / 40.0).min(1.0);

    let unique: HashSet<&str> = words.iter().map(String::as_str).collect();
    let richness = unique.len() as f64 / words.len() as f64;

    let nesting = (max_nesting_depth(text) as f64 / 5.0).min(1.0);

    (0.4 * sentence_signal + 0.3 * richness + 0.3 * nesting).clamp(0.0, 1.0)
}

// ============================================================================
// Content Classification
// ============================================================================

const CODE_KEYWORDS: &[&str] = &[
    "#include", "async", "await", "class", "const", "def", "elif", "enum", "export", "fn",
    "func", "function", "impl", "import", "lambda", "let", "package", "private", "pub", "public",
    "return", "static", "struct", "try", "var", "void", "=>", "->", "::",
];

const CODE_THRESHOLD: f64 = 0.45;
const DATA_THRESHOLD: f64 = 0.5;

/// Structural signals measured over a block of text
#[derive(Debug, Clone, Default)]
pub struct ContentSignals {
    pub words: usize,
    pub fence_blocks: usize,
    pub fenced_words: usize,
    pub code_score: f64,
    pub data_score: f64,
    pub is_json: bool,
}

impl ContentSignals {
    pub fn measure(text: &str) -> Self {
        let words = word_count(text);
        let trimmed = text.trim();

        let is_json = (trimmed.starts_with('{') || trimmed.starts_with('['))
            && serde_json::from_str::<serde_json::Value>(trimmed).is_ok();

        let (fence_blocks, fenced_words) = fenced_regions(text);

        Self {
            words,
            fence_blocks,
            fenced_words,
            code_score: code_score(text),
            data_score: data_score(text),
            is_json,
        }
    }

    fn block_type(&self) -> ContentType {
        if self.is_json {
            return ContentType::Data;
        }
        if self.fence_blocks > 0 {
            let prose = self.words.saturating_sub(self.fenced_words) as f64;
            return if self.words > 0 && prose / self.words as f64 >= 0.2 {
                ContentType::Mixed
            } else {
                ContentType::Code
            };
        }
        match (
            self.code_score >= CODE_THRESHOLD,
            self.data_score >= DATA_THRESHOLD,
        ) {
            (true, true) => ContentType::Mixed,
            (true, false) => ContentType::Code,
            (false, true) => ContentType::Data,
            (false, false) => ContentType::Text,
        }
    }
}

fn fenced_regions(text: &str) -> (usize, usize) {
    let mut fences: usize = 0;
    let mut inside = false;
    let mut fenced_words = 0;
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            fences += 1;
            inside = !inside;
            continue;
        }
        if inside {
            fenced_words += word_count(line);
        }
    }
    (fences.div_ceil(2), fenced_words)
}

fn code_score(text: &str) -> f64 {
    let non_ws = text.chars().filter(|c| !c.is_whitespace()).count();
    if non_ws == 0 {
        return 0.0;
    }
    let symbols = text.chars().filter(|c| "{}[]();".contains(*c)).count();
    let symbol_density = symbols as f64 / non_ws as f64;

    let tokens: Vec<&str> = text.split_whitespace().collect();
    let keyword_hits = tokens
        .iter()
        .filter(|t| {
            let bare = t.trim_matches(|c: char| c == '(' || c == ')' || c == ':' || c == ',');
            CODE_KEYWORDS.contains(&bare)
        })
        .count();
    let keyword_ratio = keyword_hits as f64 / tokens.len().max(1) as f64;

    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let terminated = lines
        .iter()
        .filter(|l| {
            let l = l.trim_end();
            l.ends_with(';') || l.ends_with('{') || l.ends_with('}') || l.ends_with(':')
        })
        .count();
    let terminator_ratio = terminated as f64 / lines.len().max(1) as f64;

    (symbol_density * 4.0).min(1.0) * 0.4
        + (keyword_ratio * 8.0).min(1.0) * 0.3
        + terminator_ratio * 0.3
}

fn is_numeric_token(token: &str) -> bool {
    let bare = token.trim_matches(|c: char| "$%,;()".contains(c));
    !bare.is_empty() && bare.parse::<f64>().is_ok()
}

fn is_delimited_line(line: &str) -> bool {
    let commas = line.matches(',').count();
    let pipes = line.matches('|').count();
    let tabs = line.matches('\t').count();
    let key_value = line
        .split_once(':')
        .or_else(|| line.split_once('='))
        .map(|(k, v)| {
            let k = k.trim();
            !k.is_empty() && !k.contains(' ') && !v.trim().is_empty()
        })
        .unwrap_or(false);
    (commas >= 2 && word_count(line) <= commas * 3 + 3) || pipes >= 2 || tabs >= 2 || key_value
}

fn data_score(text: &str) -> f64 {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let numeric = tokens.iter().filter(|t| is_numeric_token(t)).count();
    let numeric_ratio = numeric as f64 / tokens.len() as f64;

    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let delimited = lines.iter().filter(|l| is_delimited_line(l)).count();
    let delimited_ratio = delimited as f64 / lines.len().max(1) as f64;

    (numeric_ratio * 1.5).min(1.0) * 0.5 + delimited_ratio * 0.5
}

/// Classify a block of text as text, code, data or mixed
pub fn classify(text: &str) -> ContentType {
    let whole = ContentSignals::measure(text).block_type();
    if whole == ContentType::Mixed || (whole == ContentType::Data && is_json_block(text)) {
        return whole;
    }

    // Paragraph-level check: substantial prose next to a code/data block
    let paragraphs = paragraphs(text);
    if paragraphs.len() < 2 {
        return whole;
    }
    let total = word_count(text).max(1) as f64;
    let mut weights: HashMap<ContentType, f64> = HashMap::new();
    for p in &paragraphs {
        let kind = ContentSignals::measure(p).block_type();
        *weights.entry(kind).or_insert(0.0) += word_count(p) as f64 / total;
    }
    let significant = weights.values().filter(|w| **w >= 0.2).count();
    if significant >= 2 {
        ContentType::Mixed
    } else {
        whole
    }
}

fn is_json_block(text: &str) -> bool {
    ContentSignals::measure(text).is_json
}

fn paragraphs(text: &str) -> Vec<&str> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Split text into homogeneous parts. Fenced blocks become code parts;
/// remaining paragraphs are classified individually and adjacent parts of the
/// same type are merged. Never yields `Mixed`.
pub fn split_homogeneous(text: &str) -> Vec<(ContentType, String)> {
    let mut raw: Vec<(ContentType, String)> = Vec::new();
    let mut prose = String::new();
    let mut code = String::new();
    let mut inside = false;

    let flush_prose = |prose: &mut String, raw: &mut Vec<(ContentType, String)>| {
        for p in paragraphs(prose) {
            let kind = match ContentSignals::measure(p).block_type() {
                ContentType::Mixed => ContentType::Text,
                other => other,
            };
            raw.push((kind, p.to_string()));
        }
        prose.clear();
    };

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            if inside {
                if !code.trim().is_empty() {
                    raw.push((ContentType::Code, code.trim_end().to_string()));
                }
                code.clear();
            } else {
                flush_prose(&mut prose, &mut raw);
            }
            inside = !inside;
            continue;
        }
        let target = if inside { &mut code } else { &mut prose };
        target.push_str(line);
        target.push('\n');
    }
    if inside && !code.trim().is_empty() {
        raw.push((ContentType::Code, code.trim_end().to_string()));
    }
    flush_prose(&mut prose, &mut raw);

    let mut merged: Vec<(ContentType, String)> = Vec::new();
    for (kind, part) in raw {
        match merged.last_mut() {
            Some((last, text)) if *last == kind => {
                text.push_str("\n\n");
                text.push_str(&part);
            }
            _ => merged.push((kind, part)),
        }
    }
    merged
}
