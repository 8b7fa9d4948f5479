//! Validators: pass/fail checks against numeric thresholds
//!
//! A failed validation is a result, not an error. Issues and
//! recommendations explain what fell short.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::swarm::analysis::{self, cached_regex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorKind {
    Accuracy,
    Consistency,
    Completeness,
}

impl ValidatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorKind::Accuracy => "accuracy",
            ValidatorKind::Consistency => "consistency",
            ValidatorKind::Completeness => "completeness",
        }
    }
}

impl fmt::Display for ValidatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a validator runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorScope {
    /// Once per evaluator chunk, then aggregated
    PerChunk,
    /// Once over the whole content
    Document,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub validator: ValidatorKind,
    pub passed: bool,
    pub score: f64,
    pub threshold: f64,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl ValidationResult {
    fn new(validator: ValidatorKind, score: f64, threshold: f64) -> Self {
        let score = score.clamp(0.0, 1.0);
        Self {
            validator,
            passed: score >= threshold,
            score,
            threshold,
            issues: Vec::new(),
            recommendations: Vec::new(),
        }
    }
}

pub trait Validator: Send + Sync {
    fn kind(&self) -> ValidatorKind;

    fn scope(&self) -> ValidatorScope {
        ValidatorScope::PerChunk
    }

    fn validate(&self, content: &str, threshold: f64) -> ValidationResult;
}

// ============================================================================
// Accuracy
// ============================================================================

fn has_figure(sentence: &str) -> bool {
    sentence.chars().any(|c| c.is_ascii_digit())
}

fn citation_count(sentence: &str) -> usize {
    static BRACKET: OnceLock<Option<Regex>> = OnceLock::new();
    static AUTHOR_YEAR: OnceLock<Option<Regex>> = OnceLock::new();
    static URL: OnceLock<Option<Regex>> = OnceLock::new();

    let mut count = 0;
    for (cell, pattern) in [
        (&BRACKET, r"\[\d+(?:[,\-]\s*\d+)*\]"),
        (&AUTHOR_YEAR, r"\([A-Z][A-Za-z\-]+(?: et al\.?)?,? (?:19|20)\d{2}\)"),
        (&URL, r"https?://[^\s)]+"),
    ] {
        if let Some(re) = cached_regex(cell, pattern) {
            count += re.find_iter(sentence).count();
        }
    }

    let lower = sentence.to_lowercase();
    for marker in ["according to", "source:", "reported by", "cited in"] {
        count += lower.matches(marker).count();
    }
    count
}

const CREDIBLE_MARKERS: [&str; 8] = [
    "doi", ".gov", ".edu", "journal", "et al", "peer-reviewed", "university", "institute",
];

/// Share of factual claims carrying a source, weighted with source credibility
pub struct AccuracyValidator;

impl Validator for AccuracyValidator {
    fn kind(&self) -> ValidatorKind {
        ValidatorKind::Accuracy
    }

    fn validate(&self, content: &str, threshold: f64) -> ValidationResult {
        let sentences = analysis::split_sentences(content);
        let factual: Vec<&str> = sentences.iter().copied().filter(|s| has_figure(s)).collect();
        let verified = factual.iter().filter(|s| citation_count(s) > 0).count();
        let cited: Vec<&str> = sentences
            .iter()
            .copied()
            .filter(|s| citation_count(s) > 0)
            .collect();
        let credible = cited
            .iter()
            .filter(|s| {
                let lower = s.to_lowercase();
                CREDIBLE_MARKERS.iter().any(|m| lower.contains(m))
            })
            .count();

        let verified_ratio = if factual.is_empty() {
            1.0
        } else {
            verified as f64 / factual.len() as f64
        };
        let credibility = match (cited.len(), factual.len()) {
            (0, 0) => 1.0,
            (0, _) => 0.0,
            (n, _) => 0.5 + 0.5 * credible as f64 / n as f64,
        };

        let mut result = ValidationResult::new(
            ValidatorKind::Accuracy,
            0.7 * verified_ratio + 0.3 * credibility,
            threshold,
        );
        let unsourced = factual.len() - verified;
        if unsourced > 0 {
            result.issues.push(format!(
                "{} of {} factual claims lack a source",
                unsourced,
                factual.len()
            ));
            result
                .recommendations
                .push("Cite a source for every figure, date and statistic".to_string());
        }
        if !cited.is_empty() && credibility < 0.75 {
            result
                .issues
                .push("Sources are mostly informal or unattributed".to_string());
            result
                .recommendations
                .push("Prefer peer-reviewed or institutional sources".to_string());
        }
        result
    }
}

// ============================================================================
// Consistency
// ============================================================================

const NEGATIONS: [&str; 7] = ["not", "no", "never", "none", "cannot", "isn", "doesn"];
const SEQUENCE_MARKERS: [&str; 6] = ["then", "later", "afterwards", "subsequently", "after", "next"];

fn polarity_and_terms(sentence: &str) -> (bool, Vec<String>) {
    let terms = analysis::terms(sentence);
    let negated = terms.iter().filter(|t| NEGATIONS.contains(&t.as_str())).count() % 2 == 1;
    let content = terms
        .into_iter()
        .filter(|t| !NEGATIONS.contains(&t.as_str()) && !analysis::is_stop_word(t))
        .collect();
    (negated, content)
}

fn years(sentence: &str) -> Vec<u32> {
    static YEAR: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&YEAR, r"\b(1[5-9]\d{2}|20\d{2})\b")
        .map(|re| {
            re.find_iter(sentence)
                .filter_map(|m| m.as_str().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Contradicting statement pairs and out-of-order timelines
pub struct ConsistencyValidator;

impl Validator for ConsistencyValidator {
    fn kind(&self) -> ValidatorKind {
        ValidatorKind::Consistency
    }

    fn validate(&self, content: &str, threshold: f64) -> ValidationResult {
        let sentences = analysis::split_sentences(content);
        let parsed: Vec<(bool, Vec<String>)> =
            sentences.iter().map(|s| polarity_and_terms(s)).collect();

        let mut contradictions = Vec::new();
        for i in 0..parsed.len() {
            for j in (i + 1)..parsed.len() {
                let (neg_a, terms_a) = &parsed[i];
                let (neg_b, terms_b) = &parsed[j];
                if neg_a != neg_b && terms_a.len() >= 2 && analysis::jaccard(terms_a, terms_b) >= 0.8 {
                    contradictions.push((i, j));
                }
            }
        }

        let mut temporal = Vec::new();
        let mut last_year: Option<u32> = None;
        for (i, sentence) in sentences.iter().enumerate() {
            let found = years(sentence);
            let Some(&latest) = found.iter().max() else {
                continue;
            };
            let first = analysis::terms(sentence).into_iter().next().unwrap_or_default();
            if let Some(prev) = last_year {
                if SEQUENCE_MARKERS.contains(&first.as_str()) && latest < prev {
                    temporal.push(i);
                }
            }
            last_year = Some(latest);
        }

        let penalty = 0.25 * (contradictions.len() + temporal.len()) as f64;
        let mut result = ValidationResult::new(ValidatorKind::Consistency, 1.0 - penalty, threshold);
        for (i, j) in &contradictions {
            result.issues.push(format!(
                "Contradiction between \"{}\" and \"{}\"",
                analysis::truncate_chars(sentences[*i], 60),
                analysis::truncate_chars(sentences[*j], 60)
            ));
        }
        for i in &temporal {
            result.issues.push(format!(
                "Timeline goes backwards at \"{}\"",
                analysis::truncate_chars(sentences[*i], 60)
            ));
        }
        if !contradictions.is_empty() {
            result
                .recommendations
                .push("Reconcile contradicting statements".to_string());
        }
        if !temporal.is_empty() {
            result
                .recommendations
                .push("Check the chronological order of events".to_string());
        }
        result
    }
}

// ============================================================================
// Completeness
// ============================================================================

const MAX_HEADING_WORDS: usize = 6;

fn heading_text(text: &str, max_words: usize) -> Option<String> {
    let text = text
        .trim()
        .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.')
        .trim_end_matches(':')
        .trim();
    (!text.is_empty() && analysis::word_count(text) <= max_words).then(|| text.to_lowercase())
}

/// Heading text of a line, lowercased; None for body lines.
///
/// Recognizes `#` headings, numbered headings (`2.1 Methods`), lines that are
/// wholly bold and short `Label:` lines. Setext underlines need the previous
/// line and are handled by `headings`.
fn heading_of(line: &str) -> Option<String> {
    static NUMBERED: OnceLock<Option<Regex>> = OnceLock::new();
    let trimmed = line.trim();

    if trimmed.starts_with('#') {
        return heading_text(trimmed.trim_start_matches('#'), usize::MAX);
    }
    if let Some(inner) = trimmed
        .strip_prefix("**")
        .and_then(|rest| rest.trim_end_matches(':').strip_suffix("**"))
    {
        return heading_text(inner, MAX_HEADING_WORDS);
    }
    if let Some(caps) =
        cached_regex(&NUMBERED, r"^\d+(?:\.\d+)*\.?\s+(\p{Lu}[^.!?]*)$").and_then(|re| re.captures(trimmed))
    {
        return heading_text(caps.get(1).map_or("", |m| m.as_str()), MAX_HEADING_WORDS);
    }
    let label = trimmed.strip_suffix(':')?;
    if label.starts_with(['-', '*', '+']) {
        return None;
    }
    heading_text(label, MAX_HEADING_WORDS)
}

fn is_underline(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() >= 3 && (trimmed.chars().all(|c| c == '=') || trimmed.chars().all(|c| c == '-'))
}

/// All headings of `content`, including setext (`Title` over `=====`)
fn headings(content: &str) -> BTreeSet<String> {
    let lines: Vec<&str> = content.lines().collect();
    let mut found: BTreeSet<String> = lines.iter().filter_map(|line| heading_of(line)).collect();
    for pair in lines.windows(2) {
        if is_underline(pair[1]) && !pair[0].trim().is_empty() && !is_underline(pair[0]) {
            found.extend(heading_text(pair[0], MAX_HEADING_WORDS));
        }
    }
    found
}

/// Required-section presence plus topic depth; judged over the whole content
pub struct CompletenessValidator {
    required_sections: Vec<String>,
    min_words_per_section: usize,
}

impl Default for CompletenessValidator {
    fn default() -> Self {
        Self::new(vec!["introduction".to_string(), "conclusion".to_string()])
    }
}

impl CompletenessValidator {
    pub fn new(required_sections: Vec<String>) -> Self {
        Self {
            required_sections: required_sections
                .into_iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            min_words_per_section: 40,
        }
    }

    pub fn with_min_words(mut self, words: usize) -> Self {
        self.min_words_per_section = words.max(1);
        self
    }

    pub fn required_sections(&self) -> &[String] {
        &self.required_sections
    }
}

impl Validator for CompletenessValidator {
    fn kind(&self) -> ValidatorKind {
        ValidatorKind::Completeness
    }

    fn scope(&self) -> ValidatorScope {
        ValidatorScope::Document
    }

    fn validate(&self, content: &str, threshold: f64) -> ValidationResult {
        let headings = headings(content);
        // A line holding nothing but the section name also counts
        let bare: BTreeSet<String> = content
            .lines()
            .map(|line| line.trim().trim_end_matches(':').trim().to_lowercase())
            .filter(|line| self.required_sections.contains(line))
            .collect();
        let missing: Vec<&String> = self
            .required_sections
            .iter()
            .filter(|section| {
                !bare.contains(*section) && !headings.iter().any(|h| h.starts_with(section.as_str()))
            })
            .collect();

        let section_ratio = if self.required_sections.is_empty() {
            1.0
        } else {
            1.0 - missing.len() as f64 / self.required_sections.len() as f64
        };
        let sections = headings.len().max(1);
        let depth =
            (analysis::word_count(content) as f64 / (sections * self.min_words_per_section) as f64).min(1.0);

        let mut result = ValidationResult::new(
            ValidatorKind::Completeness,
            0.7 * section_ratio + 0.3 * depth,
            threshold,
        );
        result.passed &= missing.is_empty();
        for section in &missing {
            result
                .issues
                .push(format!("Missing required section: {}", section));
            result
                .recommendations
                .push(format!("Add a {} section", section));
        }
        if depth < 0.5 {
            result
                .issues
                .push("Sections cover their topics only briefly".to_string());
            result
                .recommendations
                .push("Expand each section with supporting detail".to_string());
        }
        result
    }
}
