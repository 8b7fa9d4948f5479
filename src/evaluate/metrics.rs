//! Metric evaluators: 0-1 scores with strengths and weaknesses
//!
//! Each evaluator reports a handful of named metrics; its overall score is
//! their unweighted mean.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::swarm::analysis;

/// Metrics at or above this are listed as strengths
pub const STRENGTH_AT: f64 = 0.7;
/// Metrics below this are listed as weaknesses
pub const WEAKNESS_BELOW: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Quality,
    Confidence,
    Usefulness,
    Novelty,
    Impact,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Quality => "quality",
            MetricKind::Confidence => "confidence",
            MetricKind::Usefulness => "usefulness",
            MetricKind::Novelty => "novelty",
            MetricKind::Impact => "impact",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub evaluator: MetricKind,
    pub metrics: BTreeMap<String, f64>,
    pub overall: f64,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
}

impl EvaluationResult {
    /// Build from named metrics; each is clamped to [0, 1]
    pub fn from_metrics(evaluator: MetricKind, metrics: &[(&str, f64)]) -> Self {
        let metrics: BTreeMap<String, f64> = metrics
            .iter()
            .map(|(name, v)| (name.to_string(), v.clamp(0.0, 1.0)))
            .collect();
        let overall = if metrics.is_empty() {
            0.0
        } else {
            metrics.values().sum::<f64>() / metrics.len() as f64
        };

        let mut strengths = Vec::new();
        let mut weaknesses = Vec::new();
        for (name, value) in &metrics {
            if *value >= STRENGTH_AT {
                strengths.push(format!("Strong {}", name.replace('_', " ")));
            } else if *value < WEAKNESS_BELOW {
                weaknesses.push(format!("Weak {}", name.replace('_', " ")));
            }
        }

        Self {
            evaluator,
            metrics,
            overall,
            strengths,
            weaknesses,
        }
    }
}

pub trait MetricEvaluator: Send + Sync {
    fn kind(&self) -> MetricKind;

    fn evaluate(&self, content: &str) -> EvaluationResult;
}

/// All built-in evaluators
pub fn default_evaluators() -> Vec<Box<dyn MetricEvaluator>> {
    vec![
        Box::new(QualityEvaluator),
        Box::new(ConfidenceEvaluator),
        Box::new(UsefulnessEvaluator),
        Box::new(NoveltyEvaluator),
        Box::new(ImpactEvaluator),
    ]
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn count_matching(sentences: &[&str], words: &[&str]) -> usize {
    sentences
        .iter()
        .filter(|s| {
            let terms = analysis::terms(s);
            terms.iter().any(|t| words.contains(&t.as_str()))
        })
        .count()
}

// ============================================================================
// Built-in evaluators
// ============================================================================

/// Structure, clarity and grammar
pub struct QualityEvaluator;

impl MetricEvaluator for QualityEvaluator {
    fn kind(&self) -> MetricKind {
        MetricKind::Quality
    }

    fn evaluate(&self, content: &str) -> EvaluationResult {
        let sentences = analysis::split_sentences(content);
        let paragraphs = content.split("\n\n").filter(|p| !p.trim().is_empty()).count();
        let headings = content
            .lines()
            .filter(|l| l.trim_start().starts_with('#'))
            .count();
        let lists = content
            .lines()
            .filter(|l| {
                let t = l.trim_start();
                t.starts_with("- ") || t.starts_with("* ")
            })
            .count();
        let structure = (0.4 * (paragraphs as f64 / 3.0).min(1.0)
            + 0.4 * (headings.min(2) as f64 / 2.0)
            + 0.2 * (lists.min(2) as f64 / 2.0))
            .min(1.0);

        // Sentences of 12-22 words read best
        let avg_len = ratio(analysis::word_count(content), sentences.len());
        let clarity = if sentences.is_empty() {
            0.0
        } else if (12.0..=22.0).contains(&avg_len) {
            1.0
        } else if avg_len < 12.0 {
            (avg_len / 12.0).max(0.3)
        } else {
            (1.0 - (avg_len - 22.0) / 30.0).max(0.0)
        };

        let well_formed = sentences
            .iter()
            .filter(|s| {
                let starts_upper = s.chars().next().map_or(false, |c| !c.is_lowercase());
                let ends_punct = s.ends_with(['.', '!', '?', ':']);
                starts_upper && ends_punct
            })
            .count();
        let grammar = ratio(well_formed, sentences.len());

        EvaluationResult::from_metrics(
            MetricKind::Quality,
            &[("structure", structure), ("clarity", clarity), ("grammar", grammar)],
        )
    }
}

const HEDGES: [&str; 8] = [
    "may", "might", "possibly", "perhaps", "unclear", "allegedly", "likely", "suggests",
];
const VERIFICATION: [&str; 7] = [
    "confirmed", "verified", "measured", "observed", "replicated", "validated", "demonstrated",
];

/// Source presence and verification language
pub struct ConfidenceEvaluator;

impl MetricEvaluator for ConfidenceEvaluator {
    fn kind(&self) -> MetricKind {
        MetricKind::Confidence
    }

    fn evaluate(&self, content: &str) -> EvaluationResult {
        let sentences = analysis::split_sentences(content);
        let lower = content.to_lowercase();
        let sourced = sentences
            .iter()
            .filter(|s| {
                let l = s.to_lowercase();
                l.contains("according to") || l.contains("http") || l.contains('[') || l.contains("source")
            })
            .count();
        let source_presence = (ratio(sourced, sentences.len()) * 2.0).min(1.0);

        let hedged = count_matching(&sentences, &HEDGES);
        let verified = count_matching(&sentences, &VERIFICATION);
        let verification = if lower.trim().is_empty() {
            0.0
        } else {
            (0.5 + 0.5 * ratio(verified, sentences.len()) * 2.0 - 0.5 * ratio(hedged, sentences.len()))
                .clamp(0.0, 1.0)
        };

        EvaluationResult::from_metrics(
            MetricKind::Confidence,
            &[("source_presence", source_presence), ("verification", verification)],
        )
    }
}

const ACTIONABLE: [&str; 9] = [
    "should", "must", "recommend", "recommended", "consider", "use", "avoid", "ensure", "step",
];

/// Actionability and specificity
pub struct UsefulnessEvaluator;

impl MetricEvaluator for UsefulnessEvaluator {
    fn kind(&self) -> MetricKind {
        MetricKind::Usefulness
    }

    fn evaluate(&self, content: &str) -> EvaluationResult {
        let sentences = analysis::split_sentences(content);
        let actionability = (ratio(count_matching(&sentences, &ACTIONABLE), sentences.len()) * 3.0).min(1.0);

        let words = analysis::word_count(content);
        let specific = content
            .split_whitespace()
            .filter(|w| w.chars().any(|c| c.is_ascii_digit()) || w.chars().next().map_or(false, char::is_uppercase))
            .count();
        let specificity = (ratio(specific, words) * 4.0).min(1.0);

        EvaluationResult::from_metrics(
            MetricKind::Usefulness,
            &[("actionability", actionability), ("specificity", specificity)],
        )
    }
}

/// Vocabulary richness and repetition
pub struct NoveltyEvaluator;

impl MetricEvaluator for NoveltyEvaluator {
    fn kind(&self) -> MetricKind {
        MetricKind::Novelty
    }

    fn evaluate(&self, content: &str) -> EvaluationResult {
        let terms = analysis::content_terms(content);
        let unique: HashSet<&String> = terms.iter().collect();
        let richness = ratio(unique.len(), terms.len());

        let sentences = analysis::split_sentences(content);
        let distinct: HashSet<String> = sentences.iter().map(|s| s.to_lowercase()).collect();
        let originality = ratio(distinct.len(), sentences.len());

        EvaluationResult::from_metrics(
            MetricKind::Novelty,
            &[("vocabulary_richness", richness), ("originality", originality)],
        )
    }
}

const SIGNIFICANCE: [&str; 10] = [
    "significant", "significantly", "critical", "major", "key", "substantial", "important",
    "breakthrough", "increase", "decrease",
];

/// Significance language and quantified claims
pub struct ImpactEvaluator;

impl MetricEvaluator for ImpactEvaluator {
    fn kind(&self) -> MetricKind {
        MetricKind::Impact
    }

    fn evaluate(&self, content: &str) -> EvaluationResult {
        let sentences = analysis::split_sentences(content);
        let significance = (ratio(count_matching(&sentences, &SIGNIFICANCE), sentences.len()) * 3.0).min(1.0);
        let quantified = sentences
            .iter()
            .filter(|s| s.chars().any(|c| c.is_ascii_digit()))
            .count();
        let quantification = (ratio(quantified, sentences.len()) * 2.0).min(1.0);

        EvaluationResult::from_metrics(
            MetricKind::Impact,
            &[("significance", significance), ("quantification", quantification)],
        )
    }
}
