//! Evaluate module - validation, scoring and final result assembly
//!
//! - Content is split into bounded word-count chunks, cached per content id
//! - Validators report pass/fail against thresholds; evaluators report 0-1 metrics
//! - Results are aggregated per validator/evaluator type across chunks

mod metrics;
mod report;
mod validators;

pub use metrics::*;
pub use report::*;
pub use validators::*;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::processor::ProcessingResult;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Words per evaluator chunk
    pub chunk_size: usize,
    pub required_sections: Vec<String>,
    pub accuracy_threshold: f64,
    pub consistency_threshold: f64,
    pub completeness_threshold: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            required_sections: vec!["introduction".to_string(), "conclusion".to_string()],
            accuracy_threshold: 0.7,
            consistency_threshold: 0.8,
            completeness_threshold: 0.8,
        }
    }
}

/// Thresholds to validate against. A validator without a threshold is skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationCriteria {
    pub accuracy: Option<f64>,
    pub consistency: Option<f64>,
    pub completeness: Option<f64>,
    /// Overrides the configured required sections
    pub required_sections: Option<Vec<String>>,
}

impl ValidationCriteria {
    /// All validators with the configured thresholds
    pub fn from_config(config: &EvaluationConfig) -> Self {
        Self {
            accuracy: Some(config.accuracy_threshold),
            consistency: Some(config.consistency_threshold),
            completeness: Some(config.completeness_threshold),
            required_sections: None,
        }
    }

    pub fn with_accuracy(mut self, threshold: f64) -> Self {
        self.accuracy = Some(threshold);
        self
    }

    pub fn with_consistency(mut self, threshold: f64) -> Self {
        self.consistency = Some(threshold);
        self
    }

    pub fn with_completeness(mut self, threshold: f64) -> Self {
        self.completeness = Some(threshold);
        self
    }

    pub fn with_required_sections(mut self, sections: Vec<String>) -> Self {
        self.required_sections = Some(sections);
        self
    }
}

// ============================================================================
// Aggregates
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedValidation {
    pub validator: ValidatorKind,
    /// True only if every chunk passed
    pub passed: bool,
    pub score: f64,
    pub threshold: f64,
    pub chunks: usize,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedEvaluation {
    pub evaluator: MetricKind,
    pub metrics: BTreeMap<String, f64>,
    pub overall: f64,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub chunks: usize,
    /// 1 = highest overall score
    pub rank: usize,
}

fn extend_unique(out: &mut Vec<String>, values: &[String]) {
    for value in values {
        if !out.contains(value) {
            out.push(value.clone());
        }
    }
}

/// Merge per-chunk validations by validator type
pub fn aggregate_validations(results: &[ValidationResult]) -> Vec<AggregatedValidation> {
    let mut merged: BTreeMap<ValidatorKind, AggregatedValidation> = BTreeMap::new();
    for result in results {
        let agg = merged
            .entry(result.validator)
            .or_insert_with(|| AggregatedValidation {
                validator: result.validator,
                passed: true,
                score: 0.0,
                threshold: result.threshold,
                chunks: 0,
                issues: Vec::new(),
                recommendations: Vec::new(),
            });
        agg.passed &= result.passed;
        agg.score += result.score;
        agg.chunks += 1;
        extend_unique(&mut agg.issues, &result.issues);
        extend_unique(&mut agg.recommendations, &result.recommendations);
    }

    merged
        .into_values()
        .map(|mut agg| {
            agg.score /= agg.chunks as f64;
            agg
        })
        .collect()
}

/// Merge per-chunk evaluations by evaluator type and rank by overall score
pub fn aggregate_evaluations(results: &[EvaluationResult]) -> Vec<AggregatedEvaluation> {
    let mut merged: BTreeMap<MetricKind, AggregatedEvaluation> = BTreeMap::new();
    for result in results {
        let agg = merged
            .entry(result.evaluator)
            .or_insert_with(|| AggregatedEvaluation {
                evaluator: result.evaluator,
                metrics: BTreeMap::new(),
                overall: 0.0,
                strengths: Vec::new(),
                weaknesses: Vec::new(),
                chunks: 0,
                rank: 0,
            });
        for (name, value) in &result.metrics {
            *agg.metrics.entry(name.clone()).or_insert(0.0) += value;
        }
        agg.overall += result.overall;
        agg.chunks += 1;
        extend_unique(&mut agg.strengths, &result.strengths);
        extend_unique(&mut agg.weaknesses, &result.weaknesses);
    }

    let mut ranked: Vec<AggregatedEvaluation> = merged
        .into_values()
        .map(|mut agg| {
            let n = agg.chunks as f64;
            agg.overall /= n;
            for value in agg.metrics.values_mut() {
                *value /= n;
            }
            agg
        })
        .collect();
    // Stable sort: equal scores keep evaluator order
    ranked.sort_by(|a, b| {
        b.overall
            .partial_cmp(&a.overall)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for (i, agg) in ranked.iter_mut().enumerate() {
        agg.rank = i + 1;
    }
    ranked
}

// ============================================================================
// Evaluator
// ============================================================================

struct CachedChunks {
    checksum: blake3::Hash,
    chunks: Arc<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Split on line boundaries into pieces of at most `limit` words; a single
/// overlong line is split on words.
pub fn split_for_evaluation(content: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut words = 0;

    for line in content.lines() {
        let line_words: Vec<&str> = line.split_whitespace().collect();
        if line_words.len() > limit {
            if !current.is_empty() {
                chunks.push(current.join("\n"));
                current.clear();
                words = 0;
            }
            for piece in line_words.chunks(limit) {
                chunks.push(piece.join(" "));
            }
            continue;
        }
        if words + line_words.len() > limit && !current.is_empty() {
            chunks.push(current.join("\n"));
            current.clear();
            words = 0;
        }
        words += line_words.len();
        current.push(line);
    }
    if current.iter().any(|l| !l.trim().is_empty()) {
        chunks.push(current.join("\n"));
    }
    chunks
}

pub struct Evaluator {
    config: EvaluationConfig,
    evaluators: Vec<Box<dyn MetricEvaluator>>,
    cache: Mutex<HashMap<String, CachedChunks>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(EvaluationConfig::default())
    }
}

impl Evaluator {
    pub fn new(config: EvaluationConfig) -> Self {
        Self {
            config,
            evaluators: default_evaluators(),
            cache: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_evaluators(mut self, evaluators: Vec<Box<dyn MetricEvaluator>>) -> Self {
        self.evaluators = evaluators;
        self
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Evaluation chunks for `content`, reused while the content is unchanged
    pub fn chunks(&self, content_id: &str, content: &str) -> Arc<Vec<String>> {
        let checksum = blake3::hash(content.as_bytes());
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.get(content_id) {
            if cached.checksum == checksum {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Arc::clone(&cached.chunks);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let chunks = Arc::new(split_for_evaluation(content, self.config.chunk_size));
        debug!("Evaluator chunked {} into {} pieces", content_id, chunks.len());
        cache.insert(
            content_id.to_string(),
            CachedChunks {
                checksum,
                chunks: Arc::clone(&chunks),
            },
        );
        chunks
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.lock().len(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    fn validators(&self, criteria: &ValidationCriteria) -> Vec<(Box<dyn Validator>, f64)> {
        let mut out: Vec<(Box<dyn Validator>, f64)> = Vec::new();
        if let Some(t) = criteria.accuracy {
            out.push((Box::new(AccuracyValidator), t));
        }
        if let Some(t) = criteria.consistency {
            out.push((Box::new(ConsistencyValidator), t));
        }
        if let Some(t) = criteria.completeness {
            let sections = criteria
                .required_sections
                .clone()
                .unwrap_or_else(|| self.config.required_sections.clone());
            out.push((Box::new(CompletenessValidator::new(sections)), t));
        }
        out
    }

    pub fn validate(
        &self,
        content_id: &str,
        content: &str,
        criteria: &ValidationCriteria,
    ) -> Vec<AggregatedValidation> {
        let chunks = self.chunks(content_id, content);
        let mut results = Vec::new();
        for (validator, threshold) in self.validators(criteria) {
            match validator.scope() {
                ValidatorScope::Document => results.push(validator.validate(content, threshold)),
                ValidatorScope::PerChunk => {
                    let per_chunk: Vec<ValidationResult> = chunks
                        .par_iter()
                        .map(|chunk| validator.validate(chunk, threshold))
                        .collect();
                    results.extend(per_chunk);
                }
            }
        }
        aggregate_validations(&results)
    }

    pub fn evaluate(&self, content_id: &str, content: &str) -> Vec<AggregatedEvaluation> {
        let chunks = self.chunks(content_id, content);
        let results: Vec<EvaluationResult> = self
            .evaluators
            .iter()
            .flat_map(|evaluator| {
                chunks
                    .par_iter()
                    .map(|chunk| evaluator.evaluate(chunk))
                    .collect::<Vec<_>>()
            })
            .collect();
        aggregate_evaluations(&results)
    }

    pub fn create_final_result(
        &self,
        content_id: &str,
        validations: Vec<AggregatedValidation>,
        evaluations: Vec<AggregatedEvaluation>,
        synthesized: SynthesizedInfo,
        collected: Vec<ProcessingResult>,
    ) -> FinalResult {
        create_final_result(content_id, validations, evaluations, synthesized, collected)
    }
}
