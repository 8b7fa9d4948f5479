//! Chunk processor - content-type strategy registry
//!
//! Strategies register for one content type with a priority; dispatch picks
//! the lowest priority number registered for the chunk's type. Strategy
//! failures and panics stop at the processor boundary and come back as a
//! result with `success = false`, zero confidence and `[retry, escalate]`.

mod strategies;

pub use strategies::*;

use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dedup::{DedupItem, ResultKind};
use crate::error::{PipelineError, Result};
use crate::swarm::analysis::ContentType;
use crate::swarm::Chunk;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Follow-up suggested by a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    DeepAnalysis,
    ContextAnalysis,
    CrossReference,
    ValidateData,
    ReviewCode,
    Retry,
    Escalate,
}

impl NextAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NextAction::DeepAnalysis => "deep_analysis",
            NextAction::ContextAnalysis => "context_analysis",
            NextAction::CrossReference => "cross_reference",
            NextAction::ValidateData => "validate_data",
            NextAction::ReviewCode => "review_code",
            NextAction::Retry => "retry",
            NextAction::Escalate => "escalate",
        }
    }
}

/// Neighbouring chunk handed to a strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedChunk {
    pub id: String,
    pub summary: String,
    pub keywords: Vec<String>,
}

impl From<&Chunk> for RelatedChunk {
    fn from(chunk: &Chunk) -> Self {
        Self {
            id: chunk.id.clone(),
            summary: chunk.summary.clone(),
            keywords: chunk.keywords.clone(),
        }
    }
}

/// Everything a strategy may look at besides the chunk itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingContext {
    pub worker_id: String,
    /// Results already produced for this document
    pub prior_results: Vec<ProcessingResult>,
    pub related_chunks: Vec<RelatedChunk>,
    pub goals: Vec<String>,
}

impl ProcessingContext {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_goals(mut self, goals: Vec<String>) -> Self {
        self.goals = goals;
        self
    }

    pub fn with_related(mut self, related: Vec<RelatedChunk>) -> Self {
        self.related_chunks = related;
        self
    }

    pub fn with_prior_results(mut self, prior: Vec<ProcessingResult>) -> Self {
        self.prior_results = prior;
        self
    }
}

/// Structured output of one chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub chunk_id: String,
    pub strategy: String,
    pub content_type: ContentType,
    pub success: bool,
    pub analysis: Option<Analysis>,
    /// 0..=1
    pub confidence: f64,
    pub entities: Vec<String>,
    pub summary: String,
    pub key_points: Vec<String>,
    pub next_actions: Vec<NextAction>,
    pub error: Option<String>,
    pub worker_id: String,
    pub processing_ms: u64,
    /// 0..=1, used to pick dedup representatives
    pub quality_score: f64,
}

impl ProcessingResult {
    pub fn failure(chunk: &Chunk, strategy: &str, worker_id: &str, error: impl Into<String>) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            strategy: strategy.to_string(),
            content_type: chunk.content_type,
            success: false,
            analysis: None,
            confidence: 0.0,
            entities: Vec::new(),
            summary: String::new(),
            key_points: Vec::new(),
            next_actions: vec![NextAction::Retry, NextAction::Escalate],
            error: Some(error.into()),
            worker_id: worker_id.to_string(),
            processing_ms: 0,
            quality_score: 0.0,
        }
    }

    /// Dedup view of this result (`ResultKind::Analysis`)
    pub fn to_dedup_item(&self) -> DedupItem {
        let mut text = self.summary.clone();
        for point in &self.key_points {
            text.push(' ');
            text.push_str(point);
        }
        let mut keywords: BTreeSet<String> = self
            .entities
            .iter()
            .map(|e| e.to_lowercase())
            .collect();
        keywords.extend(crate::swarm::analysis::content_terms(&text));

        DedupItem {
            id: self.chunk_id.clone(),
            kind: ResultKind::Analysis,
            content: serde_json::to_value(&self.analysis).unwrap_or(serde_json::Value::Null),
            text,
            keywords: keywords.into_iter().collect(),
            quality_score: self.quality_score,
            reliability: self.confidence,
            latency_ms: self.processing_ms,
            duplicate_group: None,
        }
    }
}

/// What a strategy hands back before the processor scores it
#[derive(Debug, Clone)]
pub struct StrategyOutput {
    pub analysis: Analysis,
    pub entities: Vec<String>,
    pub summary: String,
    pub key_points: Vec<String>,
    /// 0..=1, how much the strategy found; raises confidence
    pub richness: f64,
    pub next_actions: Vec<NextAction>,
}

/// A processing strategy for one content type
pub trait ProcessingStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn content_type(&self) -> ContentType;

    /// Lower numbers win when several strategies claim a type
    fn priority(&self) -> u32;

    fn process(
        &self,
        content: &str,
        ctx: &ProcessingContext,
        processor: &ChunkProcessor,
    ) -> Result<StrategyOutput>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Complexity above which deeper analysis is suggested
const DEEP_ANALYSIS_COMPLEXITY: f64 = 0.7;
/// Related chunks at or above which context analysis is suggested
const CONTEXT_ANALYSIS_RELATED: usize = 3;

pub struct ChunkProcessor {
    strategies: HashMap<ContentType, Vec<Arc<dyn ProcessingStrategy>>>,
}

impl Default for ChunkProcessor {
    fn default() -> Self {
        let mut processor = Self::empty();
        processor.register(Arc::new(TextStrategy));
        processor.register(Arc::new(CodeStrategy));
        processor.register(Arc::new(DataStrategy));
        processor.register(Arc::new(MixedStrategy));
        processor
    }
}

impl ChunkProcessor {
    /// Registry with the built-in text/code/data/mixed strategies
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    pub fn register(&mut self, strategy: Arc<dyn ProcessingStrategy>) {
        let entry = self.strategies.entry(strategy.content_type()).or_default();
        entry.push(strategy);
        entry.sort_by_key(|s| s.priority());
    }

    /// Strategy that handles `content_type`
    pub fn strategy_for(&self, content_type: ContentType) -> Option<&Arc<dyn ProcessingStrategy>> {
        self.strategies.get(&content_type).and_then(|s| s.first())
    }

    pub fn strategy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .strategies
            .values()
            .flatten()
            .map(|s| s.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Run the matching strategy for part of a chunk (used by the mixed
    /// strategy). Panics are caught and reported as errors.
    pub fn process_part(
        &self,
        content_type: ContentType,
        content: &str,
        ctx: &ProcessingContext,
    ) -> Result<StrategyOutput> {
        let strategy = self
            .strategy_for(content_type)
            .ok_or_else(|| PipelineError::invalid(format!("no strategy for {}", content_type)))?;
        run_guarded(strategy.as_ref(), "part", content, ctx, self)
    }

    /// Process a chunk. Never fails: errors come back as a failed result.
    pub fn process(&self, chunk: &Chunk, ctx: &ProcessingContext) -> ProcessingResult {
        let start = Instant::now();
        let Some(strategy) = self.strategy_for(chunk.content_type) else {
            warn!("No strategy registered for {} chunk {}", chunk.content_type, chunk.id);
            return ProcessingResult::failure(
                chunk,
                "none",
                &ctx.worker_id,
                format!("no strategy for {}", chunk.content_type),
            );
        };

        match run_guarded(strategy.as_ref(), &chunk.id, &chunk.content, ctx, self) {
            Ok(output) => {
                let confidence = confidence(chunk.complexity, output.richness);
                let mut next_actions: BTreeSet<NextAction> =
                    output.next_actions.into_iter().collect();
                if chunk.complexity > DEEP_ANALYSIS_COMPLEXITY {
                    next_actions.insert(NextAction::DeepAnalysis);
                }
                if ctx.related_chunks.len() >= CONTEXT_ANALYSIS_RELATED {
                    next_actions.insert(NextAction::ContextAnalysis);
                }
                if shares_entities(&output.entities, &ctx.prior_results) {
                    next_actions.insert(NextAction::CrossReference);
                }

                debug!(
                    "Chunk {} processed by {} (confidence {:.2})",
                    chunk.id,
                    strategy.name(),
                    confidence
                );
                ProcessingResult {
                    chunk_id: chunk.id.clone(),
                    strategy: strategy.name().to_string(),
                    content_type: chunk.content_type,
                    success: true,
                    analysis: Some(output.analysis),
                    confidence,
                    entities: output.entities,
                    summary: output.summary,
                    key_points: output.key_points,
                    next_actions: next_actions.into_iter().collect(),
                    error: None,
                    worker_id: ctx.worker_id.clone(),
                    processing_ms: start.elapsed().as_millis() as u64,
                    quality_score: ((confidence + output.richness) / 2.0).clamp(0.0, 1.0),
                }
            }
            Err(e) => {
                warn!("Strategy {} failed on chunk {}: {}", strategy.name(), chunk.id, e);
                let mut result =
                    ProcessingResult::failure(chunk, strategy.name(), &ctx.worker_id, e.to_string());
                result.processing_ms = start.elapsed().as_millis() as u64;
                result
            }
        }
    }
}

fn run_guarded(
    strategy: &dyn ProcessingStrategy,
    label: &str,
    content: &str,
    ctx: &ProcessingContext,
    processor: &ChunkProcessor,
) -> Result<StrategyOutput> {
    match catch_unwind(AssertUnwindSafe(|| strategy.process(content, ctx, processor))) {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "strategy panicked".to_string());
            Err(PipelineError::ChunkProcessing {
                chunk_id: label.to_string(),
                reason: format!("{} panicked: {}", strategy.name(), reason),
            })
        }
    }
}

/// Base 0.8, minus up to 0.3 for complexity, plus up to 0.15 for richness
pub fn confidence(complexity: f64, richness: f64) -> f64 {
    let penalty = 0.3 * complexity.clamp(0.0, 1.0);
    let bonus = 0.15 * richness.clamp(0.0, 1.0);
    (0.8 - penalty + bonus).clamp(0.0, 1.0)
}

fn shares_entities(entities: &[String], prior: &[ProcessingResult]) -> bool {
    if entities.is_empty() {
        return false;
    }
    let mine: BTreeSet<String> = entities.iter().map(|e| e.to_lowercase()).collect();
    prior
        .iter()
        .flat_map(|r| r.entities.iter())
        .any(|e| mine.contains(&e.to_lowercase()))
}
