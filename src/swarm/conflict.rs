//! Conflict resolution over a contested resource
//!
//! Strategies are tried in order; the first one that can single out a
//! worker wins. Capability matching always decides (ties fall back to
//! registration order), so a non-empty claim set is always resolved.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};

/// A worker's claim on a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub worker_id: String,
    /// Higher wins under priority resolution
    pub priority: u8,
}

impl Claim {
    pub fn new(worker_id: impl Into<String>, priority: u8) -> Self {
        Self {
            worker_id: worker_id.into(),
            priority,
        }
    }
}

/// Resource contested by several workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub resource_id: String,
    /// Used for capability matching
    pub description: String,
    pub claims: Vec<Claim>,
}

/// Claim enriched with coordinator state
#[derive(Debug, Clone)]
pub struct Claimant {
    pub worker_id: String,
    pub priority: u8,
    pub load_ratio: f64,
    pub similarity: f32,
    pub order: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    Priority,
    LoadBalancing,
    CapabilityMatching,
}

impl ResolutionStrategy {
    /// Index of the selected claimant, or None when the strategy cannot decide
    fn select(&self, claimants: &[Claimant]) -> Option<usize> {
        match self {
            ResolutionStrategy::Priority => {
                let top = claimants.iter().map(|c| c.priority).max()?;
                unique(claimants, |c| c.priority == top)
            }
            ResolutionStrategy::LoadBalancing => {
                let low = claimants
                    .iter()
                    .map(|c| c.load_ratio)
                    .fold(f64::INFINITY, f64::min);
                unique(claimants, |c| (c.load_ratio - low).abs() < f64::EPSILON)
            }
            ResolutionStrategy::CapabilityMatching => claimants
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.similarity
                        .partial_cmp(&b.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.order.cmp(&a.order))
                })
                .map(|(i, _)| i),
        }
    }
}

fn unique(claimants: &[Claimant], pred: impl Fn(&Claimant) -> bool) -> Option<usize> {
    let mut matches = claimants.iter().enumerate().filter(|(_, c)| pred(c));
    let first = matches.next()?;
    match matches.next() {
        Some(_) => None,
        None => Some(first.0),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub resource_id: String,
    pub worker_id: String,
    pub strategy: ResolutionStrategy,
}

pub struct ConflictResolver {
    strategies: Vec<ResolutionStrategy>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self {
            strategies: vec![
                ResolutionStrategy::Priority,
                ResolutionStrategy::LoadBalancing,
                ResolutionStrategy::CapabilityMatching,
            ],
        }
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategies(strategies: Vec<ResolutionStrategy>) -> Self {
        Self { strategies }
    }

    pub fn resolve(&self, resource_id: &str, claimants: &[Claimant]) -> Result<Resolution> {
        if claimants.is_empty() {
            return Err(PipelineError::invalid(format!(
                "conflict over {} has no claimants",
                resource_id
            )));
        }

        for strategy in &self.strategies {
            if let Some(idx) = strategy.select(claimants) {
                debug!(
                    "Conflict over {} resolved by {:?} -> {}",
                    resource_id, strategy, claimants[idx].worker_id
                );
                return Ok(Resolution {
                    resource_id: resource_id.to_string(),
                    worker_id: claimants[idx].worker_id.clone(),
                    strategy: *strategy,
                });
            }
        }

        Err(PipelineError::invalid(format!(
            "no strategy could resolve conflict over {}",
            resource_id
        )))
    }
}
