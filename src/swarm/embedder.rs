//! Capability embeddings
//!
//! Provides the vectors used for capability routing:
//! - Hash projection (deterministic reference backend, no model required)
//! - Ollama-compatible HTTP backend for real embeddings
//!
//! Hash projection vectors are reproducible and swappable; they carry no
//! semantic guarantee beyond shared terms mapping to shared dimensions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use super::analysis;
use crate::error::{PipelineError, Result};

// ============================================================================
// Embedding Configuration
// ============================================================================

/// Embedding backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderBackend {
    /// Deterministic hash projection
    #[default]
    Hash,
    /// Ollama `/api/embeddings`
    Ollama,
}

/// Configuration for the embedder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    pub backend: EmbedderBackend,
    /// Embedding dimension
    pub dimension: usize,
    /// Hash projections per term
    pub projections: usize,
    /// Model name for HTTP backends
    pub model: String,
    /// Ollama endpoint (default: http://localhost:11434)
    pub ollama_endpoint: String,
    pub timeout_secs: u64,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            backend: EmbedderBackend::Hash,
            dimension: 512,
            projections: 4,
            model: "nomic-embed-text".to_string(),
            ollama_endpoint: "http://localhost:11434".to_string(),
            timeout_secs: 30,
        }
    }
}

// ============================================================================
// Embedder Trait
// ============================================================================

/// Trait for embedding implementations
pub trait Embedder: Send + Sync {
    /// Embed free text (task descriptions)
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a set of terms (capability tags)
    fn embed_terms(&self, terms: &[String]) -> Result<Vec<f32>> {
        self.embed(&terms.join(" "))
    }

    /// Get embedding dimension
    fn dimension(&self) -> usize;

    /// Get backend name
    fn backend(&self) -> &str;

    /// Embedding performs I/O; async callers move it to the blocking pool
    fn is_blocking(&self) -> bool {
        false
    }
}

/// Build the embedder selected by `config`
pub fn embedder_from_config(config: &EmbedderConfig) -> Arc<dyn Embedder> {
    match config.backend {
        EmbedderBackend::Hash => {
            info!(
                "Using hash-projection embedder (dim={}, projections={})",
                config.dimension, config.projections
            );
            Arc::new(HashProjectionEmbedder::new(
                config.dimension,
                config.projections,
            ))
        }
        EmbedderBackend::Ollama => {
            let endpoint = format!(
                "{}/api/embeddings",
                config.ollama_endpoint.trim_end_matches('/')
            );
            info!("Using Ollama embedder at {}", endpoint);
            Arc::new(
                HttpEmbedder::new(&endpoint, &config.model, config.dimension)
                    .with_timeout(Duration::from_secs(config.timeout_secs)),
            )
        }
    }
}

// ============================================================================
// Hash Projection Embedder
// ============================================================================

/// Accumulates a signed hash projection per term, then L2-normalizes
pub struct HashProjectionEmbedder {
    dimension: usize,
    projections: usize,
}

impl HashProjectionEmbedder {
    pub fn new(dimension: usize, projections: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            projections: projections.max(1),
        }
    }
}

impl Embedder for HashProjectionEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_terms(&analysis::content_terms(text))
    }

    fn embed_terms(&self, terms: &[String]) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let weight = 1.0 / self.projections as f32;

        for term in terms {
            for seed in 0..self.projections as u64 {
                let h = xxh3_64_with_seed(term.as_bytes(), seed);
                let idx = (h % self.dimension as u64) as usize;
                let sign = if h >> 63 == 1 { -1.0 } else { 1.0 };
                vector[idx] += sign * weight;
            }
        }

        normalize(&mut vector);
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn backend(&self) -> &str {
        "hash-projection"
    }
}

// ============================================================================
// HTTP Embedder (Ollama compatible)
// ============================================================================

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Embeds through an Ollama-style `/api/embeddings` endpoint. Every call is
/// a blocking HTTP round trip.
pub struct HttpEmbedder {
    endpoint: String,
    model: String,
    dimension: usize,
    agent: ureq::Agent,
}

impl HttpEmbedder {
    pub fn new(endpoint: &str, model: &str, dimension: usize) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            dimension,
            agent: Self::agent(Duration::from_secs(30)),
        }
    }

    fn agent(timeout: Duration) -> ureq::Agent {
        ureq::AgentBuilder::new().timeout(timeout).build()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = Self::agent(timeout);
        self
    }
}

impl Embedder for HttpEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };
        let response: EmbeddingResponse = self
            .agent
            .post(&self.endpoint)
            .send_json(&request)
            .map_err(|e| PipelineError::Embedding(format!("{} unreachable: {}", self.endpoint, e)))?
            .into_json()
            .map_err(|e| PipelineError::Embedding(format!("malformed reply from {}: {}", self.endpoint, e)))?;

        let mut vector = response.embedding;
        if vector.len() != self.dimension {
            return Err(PipelineError::Embedding(format!(
                "{} returned {} dimensions, routing index uses {}",
                self.model,
                vector.len(),
                self.dimension
            )));
        }
        normalize(&mut vector);
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn backend(&self) -> &str {
        "http-ollama"
    }

    fn is_blocking(&self) -> bool {
        true
    }
}

// ============================================================================
// Task Vector Cache
// ============================================================================

/// Task vectors keyed by their sorted term list. Routing the same content
/// type with the same keywords reuses the vector instead of re-embedding.
#[derive(Default)]
pub struct EmbeddingCache {
    vectors: RwLock<HashMap<String, Vec<f32>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached vector for `key`; counts a hit or a miss
    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let found = self.vectors.read().get(key).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn insert(&self, key: String, vector: Vec<f32>) {
        self.vectors.write().insert(key, vector);
    }

    /// (size, hits, misses)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.vectors.read().len(),
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn clear(&self) {
        self.vectors.write().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

// ============================================================================
// Vector Utilities
// ============================================================================

/// Scale to unit length; zero vectors are left untouched
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine of the angle between `a` and `b`; 0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let (dot, aa, bb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, aa, bb), (x, y)| {
            (dot + x * y, aa + x * x, bb + y * y)
        });
    let denominator = (aa * bb).sqrt();
    if denominator > 0.0 {
        dot / denominator
    } else {
        0.0
    }
}

/// Perturb each dimension by uniform noise in `[-rate, rate]`, then re-normalize
pub fn mutate_vector<R: Rng>(parent: &[f32], rate: f32, rng: &mut R) -> Vec<f32> {
    let rate = rate.abs();
    let mut child: Vec<f32> = parent
        .iter()
        .map(|v| {
            if rate > 0.0 {
                v + rng.random_range(-rate..=rate)
            } else {
                *v
            }
        })
        .collect();
    normalize(&mut child);
    child
}
