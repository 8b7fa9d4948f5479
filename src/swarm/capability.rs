//! Capability index - worker vectors and candidate ranking
//!
//! Each worker gets a vector built from its declared capability tags. A task
//! description is embedded the same way and workers are ranked by cosine
//! similarity, restricted to available workers whose tags share at least one
//! term with the task. Ties fall back to overlap count, then registration
//! order, so identical inputs always produce the identical ranking.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::analysis;
use super::embedder::{cosine_similarity, mutate_vector, Embedder, EmbeddingCache};
use crate::error::{PipelineError, Result};

/// Indexed capability profile of one worker
#[derive(Debug, Clone)]
pub struct CapabilityProfile {
    pub worker_id: String,
    pub tags: Vec<String>,
    /// Normalized terms of all tags
    pub tag_terms: BTreeSet<String>,
    pub vector: Vec<f32>,
    /// Registration sequence number
    pub order: u64,
}

/// A ranked candidate worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub worker_id: String,
    pub similarity: f32,
    /// Task terms present in the worker's tags
    pub overlap: usize,
    pub order: u64,
}

/// Normalized term set of capability tags (`"data-analysis"` -> data, analysis)
pub fn tag_terms<S: AsRef<str>>(tags: &[S]) -> BTreeSet<String> {
    tags.iter()
        .flat_map(|t| analysis::terms(t.as_ref()))
        .collect()
}

/// Derived keywords of a task: description content terms plus requirement terms
pub fn task_terms<S: AsRef<str>>(description: &str, requirements: &[S]) -> BTreeSet<String> {
    let mut terms: BTreeSet<String> = analysis::content_terms(description).into_iter().collect();
    terms.extend(tag_terms(requirements));
    terms
}

pub struct CapabilityIndex {
    embedder: Arc<dyn Embedder>,
    cache: EmbeddingCache,
    profiles: RwLock<Vec<CapabilityProfile>>,
    next_order: AtomicU64,
}

impl CapabilityIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            cache: EmbeddingCache::new(),
            profiles: RwLock::new(Vec::new()),
            next_order: AtomicU64::new(0),
        }
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    pub fn backend(&self) -> &str {
        self.embedder.backend()
    }

    /// Vector of a capability tag list
    pub fn tag_vector<S: AsRef<str>>(&self, tags: &[S]) -> Result<Vec<f32>> {
        let terms: Vec<String> = tag_terms(tags).into_iter().collect();
        self.embedder.embed_terms(&terms)
    }

    /// Index a worker from its tags; returns the computed vector
    pub fn register<S: AsRef<str>>(&self, worker_id: &str, tags: &[S]) -> Result<Vec<f32>> {
        let vector = self.tag_vector(tags)?;
        self.insert(worker_id, tags, tag_terms(tags), vector.clone())?;
        Ok(vector)
    }

    /// Index a worker with an explicit vector (derived workers)
    pub fn register_with_vector<S: AsRef<str>>(
        &self,
        worker_id: &str,
        tags: &[S],
        vector: Vec<f32>,
    ) -> Result<()> {
        if vector.len() != self.dimension() {
            return Err(PipelineError::invalid(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                self.dimension()
            )));
        }
        self.insert(worker_id, tags, tag_terms(tags), vector)
    }

    fn insert<S: AsRef<str>>(
        &self,
        worker_id: &str,
        tags: &[S],
        tag_terms: BTreeSet<String>,
        vector: Vec<f32>,
    ) -> Result<()> {
        let mut profiles = self.profiles.write();
        if profiles.iter().any(|p| p.worker_id == worker_id) {
            return Err(PipelineError::invalid(format!(
                "worker {} is already indexed",
                worker_id
            )));
        }

        let order = self.next_order.fetch_add(1, Ordering::Relaxed);

        profiles.push(CapabilityProfile {
            worker_id: worker_id.to_string(),
            tags: tags.iter().map(|t| t.as_ref().to_string()).collect(),
            tag_terms,
            vector,
            order,
        });
        Ok(())
    }

    /// Derive a vector from `parent_id` by bounded perturbation
    pub fn derive_vector(&self, parent_id: &str, rate: f32, seed: u64) -> Result<Vec<f32>> {
        let parent = self
            .vector(parent_id)
            .ok_or_else(|| PipelineError::UnknownWorker(parent_id.to_string()))?;
        let mut rng = StdRng::seed_from_u64(seed);
        Ok(mutate_vector(&parent, rate, &mut rng))
    }

    pub fn remove(&self, worker_id: &str) -> bool {
        let mut profiles = self.profiles.write();
        let before = profiles.len();
        profiles.retain(|p| p.worker_id != worker_id);
        profiles.len() != before
    }

    pub fn vector(&self, worker_id: &str) -> Option<Vec<f32>> {
        self.profiles
            .read()
            .iter()
            .find(|p| p.worker_id == worker_id)
            .map(|p| p.vector.clone())
    }

    pub fn profile(&self, worker_id: &str) -> Option<CapabilityProfile> {
        self.profiles
            .read()
            .iter()
            .find(|p| p.worker_id == worker_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.profiles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.read().is_empty()
    }

    /// Vector of a task description plus requirement tags (cached)
    pub fn task_vector<S: AsRef<str>>(&self, description: &str, requirements: &[S]) -> Result<Vec<f32>> {
        let terms: Vec<String> = task_terms(description, requirements).into_iter().collect();
        let key = terms.join(" ");
        if let Some(vector) = self.cache.get(&key) {
            return Ok(vector);
        }
        let vector = self.embedder.embed_terms(&terms)?;
        self.cache.insert(key, vector.clone());
        Ok(vector)
    }

    /// `task_vector` for async callers. Blocking backends embed on the
    /// blocking pool so no runtime thread waits on the network.
    pub async fn task_vector_async(&self, description: &str, requirements: &[String]) -> Result<Vec<f32>> {
        if !self.embedder.is_blocking() {
            return self.task_vector(description, requirements);
        }
        let terms: Vec<String> = task_terms(description, requirements).into_iter().collect();
        let key = terms.join(" ");
        if let Some(vector) = self.cache.get(&key) {
            return Ok(vector);
        }

        let embedder = Arc::clone(&self.embedder);
        let vector = tokio::task::spawn_blocking(move || embedder.embed_terms(&terms))
            .await
            .map_err(|e| PipelineError::Embedding(format!("embedding task failed: {}", e)))??;
        self.cache.insert(key, vector.clone());
        Ok(vector)
    }

    /// Similarity of one worker to a task description
    pub fn similarity(&self, worker_id: &str, description: &str) -> Result<Option<f32>> {
        let task = self.task_vector::<&str>(description, &[])?;
        Ok(self
            .vector(worker_id)
            .map(|v| cosine_similarity(&task, &v)))
    }

    /// Rank available workers whose tags overlap the task's derived keywords
    pub fn rank<S, F>(&self, description: &str, requirements: &[S], is_available: F) -> Result<Vec<Candidate>>
    where
        S: AsRef<str>,
        F: Fn(&str) -> bool,
    {
        let task_vector = self.task_vector(description, requirements)?;
        Ok(self.rank_with_vector(&task_vector, description, requirements, is_available))
    }

    /// `rank` against a task vector computed beforehand. Never embeds.
    pub fn rank_with_vector<S, F>(
        &self,
        task_vector: &[f32],
        description: &str,
        requirements: &[S],
        is_available: F,
    ) -> Vec<Candidate>
    where
        S: AsRef<str>,
        F: Fn(&str) -> bool,
    {
        let keywords = task_terms(description, requirements);
        let profiles = self.profiles.read();
        let mut candidates: Vec<Candidate> = profiles
            .iter()
            .filter(|p| is_available(&p.worker_id))
            .filter_map(|p| {
                let overlap = p.tag_terms.intersection(&keywords).count();
                (overlap > 0).then(|| Candidate {
                    worker_id: p.worker_id.clone(),
                    similarity: cosine_similarity(task_vector, &p.vector),
                    overlap,
                    order: p.order,
                })
            })
            .collect();
        drop(profiles);

        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.overlap.cmp(&a.overlap))
                .then_with(|| a.order.cmp(&b.order))
        });

        debug!(
            "Ranked {} candidates for task terms {:?}",
            candidates.len(),
            keywords
        );
        candidates
    }

    /// (size, hits, misses) of the task vector cache
    pub fn cache_stats(&self) -> (usize, usize, usize) {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::embedder::HashProjectionEmbedder;

    fn index() -> CapabilityIndex {
        CapabilityIndex::new(Arc::new(HashProjectionEmbedder::new(512, 4)))
    }

    #[test]
    fn test_tag_terms_split() {
        let terms = tag_terms(&["data-analysis", "ML"]);
        assert!(terms.contains("data"));
        assert!(terms.contains("analysis"));
        assert!(terms.contains("ml"));
    }

    #[test]
    fn test_rank_filters_by_overlap() {
        let index = index();
        index.register("coder", &["code", "rust", "review"]).unwrap();
        index.register("writer", &["text", "summary", "prose"]).unwrap();

        let ranked = index
            .rank::<&str, _>("Review rust code for safety issues", &[], |_| true)
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].worker_id, "coder");
        assert_eq!(ranked[0].overlap, 3);
    }

    #[test]
    fn test_rank_filters_unavailable() {
        let index = index();
        index.register("a", &["code"]).unwrap();
        index.register("b", &["code"]).unwrap();

        let ranked = index.rank("anything", &["code"], |id| id != "a").unwrap();
        let ids: Vec<&str> = ranked.iter().map(|c| c.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn test_ties_use_registration_order() {
        let index = index();
        index.register("second", &["data", "statistics"]).unwrap();
        index.register("first", &["statistics", "data"]).unwrap();

        let ranked = index.rank::<&str, _>("data statistics", &[], |_| true).unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].similarity, ranked[1].similarity);
        assert_eq!(ranked[0].worker_id, "second");
        assert_eq!(ranked[1].worker_id, "first");
    }

    #[test]
    fn test_rank_is_deterministic() {
        let index = index();
        index.register("w1", &["text", "analysis"]).unwrap();
        index.register("w2", &["text", "summary"]).unwrap();
        index.register("w3", &["analysis", "code"]).unwrap();

        let first = index.rank("text analysis summary", &["text"], |_| true).unwrap();
        for _ in 0..5 {
            assert_eq!(index.rank("text analysis summary", &["text"], |_| true).unwrap(), first);
        }
        let (_, hits, _) = index.cache_stats();
        assert!(hits >= 5);
    }

    #[tokio::test]
    async fn test_async_task_vector_matches_sync() {
        let index = index();
        index.register("w1", &["text", "summary"]).unwrap();
        let requirements = vec!["text".to_string()];

        let vector = index.task_vector_async("summarize findings", &requirements).await.unwrap();
        assert_eq!(vector, index.task_vector("summarize findings", &requirements).unwrap());
        assert_eq!(
            index.rank_with_vector(&vector, "summarize findings", &requirements, |_| true),
            index.rank("summarize findings", &requirements, |_| true).unwrap()
        );
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let index = index();
        index.register("w1", &["text"]).unwrap();
        assert!(index.register("w1", &["code"]).is_err());
    }

    #[test]
    fn test_derived_vector_close_to_parent() {
        let index = index();
        let parent = index.register("parent", &["text", "analysis"]).unwrap();
        let child = index.derive_vector("parent", 0.02, 42).unwrap();
        assert!(cosine_similarity(&parent, &child) > 0.8);

        // same seed, same child
        assert_eq!(child, index.derive_vector("parent", 0.02, 42).unwrap());
        assert!(index.derive_vector("missing", 0.02, 42).is_err());
    }

    #[test]
    fn test_register_with_vector_checks_dimension() {
        let index = index();
        assert!(index.register_with_vector("w", &["x"], vec![1.0; 3]).is_err());
        assert!(index.register_with_vector("w", &["x"], vec![0.0; 512]).is_ok());
    }

    #[test]
    fn test_remove() {
        let index = index();
        index.register("w1", &["text"]).unwrap();
        assert!(index.remove("w1"));
        assert!(!index.remove("w1"));
        assert!(index.is_empty());
    }
}
