//! Docswarm Library
//!
//! Document processing pipeline built around a swarm of capability-matched
//! workers: documents are chunked, chunks are routed to workers by
//! capability-vector similarity and load, content-type strategies analyse
//! them, and the merged results are deduplicated, evaluated and delivered.
//!
//! # Features
//!
//! - **Chunking**: Word windows with overlap, content typing, keywords and related-chunk links
//! - **Routing**: Capability vectors from a hash or Ollama embedder, load-aware allocation
//! - **Coordination**: Acknowledged messaging with retry, rebalancing, conflict resolution
//! - **Dedup**: Exact, fuzzy and semantic strategies
//! - **Evaluation**: Validators and metrics aggregated into a final result
//! - **Delivery**: Immediate, scheduled or batched, with retry, in five formats
//!
//! # Example
//!
//! ```no_run
//! use docswarm::{Config, DocumentMetadata, PipelineEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let engine = PipelineEngine::new(&config)?;
//!     for spec in &config.workers {
//!         engine.register_worker(spec.clone())?;
//!     }
//!
//!     let doc_id = engine
//!         .ingest_document("Some long report...", DocumentMetadata::titled("report"))
//!         .await?;
//!     let status = engine.run_document(&doc_id, &[]).await?;
//!
//!     println!("{}% done", status.progress.percentage);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod dedup;
pub mod delivery;
pub mod error;
pub mod evaluate;
pub mod processor;
pub mod swarm;

// Re-export commonly used types
pub use config::Config;
pub use crate::core::{
    Document, DocumentMetadata, DocumentStatus, DocumentStatusReport, PipelineEngine,
    PipelineStore, Progress,
};
pub use dedup::{DedupReport, Deduplicator, SimilarityMethod};
pub use delivery::{
    Channel, DeliveryRecord, DeliveryService, DeliveryStatus, DeliveryType, OutputFormat,
};
pub use error::{PipelineError, Result};
pub use evaluate::{Evaluator, FinalResult, ValidationCriteria};
pub use processor::{ChunkProcessor, ProcessingResult};
pub use swarm::{Chunk, ChunkStatus, Chunker, ContentType, Coordinator, Task, Worker, WorkerSpec};
