//! Swarm - chunking, capability routing and worker coordination
//!
//! - Analysis: content typing, keywords, summaries, complexity
//! - Chunker: overlap-preserving windows with relationship links
//! - Embedder: capability vectors (hash projection or HTTP model)
//! - Capability: worker index and deterministic candidate ranking
//! - Orchestrator: the coordinator owning worker load and task state
//! - Messaging: at-least-once message bus with per-worker mailboxes
//! - Conflict: priority / load / capability resolution
//! - Heal: retry with backoff and the attempt log

pub mod analysis;
mod agents;
mod capability;
mod chunker;
mod conflict;
mod embedder;
mod heal;
mod messaging;
mod orchestrator;

pub use agents::*;
pub use analysis::ContentType;
pub use capability::*;
pub use chunker::*;
pub use conflict::*;
pub use embedder::*;
pub use heal::*;
pub use messaging::*;
pub use orchestrator::*;
