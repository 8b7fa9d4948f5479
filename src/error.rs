//! Pipeline error taxonomy
//!
//! Expected failure modes (a chunk that fails, a message that exhausts its
//! retries, a delivery that gives up) are reported through status fields.
//! The variants here cover what callers must handle immediately.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no suitable worker for requirements [{}]", requirements.join(", "))]
    NoSuitableWorker { requirements: Vec<String> },

    #[error("message {message_id} could not be delivered: {reason}")]
    MessageDeliveryFailure { message_id: String, reason: String },

    #[error("chunk {chunk_id} failed: {reason}")]
    ChunkProcessing { chunk_id: String, reason: String },

    #[error("delivery via {channel} failed: {reason}")]
    Delivery { channel: String, reason: String },

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("unknown chunk: {0}")]
    UnknownChunk(String),

    #[error("unknown document: {0}")]
    UnknownDocument(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        PipelineError::InvalidRequest(msg.into())
    }

    pub fn transition(
        entity: &'static str,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
    ) -> Self {
        PipelineError::InvalidTransition {
            entity,
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }

    /// True for failures a caller is expected to observe and route around
    /// rather than treat as a programming error.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            PipelineError::NoSuitableWorker { .. }
                | PipelineError::MessageDeliveryFailure { .. }
                | PipelineError::ChunkProcessing { .. }
                | PipelineError::Delivery { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_suitable_worker_message() {
        let err = PipelineError::NoSuitableWorker {
            requirements: vec!["code".into(), "rust".into()],
        };
        assert_eq!(
            err.to_string(),
            "no suitable worker for requirements [code, rust]"
        );
        assert!(err.is_expected());
    }

    #[test]
    fn test_transition_formats_states() {
        let err = PipelineError::transition("task", "Completed", "Assigned");
        assert!(err.to_string().contains("task transition"));
        assert!(!err.is_expected());
    }
}
