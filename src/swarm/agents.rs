//! Swarm agents - workers, tasks and messages
//!
//! Plain data types shared by the coordinator, the message bus and the
//! pipeline engine, plus the atomic counters behind coordination statistics.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Workers
// ============================================================================

/// Registration request for a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Explicit id; a UUID is generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub capabilities: Vec<String>,
    /// Max concurrent tasks
    pub capacity: usize,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, capabilities: &[&str], capacity: usize) -> Self {
        Self {
            id: None,
            name: name.into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            capacity,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A registered worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub capacity: usize,
    /// Always <= capacity
    pub current_load: usize,
    pub available: bool,
    /// Set for specialists derived from another worker
    pub parent_id: Option<String>,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn from_spec(id: String, spec: WorkerSpec) -> Self {
        Self {
            id,
            name: spec.name,
            capabilities: spec.capabilities,
            capacity: spec.capacity,
            current_load: 0,
            available: true,
            parent_id: None,
            completed_tasks: 0,
            failed_tasks: 0,
            registered_at: Utc::now(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.capacity
    }

    /// Eligible for new work: available and below capacity
    pub fn can_accept(&self) -> bool {
        self.available && self.has_capacity()
    }

    pub fn load_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.current_load as f64 / self.capacity as f64
    }
}

// ============================================================================
// Tasks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Holds a unit of worker load
    pub fn is_live(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Allocation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub description: String,
    /// Required capability tags
    pub requirements: Vec<String>,
    /// Higher is more urgent
    pub priority: u8,
    pub estimated_duration_ms: u64,
    /// Task ids that must complete before this task starts
    pub dependencies: Vec<String>,
    pub chunk_id: Option<String>,
    pub document_id: Option<String>,
}

impl TaskRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_requirements(mut self, requirements: &[&str]) -> Self {
        self.requirements = requirements.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimated_duration_ms(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = ms;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn for_chunk(mut self, document_id: &str, chunk_id: &str) -> Self {
        self.document_id = Some(document_id.to_string());
        self.chunk_id = Some(chunk_id.to_string());
        self
    }
}

/// An allocated unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub requirements: Vec<String>,
    pub priority: u8,
    pub estimated_duration_ms: u64,
    pub dependencies: Vec<String>,
    pub chunk_id: Option<String>,
    pub document_id: Option<String>,
    pub assigned_worker: Option<String>,
    pub status: TaskStatus,
    pub reassignments: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_request(id: String, request: TaskRequest) -> Self {
        Self {
            id,
            description: request.description,
            requirements: request.requirements,
            priority: request.priority,
            estimated_duration_ms: request.estimated_duration_ms,
            dependencies: request.dependencies,
            chunk_id: request.chunk_id,
            document_id: request.document_id,
            assigned_worker: None,
            status: TaskStatus::Pending,
            reassignments: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Broadcast,
    Coordination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Processed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Processed => "processed",
            MessageStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub status: MessageStatus,
    /// Retries performed (attempts - 1)
    pub retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        recipients: Vec<String>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipients,
            message_type,
            payload,
            status: MessageStatus::Pending,
            retries: 0,
            last_error: None,
            created_at: Utc::now(),
            delivered_at: None,
        }
    }
}

// ============================================================================
// Swarm Statistics
// ============================================================================

/// Counters tracked by the coordinator
#[derive(Debug, Default)]
pub struct SwarmStats {
    pub workers_registered: AtomicUsize,
    pub tasks_allocated: AtomicUsize,
    pub allocations_rejected: AtomicUsize,
    pub tasks_completed: AtomicUsize,
    pub tasks_failed: AtomicUsize,
    pub tasks_rebalanced: AtomicUsize,
    pub messages_sent: AtomicUsize,
    pub messages_retried: AtomicUsize,
    pub messages_failed: AtomicUsize,
    pub conflicts_resolved: AtomicUsize,
}

impl SwarmStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn to_summary(&self) -> SwarmSummary {
        SwarmSummary {
            workers_registered: self.workers_registered.load(Ordering::Relaxed),
            tasks_allocated: self.tasks_allocated.load(Ordering::Relaxed),
            allocations_rejected: self.allocations_rejected.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_rebalanced: self.tasks_rebalanced.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_retried: self.messages_retried.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of `SwarmStats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmSummary {
    pub workers_registered: usize,
    pub tasks_allocated: usize,
    pub allocations_rejected: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_rebalanced: usize,
    pub messages_sent: usize,
    pub messages_retried: usize,
    pub messages_failed: usize,
    pub conflicts_resolved: usize,
}

/// Load of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLoad {
    pub worker_id: String,
    pub name: String,
    pub load: usize,
    pub capacity: usize,
    pub load_ratio: f64,
    pub available: bool,
}

/// Coordination statistics exposed to the outer system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationStats {
    pub workers: Vec<WorkerLoad>,
    pub total_capacity: usize,
    pub total_load: usize,
    pub tasks_by_status: BTreeMap<String, usize>,
    pub messages_by_status: BTreeMap<String, usize>,
    /// Documents with live tasks on two or more distinct workers
    pub active_collaborations: usize,
    pub counters: SwarmSummary,
}

impl CoordinationStats {
    pub fn utilization(&self) -> f64 {
        if self.total_capacity == 0 {
            return 0.0;
        }
        self.total_load as f64 / self.total_capacity as f64
    }
}
