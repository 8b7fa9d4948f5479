//! Swarm Coordinator - single point of truth for workers, tasks and load
//!
//! The coordinator:
//! - Registers workers and indexes their capability vectors
//! - Allocates tasks to the best-scoring worker with free capacity
//! - Tracks the task state machine and releases load on completion/failure
//! - Rebalances assigned-but-not-started tasks away from overloaded workers
//! - Resolves conflicts and relays messages through the message bus
//!
//! All load mutation happens under one state lock, so `load <= capacity`
//! holds after every operation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::agents::*;
use super::capability::{tag_terms, CapabilityIndex};
use super::conflict::{Claimant, Conflict, ConflictResolver, Resolution};
use super::embedder::Embedder;
use super::heal::{HealLog, RetryPolicy};
use super::messaging::{MessageBus, MessageTransport};
use crate::error::{PipelineError, Result};

/// Sender id used for coordinator-originated messages
pub const COORDINATOR_ID: &str = "coordinator";

// ============================================================================
// Coordinator Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Message retries after the first attempt
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Load ratio above which a worker sheds tasks
    pub overload_threshold: f64,
    /// Load ratio below which a worker receives shed tasks
    pub underload_threshold: f64,
    /// Weight of the load ratio in the allocation score
    pub load_weight: f64,
    /// Per-dimension perturbation for specialist vectors
    pub mutation_rate: f32,
    pub rebalance_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            overload_threshold: 0.8,
            underload_threshold: 0.3,
            load_weight: 0.5,
            mutation_rate: 0.05,
            rebalance_interval_ms: 30_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay_ms: self.initial_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }

    pub fn with_thresholds(mut self, overload: f64, underload: f64) -> Self {
        self.overload_threshold = overload;
        self.underload_threshold = underload;
        self
    }

    pub fn with_retry(mut self, max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.initial_delay_ms = initial_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }
}

// ============================================================================
// Rebalance Report
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMove {
    pub task_id: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub overloaded: Vec<String>,
    pub underloaded: Vec<String>,
    pub moves: Vec<TaskMove>,
}

// ============================================================================
// Coordinator
// ============================================================================

#[derive(Default)]
struct CoordinatorState {
    workers: HashMap<String, Worker>,
    /// Registration order
    worker_order: Vec<String>,
    tasks: HashMap<String, Task>,
    task_order: Vec<String>,
    watchers: HashMap<String, watch::Sender<TaskStatus>>,
}

impl CoordinatorState {
    fn worker_mut(&mut self, worker_id: &str) -> Result<&mut Worker> {
        self.workers
            .get_mut(worker_id)
            .ok_or_else(|| PipelineError::UnknownWorker(worker_id.to_string()))
    }

    fn task_mut(&mut self, task_id: &str) -> Result<&mut Task> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| PipelineError::UnknownTask(task_id.to_string()))
    }

    fn publish(&self, task_id: &str, status: TaskStatus) {
        if let Some(tx) = self.watchers.get(task_id) {
            tx.send_replace(status);
        }
    }

    fn ratio(&self, worker_id: &str) -> f64 {
        self.workers.get(worker_id).map_or(0.0, Worker::load_ratio)
    }

    fn release(&mut self, worker_id: &str) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.current_load = worker.current_load.saturating_sub(1);
        }
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    index: CapabilityIndex,
    state: Mutex<CoordinatorState>,
    bus: Arc<MessageBus>,
    resolver: ConflictResolver,
    stats: Arc<SwarmStats>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, embedder: Arc<dyn Embedder>, log: Arc<HealLog>) -> Self {
        let stats = Arc::new(SwarmStats::new());
        let bus = MessageBus::new(config.retry_policy(), Arc::clone(&stats)).with_log(log);
        Self {
            config,
            index: CapabilityIndex::new(embedder),
            state: Mutex::new(CoordinatorState::default()),
            bus: Arc::new(bus),
            resolver: ConflictResolver::new(),
            stats,
        }
    }

    /// Route messages through `transport` instead of the in-process
    /// mailboxes. Call before registering workers.
    pub fn with_transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        let bus = MessageBus::new(self.config.retry_policy(), Arc::clone(&self.stats))
            .with_log(Arc::clone(self.bus.log()))
            .with_transport(transport);
        self.bus = Arc::new(bus);
        self
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn index(&self) -> &CapabilityIndex {
        &self.index
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn heal_log(&self) -> &Arc<HealLog> {
        self.bus.log()
    }

    // ------------------------------------------------------------------------
    // Worker registry
    // ------------------------------------------------------------------------

    pub fn register_worker(&self, spec: WorkerSpec) -> Result<String> {
        validate_spec(&spec)?;
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let vector = self.index.tag_vector(&spec.capabilities)?;

        let mut state = self.state.lock();
        if state.workers.contains_key(&id) {
            return Err(PipelineError::invalid(format!("worker {} already registered", id)));
        }
        self.index
            .register_with_vector(&id, &spec.capabilities, vector)?;

        let worker = Worker::from_spec(id.clone(), spec);
        info!(
            "🐝 Worker {} ({}) registered: capacity {}, capabilities [{}]",
            worker.name,
            id,
            worker.capacity,
            worker.capabilities.join(", ")
        );
        state.workers.insert(id.clone(), worker);
        state.worker_order.push(id.clone());
        drop(state);

        self.bus.mailboxes().open(&id);
        SwarmStats::incr(&self.stats.workers_registered);
        Ok(id)
    }

    /// Register a worker whose vector is a perturbed copy of `parent_id`'s.
    /// An empty capability list inherits the parent's tags.
    pub fn spawn_specialist(&self, parent_id: &str, mut spec: WorkerSpec) -> Result<String> {
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut state = self.state.lock();
        let parent = state
            .workers
            .get(parent_id)
            .ok_or_else(|| PipelineError::UnknownWorker(parent_id.to_string()))?;
        if spec.capabilities.is_empty() {
            spec.capabilities = parent.capabilities.clone();
        }
        validate_spec(&spec)?;
        if state.workers.contains_key(&id) {
            return Err(PipelineError::invalid(format!("worker {} already registered", id)));
        }

        let vector = self.index.derive_vector(
            parent_id,
            self.config.mutation_rate,
            xxh3_64(id.as_bytes()),
        )?;
        self.index
            .register_with_vector(&id, &spec.capabilities, vector)?;

        let mut worker = Worker::from_spec(id.clone(), spec);
        worker.parent_id = Some(parent_id.to_string());
        info!("🐝 Specialist {} derived from {}", id, parent_id);
        state.workers.insert(id.clone(), worker);
        state.worker_order.push(id.clone());
        drop(state);

        self.bus.mailboxes().open(&id);
        SwarmStats::incr(&self.stats.workers_registered);
        Ok(id)
    }

    /// Remove a worker; its live tasks fail. Returns the failed task ids.
    pub fn unregister_worker(&self, worker_id: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        if state.workers.remove(worker_id).is_none() {
            return Err(PipelineError::UnknownWorker(worker_id.to_string()));
        }
        state.worker_order.retain(|id| id != worker_id);
        self.index.remove(worker_id);

        let orphaned: Vec<String> = state
            .task_order
            .iter()
            .filter(|id| {
                state.tasks.get(*id).is_some_and(|t| {
                    t.status.is_live() && t.assigned_worker.as_deref() == Some(worker_id)
                })
            })
            .cloned()
            .collect();

        let now = Utc::now();
        for task_id in &orphaned {
            if let Some(task) = state.tasks.get_mut(task_id) {
                task.status = TaskStatus::Failed;
                task.error = Some(format!("worker {} unregistered", worker_id));
                task.completed_at = Some(now);
            }
            state.publish(task_id, TaskStatus::Failed);
            SwarmStats::incr(&self.stats.tasks_failed);
        }
        drop(state);

        let undelivered = self.bus.mailboxes().close(worker_id);
        info!(
            "Worker {} unregistered ({} tasks failed, {} messages dropped from mailbox)",
            worker_id,
            orphaned.len(),
            undelivered.len()
        );
        Ok(orphaned)
    }

    pub fn set_availability(&self, worker_id: &str, available: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.worker_mut(worker_id)?.available = available;
        debug!("Worker {} availability -> {}", worker_id, available);
        Ok(())
    }

    pub fn worker(&self, worker_id: &str) -> Option<Worker> {
        self.state.lock().workers.get(worker_id).cloned()
    }

    /// All workers in registration order
    pub fn workers(&self) -> Vec<Worker> {
        let state = self.state.lock();
        state
            .worker_order
            .iter()
            .filter_map(|id| state.workers.get(id).cloned())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    /// Best worker by similarity discounted by load, among available
    /// workers with capacity whose tags overlap the task. `task_vector` is
    /// embedded before the state lock is taken.
    fn pick_worker(
        &self,
        state: &CoordinatorState,
        task_vector: &[f32],
        description: &str,
        requirements: &[String],
        exclude: Option<&str>,
    ) -> Option<String> {
        let candidates = self
            .index
            .rank_with_vector(task_vector, description, requirements, |id| {
                exclude != Some(id) && state.workers.get(id).is_some_and(Worker::can_accept)
            });

        let mut best: Option<(&str, f64)> = None;
        for candidate in &candidates {
            let Some(worker) = state.workers.get(&candidate.worker_id) else {
                continue;
            };
            let similarity = f64::from(candidate.similarity.max(0.0));
            let score = similarity * (1.0 - worker.load_ratio() * self.config.load_weight);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((candidate.worker_id.as_str(), score));
            }
        }
        best.map(|(id, _)| id.to_string())
    }

    fn check_dependencies(state: &CoordinatorState, dependencies: &[String]) -> Result<()> {
        for dep in dependencies {
            if !state.tasks.contains_key(dep) {
                return Err(PipelineError::UnknownTask(dep.clone()));
            }
        }
        Ok(())
    }

    fn assign_locked(&self, state: &mut CoordinatorState, worker_id: &str, request: TaskRequest) -> Result<Task> {
        let worker = state.worker_mut(worker_id)?;
        if !worker.can_accept() {
            return Err(PipelineError::NoSuitableWorker {
                requirements: request.requirements,
            });
        }
        worker.current_load += 1;

        let mut task = Task::from_request(uuid::Uuid::new_v4().to_string(), request);
        task.status = TaskStatus::Assigned;
        task.assigned_worker = Some(worker_id.to_string());
        task.assigned_at = Some(Utc::now());

        let (tx, _) = watch::channel(TaskStatus::Assigned);
        state.watchers.insert(task.id.clone(), tx);
        state.task_order.push(task.id.clone());
        state.tasks.insert(task.id.clone(), task.clone());
        SwarmStats::incr(&self.stats.tasks_allocated);
        Ok(task)
    }

    /// Allocate a task to the best-matching worker.
    ///
    /// Fails with `NoSuitableWorker` (and creates nothing) when no available
    /// worker with free capacity shares a capability term with the task.
    pub async fn allocate_task(&self, request: TaskRequest) -> Result<String> {
        let task_vector = self
            .index
            .task_vector_async(&request.description, &request.requirements)
            .await?;
        let task = {
            let mut state = self.state.lock();
            Self::check_dependencies(&state, &request.dependencies)?;

            let chosen = self.pick_worker(
                &state,
                &task_vector,
                &request.description,
                &request.requirements,
                None,
            );
            let Some(worker_id) = chosen else {
                SwarmStats::incr(&self.stats.allocations_rejected);
                debug!("No worker for task '{}'", request.description);
                return Err(PipelineError::NoSuitableWorker {
                    requirements: request.requirements,
                });
            };
            self.assign_locked(&mut state, &worker_id, request)?
        };

        self.notify_assignment(&task).await;
        Ok(task.id)
    }

    /// Allocate directly to `worker_id` (pull model)
    pub async fn allocate_task_to(&self, worker_id: &str, request: TaskRequest) -> Result<String> {
        let task = {
            let mut state = self.state.lock();
            Self::check_dependencies(&state, &request.dependencies)?;
            self.assign_locked(&mut state, worker_id, request)?
        };

        self.notify_assignment(&task).await;
        Ok(task.id)
    }

    async fn notify_assignment(&self, task: &Task) {
        let Some(worker_id) = task.assigned_worker.clone() else {
            return;
        };
        let message = Message::new(
            COORDINATOR_ID,
            vec![worker_id],
            MessageType::Request,
            json!({
                "event": "task_assigned",
                "task_id": task.id,
                "description": task.description,
                "chunk_id": task.chunk_id,
                "priority": task.priority,
            }),
        );
        if let Err(e) = self.bus.send(message).await {
            warn!("Assignment notice for task {} not sent: {}", task.id, e);
        }
    }

    // ------------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------------

    pub fn start_task(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get(task_id)
            .ok_or_else(|| PipelineError::UnknownTask(task_id.to_string()))?;
        if task.status != TaskStatus::Assigned {
            return Err(PipelineError::transition("task", task.status, TaskStatus::InProgress));
        }
        for dep in &task.dependencies {
            let done = state
                .tasks
                .get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed);
            if !done {
                return Err(PipelineError::invalid(format!(
                    "task {} depends on unfinished task {}",
                    task_id, dep
                )));
            }
        }

        let task = state.task_mut(task_id)?;
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        state.publish(task_id, TaskStatus::InProgress);
        Ok(())
    }

    fn finish(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let task = state.task_mut(task_id)?;
        if !task.status.is_live() {
            return Err(PipelineError::transition("task", task.status, status));
        }
        task.status = status;
        task.result = result;
        task.error = error;
        task.completed_at = Some(Utc::now());
        if task.started_at.is_none() {
            task.started_at = task.completed_at;
        }
        let worker_id = task.assigned_worker.clone();

        if let Some(worker_id) = worker_id {
            state.release(&worker_id);
            if let Some(worker) = state.workers.get_mut(&worker_id) {
                match status {
                    TaskStatus::Completed => worker.completed_tasks += 1,
                    _ => worker.failed_tasks += 1,
                }
            }
        }
        state.publish(task_id, status);
        Ok(())
    }

    pub fn complete_task(&self, task_id: &str, result: Option<serde_json::Value>) -> Result<()> {
        self.finish(task_id, TaskStatus::Completed, result, None)?;
        SwarmStats::incr(&self.stats.tasks_completed);
        Ok(())
    }

    pub fn fail_task(&self, task_id: &str, error: &str) -> Result<()> {
        self.finish(task_id, TaskStatus::Failed, None, Some(error.to_string()))?;
        SwarmStats::incr(&self.stats.tasks_failed);
        warn!("Task {} failed: {}", task_id, error);
        Ok(())
    }

    /// Move an assigned (not started) task. With no target the best other
    /// eligible worker is chosen. Returns the new worker id.
    pub async fn reassign_task(&self, task_id: &str, target: Option<&str>) -> Result<String> {
        let task_vector = match target {
            Some(_) => None,
            None => {
                let (description, requirements) = self
                    .task(task_id)
                    .map(|t| (t.description, t.requirements))
                    .ok_or_else(|| PipelineError::UnknownTask(task_id.to_string()))?;
                Some(self.index.task_vector_async(&description, &requirements).await?)
            }
        };
        let task = {
            let mut state = self.state.lock();
            let task = state
                .tasks
                .get(task_id)
                .ok_or_else(|| PipelineError::UnknownTask(task_id.to_string()))?;
            if task.status != TaskStatus::Assigned {
                return Err(PipelineError::transition("task", task.status, TaskStatus::Assigned));
            }
            let current = task.assigned_worker.clone().unwrap_or_default();

            let destination = match target {
                Some(id) => {
                    let worker = state
                        .workers
                        .get(id)
                        .ok_or_else(|| PipelineError::UnknownWorker(id.to_string()))?;
                    (id != current && worker.can_accept()).then(|| id.to_string())
                }
                None => task_vector.as_deref().and_then(|vector| {
                    self.pick_worker(
                        &state,
                        vector,
                        &task.description,
                        &task.requirements,
                        Some(current.as_str()),
                    )
                }),
            };
            let Some(destination) = destination else {
                return Err(PipelineError::NoSuitableWorker {
                    requirements: task.requirements.clone(),
                });
            };

            Self::move_locked(&mut state, task_id, &current, &destination)?
        };

        self.notify_assignment(&task).await;
        Ok(task.assigned_worker.unwrap_or_default())
    }

    fn move_locked(state: &mut CoordinatorState, task_id: &str, from: &str, to: &str) -> Result<Task> {
        state.worker_mut(to)?.current_load += 1;
        state.release(from);
        let task = state.task_mut(task_id)?;
        task.assigned_worker = Some(to.to_string());
        task.assigned_at = Some(Utc::now());
        task.reassignments += 1;
        Ok(task.clone())
    }

    /// Await a task's terminal state
    pub async fn wait_for_task(&self, task_id: &str) -> Result<Task> {
        let mut rx = {
            let state = self.state.lock();
            let tx = state
                .watchers
                .get(task_id)
                .ok_or_else(|| PipelineError::UnknownTask(task_id.to_string()))?;
            tx.subscribe()
        };

        while !rx.borrow_and_update().is_terminal() {
            if rx.changed().await.is_err() {
                break;
            }
        }

        self.task(task_id)
            .ok_or_else(|| PipelineError::UnknownTask(task_id.to_string()))
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.state.lock().tasks.get(task_id).cloned()
    }

    /// Tasks in allocation order
    pub fn tasks(&self) -> Vec<Task> {
        let state = self.state.lock();
        state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    pub fn tasks_for_worker(&self, worker_id: &str) -> Vec<Task> {
        self.tasks()
            .into_iter()
            .filter(|t| t.assigned_worker.as_deref() == Some(worker_id))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Load balancing
    // ------------------------------------------------------------------------

    /// Move assigned-but-not-started tasks from overloaded workers to the
    /// least-loaded eligible underloaded worker.
    pub async fn rebalance(&self) -> RebalanceReport {
        let mut report = RebalanceReport::default();
        let moved_tasks = {
            let mut guard = self.state.lock();
            let state: &mut CoordinatorState = &mut guard;
            let overload = self.config.overload_threshold;
            let underload = self.config.underload_threshold;

            report.overloaded = state
                .worker_order
                .iter()
                .filter(|id| state.ratio(id) > overload)
                .cloned()
                .collect();
            report.underloaded = state
                .worker_order
                .iter()
                .filter(|id| {
                    state
                        .workers
                        .get(id.as_str())
                        .is_some_and(|w| w.can_accept() && w.load_ratio() < underload)
                })
                .cloned()
                .collect();

            let mut moved = Vec::new();
            for source in report.overloaded.clone() {
                let mut movable: Vec<Task> = state
                    .tasks
                    .values()
                    .filter(|t| {
                        t.status == TaskStatus::Assigned
                            && t.assigned_worker.as_deref() == Some(source.as_str())
                    })
                    .cloned()
                    .collect();
                movable.sort_by(|a, b| {
                    a.priority
                        .cmp(&b.priority)
                        .then_with(|| b.created_at.cmp(&a.created_at))
                });

                for task in movable {
                    if state.ratio(&source) <= overload {
                        break;
                    }
                    let required = tag_terms(&task.requirements);
                    let destination = report
                        .underloaded
                        .iter()
                        .enumerate()
                        .filter(|(_, id)| **id != source)
                        .filter(|(_, id)| {
                            state
                                .workers
                                .get(id.as_str())
                                .is_some_and(|w| w.can_accept() && w.load_ratio() < underload)
                        })
                        .filter(|(_, id)| {
                            required.is_empty()
                                || self
                                    .index
                                    .profile(id)
                                    .is_some_and(|p| !p.tag_terms.is_disjoint(&required))
                        })
                        .min_by(|(ia, a), (ib, b)| {
                            state
                                .ratio(a)
                                .partial_cmp(&state.ratio(b))
                                .unwrap_or(std::cmp::Ordering::Equal)
                                .then_with(|| ia.cmp(ib))
                        })
                        .map(|(_, id)| id.clone());

                    let Some(destination) = destination else {
                        continue;
                    };
                    match Self::move_locked(state, &task.id, &source, &destination) {
                        Ok(moved_task) => {
                            SwarmStats::incr(&self.stats.tasks_rebalanced);
                            report.moves.push(TaskMove {
                                task_id: task.id.clone(),
                                from: source.clone(),
                                to: destination,
                            });
                            moved.push(moved_task);
                        }
                        Err(e) => warn!("Rebalance of task {} skipped: {}", task.id, e),
                    }
                }
            }
            moved
        };

        if !report.moves.is_empty() {
            info!(
                "Rebalanced {} tasks ({} overloaded, {} underloaded workers)",
                report.moves.len(),
                report.overloaded.len(),
                report.underloaded.len()
            );
        }
        for task in &moved_tasks {
            self.notify_assignment(task).await;
        }
        report
    }

    /// Run `rebalance` every `interval` until the handle is shut down
    pub fn spawn_rebalancer(self: &Arc<Self>, interval: Duration) -> RebalancerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let coordinator = Arc::clone(self);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        coordinator.rebalance().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Rebalancer stopped");
        });

        RebalancerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    // ------------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------------

    pub fn resolve_conflict(&self, conflict: &Conflict) -> Result<Resolution> {
        let claimants = {
            let state = self.state.lock();
            let mut claimants = Vec::with_capacity(conflict.claims.len());
            for claim in &conflict.claims {
                let worker = state
                    .workers
                    .get(&claim.worker_id)
                    .ok_or_else(|| PipelineError::UnknownWorker(claim.worker_id.clone()))?;
                let profile = self
                    .index
                    .profile(&claim.worker_id)
                    .ok_or_else(|| PipelineError::UnknownWorker(claim.worker_id.clone()))?;
                let similarity = self
                    .index
                    .similarity(&claim.worker_id, &conflict.description)?
                    .unwrap_or(0.0);
                claimants.push(Claimant {
                    worker_id: claim.worker_id.clone(),
                    priority: claim.priority,
                    load_ratio: worker.load_ratio(),
                    similarity,
                    order: profile.order,
                });
            }
            claimants
        };

        let resolution = self.resolver.resolve(&conflict.resource_id, &claimants)?;
        SwarmStats::incr(&self.stats.conflicts_resolved);
        Ok(resolution)
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    pub async fn send_message(
        &self,
        sender: &str,
        recipients: Vec<String>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Result<Message> {
        self.bus
            .send(Message::new(sender, recipients, message_type, payload))
            .await
    }

    /// Send to every registered worker except the sender
    pub async fn broadcast(&self, sender: &str, payload: serde_json::Value) -> Result<Message> {
        let recipients: Vec<String> = {
            let state = self.state.lock();
            state
                .worker_order
                .iter()
                .filter(|id| id.as_str() != sender)
                .cloned()
                .collect()
        };
        self.send_message(sender, recipients, MessageType::Broadcast, payload)
            .await
    }

    pub fn dispatch_message(&self, message: Message) -> Result<String> {
        self.bus.dispatch(message)
    }

    pub fn receive_messages(&self, worker_id: &str) -> Result<Vec<Message>> {
        if !self.state.lock().workers.contains_key(worker_id) {
            return Err(PipelineError::UnknownWorker(worker_id.to_string()));
        }
        Ok(self.bus.receive(worker_id))
    }

    pub fn acknowledge(&self, message_id: &str) -> Result<()> {
        self.bus.acknowledge(message_id)
    }

    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.bus.message(message_id)
    }

    // ------------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------------

    pub fn statistics(&self) -> CoordinationStats {
        let state = self.state.lock();

        let workers: Vec<WorkerLoad> = state
            .worker_order
            .iter()
            .filter_map(|id| state.workers.get(id))
            .map(|w| WorkerLoad {
                worker_id: w.id.clone(),
                name: w.name.clone(),
                load: w.current_load,
                capacity: w.capacity,
                load_ratio: w.load_ratio(),
                available: w.available,
            })
            .collect();

        let mut tasks_by_status = BTreeMap::new();
        let mut collaborators: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        for task in state.tasks.values() {
            *tasks_by_status
                .entry(task.status.as_str().to_string())
                .or_insert(0) += 1;
            if task.status.is_live() {
                if let (Some(doc), Some(worker)) = (&task.document_id, &task.assigned_worker) {
                    collaborators
                        .entry(doc.as_str())
                        .or_default()
                        .insert(worker.as_str());
                }
            }
        }

        CoordinationStats {
            total_capacity: workers.iter().map(|w| w.capacity).sum(),
            total_load: workers.iter().map(|w| w.load).sum(),
            workers,
            tasks_by_status,
            messages_by_status: self.bus.counts_by_status(),
            active_collaborations: collaborators.values().filter(|w| w.len() >= 2).count(),
            counters: self.stats.to_summary(),
        }
    }
}

fn validate_spec(spec: &WorkerSpec) -> Result<()> {
    if spec.capacity == 0 {
        return Err(PipelineError::invalid(format!(
            "worker {} has zero capacity",
            spec.name
        )));
    }
    if spec.capabilities.iter().all(|c| c.trim().is_empty()) {
        return Err(PipelineError::invalid(format!(
            "worker {} declares no capabilities",
            spec.name
        )));
    }
    Ok(())
}

/// Handle to a periodic rebalancer
pub struct RebalancerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RebalancerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!("Rebalancer task ended abnormally: {}", e);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::conflict::{Claim, ResolutionStrategy};
    use crate::swarm::embedder::HashProjectionEmbedder;

    fn coordinator() -> Coordinator {
        Coordinator::new(
            CoordinatorConfig::default().with_retry(1, 1, 2),
            Arc::new(HashProjectionEmbedder::new(512, 4)),
            Arc::new(HealLog::new()),
        )
    }

    fn spec(id: &str, caps: &[&str], capacity: usize) -> WorkerSpec {
        WorkerSpec::new(id, caps, capacity).with_id(id)
    }

    fn request(description: &str, reqs: &[&str]) -> TaskRequest {
        TaskRequest::new(description).with_requirements(reqs)
    }

    #[tokio::test]
    async fn test_allocation_prefers_lower_load_ratio() {
        let coord = coordinator();
        coord.register_worker(spec("small", &["text"], 2)).unwrap();
        coord.register_worker(spec("large", &["text"], 3)).unwrap();

        coord.allocate_task_to("small", request("a", &["text"])).await.unwrap();
        coord.allocate_task_to("small", request("b", &["text"])).await.unwrap();
        coord.allocate_task_to("large", request("c", &["text"])).await.unwrap();

        let id = coord.allocate_task(request("analyze text", &["text"])).await.unwrap();
        let task = coord.task(&id).unwrap();
        assert_eq!(task.assigned_worker.as_deref(), Some("large"));
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(coord.worker("large").unwrap().current_load, 2);
    }

    /// Hash projection behind a deliberate delay, reported as blocking
    struct SlowEmbedder(HashProjectionEmbedder);

    impl Embedder for SlowEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            std::thread::sleep(Duration::from_millis(60));
            self.0.embed(text)
        }

        fn embed_terms(&self, terms: &[String]) -> Result<Vec<f32>> {
            std::thread::sleep(Duration::from_millis(60));
            self.0.embed_terms(terms)
        }

        fn dimension(&self) -> usize {
            self.0.dimension()
        }

        fn backend(&self) -> &str {
            "slow"
        }

        fn is_blocking(&self) -> bool {
            true
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_blocking_embedder_leaves_runtime_free() {
        let coord = Arc::new(Coordinator::new(
            CoordinatorConfig::default(),
            Arc::new(SlowEmbedder(HashProjectionEmbedder::new(128, 2))),
            Arc::new(HealLog::new()),
        ));
        coord.register_worker(spec("w", &["text"], 2)).unwrap();

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = {
            let coord = Arc::clone(&coord);
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    // the state lock is free while the task vector is embedded
                    assert_eq!(coord.workers().len(), 1);
                    ticks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            })
        };

        let id = coord.allocate_task(request("summarize notes", &["text"])).await.unwrap();
        ticker.abort();
        assert!(ticks.load(std::sync::atomic::Ordering::Relaxed) > 0);
        assert_eq!(coord.task(&id).unwrap().assigned_worker.as_deref(), Some("w"));
    }

    #[tokio::test]
    async fn test_no_suitable_worker_creates_nothing() {
        let coord = coordinator();
        coord.register_worker(spec("coder", &["code"], 1)).unwrap();

        let err = coord
            .allocate_task(request("write a poem", &["poetry"]))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoSuitableWorker { .. }));
        assert!(coord.tasks().is_empty());
        assert_eq!(coord.statistics().counters.allocations_rejected, 1);
    }

    #[tokio::test]
    async fn test_full_worker_not_allocated() {
        let coord = coordinator();
        coord.register_worker(spec("w", &["text"], 1)).unwrap();
        coord.allocate_task(request("x", &["text"])).await.unwrap();
        assert!(coord.allocate_task(request("y", &["text"])).await.is_err());
        assert_eq!(coord.worker("w").unwrap().current_load, 1);
    }

    #[tokio::test]
    async fn test_task_lifecycle_releases_load() {
        let coord = coordinator();
        coord.register_worker(spec("w", &["text"], 2)).unwrap();
        let id = coord.allocate_task(request("summarize text", &["text"])).await.unwrap();

        coord.start_task(&id).unwrap();
        assert!(coord.start_task(&id).is_err());
        coord.complete_task(&id, Some(json!({"ok": true}))).unwrap();

        let task = coord.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.started_at.is_some() && task.completed_at.is_some());
        assert_eq!(coord.worker("w").unwrap().current_load, 0);
        assert_eq!(coord.worker("w").unwrap().completed_tasks, 1);
        assert!(coord.complete_task(&id, None).is_err());
    }

    #[tokio::test]
    async fn test_assignment_notice_in_mailbox() {
        let coord = coordinator();
        coord.register_worker(spec("w", &["text"], 2)).unwrap();
        let id = coord.allocate_task(request("text job", &["text"])).await.unwrap();

        let inbox = coord.receive_messages("w").unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].payload["task_id"], id);
        coord.acknowledge(&inbox[0].id).unwrap();
        assert!(coord.receive_messages("ghost").is_err());
    }

    #[tokio::test]
    async fn test_dependencies_gate_start() {
        let coord = coordinator();
        coord.register_worker(spec("w", &["text"], 3)).unwrap();
        let first = coord.allocate_task(request("first", &["text"])).await.unwrap();
        let second = coord
            .allocate_task(request("second", &["text"]).with_dependencies(vec![first.clone()]))
            .await
            .unwrap();

        assert!(coord.start_task(&second).is_err());
        coord.complete_task(&first, None).unwrap();
        coord.start_task(&second).unwrap();

        let unknown = coord
            .allocate_task(request("third", &["text"]).with_dependencies(vec!["nope".into()]))
            .await;
        assert!(matches!(unknown, Err(PipelineError::UnknownTask(_))));
    }

    #[tokio::test]
    async fn test_unregister_fails_live_tasks() {
        let coord = coordinator();
        coord.register_worker(spec("w", &["text"], 2)).unwrap();
        let id = coord.allocate_task(request("text", &["text"])).await.unwrap();

        let failed = coord.unregister_worker("w").unwrap();
        assert_eq!(failed, vec![id.clone()]);
        assert_eq!(coord.task(&id).unwrap().status, TaskStatus::Failed);
        assert!(coord.index().is_empty());
        assert!(coord.unregister_worker("w").is_err());
    }

    #[tokio::test]
    async fn test_reassign_only_while_assigned() {
        let coord = coordinator();
        coord.register_worker(spec("a", &["text"], 2)).unwrap();
        coord.register_worker(spec("b", &["text"], 2)).unwrap();
        let id = coord.allocate_task_to("a", request("text", &["text"])).await.unwrap();

        let moved_to = coord.reassign_task(&id, None).await.unwrap();
        assert_eq!(moved_to, "b");
        assert_eq!(coord.worker("a").unwrap().current_load, 0);
        assert_eq!(coord.worker("b").unwrap().current_load, 1);
        assert_eq!(coord.task(&id).unwrap().reassignments, 1);

        coord.start_task(&id).unwrap();
        assert!(coord.reassign_task(&id, Some("a")).await.is_err());
    }

    #[tokio::test]
    async fn test_rebalance_moves_assigned_only() {
        let coord = coordinator();
        coord.register_worker(spec("busy", &["text"], 5)).unwrap();
        coord.register_worker(spec("idle", &["text"], 5)).unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                coord
                    .allocate_task_to("busy", request(&format!("t{}", i), &["text"]))
                    .await
                    .unwrap(),
            );
        }
        for id in &ids[..3] {
            coord.start_task(id).unwrap();
        }

        let report = coord.rebalance().await;
        assert_eq!(report.overloaded, vec!["busy".to_string()]);
        assert_eq!(report.moves.len(), 1);
        let moved = coord.task(&report.moves[0].task_id).unwrap();
        assert_eq!(moved.status, TaskStatus::Assigned);
        assert_eq!(moved.assigned_worker.as_deref(), Some("idle"));
        assert_eq!(coord.worker("busy").unwrap().current_load, 4);
        assert_eq!(coord.worker("idle").unwrap().current_load, 1);

        // in-progress tasks never move
        for id in &ids[..3] {
            assert_eq!(coord.task(id).unwrap().assigned_worker.as_deref(), Some("busy"));
        }
    }

    #[tokio::test]
    async fn test_rebalance_respects_requirements() {
        let coord = coordinator();
        coord.register_worker(spec("busy", &["code", "text"], 2)).unwrap();
        coord.register_worker(spec("writer", &["text"], 4)).unwrap();
        coord.allocate_task_to("busy", request("fix", &["code"])).await.unwrap();
        coord.allocate_task_to("busy", request("fix", &["code"])).await.unwrap();

        let report = coord.rebalance().await;
        assert!(report.moves.is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_task_resolves() {
        let coord = Arc::new(coordinator());
        coord.register_worker(spec("w", &["text"], 1)).unwrap();
        let id = coord.allocate_task(request("text", &["text"])).await.unwrap();

        let waiter = {
            let coord = Arc::clone(&coord);
            let id = id.clone();
            tokio::spawn(async move { coord.wait_for_task(&id).await })
        };
        coord.fail_task(&id, "boom").unwrap();

        let task = waiter.await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_specialist_inherits_and_derives() {
        let coord = coordinator();
        coord.register_worker(spec("general", &["text", "analysis"], 2)).unwrap();
        let child = coord
            .spawn_specialist("general", WorkerSpec::new("child", &[], 1).with_id("child"))
            .unwrap();

        let worker = coord.worker(&child).unwrap();
        assert_eq!(worker.parent_id.as_deref(), Some("general"));
        assert_eq!(worker.capabilities, vec!["text", "analysis"]);
        assert!(coord.spawn_specialist("missing", WorkerSpec::new("x", &[], 1)).is_err());
    }

    #[tokio::test]
    async fn test_resolve_conflict() {
        let coord = coordinator();
        coord.register_worker(spec("a", &["text"], 2)).unwrap();
        coord.register_worker(spec("b", &["text"], 2)).unwrap();
        coord.allocate_task_to("a", request("t", &["text"])).await.unwrap();

        let conflict = Conflict {
            resource_id: "doc:0".into(),
            description: "text".into(),
            claims: vec![Claim::new("a", 1), Claim::new("b", 1)],
        };
        let res = coord.resolve_conflict(&conflict).unwrap();
        assert_eq!(res.worker_id, "b");
        assert_eq!(res.strategy, ResolutionStrategy::LoadBalancing);
    }

    #[tokio::test]
    async fn test_statistics_collaborations() {
        let coord = coordinator();
        coord.register_worker(spec("a", &["text"], 2)).unwrap();
        coord.register_worker(spec("b", &["text"], 2)).unwrap();
        coord
            .allocate_task_to("a", request("t", &["text"]).for_chunk("doc", "doc:0"))
            .await
            .unwrap();
        coord
            .allocate_task_to("b", request("t", &["text"]).for_chunk("doc", "doc:1"))
            .await
            .unwrap();

        let stats = coord.statistics();
        assert_eq!(stats.active_collaborations, 1);
        assert_eq!(stats.total_capacity, 4);
        assert_eq!(stats.total_load, 2);
        assert_eq!(stats.tasks_by_status.get("assigned"), Some(&2));
        assert_eq!(stats.messages_by_status.get("delivered"), Some(&2));
        assert!((stats.utilization() - 0.5).abs() < 1e-9);
        assert!(serde_json::to_string(&stats).is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_and_failed_message() {
        let coord = coordinator();
        coord.register_worker(spec("a", &["text"], 1)).unwrap();
        coord.register_worker(spec("b", &["text"], 1)).unwrap();

        let sent = coord.broadcast("a", json!({"note": "hi"})).await.unwrap();
        assert_eq!(sent.recipients, vec!["b".to_string()]);
        assert_eq!(sent.status, MessageStatus::Delivered);

        let lost = coord
            .send_message("a", vec!["ghost".into()], MessageType::Request, json!({}))
            .await
            .unwrap();
        assert_eq!(lost.status, MessageStatus::Failed);
        assert_eq!(coord.message(&lost.id).unwrap().status, MessageStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebalancer_shutdown() {
        let coord = Arc::new(coordinator());
        let handle = coord.spawn_rebalancer(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(35)).await;
        handle.shutdown().await;
    }

    #[test]
    fn test_rejects_bad_specs() {
        let coord = coordinator();
        assert!(coord.register_worker(spec("zero", &["text"], 0)).is_err());
        assert!(coord.register_worker(spec("blank", &[], 1)).is_err());
        coord.register_worker(spec("w", &["text"], 1)).unwrap();
        assert!(coord.register_worker(spec("w", &["text"], 1)).is_err());
    }
}
