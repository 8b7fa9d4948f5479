//! PipelineEngine - The main engine orchestrating all operations
//!
//! Provides the outward API: ingest a document, report its status, hand
//! chunks to workers, take their results back, and turn a finished document
//! into a delivered report.
//!
//! A chunk's task is started the moment the chunk is handed out, since the
//! receiving worker already holds it. Rebalancing and reassignment only move
//! tasks allocated directly through the coordinator.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{
    Document, DocumentMetadata, DocumentStatus, DocumentStatusReport, PipelineStore, Progress,
    QueueStatus,
};
use crate::config::Config;
use crate::dedup::{DedupItem, Deduplicator};
use crate::delivery::{Channel, DeliveryRecord, DeliveryService, DeliveryType, OutputFormat};
use crate::error::{PipelineError, Result};
use crate::evaluate::{
    AggregatedEvaluation, AggregatedValidation, Evaluator, FinalResult, SynthesizedInfo,
    ValidationCriteria,
};
use crate::processor::{ChunkProcessor, ProcessingContext, ProcessingResult, RelatedChunk};
use crate::swarm::{
    analysis, embedder_from_config, reconstruct, Chunk, ChunkStatus, Chunker, CoordinationStats,
    Coordinator, HealLog, TaskRequest, TaskStatus, WorkerSpec,
};

const OPERATOR_ID: &str = "operator";
const SYNTHESIS_FINDINGS: usize = 5;
const SYNTHESIS_THEMES: usize = 8;
const SYNTHESIS_SUMMARY_CHARS: usize = 600;
const CAPACITY_POLL: Duration = Duration::from_millis(20);

/// The main docswarm engine
pub struct PipelineEngine {
    /// Splits ingested documents
    chunker: Arc<Chunker>,
    /// Owns worker load and task state
    coordinator: Arc<Coordinator>,
    /// Content-type strategies
    processor: Arc<ChunkProcessor>,
    deduplicator: Deduplicator,
    evaluator: Arc<Evaluator>,
    delivery: Arc<DeliveryService>,
    /// Persisted entities
    store: PipelineStore,
    /// Chunk ids waiting for a worker, oldest first
    queue: Mutex<VecDeque<String>>,
    /// Status feed per document, used to await chunking
    watchers: Mutex<HashMap<String, watch::Sender<DocumentStatus>>>,
}

impl PipelineEngine {
    /// Create an engine with an in-memory store
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        Self::with_store(config, PipelineStore::in_memory())
    }

    /// Create an engine over an injected store
    pub fn with_store(config: &Config, store: PipelineStore) -> Result<Arc<Self>> {
        Self::with_processor(config, store, ChunkProcessor::new())
    }

    /// Create an engine with a custom strategy registry
    pub fn with_processor(
        config: &Config,
        store: PipelineStore,
        processor: ChunkProcessor,
    ) -> Result<Arc<Self>> {
        let log = Arc::new(HealLog::new());
        let embedder = embedder_from_config(&config.routing);
        let coordinator = Coordinator::new(config.coordination.clone(), embedder, Arc::clone(&log));

        Ok(Arc::new(Self {
            chunker: Arc::new(Chunker::new(config.chunking.clone())?),
            coordinator: Arc::new(coordinator),
            processor: Arc::new(processor),
            deduplicator: Deduplicator::default(),
            evaluator: Arc::new(Evaluator::new(config.evaluation.clone())),
            delivery: DeliveryService::new(config.delivery.clone(), log),
            store,
            queue: Mutex::new(VecDeque::new()),
            watchers: Mutex::new(HashMap::new()),
        }))
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn delivery(&self) -> &Arc<DeliveryService> {
        &self.delivery
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    pub fn register_worker(&self, spec: WorkerSpec) -> Result<String> {
        let id = self.coordinator.register_worker(spec)?;
        self.sync_coordination();
        Ok(id)
    }

    /// Remove a worker. Chunks it was processing fail and their documents
    /// settle; returns the ids of those chunks.
    pub fn unregister_worker(&self, worker_id: &str) -> Result<Vec<String>> {
        let failed_tasks = self.coordinator.unregister_worker(worker_id)?;
        self.store.workers.remove(worker_id);

        let reason = format!("worker {} unregistered", worker_id);
        let mut stranded = Vec::new();
        for task_id in &failed_tasks {
            let Some(chunk_id) = self.coordinator.task(task_id).and_then(|t| t.chunk_id) else {
                continue;
            };
            if self.abandon_chunk(&chunk_id, worker_id, &reason) {
                stranded.push(chunk_id);
            }
        }
        self.sync_coordination();
        Ok(stranded)
    }

    pub fn register_channel(&self, channel: Arc<dyn Channel>) {
        self.delivery.register_channel(channel);
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Store the document and start chunking it in the background.
    ///
    /// Returns the document id immediately; empty content is rejected.
    pub async fn ingest_document(
        self: &Arc<Self>,
        content: &str,
        metadata: DocumentMetadata,
    ) -> Result<String> {
        let document = Document::new(content, metadata)?;
        let id = document.id.clone();
        info!(
            "📄 Ingested '{}' as {} ({} words)",
            document.title, id, document.word_count
        );

        let (tx, _) = watch::channel(DocumentStatus::Pending);
        self.watchers.lock().insert(id.clone(), tx);
        self.store.documents.set(document);

        let engine = Arc::clone(self);
        let doc_id = id.clone();
        tokio::spawn(async move { engine.chunk_document(&doc_id).await });

        Ok(id)
    }

    async fn chunk_document(&self, doc_id: &str) {
        let Some(document) = self.store.documents.get(doc_id) else {
            return;
        };
        self.set_document_status(doc_id, DocumentStatus::Chunking, None);

        let chunker = Arc::clone(&self.chunker);
        let id = doc_id.to_string();
        let outcome =
            tokio::task::spawn_blocking(move || chunker.chunk_document(&id, &document.content))
                .await;

        let chunks = match outcome {
            Ok(Ok(chunks)) => chunks,
            Ok(Err(e)) => {
                warn!("Chunking {} failed: {}", doc_id, e);
                self.set_document_status(doc_id, DocumentStatus::Error, Some(e.to_string()));
                return;
            }
            Err(e) => {
                warn!("Chunking task for {} died: {}", doc_id, e);
                self.set_document_status(
                    doc_id,
                    DocumentStatus::Error,
                    Some(format!("chunking task failed: {}", e)),
                );
                return;
            }
        };

        // Links are final before anything is queued
        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        for chunk in chunks {
            self.store.chunks.set(chunk);
        }
        self.store
            .documents
            .update(doc_id, &mut |doc| doc.chunk_ids = ids.clone());
        self.queue.lock().extend(ids.iter().cloned());
        self.set_document_status(doc_id, DocumentStatus::Processing, None);

        info!("✂️  Document {} split into {} chunks", doc_id, ids.len());
    }

    /// Resolve once chunking has finished, with the status it left behind
    pub async fn wait_for_chunking(&self, doc_id: &str) -> Result<DocumentStatus> {
        let mut rx = {
            let watchers = self.watchers.lock();
            let tx = watchers
                .get(doc_id)
                .ok_or_else(|| PipelineError::UnknownDocument(doc_id.to_string()))?;
            tx.subscribe()
        };

        loop {
            let status = *rx.borrow_and_update();
            if status.is_chunked() {
                return Ok(status);
            }
            if rx.changed().await.is_err() {
                return Ok(status);
            }
        }
    }

    fn set_document_status(&self, doc_id: &str, status: DocumentStatus, error: Option<String>) {
        self.store.documents.update(doc_id, &mut |doc| {
            doc.set_status(status);
            doc.error = error.clone();
        });
        if let Some(tx) = self.watchers.lock().get(doc_id) {
            tx.send_replace(status);
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    fn progress_of(&self, document: &Document) -> Progress {
        Progress::from_statuses(
            document
                .chunk_ids
                .iter()
                .filter_map(|id| self.store.chunks.get(id))
                .map(|chunk| chunk.status),
        )
    }

    fn queue_status(&self, doc_id: &str) -> QueueStatus {
        let (queued, queued_total) = {
            let queue = self.queue.lock();
            let prefix = format!("{}:", doc_id);
            (
                queue.iter().filter(|id| id.starts_with(&prefix)).count(),
                queue.len(),
            )
        };
        let workers = self.coordinator.workers();
        QueueStatus {
            queued,
            queued_total,
            available_workers: workers.iter().filter(|w| w.can_accept()).count(),
            free_capacity: workers
                .iter()
                .filter(|w| w.available)
                .map(|w| w.capacity.saturating_sub(w.current_load))
                .sum(),
        }
    }

    /// Document, chunk progress and queue view. Read-only.
    pub fn get_document_status(&self, doc_id: &str) -> Result<DocumentStatusReport> {
        let document = self
            .store
            .documents
            .get(doc_id)
            .ok_or_else(|| PipelineError::UnknownDocument(doc_id.to_string()))?;
        let progress = self.progress_of(&document);
        let queue_status = self.queue_status(doc_id);
        Ok(DocumentStatusReport {
            document,
            progress,
            queue_status,
        })
    }

    pub fn get_coordination_statistics(&self) -> CoordinationStats {
        self.sync_coordination();
        self.coordinator.statistics()
    }

    /// Mirror coordinator-owned workers and tasks into the store
    fn sync_coordination(&self) {
        for worker in self.coordinator.workers() {
            self.store.workers.set(worker);
        }
        for task in self.coordinator.tasks() {
            self.store.tasks.set(task);
        }
    }

    // ========================================================================
    // Chunk hand-out
    // ========================================================================

    fn task_request(chunk: &Chunk) -> TaskRequest {
        let kind = chunk.content_type.as_str();
        TaskRequest::new(format!("{} analysis: {}", kind, chunk.keywords.join(" ")))
            .with_requirements(&[kind])
            .with_priority((chunk.complexity * 10.0).round() as u8)
            .with_estimated_duration_ms(chunk.word_count as u64 * 2)
            .for_chunk(&chunk.document_id, &chunk.id)
    }

    fn pop_queued(&self, doc_id: Option<&str>) -> Option<String> {
        let mut queue = self.queue.lock();
        match doc_id {
            None => queue.pop_front(),
            Some(doc_id) => {
                let prefix = format!("{}:", doc_id);
                let at = queue.iter().position(|id| id.starts_with(&prefix))?;
                queue.remove(at)
            }
        }
    }

    fn requeue_front(&self, ids: Vec<String>) {
        let mut queue = self.queue.lock();
        for id in ids.into_iter().rev() {
            queue.push_front(id);
        }
    }

    /// Apply `f` to a stored chunk and return the updated copy. `f` must fail
    /// before mutating anything.
    fn update_chunk(
        &self,
        chunk_id: &str,
        mut f: impl FnMut(&mut Chunk) -> Result<()>,
    ) -> Result<Chunk> {
        let mut outcome = None;
        self.store.chunks.update(chunk_id, &mut |chunk| {
            outcome = Some(f(chunk).map(|_| chunk.clone()));
        });
        outcome.unwrap_or_else(|| Err(PipelineError::UnknownChunk(chunk_id.to_string())))
    }

    /// Next queued chunk, allocated to `worker_id` or to the best-matching
    /// worker. `None` when nothing queued can be placed right now.
    pub async fn get_next_chunk(&self, worker_id: Option<&str>) -> Result<Option<Chunk>> {
        self.next_chunk(None, worker_id).await
    }

    async fn next_chunk(&self, doc_id: Option<&str>, worker_id: Option<&str>) -> Result<Option<Chunk>> {
        if let Some(worker_id) = worker_id {
            if self.coordinator.worker(worker_id).is_none() {
                return Err(PipelineError::UnknownWorker(worker_id.to_string()));
            }
        }

        let mut skipped = Vec::new();
        let mut claimed = None;
        while let Some(chunk_id) = self.pop_queued(doc_id) {
            let Some(chunk) = self.store.chunks.get(&chunk_id) else {
                continue;
            };
            if chunk.status != ChunkStatus::Pending {
                continue;
            }

            let request = Self::task_request(&chunk);
            let allocation = match worker_id {
                Some(worker_id) => self.coordinator.allocate_task_to(worker_id, request).await,
                None => self.coordinator.allocate_task(request).await,
            };
            match allocation {
                Ok(task_id) => {
                    claimed = Some((chunk_id, task_id));
                    break;
                }
                Err(PipelineError::NoSuitableWorker { .. }) => {
                    skipped.push(chunk_id);
                    // A named worker that is full takes nothing else either
                    if worker_id.is_some() {
                        break;
                    }
                }
                Err(e) => {
                    skipped.push(chunk_id);
                    self.requeue_front(skipped);
                    return Err(e);
                }
            }
        }
        self.requeue_front(skipped);

        let Some((chunk_id, task_id)) = claimed else {
            return Ok(None);
        };
        match self.claim(&chunk_id, &task_id) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(e) => {
                self.release_claim(&chunk_id, &task_id, &e);
                Err(e)
            }
        }
    }

    /// Start the allocated task and move the chunk to Processing
    fn claim(&self, chunk_id: &str, task_id: &str) -> Result<Chunk> {
        self.coordinator.start_task(task_id)?;
        let task = self
            .coordinator
            .task(task_id)
            .ok_or_else(|| PipelineError::UnknownTask(task_id.to_string()))?;
        let assignee = task.assigned_worker.unwrap_or_default();

        let chunk = self.update_chunk(chunk_id, |chunk| {
            chunk.transition(ChunkStatus::Processing)?;
            chunk.assigned_worker = Some(assignee.clone());
            chunk.task_id = Some(task_id.to_string());
            chunk.record(&assignee, "assigned", Some(task_id.to_string()));
            Ok(())
        })?;
        debug!("Chunk {} -> worker {} (task {})", chunk.id, assignee, task_id);
        Ok(chunk)
    }

    /// Undo an allocation whose hand-out failed: the task gives its load
    /// back and a still-pending chunk returns to the front of the queue
    fn release_claim(&self, chunk_id: &str, task_id: &str, error: &PipelineError) {
        if self.coordinator.task(task_id).is_some_and(|t| t.status.is_live()) {
            if let Err(e) = self
                .coordinator
                .fail_task(task_id, &format!("hand-out failed: {}", error))
            {
                debug!("Could not release task {}: {}", task_id, e);
            }
        }
        if self
            .store
            .chunks
            .get(chunk_id)
            .is_some_and(|c| c.status == ChunkStatus::Pending)
        {
            self.requeue_front(vec![chunk_id.to_string()]);
        }
    }

    // ========================================================================
    // Results
    // ========================================================================

    fn claimed_chunk(&self, chunk_id: &str, worker_id: &str, next: ChunkStatus) -> Result<Chunk> {
        let chunk = self
            .store
            .chunks
            .get(chunk_id)
            .ok_or_else(|| PipelineError::UnknownChunk(chunk_id.to_string()))?;
        if chunk.status != ChunkStatus::Processing {
            return Err(PipelineError::transition("chunk", chunk.status, next));
        }
        if chunk.assigned_worker.as_deref() != Some(worker_id) {
            return Err(PipelineError::invalid(format!(
                "chunk {} is not assigned to {}",
                chunk_id, worker_id
            )));
        }
        Ok(chunk)
    }

    /// Error of the chunk's task when the coordinator has already failed it
    fn failed_task_error(&self, chunk: &Chunk) -> Option<String> {
        let task = self.coordinator.task(chunk.task_id.as_deref()?)?;
        (task.status == TaskStatus::Failed)
            .then(|| task.error.unwrap_or_else(|| "task failed".to_string()))
    }

    /// Record a result. A result for a task the coordinator already failed
    /// is rejected and the chunk fails with the task's error.
    pub fn complete_chunk(
        &self,
        chunk_id: &str,
        result: ProcessingResult,
        worker_id: &str,
    ) -> Result<()> {
        let chunk = self.claimed_chunk(chunk_id, worker_id, ChunkStatus::Completed)?;
        if let Some(reason) = self.failed_task_error(&chunk) {
            self.abandon_chunk(chunk_id, worker_id, &reason);
            return Err(PipelineError::transition(
                "task",
                TaskStatus::Failed,
                TaskStatus::Completed,
            ));
        }
        if let Some(task_id) = &chunk.task_id {
            self.coordinator.complete_task(
                task_id,
                Some(json!({
                    "chunk_id": chunk_id,
                    "strategy": result.strategy,
                    "confidence": result.confidence,
                })),
            )?;
        }

        let note = format!("{} @ {:.2}", result.strategy, result.confidence);
        let mut result = Some(result);
        let chunk = self.update_chunk(chunk_id, |chunk| {
            chunk.transition(ChunkStatus::Completed)?;
            chunk.record(worker_id, "completed", Some(note.clone()));
            chunk.result = result.take();
            chunk.error = None;
            Ok(())
        })?;

        self.settle_document(&chunk.document_id);
        Ok(())
    }

    pub fn fail_chunk(&self, chunk_id: &str, error: &str, worker_id: &str) -> Result<()> {
        let chunk = self.claimed_chunk(chunk_id, worker_id, ChunkStatus::Error)?;
        if let Some(task_id) = &chunk.task_id {
            if self.failed_task_error(&chunk).is_none() {
                self.coordinator.fail_task(task_id, error)?;
            }
        }

        let chunk = self.update_chunk(chunk_id, |chunk| {
            chunk.transition(ChunkStatus::Error)?;
            chunk.record(worker_id, "failed", Some(error.to_string()));
            chunk.error = Some(error.to_string());
            Ok(())
        })?;
        warn!("Chunk {} failed on {}: {}", chunk_id, worker_id, error);

        self.settle_document(&chunk.document_id);
        Ok(())
    }

    /// Fail a Processing chunk outside the normal result path, releasing its
    /// task if still live. False when the chunk was not Processing.
    fn abandon_chunk(&self, chunk_id: &str, actor: &str, reason: &str) -> bool {
        let Some(chunk) = self.store.chunks.get(chunk_id) else {
            return false;
        };
        if chunk.status != ChunkStatus::Processing {
            return false;
        }
        if let Some(task_id) = &chunk.task_id {
            if self.coordinator.task(task_id).is_some_and(|t| t.status.is_live()) {
                if let Err(e) = self.coordinator.fail_task(task_id, reason) {
                    debug!("Could not fail task {}: {}", task_id, e);
                }
            }
        }

        let outcome = self.update_chunk(chunk_id, |chunk| {
            chunk.transition(ChunkStatus::Error)?;
            chunk.record(actor, "abandoned", Some(reason.to_string()));
            chunk.error = Some(reason.to_string());
            Ok(())
        });
        match outcome {
            Ok(chunk) => {
                warn!("Chunk {} abandoned: {}", chunk_id, reason);
                self.settle_document(&chunk.document_id);
                true
            }
            Err(e) => {
                debug!("Chunk {} not abandoned: {}", chunk_id, e);
                false
            }
        }
    }

    /// Completed if any chunk completed, Error if all failed, once every
    /// chunk is terminal
    fn settle_document(&self, doc_id: &str) {
        let Some(document) = self.store.documents.get(doc_id) else {
            return;
        };
        let progress = self.progress_of(&document);
        if !progress.is_done() {
            return;
        }

        let status = if progress.completed > 0 {
            DocumentStatus::Completed
        } else {
            DocumentStatus::Error
        };
        if document.status == status {
            return;
        }
        let error = (status == DocumentStatus::Error)
            .then(|| format!("all {} chunks failed", progress.total));
        self.set_document_status(doc_id, status, error);
        info!(
            "Document {} {} ({} completed, {} failed)",
            doc_id, status, progress.completed, progress.failed
        );
    }

    /// Put a failed chunk back in the queue
    pub fn reprocess_chunk(&self, chunk_id: &str) -> Result<()> {
        let chunk = self.update_chunk(chunk_id, |chunk| {
            chunk.transition(ChunkStatus::Pending)?;
            let previous = chunk.error.take();
            chunk.record(OPERATOR_ID, "reprocess", previous);
            chunk.result = None;
            chunk.assigned_worker = None;
            chunk.task_id = None;
            Ok(())
        })?;

        self.queue.lock().push_back(chunk.id.clone());
        self.set_document_status(&chunk.document_id, DocumentStatus::Processing, None);
        info!("🔁 Chunk {} queued for reprocessing", chunk_id);
        Ok(())
    }

    // ========================================================================
    // Driving a document
    // ========================================================================

    fn context_for(&self, chunk: &Chunk, worker_id: &str, goals: &[String]) -> ProcessingContext {
        let related: Vec<RelatedChunk> = chunk
            .related_chunk_ids
            .iter()
            .filter_map(|id| self.store.chunks.get(id))
            .map(|c| RelatedChunk::from(&c))
            .collect();
        let prior: Vec<ProcessingResult> = self
            .document_chunks(&chunk.document_id)
            .into_iter()
            .filter_map(|c| c.result)
            .filter(|r| r.success)
            .collect();

        ProcessingContext::new(worker_id)
            .with_related(related)
            .with_prior_results(prior)
            .with_goals(goals.to_vec())
    }

    fn document_chunks(&self, doc_id: &str) -> Vec<Chunk> {
        self.store
            .documents
            .get(doc_id)
            .map(|doc| {
                doc.chunk_ids
                    .iter()
                    .filter_map(|id| self.store.chunks.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Worker-side read of assignment notices
    fn acknowledge_assignments(&self, worker_id: &str) {
        let Ok(messages) = self.coordinator.receive_messages(worker_id) else {
            return;
        };
        for message in messages {
            if let Err(e) = self.coordinator.acknowledge(&message.id) {
                debug!("Could not acknowledge {}: {}", message.id, e);
            }
        }
    }

    fn settle_chunk(&self, chunk_id: &str, worker_id: &str, result: ProcessingResult) -> Result<()> {
        if result.success {
            self.complete_chunk(chunk_id, result, worker_id)
        } else {
            let error = result
                .error
                .unwrap_or_else(|| "processing failed".to_string());
            self.fail_chunk(chunk_id, &error, worker_id)
        }
    }

    /// A queued chunk of `doc_id` has an available capable worker that is
    /// only full, and some other run holds load that will be released
    async fn awaits_capacity(&self, doc_id: &str) -> bool {
        let workers = self.coordinator.workers();
        if workers.iter().all(|w| w.current_load == 0) {
            return false;
        }
        let prefix = format!("{}:", doc_id);
        let queued: Vec<String> = self
            .queue
            .lock()
            .iter()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect();
        let available = |id: &str| workers.iter().any(|w| w.id == id && w.available);
        let index = self.coordinator.index();
        for chunk in queued.iter().filter_map(|id| self.store.chunks.get(id)) {
            let request = Self::task_request(&chunk);
            let Ok(vector) = index
                .task_vector_async(&request.description, &request.requirements)
                .await
            else {
                continue;
            };
            let candidates =
                index.rank_with_vector(&vector, &request.description, &request.requirements, available);
            if !candidates.is_empty() {
                return true;
            }
        }
        false
    }

    /// Chunks still queued once nothing is running can never be placed
    fn fail_unroutable(&self, doc_id: &str) {
        let mut failed = 0;
        while let Some(chunk_id) = self.pop_queued(Some(doc_id)) {
            let outcome = self.update_chunk(&chunk_id, |chunk| {
                if chunk.status != ChunkStatus::Pending {
                    return Ok(());
                }
                let reason = format!("no suitable worker for {} content", chunk.content_type);
                chunk.transition(ChunkStatus::Processing)?;
                chunk.transition(ChunkStatus::Error)?;
                chunk.record("coordinator", "unroutable", Some(reason.clone()));
                chunk.error = Some(reason);
                Ok(())
            });
            match outcome {
                Ok(chunk) if chunk.status == ChunkStatus::Error => failed += 1,
                Ok(_) => {}
                Err(e) => warn!("Could not fail chunk {}: {}", chunk_id, e),
            }
        }
        if failed > 0 {
            warn!("{} chunks of {} had no suitable worker", failed, doc_id);
            self.settle_document(doc_id);
        }
    }

    /// Route every queued chunk of `doc_id` through the coordinator and run
    /// the strategies concurrently until the document is terminal.
    ///
    /// A chunk that cannot be settled fails on its own; the rest of the
    /// document carries on. A hand-out error stops new hand-outs, lets the
    /// running chunks finish and is then returned.
    pub async fn run_document(
        self: &Arc<Self>,
        doc_id: &str,
        goals: &[String],
    ) -> Result<DocumentStatusReport> {
        if self.wait_for_chunking(doc_id).await? == DocumentStatus::Error {
            return self.get_document_status(doc_id);
        }

        let mut running: JoinSet<(String, String, ProcessingResult)> = JoinSet::new();
        // chunk id -> worker id, for chunks whose job has not reported back
        let mut in_flight: HashMap<String, String> = HashMap::new();
        let mut handout_error = None;
        loop {
            while handout_error.is_none() {
                let chunk = match self.next_chunk(Some(doc_id), None).await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Stopped handing out chunks of {}: {}", doc_id, e);
                        handout_error = Some(e);
                        break;
                    }
                };
                let worker_id = chunk.assigned_worker.clone().unwrap_or_default();
                self.acknowledge_assignments(&worker_id);
                in_flight.insert(chunk.id.clone(), worker_id.clone());

                let ctx = self.context_for(&chunk, &worker_id, goals);
                let processor = Arc::clone(&self.processor);
                running.spawn(async move {
                    let chunk_id = chunk.id.clone();
                    let snapshot = chunk.clone();
                    let job = tokio::task::spawn_blocking(move || processor.process(&chunk, &ctx));
                    let result = match job.await {
                        Ok(result) => result,
                        Err(e) => ProcessingResult::failure(
                            &snapshot,
                            "none",
                            &worker_id,
                            format!("chunk worker task died: {}", e),
                        ),
                    };
                    (chunk_id, worker_id, result)
                });
            }

            let Some(joined) = running.join_next().await else {
                if handout_error.is_none() && self.awaits_capacity(doc_id).await {
                    tokio::time::sleep(CAPACITY_POLL).await;
                    continue;
                }
                break;
            };
            match joined {
                Ok((chunk_id, worker_id, result)) => {
                    in_flight.remove(&chunk_id);
                    if let Err(e) = self.settle_chunk(&chunk_id, &worker_id, result) {
                        warn!("Could not settle chunk {}: {}", chunk_id, e);
                        self.abandon_chunk(&chunk_id, &worker_id, &e.to_string());
                    }
                }
                Err(e) => warn!("Chunk worker task died: {}", e),
            }
        }
        for (chunk_id, worker_id) in in_flight {
            self.abandon_chunk(&chunk_id, &worker_id, "chunk worker task died");
        }

        if let Some(e) = handout_error {
            self.sync_coordination();
            return Err(e);
        }
        self.fail_unroutable(doc_id);
        self.sync_coordination();
        self.get_document_status(doc_id)
    }

    /// Results of every chunk in position order. Failed chunks contribute a
    /// failure result so their follow-ups reach the report.
    pub fn collected_results(&self, doc_id: &str) -> Result<Vec<ProcessingResult>> {
        if self.store.documents.get(doc_id).is_none() {
            return Err(PipelineError::UnknownDocument(doc_id.to_string()));
        }
        Ok(self
            .document_chunks(doc_id)
            .into_iter()
            .filter_map(|chunk| match chunk.status {
                ChunkStatus::Completed => chunk.result,
                ChunkStatus::Error => Some(ProcessingResult::failure(
                    &chunk,
                    "none",
                    chunk.assigned_worker.as_deref().unwrap_or_default(),
                    chunk.error.clone().unwrap_or_default(),
                )),
                _ => None,
            })
            .collect())
    }

    /// Rebuild the document from its chunks and check it against the
    /// ingestion checksum
    pub fn reconstruct_document(&self, doc_id: &str) -> Result<String> {
        let document = self
            .store
            .documents
            .get(doc_id)
            .ok_or_else(|| PipelineError::UnknownDocument(doc_id.to_string()))?;
        let chunks = self.document_chunks(doc_id);
        if chunks.len() != document.chunk_ids.len() {
            return Err(PipelineError::invalid(format!(
                "document {} is missing {} chunks",
                doc_id,
                document.chunk_ids.len() - chunks.len()
            )));
        }

        let text = reconstruct(&chunks)?;
        if blake3::hash(text.as_bytes()).to_hex().as_str() != document.checksum {
            return Err(PipelineError::invalid(format!(
                "reconstruction of {} does not match its checksum",
                doc_id
            )));
        }
        Ok(text)
    }

    // ========================================================================
    // Final result & delivery
    // ========================================================================

    /// Deduplicate, evaluate and synthesize a terminal document
    pub async fn finalize_document(
        &self,
        doc_id: &str,
        criteria: &ValidationCriteria,
        goals: &[String],
    ) -> Result<FinalResult> {
        let status = self.get_document_status(doc_id)?.document.status;
        if !status.is_terminal() {
            return Err(PipelineError::invalid(format!(
                "document {} is still {}",
                doc_id, status
            )));
        }

        let (successful, failed): (Vec<ProcessingResult>, Vec<ProcessingResult>) = self
            .collected_results(doc_id)?
            .into_iter()
            .partition(|r| r.success);

        let items: Vec<DedupItem> = successful.iter().map(|r| r.to_dedup_item()).collect();
        let outcome = self.deduplicator.deduplicate(items);
        let report = outcome.report();
        info!(
            "🧹 {}: kept {} of {} results ({} duplicate groups)",
            doc_id, report.unique_items, report.scanned_items, report.duplicate_groups
        );

        let kept: HashSet<&str> = outcome.items.iter().map(|i| i.id.as_str()).collect();
        let mut results: Vec<ProcessingResult> = successful
            .iter()
            .filter(|r| kept.contains(r.chunk_id.as_str()))
            .cloned()
            .collect();
        let synthesized = synthesize(&results, goals);
        results.extend(failed);

        let content = self.reconstruct_document(doc_id)?;
        let evaluator = Arc::clone(&self.evaluator);
        let criteria = criteria.clone();
        let id = doc_id.to_string();
        let (validations, evaluations) = tokio::task::spawn_blocking(move || {
            (
                evaluator.validate(&id, &content, &criteria),
                evaluator.evaluate(&id, &content),
            )
        })
        .await
        .map_err(|e| PipelineError::invalid(format!("evaluation task failed: {}", e)))?;

        let result =
            self.create_final_result(doc_id, validations, evaluations, synthesized, results);
        info!(
            "📊 {}: overall {:.2}, confidence {:.2}, validation {}",
            doc_id,
            result.summary.overall_score,
            result.summary.confidence,
            if result.summary.validation_passed { "passed" } else { "failed" }
        );
        Ok(result)
    }

    pub fn create_final_result(
        &self,
        content_id: &str,
        validations: Vec<AggregatedValidation>,
        evaluations: Vec<AggregatedEvaluation>,
        synthesized: SynthesizedInfo,
        collected: Vec<ProcessingResult>,
    ) -> FinalResult {
        self.evaluator
            .create_final_result(content_id, validations, evaluations, synthesized, collected)
    }

    pub async fn deliver_result(
        &self,
        result: FinalResult,
        format: OutputFormat,
        channel: &str,
        delivery_type: DeliveryType,
    ) -> Result<DeliveryRecord> {
        self.delivery
            .deliver_result(result, format, channel, delivery_type)
            .await
    }

    /// Push out every pending batch
    pub async fn flush_deliveries(&self) -> Vec<DeliveryRecord> {
        self.delivery.flush_batches().await
    }
}

/// Summary, findings and themes from deduplicated results in chunk order
fn synthesize(results: &[ProcessingResult], goals: &[String]) -> SynthesizedInfo {
    let summary = results
        .iter()
        .map(|r| r.summary.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let mut ranked: Vec<&ProcessingResult> = results.iter().collect();
    ranked.sort_by(|a, b| {
        b.quality_score
            .partial_cmp(&a.quality_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut key_findings: Vec<String> = Vec::new();
    for point in ranked.iter().filter_map(|r| r.key_points.first()) {
        if key_findings.len() == SYNTHESIS_FINDINGS {
            break;
        }
        if !key_findings.contains(point) {
            key_findings.push(point.clone());
        }
    }

    let corpus: String = results
        .iter()
        .flat_map(|r| std::iter::once(r.summary.as_str()).chain(r.key_points.iter().map(String::as_str)))
        .collect::<Vec<_>>()
        .join("\n");
    let mut themes: Vec<String> = goals.to_vec();
    for keyword in analysis::extract_keywords(&corpus, SYNTHESIS_THEMES) {
        if themes.len() >= SYNTHESIS_THEMES + goals.len() {
            break;
        }
        if !themes.iter().any(|t| t.eq_ignore_ascii_case(&keyword)) {
            themes.push(keyword);
        }
    }

    SynthesizedInfo {
        summary: analysis::truncate_chars(&summary, SYNTHESIS_SUMMARY_CHARS),
        key_findings,
        themes,
        sources: results.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryStatus, MemoryChannel};
    use crate::processor::{ProcessingStrategy, StrategyOutput, TextStrategy};
    use crate::swarm::ContentType;

    fn config(max_chunk_size: usize, overlap: usize) -> Config {
        let mut config = Config::default();
        config.chunking = config.chunking.with_window(max_chunk_size, overlap);
        config
    }

    fn prose(sentences: usize) -> String {
        (0..sentences)
            .map(|i| {
                format!(
                    "Sentence {} explains how reservoir sediment changes turbine output across season {}.",
                    i,
                    i % 4
                )
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn ingest(engine: &Arc<PipelineEngine>, text: &str) -> String {
        let id = engine
            .ingest_document(text, DocumentMetadata::titled("test"))
            .await
            .unwrap();
        engine.wait_for_chunking(&id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_ingest_rejects_empty() {
        let engine = PipelineEngine::new(&Config::default()).unwrap();
        let err = engine
            .ingest_document("  \n ", DocumentMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_ingest_chunks_and_queues() {
        let engine = PipelineEngine::new(&config(20, 5)).unwrap();
        let id = ingest(&engine, &prose(8)).await;

        let report = engine.get_document_status(&id).unwrap();
        assert_eq!(report.document.status, DocumentStatus::Processing);
        assert!(report.progress.total > 1);
        assert_eq!(report.progress.pending, report.progress.total);
        assert_eq!(report.queue_status.queued, report.progress.total);

        let again = engine.get_document_status(&id).unwrap();
        assert_eq!(report.progress, again.progress);
        assert_eq!(report.queue_status, again.queue_status);
    }

    #[tokio::test]
    async fn test_pull_model_complete_and_fail() {
        let engine = PipelineEngine::new(&config(20, 0)).unwrap();
        let worker = engine
            .register_worker(WorkerSpec::new("w", &["text"], 1))
            .unwrap();
        let id = ingest(&engine, &prose(5)).await;
        let total = engine.get_document_status(&id).unwrap().progress.total;

        let chunk = engine.get_next_chunk(Some(&worker)).await.unwrap().unwrap();
        assert_eq!(chunk.status, ChunkStatus::Processing);
        assert_eq!(chunk.assigned_worker.as_deref(), Some(worker.as_str()));
        // capacity 1: nothing else until this one is settled
        assert!(engine.get_next_chunk(Some(&worker)).await.unwrap().is_none());

        let result = engine
            .processor
            .process(&chunk, &ProcessingContext::new(worker.clone()));
        assert!(engine.complete_chunk(&chunk.id, result.clone(), "someone-else").is_err());
        engine.complete_chunk(&chunk.id, result, &worker).unwrap();
        assert_eq!(engine.coordinator().worker(&worker).unwrap().current_load, 0);

        let second = engine.get_next_chunk(Some(&worker)).await.unwrap().unwrap();
        engine.fail_chunk(&second.id, "model timeout", &worker).unwrap();

        let report = engine.get_document_status(&id).unwrap();
        assert_eq!(report.progress.completed, 1);
        assert_eq!(report.progress.failed, 1);
        assert_eq!(report.queue_status.queued, total - 2);
        assert_eq!(report.document.status, DocumentStatus::Processing);
    }

    #[tokio::test]
    async fn test_unregister_fails_claimed_chunk() {
        let engine = PipelineEngine::new(&config(50, 0)).unwrap();
        let worker = engine
            .register_worker(WorkerSpec::new("w", &["text"], 1))
            .unwrap();
        let id = ingest(&engine, &prose(2)).await;

        let chunk = engine.get_next_chunk(Some(&worker)).await.unwrap().unwrap();
        assert_eq!(engine.unregister_worker(&worker).unwrap(), vec![chunk.id.clone()]);

        let stored = engine.store().chunks.get(&chunk.id).unwrap();
        assert_eq!(stored.status, ChunkStatus::Error);
        assert!(stored.error.unwrap().contains("unregistered"));
        assert!(engine.store().workers.get(&worker).is_none());

        let report = engine.get_document_status(&id).unwrap();
        assert_eq!(report.document.status, DocumentStatus::Error);
        assert!(report.progress.is_done());

        let result = engine
            .processor
            .process(&chunk, &ProcessingContext::new(worker.clone()));
        assert!(engine.complete_chunk(&chunk.id, result, &worker).is_err());
    }

    #[tokio::test]
    async fn test_results_after_task_failed_elsewhere() {
        let engine = PipelineEngine::new(&config(50, 0)).unwrap();
        let worker = engine
            .register_worker(WorkerSpec::new("w", &["text"], 2))
            .unwrap();
        let first = ingest(&engine, &prose(2)).await;
        let second = ingest(&engine, &prose(3)).await;

        let a = engine.get_next_chunk(Some(&worker)).await.unwrap().unwrap();
        let b = engine.get_next_chunk(Some(&worker)).await.unwrap().unwrap();
        // the coordinator fails both tasks without the engine hearing of it
        engine.coordinator().unregister_worker(&worker).unwrap();

        let result = engine
            .processor
            .process(&a, &ProcessingContext::new(worker.clone()));
        assert!(matches!(
            engine.complete_chunk(&a.id, result, &worker),
            Err(PipelineError::InvalidTransition { .. })
        ));
        engine.fail_chunk(&b.id, "model timeout", &worker).unwrap();

        for (doc_id, chunk_id) in [(&first, &a.id), (&second, &b.id)] {
            assert_eq!(engine.store().chunks.get(chunk_id).unwrap().status, ChunkStatus::Error);
            assert_eq!(
                engine.get_document_status(doc_id).unwrap().document.status,
                DocumentStatus::Error
            );
        }
    }

    /// Text strategy that signals when it starts and waits to be released
    struct Gated {
        started: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl ProcessingStrategy for Gated {
        fn name(&self) -> &str {
            "gated"
        }
        fn content_type(&self) -> ContentType {
            ContentType::Text
        }
        fn priority(&self) -> u32 {
            0
        }
        fn process(
            &self,
            content: &str,
            ctx: &ProcessingContext,
            processor: &ChunkProcessor,
        ) -> Result<StrategyOutput> {
            let _ = self.started.lock().send(());
            let _ = self.release.lock().recv();
            TextStrategy.process(content, ctx, processor)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_survives_worker_leaving() {
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let mut processor = ChunkProcessor::empty();
        processor.register(Arc::new(Gated {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        }));
        let engine =
            PipelineEngine::with_processor(&config(50, 0), PipelineStore::in_memory(), processor)
                .unwrap();
        let worker = engine
            .register_worker(WorkerSpec::new("w", &["text"], 1))
            .unwrap();
        let id = ingest(&engine, &prose(2)).await;

        let runner = {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            tokio::spawn(async move { engine.run_document(&id, &[]).await })
        };
        tokio::task::spawn_blocking(move || started_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let stranded = engine.unregister_worker(&worker).unwrap();
        assert_eq!(stranded.len(), 1);
        release_tx.send(()).unwrap();

        let report = runner.await.unwrap().unwrap();
        assert_eq!(report.document.status, DocumentStatus::Error);
        assert_eq!(report.progress.failed, 1);
        assert_eq!(engine.get_coordination_statistics().total_load, 0);
    }

    #[tokio::test]
    async fn test_failed_hand_out_releases_allocation() {
        let engine = PipelineEngine::new(&config(50, 0)).unwrap();
        let worker = engine
            .register_worker(WorkerSpec::new("w", &["text"], 1))
            .unwrap();
        let id = ingest(&engine, &prose(2)).await;

        let chunk_id = engine.pop_queued(Some(&id)).unwrap();
        let chunk = engine.store().chunks.get(&chunk_id).unwrap();
        let task_id = engine
            .coordinator()
            .allocate_task_to(&worker, PipelineEngine::task_request(&chunk))
            .await
            .unwrap();

        engine.release_claim(&chunk_id, &task_id, &PipelineError::invalid("store unavailable"));
        assert_eq!(engine.coordinator().worker(&worker).unwrap().current_load, 0);
        assert_eq!(engine.coordinator().task(&task_id).unwrap().status, TaskStatus::Failed);
        assert_eq!(engine.get_document_status(&id).unwrap().queue_status.queued, 1);

        let next = engine.get_next_chunk(Some(&worker)).await.unwrap().unwrap();
        assert_eq!(next.id, chunk_id);
    }

    #[tokio::test]
    async fn test_handed_out_tasks_are_not_rebalanced() {
        let engine = PipelineEngine::new(&config(50, 0)).unwrap();
        let busy = engine
            .register_worker(WorkerSpec::new("busy", &["text"], 1))
            .unwrap();
        engine
            .register_worker(WorkerSpec::new("idle", &["text"], 4))
            .unwrap();
        ingest(&engine, &prose(2)).await;

        let chunk = engine.get_next_chunk(Some(&busy)).await.unwrap().unwrap();
        let task_id = chunk.task_id.clone().unwrap();
        assert_eq!(engine.coordinator().task(&task_id).unwrap().status, TaskStatus::InProgress);

        let report = engine.coordinator().rebalance().await;
        assert_eq!(report.overloaded, vec![busy.clone()]);
        assert!(report.moves.is_empty());
        assert!(engine.coordinator().reassign_task(&task_id, None).await.is_err());
    }

    #[tokio::test]
    async fn test_run_document_completes() {
        let engine = PipelineEngine::new(&config(30, 5)).unwrap();
        for spec in crate::config::default_workers() {
            engine.register_worker(spec).unwrap();
        }
        let id = ingest(&engine, &prose(12)).await;

        let report = engine.run_document(&id, &[]).await.unwrap();
        assert_eq!(report.document.status, DocumentStatus::Completed);
        assert!(report.progress.is_done());
        assert_eq!(report.progress.percentage, 100.0);
        assert_eq!(report.queue_status.queued, 0);

        let stats = engine.get_coordination_statistics();
        assert_eq!(stats.total_load, 0);
        assert_eq!(engine.store().tasks.len(), report.progress.total);
        assert!(engine.store().workers.len() >= 4);
    }

    #[tokio::test]
    async fn test_run_without_workers_fails_document() {
        let engine = PipelineEngine::new(&config(20, 0)).unwrap();
        let id = ingest(&engine, &prose(4)).await;

        let report = engine.run_document(&id, &[]).await.unwrap();
        assert_eq!(report.document.status, DocumentStatus::Error);
        assert_eq!(report.progress.failed, report.progress.total);

        let chunk_id = report.document.chunk_ids[0].clone();
        let chunk = engine.store().chunks.get(&chunk_id).unwrap();
        assert!(chunk.error.unwrap().contains("no suitable worker"));

        engine.reprocess_chunk(&chunk_id).unwrap();
        let report = engine.get_document_status(&id).unwrap();
        assert_eq!(report.document.status, DocumentStatus::Processing);
        assert_eq!(report.progress.pending, 1);
        assert_eq!(report.queue_status.queued, 1);

        engine
            .register_worker(WorkerSpec::new("late", &["text"], 1))
            .unwrap();
        let report = engine.run_document(&id, &[]).await.unwrap();
        assert_eq!(report.document.status, DocumentStatus::Completed);
        assert_eq!(report.progress.completed, 1);
    }

    #[tokio::test]
    async fn test_reprocess_requires_error() {
        let engine = PipelineEngine::new(&config(20, 0)).unwrap();
        let id = ingest(&engine, &prose(3)).await;
        let chunk_id = engine.get_document_status(&id).unwrap().document.chunk_ids[0].clone();
        assert!(matches!(
            engine.reprocess_chunk(&chunk_id),
            Err(PipelineError::InvalidTransition { .. })
        ));
        assert!(matches!(
            engine.reprocess_chunk("nope:0"),
            Err(PipelineError::UnknownChunk(_))
        ));
    }

    #[tokio::test]
    async fn test_reconstruct_matches_checksum() {
        let engine = PipelineEngine::new(&config(15, 4)).unwrap();
        let text = format!("\n  {}\n\n", prose(6));
        let id = ingest(&engine, &text).await;
        assert_eq!(engine.reconstruct_document(&id).unwrap(), text.trim());
    }

    #[tokio::test]
    async fn test_finalize_and_deliver() {
        let engine = PipelineEngine::new(&config(30, 5)).unwrap();
        for spec in crate::config::default_workers() {
            engine.register_worker(spec).unwrap();
        }
        let channel = Arc::new(MemoryChannel::new("db"));
        engine.register_channel(channel.clone());

        let id = ingest(&engine, &prose(10)).await;
        let early = engine
            .finalize_document(&id, &ValidationCriteria::default(), &[])
            .await;
        assert!(early.is_err());

        engine.run_document(&id, &[]).await.unwrap();
        let goals = vec!["turbine efficiency".to_string()];
        let result = engine
            .finalize_document(&id, &ValidationCriteria::default().with_accuracy(0.5), &goals)
            .await
            .unwrap();
        assert_eq!(result.content_id, id);
        assert_eq!(result.validations.len(), 1);
        assert_eq!(result.evaluations.len(), 5);
        assert_eq!(result.synthesized.themes[0], "turbine efficiency");
        assert!(!result.results.is_empty());
        assert!(result.results.iter().all(|r| r.content_type == ContentType::Text));

        let record = engine
            .deliver_result(result, OutputFormat::Json, "db", DeliveryType::Immediate)
            .await
            .unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(channel.rows().len(), 1);
    }

    #[test]
    fn test_synthesize_dedups_findings() {
        let chunk = Chunk::new("d", 0, "x".into());
        let mut a = ProcessingResult::failure(&chunk, "text", "w", "");
        a.success = true;
        a.summary = "Turbines lose output.".into();
        a.key_points = vec!["Sediment cuts output".into()];
        a.quality_score = 0.4;
        let mut b = a.clone();
        b.quality_score = 0.9;
        b.key_points = vec!["Dredging restores output".into()];
        let c = a.clone();

        let info = synthesize(&[a, b, c], &[]);
        assert_eq!(
            info.key_findings,
            vec!["Dredging restores output", "Sediment cuts output"]
        );
        assert_eq!(info.sources, 3);
        assert!(info.summary.starts_with("Turbines lose output."));
    }
}
