//! Delivery module - formatting, channels and delivery policies
//!
//! - Immediate: format, send with retry, record the terminal status
//! - Scheduled: record as pending, deliver immediately once the time arrives
//! - Batch: accumulate per channel and format until the batch is full or
//!   its timeout fires, then deliver one combined result

mod channels;
mod format;

pub use channels::*;
pub use format::*;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::evaluate::FinalResult;
use crate::swarm::{with_retry_async, HealLog, RetryPolicy};

// ============================================================================
// Configuration & Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Total send attempts per delivery
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    /// Directory for the file channel
    pub output_dir: PathBuf,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5000,
            batch_size: 5,
            batch_timeout_ms: 60_000,
            output_dir: PathBuf::from("docswarm-output"),
        }
    }
}

impl DeliveryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.max_attempts)
            .with_delays(self.initial_delay_ms, self.max_delay_ms)
    }

    pub fn with_batch(mut self, size: usize, timeout: Duration) -> Self {
        self.batch_size = size.max(1);
        self.batch_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryType {
    Immediate,
    Scheduled { at: DateTime<Utc> },
    Batch,
}

impl DeliveryType {
    pub fn scheduled_in(delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        DeliveryType::Scheduled { at: Utc::now() + delay }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryType::Immediate => "immediate",
            DeliveryType::Scheduled { .. } => "scheduled",
            DeliveryType::Batch => "batch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Processing => "processing",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub result_id: String,
    pub format: OutputFormat,
    pub channel: String,
    pub delivery_type: DeliveryType,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Time spent formatting
    pub processing_ms: u64,
    /// Time spent sending, retries included
    pub delivery_ms: u64,
    /// Set on members of a batch and on the batch's own record
    pub batch_id: Option<String>,
}

impl DeliveryRecord {
    fn new(result_id: &str, format: OutputFormat, channel: &str, delivery_type: DeliveryType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            result_id: result_id.to_string(),
            format,
            channel: channel.to_string(),
            delivery_type,
            status: DeliveryStatus::Pending,
            attempts: 0,
            error: None,
            size_bytes: 0,
            created_at: Utc::now(),
            scheduled_for: match delivery_type {
                DeliveryType::Scheduled { at } => Some(at),
                _ => None,
            },
            delivered_at: None,
            processing_ms: 0,
            delivery_ms: 0,
            batch_id: None,
        }
    }
}

/// Delivery statistics
#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl DeliveryStats {
    pub fn to_summary(&self) -> DeliverySummary {
        DeliverySummary {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySummary {
    pub delivered: u64,
    pub failed: u64,
    pub retried: u64,
    pub batches_flushed: u64,
    pub bytes_sent: u64,
}

/// Results waiting for the same channel and format
struct PendingBatch {
    generation: u64,
    results: Vec<FinalResult>,
    record_ids: Vec<String>,
}

type BatchKey = (String, OutputFormat);

// ============================================================================
// Delivery Service
// ============================================================================

pub struct DeliveryService {
    config: DeliveryConfig,
    policy: RetryPolicy,
    channels: RwLock<HashMap<String, Arc<dyn Channel>>>,
    records: RwLock<HashMap<String, DeliveryRecord>>,
    record_order: RwLock<Vec<String>>,
    batches: Mutex<HashMap<BatchKey, PendingBatch>>,
    next_generation: AtomicU64,
    log: Arc<HealLog>,
    stats: DeliveryStats,
}

impl DeliveryService {
    pub fn new(config: DeliveryConfig, log: Arc<HealLog>) -> Arc<Self> {
        Arc::new(Self {
            policy: config.retry_policy(),
            config,
            channels: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            record_order: RwLock::new(Vec::new()),
            batches: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            log,
            stats: DeliveryStats::default(),
        })
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn heal_log(&self) -> &Arc<HealLog> {
        &self.log
    }

    pub fn stats(&self) -> DeliverySummary {
        self.stats.to_summary()
    }

    /// Register a channel under its name, replacing any previous one
    pub fn register_channel(&self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        debug!("Registered delivery channel {} ({:?})", name, channel.kind());
        self.channels.write().insert(name, channel);
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn channel(&self, name: &str) -> Result<Arc<dyn Channel>> {
        self.channels
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownChannel(name.to_string()))
    }

    pub fn record(&self, id: &str) -> Option<DeliveryRecord> {
        self.records.read().get(id).cloned()
    }

    /// All records in creation order
    pub fn records(&self) -> Vec<DeliveryRecord> {
        let records = self.records.read();
        self.record_order
            .read()
            .iter()
            .filter_map(|id| records.get(id).cloned())
            .collect()
    }

    fn store(&self, record: DeliveryRecord) {
        let mut records = self.records.write();
        if !records.contains_key(&record.id) {
            self.record_order.write().push(record.id.clone());
        }
        records.insert(record.id.clone(), record);
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut DeliveryRecord)) {
        if let Some(record) = self.records.write().get_mut(id) {
            f(record);
        }
    }

    /// Deliver `result` to `channel` as `format` under the given policy.
    ///
    /// Immediate deliveries come back terminal. Scheduled and batched
    /// deliveries come back `Pending` unless this call filled the batch.
    pub async fn deliver_result(
        self: &Arc<Self>,
        result: FinalResult,
        format: OutputFormat,
        channel: &str,
        delivery_type: DeliveryType,
    ) -> Result<DeliveryRecord> {
        self.channel(channel)?;
        let record = DeliveryRecord::new(&result.id, format, channel, delivery_type);
        let id = record.id.clone();
        self.store(record);

        match delivery_type {
            DeliveryType::Immediate => Ok(self.deliver_now(&id, &result).await),
            DeliveryType::Scheduled { at } => {
                let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                debug!("Delivery {} scheduled in {}", id, humantime::format_duration(wait));
                let service = Arc::clone(self);
                let record_id = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    service.deliver_now(&record_id, &result).await;
                });
                self.record(&id)
                    .ok_or_else(|| PipelineError::invalid(format!("delivery record {} vanished", id)))
            }
            DeliveryType::Batch => {
                self.enqueue_batch(&id, result, format, channel).await;
                self.record(&id)
                    .ok_or_else(|| PipelineError::invalid(format!("delivery record {} vanished", id)))
            }
        }
    }

    /// Format, send with retry, and settle the record
    async fn deliver_now(&self, record_id: &str, result: &FinalResult) -> DeliveryRecord {
        let Some(mut record) = self.record(record_id) else {
            warn!("Delivery record {} missing", record_id);
            return DeliveryRecord::new(&result.id, OutputFormat::default(), "", DeliveryType::Immediate);
        };
        if record.status.is_terminal() {
            return record;
        }
        record.status = DeliveryStatus::Processing;
        self.store(record.clone());

        let started = Instant::now();
        let body = match record.format.render(result) {
            Ok(body) => body,
            Err(e) => {
                record.processing_ms = started.elapsed().as_millis() as u64;
                return self.settle(record, Err(e.to_string()), 0);
            }
        };
        record.processing_ms = started.elapsed().as_millis() as u64;
        record.size_bytes = body.len();

        let channel = match self.channel(&record.channel) {
            Ok(channel) => channel,
            Err(e) => return self.settle(record, Err(e.to_string()), 0),
        };
        let payload = DeliveryPayload {
            delivery_id: record.id.clone(),
            result_id: result.id.clone(),
            content_id: result.content_id.clone(),
            format: record.format,
            body,
        };

        let sending = Instant::now();
        let outcome = with_retry_async(&self.policy, &self.log, "delivery", &record.channel, |_| {
            channel.send(&payload)
        })
        .await;
        record.delivery_ms = sending.elapsed().as_millis() as u64;

        let result = outcome.result.map_err(|e| e.to_string());
        self.settle(record, result, outcome.attempts)
    }

    fn settle(
        &self,
        mut record: DeliveryRecord,
        result: std::result::Result<(), String>,
        attempts: u32,
    ) -> DeliveryRecord {
        record.attempts = attempts;
        if attempts > 1 {
            self.stats
                .retried
                .fetch_add(u64::from(attempts - 1), Ordering::Relaxed);
        }
        match result {
            Ok(()) => {
                record.status = DeliveryStatus::Delivered;
                record.delivered_at = Some(Utc::now());
                record.error = None;
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_sent
                    .fetch_add(record.size_bytes as u64, Ordering::Relaxed);
                info!(
                    "📦 Delivered {} via {} ({}, {} attempt{})",
                    record.result_id,
                    record.channel,
                    humansize::format_size(record.size_bytes as u64, humansize::BINARY),
                    attempts,
                    if attempts == 1 { "" } else { "s" }
                );
            }
            Err(e) => {
                record.status = DeliveryStatus::Failed;
                record.error = Some(e);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Delivery {} via {} failed after {} attempts",
                    record.id, record.channel, attempts
                );
            }
        }
        self.store(record.clone());
        record
    }

    // ------------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------------

    async fn enqueue_batch(
        self: &Arc<Self>,
        record_id: &str,
        result: FinalResult,
        format: OutputFormat,
        channel: &str,
    ) {
        let key: BatchKey = (channel.to_string(), format);
        let (full, started) = {
            let mut batches = self.batches.lock();
            let batch = batches.entry(key.clone()).or_insert_with(|| PendingBatch {
                generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                results: Vec::new(),
                record_ids: Vec::new(),
            });
            batch.results.push(result);
            batch.record_ids.push(record_id.to_string());
            debug!(
                "Batch {} for {}/{} holds {} of {}",
                batch.generation,
                key.0,
                key.1,
                batch.results.len(),
                self.config.batch_size
            );
            let started = (batch.results.len() == 1).then_some(batch.generation);
            (batch.results.len() >= self.config.batch_size, started)
        };

        if full {
            self.flush_batch(&key, None).await;
        } else if let Some(generation) = started {
            let service = Arc::clone(self);
            let timeout = Duration::from_millis(self.config.batch_timeout_ms);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                service.flush_batch(&key, Some(generation)).await;
            });
        }
    }

    /// Take the batch for `key` and deliver it. With `generation` set, only
    /// that batch is flushed; a newer batch under the same key is left alone.
    async fn flush_batch(&self, key: &BatchKey, generation: Option<u64>) -> Option<DeliveryRecord> {
        let batch = {
            let mut batches = self.batches.lock();
            match batches.get(key) {
                Some(b) if generation.map_or(true, |g| g == b.generation) => batches.remove(key),
                _ => None,
            }
        }?;

        let batch_id = format!("batch-{}", batch.generation);
        let combined = FinalResult::combine(&batch_id, &batch.results)?;
        info!(
            "Flushing batch {} ({} results) to {}",
            batch_id,
            batch.results.len(),
            key.0
        );

        let mut record = DeliveryRecord::new(&combined.id, key.1, &key.0, DeliveryType::Batch);
        record.batch_id = Some(batch_id.clone());
        let record_id = record.id.clone();
        self.store(record);
        for id in &batch.record_ids {
            self.update(id, |r| {
                r.batch_id = Some(batch_id.clone());
                r.status = DeliveryStatus::Processing;
            });
        }

        let settled = self.deliver_now(&record_id, &combined).await;
        self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);
        for id in &batch.record_ids {
            self.update(id, |r| {
                r.status = settled.status;
                r.attempts = settled.attempts;
                r.error = settled.error.clone();
                r.delivered_at = settled.delivered_at;
                r.size_bytes = settled.size_bytes;
                r.delivery_ms = settled.delivery_ms;
            });
        }
        Some(settled)
    }

    /// Results waiting in unflushed batches
    pub fn pending_batched(&self) -> usize {
        self.batches.lock().values().map(|b| b.results.len()).sum()
    }

    /// Flush every pending batch now, returning the batch records
    pub async fn flush_batches(&self) -> Vec<DeliveryRecord> {
        let keys: Vec<BatchKey> = self.batches.lock().keys().cloned().collect();
        let mut flushed = Vec::new();
        for key in keys {
            if let Some(record) = self.flush_batch(&key, None).await {
                flushed.push(record);
            }
        }
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::{create_final_result, SynthesizedInfo};

    fn final_result(id: &str) -> FinalResult {
        create_final_result(
            id,
            vec![],
            vec![],
            SynthesizedInfo {
                key_findings: vec![format!("finding from {}", id)],
                ..Default::default()
            },
            vec![],
        )
    }

    fn service(config: DeliveryConfig) -> (Arc<DeliveryService>, Arc<MemoryChannel>) {
        let service = DeliveryService::new(config, Arc::new(HealLog::new()));
        let channel = Arc::new(MemoryChannel::new("db"));
        service.register_channel(channel.clone());
        (service, channel)
    }

    fn quick_retries() -> DeliveryConfig {
        DeliveryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_immediate_delivery() {
        let (service, channel) = service(quick_retries());
        let record = service
            .deliver_result(final_result("doc-1"), OutputFormat::Json, "db", DeliveryType::Immediate)
            .await
            .unwrap();

        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempts, 1);
        assert!(record.size_bytes > 0);
        assert!(record.delivered_at.is_some());
        assert_eq!(channel.rows().len(), 1);
        assert_eq!(service.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_unknown_channel_rejected() {
        let (service, _) = service(quick_retries());
        let err = service
            .deliver_result(final_result("d"), OutputFormat::Json, "nope", DeliveryType::Immediate)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownChannel(_)));
        assert!(service.records().is_empty());
    }

    #[tokio::test]
    async fn test_retry_then_deliver() {
        let service = DeliveryService::new(quick_retries(), Arc::new(HealLog::new()));
        let channel = Arc::new(MemoryChannel::new("flaky").with_failures(2));
        service.register_channel(channel.clone());

        let record = service
            .deliver_result(final_result("d"), OutputFormat::Text, "flaky", DeliveryType::Immediate)
            .await
            .unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempts, 3);
        assert_eq!(service.stats().retried, 2);
        assert_eq!(service.heal_log().entries_for("flaky").len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_terminally() {
        let service = DeliveryService::new(quick_retries(), Arc::new(HealLog::new()));
        let channel = Arc::new(MemoryChannel::new("down").with_failures(10));
        service.register_channel(channel.clone());

        let record = service
            .deliver_result(final_result("d"), OutputFormat::Text, "down", DeliveryType::Immediate)
            .await
            .unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert!(record.error.as_deref().unwrap().contains("simulated outage"));
        assert_eq!(channel.attempts(), 3);
        assert_eq!(service.record(&record.id).unwrap().status, DeliveryStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_delivery_waits() {
        let (service, channel) = service(quick_retries());
        let record = service
            .deliver_result(
                final_result("d"),
                OutputFormat::Prose,
                "db",
                DeliveryType::scheduled_in(Duration::from_secs(300)),
            )
            .await
            .unwrap();
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert!(record.scheduled_for.is_some());

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(channel.rows().is_empty());

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(channel.rows().len(), 1);
        assert_eq!(service.record(&record.id).unwrap().status, DeliveryStatus::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_waits_for_size_or_timeout() {
        let config = quick_retries().with_batch(5, Duration::from_secs(60));
        let (service, channel) = service(config);

        let mut ids = Vec::new();
        for i in 0..3 {
            let record = service
                .deliver_result(final_result(&format!("d{}", i)), OutputFormat::Json, "db", DeliveryType::Batch)
                .await
                .unwrap();
            assert_eq!(record.status, DeliveryStatus::Pending);
            ids.push(record.id);
            tokio::time::sleep(Duration::from_secs(3)).await;
        }

        // 9s in: nothing flushed
        assert!(channel.rows().is_empty());
        assert_eq!(service.pending_batched(), 3);

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(channel.rows().is_empty());

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(channel.rows().len(), 1);
        assert_eq!(service.pending_batched(), 0);
        for id in &ids {
            let record = service.record(id).unwrap();
            assert_eq!(record.status, DeliveryStatus::Delivered);
            assert!(record.batch_id.is_some());
        }

        let body: serde_json::Value = serde_json::from_str(&channel.rows()[0].body).unwrap();
        assert_eq!(body["summary"]["key_findings"].as_array().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_once() {
        let config = quick_retries().with_batch(2, Duration::from_secs(60));
        let (service, channel) = service(config);

        service
            .deliver_result(final_result("a"), OutputFormat::Json, "db", DeliveryType::Batch)
            .await
            .unwrap();
        let second = service
            .deliver_result(final_result("b"), OutputFormat::Json, "db", DeliveryType::Batch)
            .await
            .unwrap();
        assert_eq!(second.status, DeliveryStatus::Delivered);
        assert_eq!(channel.rows().len(), 1);

        // The next batch starts at 30s; the first batch's timer (60s) leaves it alone
        tokio::time::sleep(Duration::from_secs(30)).await;
        service
            .deliver_result(final_result("c"), OutputFormat::Json, "db", DeliveryType::Batch)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(channel.rows().len(), 1);
        assert_eq!(service.pending_batched(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(channel.rows().len(), 2);
        assert_eq!(service.stats().batches_flushed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_batches_forces_pending() {
        let (service, channel) = service(quick_retries());
        service
            .deliver_result(final_result("a"), OutputFormat::Csv, "db", DeliveryType::Batch)
            .await
            .unwrap();
        let flushed = service.flush_batches().await;
        assert_eq!(flushed.len(), 1);
        assert_eq!(channel.rows().len(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(channel.rows().len(), 1);
    }
}
