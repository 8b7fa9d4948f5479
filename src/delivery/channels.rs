//! Delivery channels
//!
//! A channel takes a formatted payload and either accepts it or returns a
//! `Delivery` error. Retries are the caller's concern.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{broadcast, mpsc};

use super::format::OutputFormat;
use crate::error::{PipelineError, Result};

/// Formatted result ready to send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub delivery_id: String,
    pub result_id: String,
    pub content_id: String,
    pub format: OutputFormat,
    pub body: String,
}

impl DeliveryPayload {
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    File,
    Http,
    Queue,
    Stream,
    Console,
    Memory,
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    async fn send(&self, payload: &DeliveryPayload) -> Result<()>;
}

fn delivery_error(channel: &str, reason: impl std::fmt::Display) -> PipelineError {
    PipelineError::Delivery {
        channel: channel.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// File
// ============================================================================

/// Writes each payload to `<dir>/<content_id>-<delivery_id>.<ext>` via a temp file and rename
pub struct FileChannel {
    name: String,
    dir: PathBuf,
}

impl FileChannel {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, payload: &DeliveryPayload) -> PathBuf {
        let stem: String = payload
            .content_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let short_id: String = payload.delivery_id.chars().take(8).collect();
        self.dir
            .join(format!("{}-{}.{}", stem, short_id, payload.format.extension()))
    }
}

#[async_trait]
impl Channel for FileChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::File
    }

    async fn send(&self, payload: &DeliveryPayload) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| delivery_error(&self.name, format!("create {}: {}", self.dir.display(), e)))?;

        let path = self.path_for(payload);
        let tmp = path.with_extension("partial");
        fs::write(&tmp, payload.body.as_bytes())
            .await
            .map_err(|e| delivery_error(&self.name, format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| delivery_error(&self.name, format!("rename {}: {}", path.display(), e)))?;

        tracing::debug!("Wrote {} bytes to {}", payload.size(), path.display());
        Ok(())
    }
}

// ============================================================================
// HTTP (API call / webhook)
// ============================================================================

/// POSTs the body to a URL; any non-2xx response is a failure
pub struct HttpChannel {
    name: String,
    url: String,
    timeout: Duration,
}

impl HttpChannel {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Channel for HttpChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Http
    }

    async fn send(&self, payload: &DeliveryPayload) -> Result<()> {
        let url = self.url.clone();
        let timeout = self.timeout;
        let content_type = payload.format.content_type();
        let delivery_id = payload.delivery_id.clone();
        let body = payload.body.clone();

        let response = tokio::task::spawn_blocking(move || {
            ureq::post(&url)
                .timeout(timeout)
                .set("Content-Type", content_type)
                .set("X-Delivery-Id", &delivery_id)
                .send_string(&body)
                .map(|r| r.status())
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| delivery_error(&self.name, format!("task failed: {}", e)))?;

        match response {
            Ok(status) if (200..300).contains(&status) => Ok(()),
            Ok(status) => Err(delivery_error(&self.name, format!("HTTP {}", status))),
            Err(e) => Err(delivery_error(&self.name, e)),
        }
    }
}

// ============================================================================
// Queue / Stream
// ============================================================================

/// Pushes payloads into a bounded tokio mpsc queue
pub struct QueueChannel {
    name: String,
    tx: mpsc::Sender<DeliveryPayload>,
}

impl QueueChannel {
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<DeliveryPayload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl Channel for QueueChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Queue
    }

    async fn send(&self, payload: &DeliveryPayload) -> Result<()> {
        self.tx
            .send(payload.clone())
            .await
            .map_err(|_| delivery_error(&self.name, "queue closed"))
    }
}

/// Publishes payloads to every current subscriber
pub struct StreamChannel {
    name: String,
    tx: broadcast::Sender<DeliveryPayload>,
}

impl StreamChannel {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryPayload> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Channel for StreamChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Stream
    }

    async fn send(&self, payload: &DeliveryPayload) -> Result<()> {
        self.tx
            .send(payload.clone())
            .map(|_| ())
            .map_err(|_| delivery_error(&self.name, "no subscribers"))
    }
}

// ============================================================================
// Console / Memory
// ============================================================================

pub struct ConsoleChannel;

#[async_trait]
impl Channel for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Console
    }

    async fn send(&self, payload: &DeliveryPayload) -> Result<()> {
        println!("{}", payload.body);
        Ok(())
    }
}

/// Keeps payloads as rows in memory. Can be told to fail its next N sends.
pub struct MemoryChannel {
    name: String,
    rows: Mutex<Vec<DeliveryPayload>>,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl MemoryChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn with_failures(self, failures: u32) -> Self {
        self.failures_left.store(failures, Ordering::SeqCst);
        self
    }

    pub fn rows(&self) -> Vec<DeliveryPayload> {
        self.rows.lock().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Memory
    }

    async fn send(&self, payload: &DeliveryPayload) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(delivery_error(&self.name, "simulated outage"));
        }
        self.rows.lock().push(payload.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn payload(body: &str) -> DeliveryPayload {
        DeliveryPayload {
            delivery_id: "0123456789abcdef".into(),
            result_id: "r1".into(),
            content_id: "doc/1".into(),
            format: OutputFormat::Text,
            body: body.into(),
        }
    }

    #[tokio::test]
    async fn test_file_channel_writes_atomically() {
        let dir = tempdir().unwrap();
        let channel = FileChannel::new("file", dir.path().join("out"));
        channel.send(&payload("hello")).await.unwrap();

        let path = channel.path_for(&payload("hello"));
        assert_eq!(path.file_name().unwrap(), "doc_1-01234567.txt");
        assert_eq!(fs::read_to_string(&path).await.unwrap(), "hello");
        assert!(!path.with_extension("partial").exists());
    }

    #[tokio::test]
    async fn test_queue_channel() {
        let (channel, mut rx) = QueueChannel::new("queue", 4);
        channel.send(&payload("queued")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().body, "queued");

        drop(rx);
        assert!(channel.send(&payload("lost")).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_channel_needs_subscribers() {
        let channel = StreamChannel::new("stream", 4);
        assert!(channel.send(&payload("nobody")).await.is_err());

        let mut rx = channel.subscribe();
        channel.send(&payload("live")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().body, "live");
    }

    #[tokio::test]
    async fn test_memory_channel_simulated_failures() {
        let channel = MemoryChannel::new("db").with_failures(2);
        assert!(channel.send(&payload("a")).await.is_err());
        assert!(channel.send(&payload("a")).await.is_err());
        channel.send(&payload("a")).await.unwrap();
        assert_eq!(channel.rows().len(), 1);
        assert_eq!(channel.attempts(), 3);
    }

    #[tokio::test]
    async fn test_http_channel_unreachable() {
        let channel = HttpChannel::new("webhook", "http://127.0.0.1:9/hook")
            .with_timeout(Duration::from_millis(200));
        let err = channel.send(&payload("x")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Delivery { .. }));
    }
}
