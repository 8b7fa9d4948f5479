//! Message passing between the coordinator and workers
//!
//! At-least-once delivery through a pluggable transport. Recipients that fail
//! are retried with backoff up to the policy's `max_retries`; a message that
//! still has undelivered recipients ends in `MessageStatus::Failed` and stays
//! in the message table for the caller to inspect. Processed messages are
//! kept only for a bounded window.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::agents::{Message, MessageStatus, SwarmStats};
use super::heal::{with_retry_async, HealLog, RetryPolicy};
use crate::error::{PipelineError, Result};

// ============================================================================
// Transport
// ============================================================================

/// Delivers one message to one recipient
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn deliver(&self, recipient: &str, message: &Message) -> Result<()>;

    fn name(&self) -> &str;
}

/// In-process transport: one FIFO mailbox per registered worker
#[derive(Default)]
pub struct MailboxTransport {
    mailboxes: RwLock<HashMap<String, VecDeque<Message>>>,
}

impl MailboxTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, worker_id: &str) {
        self.mailboxes
            .write()
            .entry(worker_id.to_string())
            .or_default();
    }

    /// Remove a mailbox, returning anything still queued in it
    pub fn close(&self, worker_id: &str) -> Vec<Message> {
        self.mailboxes
            .write()
            .remove(worker_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn drain(&self, worker_id: &str) -> Vec<Message> {
        self.mailboxes
            .write()
            .get_mut(worker_id)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn pending(&self, worker_id: &str) -> usize {
        self.mailboxes
            .read()
            .get(worker_id)
            .map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl MessageTransport for MailboxTransport {
    async fn deliver(&self, recipient: &str, message: &Message) -> Result<()> {
        match self.mailboxes.write().get_mut(recipient) {
            Some(queue) => {
                queue.push_back(message.clone());
                Ok(())
            }
            None => Err(PipelineError::MessageDeliveryFailure {
                message_id: message.id.clone(),
                reason: format!("no mailbox for recipient {}", recipient),
            }),
        }
    }

    fn name(&self) -> &str {
        "mailbox"
    }
}

// ============================================================================
// Message Bus
// ============================================================================

/// Processed messages kept before the oldest are pruned
pub const DEFAULT_PROCESSED_RETENTION: usize = 256;

pub struct MessageBus {
    mailboxes: Arc<MailboxTransport>,
    transport: Arc<dyn MessageTransport>,
    policy: RetryPolicy,
    messages: RwLock<HashMap<String, Message>>,
    /// Acknowledged ids, oldest first
    processed: Mutex<VecDeque<String>>,
    retain_processed: usize,
    log: Arc<HealLog>,
    stats: Arc<SwarmStats>,
}

impl MessageBus {
    /// Bus delivering into in-process mailboxes
    pub fn new(policy: RetryPolicy, stats: Arc<SwarmStats>) -> Self {
        let mailboxes = Arc::new(MailboxTransport::new());
        Self {
            transport: mailboxes.clone(),
            mailboxes,
            policy,
            messages: RwLock::new(HashMap::new()),
            processed: Mutex::new(VecDeque::new()),
            retain_processed: DEFAULT_PROCESSED_RETENTION,
            log: Arc::new(HealLog::new()),
            stats,
        }
    }

    pub fn with_processed_retention(mut self, retain: usize) -> Self {
        self.retain_processed = retain;
        self
    }

    /// Replace the transport (mailboxes stay available for `receive`)
    pub fn with_transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_log(mut self, log: Arc<HealLog>) -> Self {
        self.log = log;
        self
    }

    pub fn log(&self) -> &Arc<HealLog> {
        &self.log
    }

    pub fn mailboxes(&self) -> &MailboxTransport {
        &self.mailboxes
    }

    /// Send and await the terminal delivery state
    pub async fn send(&self, mut message: Message) -> Result<Message> {
        if message.recipients.is_empty() {
            return Err(PipelineError::invalid("message has no recipients"));
        }

        self.messages
            .write()
            .insert(message.id.clone(), message.clone());
        SwarmStats::incr(&self.stats.messages_sent);

        let outstanding = Mutex::new(message.recipients.clone());
        let outcome = {
            let snapshot = message.clone();
            with_retry_async(&self.policy, &self.log, "message", &snapshot.id, |attempt| {
                let transport = Arc::clone(&self.transport);
                let msg = snapshot.clone();
                let outstanding = &outstanding;
                async move {
                    let targets = outstanding.lock().clone();
                    let mut failed = Vec::new();
                    let mut last_error = None;
                    for recipient in targets {
                        if let Err(e) = transport.deliver(&recipient, &msg).await {
                            debug!(
                                "Message {} to {} failed on attempt {}: {}",
                                msg.id,
                                recipient,
                                attempt + 1,
                                e
                            );
                            failed.push(recipient);
                            last_error = Some(e);
                        }
                    }
                    *outstanding.lock() = failed;
                    match last_error {
                        None => Ok(()),
                        Some(e) => Err(e),
                    }
                }
            })
            .await
        };

        message.retries = outcome.attempts.saturating_sub(1);
        for _ in 0..message.retries {
            SwarmStats::incr(&self.stats.messages_retried);
        }

        match outcome.result {
            Ok(()) => {
                message.status = MessageStatus::Delivered;
                message.delivered_at = Some(Utc::now());
            }
            Err(e) => {
                warn!(
                    "Message {} failed after {} attempts: {}",
                    message.id, outcome.attempts, e
                );
                message.status = MessageStatus::Failed;
                message.last_error = Some(e.to_string());
                SwarmStats::incr(&self.stats.messages_failed);
            }
        }

        self.messages
            .write()
            .insert(message.id.clone(), message.clone());
        Ok(message)
    }

    /// Send in the background; the id is returned immediately and the
    /// outcome is observable through `message`.
    pub fn dispatch(self: &Arc<Self>, message: Message) -> Result<String> {
        if message.recipients.is_empty() {
            return Err(PipelineError::invalid("message has no recipients"));
        }
        let id = message.id.clone();
        self.messages.write().insert(id.clone(), message.clone());

        let bus = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = bus.send(message).await {
                warn!("Dispatch failed: {}", e);
            }
        });
        Ok(id)
    }

    /// Drain a worker's mailbox
    pub fn receive(&self, worker_id: &str) -> Vec<Message> {
        self.mailboxes.drain(worker_id)
    }

    /// Mark a delivered message as processed
    pub fn acknowledge(&self, message_id: &str) -> Result<()> {
        let mut messages = self.messages.write();
        let message = messages
            .get_mut(message_id)
            .ok_or_else(|| PipelineError::invalid(format!("unknown message {}", message_id)))?;
        if message.status != MessageStatus::Delivered {
            return Err(PipelineError::transition(
                "message",
                message.status,
                MessageStatus::Processed,
            ));
        }
        message.status = MessageStatus::Processed;

        let mut processed = self.processed.lock();
        processed.push_back(message_id.to_string());
        while processed.len() > self.retain_processed {
            if let Some(oldest) = processed.pop_front() {
                messages.remove(&oldest);
            }
        }
        Ok(())
    }

    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.messages.read().get(message_id).cloned()
    }

    pub fn failed_messages(&self) -> Vec<Message> {
        self.messages
            .read()
            .values()
            .filter(|m| m.status == MessageStatus::Failed)
            .cloned()
            .collect()
    }

    pub fn counts_by_status(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for message in self.messages.read().values() {
            *counts.entry(message.status.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::agents::MessageType;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn bus() -> MessageBus {
        MessageBus::new(
            RetryPolicy::default().with_delays(1, 5),
            Arc::new(SwarmStats::new()),
        )
    }

    fn note(to: &[&str]) -> Message {
        Message::new(
            "coordinator",
            to.iter().map(|s| s.to_string()).collect(),
            MessageType::Notification,
            serde_json::json!({"hello": "world"}),
        )
    }

    /// Fails the first `failures` deliveries, then succeeds
    struct FlakyTransport {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageTransport for FlakyTransport {
        async fn deliver(&self, _recipient: &str, message: &Message) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::Relaxed) < self.failures {
                return Err(PipelineError::MessageDeliveryFailure {
                    message_id: message.id.clone(),
                    reason: "connection reset".into(),
                });
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_mailbox() {
        let bus = bus();
        bus.mailboxes().open("w1");

        let sent = bus.send(note(&["w1"])).await.unwrap();
        assert_eq!(sent.status, MessageStatus::Delivered);
        assert_eq!(sent.retries, 0);

        let inbox = bus.receive("w1");
        assert_eq!(inbox.len(), 1);
        assert!(bus.receive("w1").is_empty());

        bus.acknowledge(&sent.id).unwrap();
        assert_eq!(bus.message(&sent.id).unwrap().status, MessageStatus::Processed);
        assert!(bus.acknowledge(&sent.id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_processed_messages_pruned() {
        let bus = bus().with_processed_retention(2);
        bus.mailboxes().open("w1");

        let mut ids = Vec::new();
        for _ in 0..3 {
            let sent = bus.send(note(&["w1"])).await.unwrap();
            bus.acknowledge(&sent.id).unwrap();
            ids.push(sent.id);
        }

        assert!(bus.message(&ids[0]).is_none());
        assert!(bus.message(&ids[2]).is_some());
        assert_eq!(bus.counts_by_status().get("processed"), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_recipient_fails_after_retries() {
        let bus = bus();
        let sent = bus.send(note(&["ghost"])).await.unwrap();

        assert_eq!(sent.status, MessageStatus::Failed);
        assert_eq!(sent.retries, 3);
        assert!(sent.last_error.unwrap().contains("ghost"));
        assert_eq!(bus.failed_messages().len(), 1);
        assert_eq!(bus.counts_by_status().get("failed"), Some(&1));
        assert_eq!(bus.log().summary().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flaky_transport_recovers() {
        let transport = Arc::new(FlakyTransport {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let bus = bus().with_transport(transport);
        let sent = bus.send(note(&["w1"])).await.unwrap();

        assert_eq!(sent.status, MessageStatus::Delivered);
        assert_eq!(sent.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_recipients_only_retry_failures() {
        let bus = bus();
        bus.mailboxes().open("w1");
        let sent = bus.send(note(&["w1", "ghost"])).await.unwrap();

        assert_eq!(sent.status, MessageStatus::Failed);
        // w1 got exactly one copy despite the retries
        assert_eq!(bus.mailboxes().pending("w1"), 1);
    }

    #[tokio::test]
    async fn test_empty_recipients_rejected() {
        assert!(bus().send(note(&[])).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_returns_immediately() {
        let bus = Arc::new(bus());
        bus.mailboxes().open("w1");
        let id = bus.dispatch(note(&["w1"])).unwrap();
        assert!(bus.message(&id).is_some());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(bus.message(&id).unwrap().status, MessageStatus::Delivered);
    }

    #[test]
    fn test_close_returns_queued() {
        let transport = MailboxTransport::new();
        transport.open("w1");
        tokio_test::block_on(transport.deliver("w1", &note(&["w1"]))).unwrap();
        assert_eq!(transport.close("w1").len(), 1);
        assert_eq!(transport.pending("w1"), 0);
    }
}
