//! Retry with exponential backoff and an audit log of failed attempts
//!
//! Used by message passing (at-least-once up to `max_retries`) and by result
//! delivery (bounded attempt count). Exhausted operations are logged as
//! `Failed` and reported back to the caller. The log keeps a bounded window
//! of recent attempts.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ============================================================================
// Retry Policy
// ============================================================================

/// Backoff policy shared by messaging and delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Initial delay between retries (doubles each attempt)
    pub initial_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl RetryPolicy {
    /// Policy allowing `attempts` total tries (at least one)
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_retries: attempts.saturating_sub(1),
            ..Default::default()
        }
    }

    pub fn with_delays(mut self, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.initial_delay_ms = initial_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Backoff before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(20);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

// ============================================================================
// Heal Log
// ============================================================================

/// Outcome recorded for one failed attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealResult {
    /// Failed, a later attempt succeeded
    Healed,
    /// Failed, another attempt follows
    Retrying,
    /// Failed after all retries
    Failed,
}

/// Entry in the heal log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealLogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Operation kind ("message", "delivery")
    pub subject: String,
    /// Message id, delivery record id, ...
    pub target: String,
    pub error: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub result: HealResult,
    pub duration_ms: u64,
}

/// Entries kept before the oldest are evicted
pub const DEFAULT_HEAL_LOG_CAPACITY: usize = 4096;

/// Bounded log of failed attempts, oldest evicted first
pub struct HealLog {
    entries: RwLock<VecDeque<HealLogEntry>>,
    capacity: usize,
    evicted: AtomicUsize,
}

impl Default for HealLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HEAL_LOG_CAPACITY)
    }
}

impl HealLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
            evicted: AtomicUsize::new(0),
        }
    }

    pub fn log(&self, entry: HealLogEntry) {
        let mut entries = self.entries.write();
        while entries.len() >= self.capacity {
            entries.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(entry);
    }

    /// Mark the open `Retrying` entries of `target` as healed
    fn mark_healed(&self, subject: &str, target: &str) {
        for entry in self.entries.write().iter_mut() {
            if entry.subject == subject
                && entry.target == target
                && entry.result == HealResult::Retrying
            {
                entry.result = HealResult::Healed;
            }
        }
    }

    pub fn entries_for(&self, target: &str) -> Vec<HealLogEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.target == target)
            .cloned()
            .collect()
    }

    /// Get failed entries (for reporting)
    pub fn get_failed(&self) -> Vec<HealLogEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.result == HealResult::Failed)
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> HealSummary {
        let entries = self.entries.read();
        let count = |r: HealResult| entries.iter().filter(|e| e.result == r).count();
        HealSummary {
            total_attempts: entries.len(),
            healed: count(HealResult::Healed),
            failed: count(HealResult::Failed),
            retrying: count(HealResult::Retrying),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealSummary {
    pub total_attempts: usize,
    pub healed: usize,
    pub failed: usize,
    pub retrying: usize,
    /// Entries dropped to stay within capacity
    pub evicted: usize,
}

// ============================================================================
// Retry Wrapper
// ============================================================================

/// Result of a retried operation plus the number of attempts made
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// `operation` receives the 0-based attempt number. Every failure is logged
/// to `log` under `subject`/`target`.
pub async fn with_retry_async<T, E, F, Fut>(
    policy: &RetryPolicy,
    log: &HealLog,
    subject: &str,
    target: &str,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        let start = Instant::now();
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    log.mark_healed(subject, target);
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                };
            }
            Err(e) => {
                let last = attempt + 1 >= max_attempts;
                log.log(HealLogEntry {
                    timestamp: chrono::Utc::now(),
                    subject: subject.to_string(),
                    target: target.to_string(),
                    error: e.to_string(),
                    attempt: attempt + 1,
                    result: if last {
                        HealResult::Failed
                    } else {
                        HealResult::Retrying
                    },
                    duration_ms: start.elapsed().as_millis() as u64,
                });

                if last {
                    warn!(
                        "{} {} failed after {} attempts: {}",
                        subject, target, max_attempts, e
                    );
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt + 1,
                    };
                }

                let delay = policy.delay_for(attempt);
                debug!(
                    "Retry {} of {} for {} {}, waiting {}ms",
                    attempt + 1,
                    policy.max_retries,
                    subject,
                    target,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
