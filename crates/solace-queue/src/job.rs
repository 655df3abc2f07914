//! Job records, enqueue options and queue statistics.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use solace_types::{JobStatus, QueueName};
use std::time::Duration;

/// Exponential backoff: the retry after failed attempt `n` (zero-based)
/// waits `base × 2^n`, capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            cap_ms: cap.as_millis() as u64,
        }
    }

    /// Delay before the next try, given the zero-based index of the attempt
    /// that just failed.
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(failed_attempt).unwrap_or(u64::MAX);
        let delay = self.base_ms.saturating_mul(factor).min(self.cap_ms);
        Duration::from_millis(delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 60_000,
        }
    }
}

/// Per-enqueue options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Hold the job back for this long before it becomes claimable.
    pub delay: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            delay: Duration::ZERO,
        }
    }
}

/// A unit of deferred work on a named queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: i64,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    /// Number of attempts started so far, including the current one.
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub status: JobStatus,
    pub enqueued_at_ms: i64,
    pub run_at_ms: i64,
    pub last_error: Option<String>,
}

impl Job {
    /// Decodes the payload into the queue's typed payload shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Returned by a successful enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: i64,
    pub queue: QueueName,
}

/// A follow-up job enqueued atomically with the completion of its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct NextJob {
    pub queue: QueueName,
    pub payload: serde_json::Value,
    /// `None` uses the broker's defaults for `queue`.
    pub options: Option<JobOptions>,
}

impl NextJob {
    pub fn new<T: Serialize>(queue: QueueName, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            queue,
            payload: serde_json::to_value(payload)?,
            options: None,
        })
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled again after `delay`.
    Retrying { delay: Duration },
    /// Moved to the dead state.
    Dead,
}

/// Aggregate job counts of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    /// Waiting jobs whose retry delay has not elapsed yet.
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Observability view of a queue. Unhealthy queues still accept enqueues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    pub queue: QueueName,
    #[serde(flatten)]
    pub counts: QueueCounts,
    pub healthy: bool,
}

impl QueueHealth {
    pub fn new(queue: QueueName, counts: QueueCounts, failed_threshold: u64) -> Self {
        Self {
            queue,
            counts,
            healthy: counts.failed <= failed_threshold,
        }
    }
}
