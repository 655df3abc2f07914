//! Durable job queues and worker pools for the Solace pipeline.
//!
//! The broker keeps one named queue per pipeline stage in SQLite. Each job
//! row carries its payload, attempt counter and backoff policy. A
//! [`WorkerPool`] drains one queue with a fixed number of concurrent slots,
//! hands each job to a [`JobHandler`] and converts the handler's result into
//! a broker transition:
//!
//! - success completes the job and, in the same transaction, enqueues the
//!   next stage's job if the handler asked for one;
//! - a transient fault schedules a retry after exponential backoff until the
//!   attempt budget is spent;
//! - a permanent fault, or a transient one on the final attempt, moves the
//!   job to the dead (`failed`) state exactly once.
//!
//! Because the downstream enqueue happens only on the terminal success
//! transition, a job that is retried never enqueues its successor twice.

pub mod broker;
pub mod error;
pub mod job;
pub mod store;
pub mod worker;

pub use broker::Broker;
pub use error::QueueError;
pub use job::{
    BackoffPolicy, FailOutcome, Job, JobHandle, JobOptions, NextJob, QueueCounts, QueueHealth,
};
pub use worker::{JobError, JobEvent, JobHandler, PoolSettings, StageOutcome, WorkerPool};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
