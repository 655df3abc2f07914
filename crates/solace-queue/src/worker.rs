//! Bounded-concurrency worker pools.

use crate::broker::Broker;
use crate::error::QueueError;
use crate::job::{FailOutcome, Job, NextJob};
use async_trait::async_trait;
use solace_types::QueueName;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

/// Result of a successful stage: optionally the job the next stage should run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutcome {
    pub next: Option<NextJob>,
}

impl StageOutcome {
    /// The chain ends here.
    pub fn done() -> Self {
        Self { next: None }
    }

    pub fn then(next: NextJob) -> Self {
        Self { next: Some(next) }
    }
}

/// A failed attempt, classified for the retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Infrastructure or provider fault; retried with backoff.
    Transient(String),
    /// The payload can never succeed; goes straight to the dead state.
    Permanent(String),
}

impl JobError {
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Stage handler invoked by a worker for every claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<StageOutcome, JobError>;

    /// Called once, after `job` has reached the dead state.
    async fn on_dead(&self, _job: &Job, _error: &str) {}
}

/// Lifecycle events published by worker pools.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Completed {
        queue: QueueName,
        job_id: i64,
        next_job_id: Option<i64>,
    },
    Retrying {
        queue: QueueName,
        job_id: i64,
        attempt: u32,
        delay: Duration,
    },
    Dead {
        queue: QueueName,
        job_id: i64,
        attempts: u32,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub concurrency: usize,
    /// How long an idle dispatcher waits before polling the store again.
    pub poll_interval: Duration,
    /// Upper bound on a single handler invocation.
    pub job_timeout: Duration,
    /// In-place retries of a broker write that failed transiently. After
    /// these the dispatcher keeps retrying it on every loop.
    pub transition_retries: u32,
    /// Delay before the first in-place retry; doubles on each one.
    pub transition_backoff: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(500),
            job_timeout: Duration::from_secs(120),
            transition_retries: 4,
            transition_backoff: Duration::from_millis(50),
        }
    }
}

/// The broker write a finished attempt still owes.
#[derive(Debug, Clone)]
enum Transition {
    Complete(Option<NextJob>),
    Fail { error: String, retryable: bool },
}

struct PoolShared {
    broker: Broker,
    queue: QueueName,
    handler: Arc<dyn JobHandler>,
    settings: PoolSettings,
    events: broadcast::Sender<JobEvent>,
    /// Attempts whose outcome could not be written yet. The job row stays
    /// `active` until one of these lands.
    unsettled: Mutex<Vec<(Job, Transition)>>,
}

impl PoolShared {
    fn park(&self, job: Job, transition: Transition) {
        self.unsettled_lock().push((job, transition));
    }

    fn take_unsettled(&self) -> Vec<(Job, Transition)> {
        std::mem::take(&mut *self.unsettled_lock())
    }

    fn unsettled_lock(&self) -> std::sync::MutexGuard<'_, Vec<(Job, Transition)>> {
        match self.unsettled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A set of workers draining one queue.
pub struct WorkerPool {
    queue: QueueName,
    dispatcher: JoinHandle<()>,
}

impl WorkerPool {
    /// Starts a pool for `queue`. The pool stops claiming once `shutdown`
    /// flips to `true` and lets in-flight jobs finish.
    pub fn spawn(
        broker: Broker,
        queue: QueueName,
        handler: Arc<dyn JobHandler>,
        settings: PoolSettings,
        events: broadcast::Sender<JobEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            broker,
            queue,
            handler,
            settings: PoolSettings {
                concurrency: settings.concurrency.max(1),
                ..settings
            },
            events,
            unsettled: Mutex::new(Vec::new()),
        });
        let dispatcher = tokio::spawn(dispatch(shared, shutdown));
        Self { queue, dispatcher }
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// Waits for the pool to drain after shutdown was signalled.
    pub async fn join(self) {
        if let Err(e) = self.dispatcher.await {
            tracing::error!(queue = %self.queue, "worker dispatcher panicked: {}", e);
        }
    }
}

async fn dispatch(shared: Arc<PoolShared>, mut shutdown: watch::Receiver<bool>) {
    let queue = shared.queue;
    let waker = shared.broker.waker(queue);
    let slots = Arc::new(Semaphore::new(shared.settings.concurrency));
    let mut in_flight = JoinSet::new();

    match shared.broker.requeue_stalled(queue).await {
        Ok((0, 0)) => {}
        Ok((requeued, dead)) => {
            tracing::warn!(queue = %queue, requeued, dead, "recovered stalled jobs");
        }
        Err(e) => tracing::error!(queue = %queue, "stalled job recovery failed: {}", e),
    }

    tracing::info!(
        queue = %queue,
        concurrency = shared.settings.concurrency,
        "worker pool started"
    );

    loop {
        while let Some(finished) = in_flight.try_join_next() {
            if let Err(e) = finished {
                tracing::error!(queue = %queue, "worker task failed: {}", e);
            }
        }
        for (job, transition) in shared.take_unsettled() {
            let shared = shared.clone();
            in_flight.spawn(async move { settle(&shared, job, transition).await });
        }
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        match shared.broker.claim_next(queue).await {
            Ok(Some(job)) => {
                let shared = shared.clone();
                in_flight.spawn(async move {
                    run_job(&shared, job).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = waker.notified() => {}
                    _ = tokio::time::sleep(shared.settings.poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            Err(e) => {
                drop(permit);
                tracing::warn!(queue = %queue, "failed to claim job, broker unreachable: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(shared.settings.poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    tracing::info!(queue = %queue, in_flight = in_flight.len(), "worker pool draining");
    while let Some(finished) = in_flight.join_next().await {
        if let Err(e) = finished {
            tracing::error!(queue = %queue, "worker task failed: {}", e);
        }
    }
    let left = shared.take_unsettled().len();
    if left > 0 {
        tracing::error!(
            queue = %queue,
            jobs = left,
            "outcomes not recorded before shutdown, jobs stay active until the next start"
        );
    }
}

async fn run_job(shared: &PoolShared, job: Job) {
    let queue = shared.queue;
    let handler = shared.handler.clone();
    let timeout = shared.settings.job_timeout;
    let owned = job.clone();

    // The handler runs in its own task so a panic is contained to this job.
    let result = tokio::spawn(async move {
        tokio::time::timeout(timeout, handler.handle(&owned)).await
    })
    .await;

    let result = match result {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(JobError::Transient(format!(
            "job timed out after {} ms",
            timeout.as_millis()
        ))),
        Err(e) => Err(JobError::Transient(format!("stage handler panicked: {}", e))),
    };

    let transition = match result {
        Ok(outcome) => Transition::Complete(outcome.next),
        Err(err) => Transition::Fail {
            retryable: err.is_retryable(),
            error: err.message().to_string(),
        },
    };
    settle(shared, job, transition).await;
}

/// Writes the outcome of a finished attempt. Transient broker faults are
/// retried with backoff, then handed back to the dispatcher, so the job
/// never stays `active` while this process runs.
async fn settle(shared: &PoolShared, job: Job, transition: Transition) {
    let mut delay = shared.settings.transition_backoff;
    let mut retries = 0;
    loop {
        match apply(shared, &job, &transition).await {
            Ok(()) => return,
            Err(e) if e.is_transient() && retries < shared.settings.transition_retries => {
                retries += 1;
                tracing::warn!(
                    job_id = job.id,
                    queue = %shared.queue,
                    retry = retries,
                    "failed to record job outcome, retrying: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) if e.is_transient() => {
                tracing::error!(
                    job_id = job.id,
                    queue = %shared.queue,
                    "broker still unreachable, outcome kept for the dispatcher: {}",
                    e
                );
                shared.park(job, transition);
                return;
            }
            Err(e) => {
                // The row already moved on; there is nothing left to write.
                tracing::error!(
                    job_id = job.id,
                    queue = %shared.queue,
                    "failed to record job outcome: {}",
                    e
                );
                return;
            }
        }
    }
}

async fn apply(shared: &PoolShared, job: &Job, transition: &Transition) -> Result<(), QueueError> {
    let queue = shared.queue;
    match transition {
        Transition::Complete(next) => {
            let next = shared.broker.complete(job, next.clone()).await?;
            tracing::debug!(
                job_id = job.id,
                queue = %queue,
                attempt = job.attempt,
                next_job_id = next.map(|h| h.id),
                "job completed"
            );
            let _ = shared.events.send(JobEvent::Completed {
                queue,
                job_id: job.id,
                next_job_id: next.map(|h| h.id),
            });
        }
        Transition::Fail { error, retryable } => {
            match shared.broker.fail(job, error, *retryable).await? {
                FailOutcome::Retrying { delay } => {
                    tracing::warn!(
                        job_id = job.id,
                        queue = %queue,
                        attempt = job.attempt,
                        max_attempts = job.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = error.as_str(),
                        "job attempt failed, retrying"
                    );
                    let _ = shared.events.send(JobEvent::Retrying {
                        queue,
                        job_id: job.id,
                        attempt: job.attempt,
                        delay,
                    });
                }
                FailOutcome::Dead => {
                    tracing::error!(
                        job_id = job.id,
                        queue = %queue,
                        attempt = job.attempt,
                        max_attempts = job.max_attempts,
                        payload = %job.payload,
                        error = error.as_str(),
                        "job moved to dead state"
                    );
                    shared.handler.on_dead(job, error).await;
                    let _ = shared.events.send(JobEvent::Dead {
                        queue,
                        job_id: job.id,
                        attempts: job.attempt,
                        error: error.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}
