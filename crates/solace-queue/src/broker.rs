//! Async facade over the SQLite job store.

use crate::error::QueueError;
use crate::job::{FailOutcome, Job, JobHandle, JobOptions, NextJob, QueueCounts, QueueHealth};
use crate::store;
use serde::Serialize;
use solace_db::DbPool;
use solace_types::QueueName;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

/// Handle to the durable queues.
///
/// Cheap to clone. Enqueues wake the worker pool of the target queue
/// immediately; pools also poll, so jobs enqueued by another process are
/// picked up too.
#[derive(Clone)]
pub struct Broker {
    pool: DbPool,
    defaults: Arc<HashMap<QueueName, JobOptions>>,
    wakers: Arc<HashMap<QueueName, Arc<Notify>>>,
}

impl Broker {
    pub fn new(pool: DbPool) -> Self {
        Self::with_defaults(pool, HashMap::new())
    }

    /// Creates a broker with per-queue default enqueue options. Queues not in
    /// `defaults` use [`JobOptions::default`].
    pub fn with_defaults(pool: DbPool, defaults: HashMap<QueueName, JobOptions>) -> Self {
        let wakers = QueueName::ALL
            .into_iter()
            .map(|queue| (queue, Arc::new(Notify::new())))
            .collect();
        Self {
            pool,
            defaults: Arc::new(defaults),
            wakers: Arc::new(wakers),
        }
    }

    pub fn default_options(&self, queue: QueueName) -> JobOptions {
        self.defaults.get(&queue).copied().unwrap_or_default()
    }

    pub(crate) fn waker(&self, queue: QueueName) -> Arc<Notify> {
        match self.wakers.get(&queue) {
            Some(waker) => waker.clone(),
            None => Arc::new(Notify::new()),
        }
    }

    fn wake(&self, queue: QueueName) {
        if let Some(waker) = self.wakers.get(&queue) {
            waker.notify_one();
        }
    }

    async fn run<T, F>(&self, op: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, QueueError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            op(&mut conn)
        })
        .await
        .map_err(|e| QueueError::Join(e.to_string()))?
    }

    /// Enqueues a job with the queue's default options.
    pub async fn enqueue<T: Serialize>(
        &self,
        queue: QueueName,
        payload: &T,
    ) -> Result<JobHandle, QueueError> {
        self.enqueue_with(queue, payload, self.default_options(queue))
            .await
    }

    /// Enqueues a job. Fails only when the store is unreachable.
    pub async fn enqueue_with<T: Serialize>(
        &self,
        queue: QueueName,
        payload: &T,
        options: JobOptions,
    ) -> Result<JobHandle, QueueError> {
        let payload = serde_json::to_value(payload)?;
        let id = self
            .run(move |conn| store::enqueue(conn, queue, &payload, &options))
            .await?;
        tracing::debug!(job_id = id, queue = %queue, "job enqueued");
        self.wake(queue);
        Ok(JobHandle { id, queue })
    }

    pub async fn claim_next(&self, queue: QueueName) -> Result<Option<Job>, QueueError> {
        self.run(move |conn| store::claim_next(conn, queue)).await
    }

    /// Completes an active job, enqueueing `next` in the same transaction.
    pub async fn complete(
        &self,
        job: &Job,
        next: Option<NextJob>,
    ) -> Result<Option<JobHandle>, QueueError> {
        let (job_id, attempt) = (job.id, job.attempt);
        let next = next.map(|next| {
            let options = next
                .options
                .unwrap_or_else(|| self.default_options(next.queue));
            (next, options)
        });
        let next_queue = next.as_ref().map(|(next, _)| next.queue);

        let next_id = self
            .run(move |conn| {
                let next = next.as_ref().map(|(next, options)| (next, options));
                store::complete(conn, job_id, attempt, next)
            })
            .await?;

        match (next_id, next_queue) {
            (Some(id), Some(queue)) => {
                self.wake(queue);
                Ok(Some(JobHandle { id, queue }))
            }
            _ => Ok(None),
        }
    }

    pub async fn fail(
        &self,
        job: &Job,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let (job_id, attempt, error) = (job.id, job.attempt, error.to_string());
        self.run(move |conn| store::fail(conn, job_id, attempt, &error, retryable))
            .await
    }

    /// Returns `(requeued, dead)` counts of recovered stalled jobs.
    pub async fn requeue_stalled(&self, queue: QueueName) -> Result<(usize, usize), QueueError> {
        self.run(move |conn| store::requeue_stalled(conn, queue))
            .await
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Option<Job>, QueueError> {
        self.run(move |conn| store::get_job(conn, job_id)).await
    }

    pub async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError> {
        self.run(move |conn| store::counts(conn, queue)).await
    }

    /// Health of every queue; a queue is unhealthy once its dead-job count
    /// exceeds `failed_threshold`.
    pub async fn health(&self, failed_threshold: u64) -> Result<Vec<QueueHealth>, QueueError> {
        self.run(move |conn| {
            QueueName::ALL
                .into_iter()
                .map(|queue| {
                    let counts = store::counts(conn, queue)?;
                    Ok(QueueHealth::new(queue, counts, failed_threshold))
                })
                .collect()
        })
        .await
    }

    pub async fn dead_jobs(&self, queue: QueueName, limit: u32) -> Result<Vec<Job>, QueueError> {
        self.run(move |conn| store::list_dead(conn, queue, limit))
            .await
    }

    pub async fn revive(&self, queue: QueueName, job_id: i64) -> Result<bool, QueueError> {
        let revived = self
            .run(move |conn| store::revive(conn, queue, job_id))
            .await?;
        if revived {
            tracing::info!(job_id, queue = %queue, "dead job revived by operator");
            self.wake(queue);
        }
        Ok(revived)
    }

    pub async fn prune_completed(&self, cutoff_ms: i64) -> Result<usize, QueueError> {
        self.run(move |conn| store::prune_completed(conn, cutoff_ms))
            .await
    }
}
