//! Wires one worker pool per queue to its stage handler.

use solace_queue::{BackoffPolicy, JobEvent, JobHandler, JobOptions, PoolSettings, WorkerPool};
use solace_types::QueueName;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::config::QueuesConfig;
use crate::notify::Notifier;
use crate::pipeline::{
    GenerationStage, NotificationStage, PipelineContext, SynthesisStage, TranscriptionStage,
};

/// Per-queue enqueue defaults for the broker.
pub fn queue_defaults(config: &QueuesConfig) -> HashMap<QueueName, JobOptions> {
    let backoff = BackoffPolicy::new(
        Duration::from_millis(config.backoff_base_ms),
        Duration::from_millis(config.backoff_cap_ms),
    );
    QueueName::ALL
        .into_iter()
        .map(|queue| {
            let options = JobOptions {
                max_attempts: config.queue(queue).max_attempts.max(1),
                backoff,
                delay: Duration::ZERO,
            };
            (queue, options)
        })
        .collect()
}

/// The running pools.
pub struct Workers {
    pools: Vec<WorkerPool>,
}

impl Workers {
    /// Starts a pool for every queue.
    pub fn spawn(
        ctx: &PipelineContext,
        notifier: Arc<dyn Notifier>,
        config: &QueuesConfig,
        events: broadcast::Sender<JobEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let pools = QueueName::ALL
            .into_iter()
            .map(|queue| {
                let handler: Arc<dyn JobHandler> = match queue {
                    QueueName::Transcription => Arc::new(TranscriptionStage::new(ctx.clone())),
                    QueueName::Generation => Arc::new(GenerationStage::new(ctx.clone())),
                    QueueName::Synthesis => Arc::new(SynthesisStage::new(ctx.clone())),
                    QueueName::Notification => Arc::new(NotificationStage::new(notifier.clone())),
                };
                let settings = PoolSettings {
                    concurrency: config.queue(queue).concurrency,
                    poll_interval: Duration::from_millis(config.poll_interval_ms),
                    job_timeout: Duration::from_secs(config.job_timeout_secs),
                    ..PoolSettings::default()
                };
                WorkerPool::spawn(
                    ctx.broker.clone(),
                    queue,
                    handler,
                    settings,
                    events.clone(),
                    shutdown.clone(),
                )
            })
            .collect();
        Self { pools }
    }

    /// Waits for every pool to drain after shutdown was signalled.
    pub async fn join(self) {
        for pool in self.pools {
            let queue = pool.queue();
            pool.join().await;
            tracing::info!(queue = %queue, "worker pool stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_per_queue_attempts() {
        let defaults = queue_defaults(&QueuesConfig::default());
        assert_eq!(defaults[&QueueName::Synthesis].max_attempts, 3);
        assert_eq!(defaults[&QueueName::Notification].max_attempts, 2);
        assert_eq!(
            defaults[&QueueName::Generation].backoff,
            BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60))
        );
    }
}
