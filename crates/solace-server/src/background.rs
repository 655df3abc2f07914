//! Background tasks for the Solace server.
//!
//! Includes:
//! - Archiving completed jobs past the retention window.
//! - Garbage-collecting expired rate-limit counters.

use crate::ratelimit::RateLimiter;
use solace_queue::Broker;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Starts the completed-job retention task. Runs until shutdown.
pub async fn start_retention_task(
    broker: Broker,
    retention_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    if retention_secs == 0 {
        tracing::warn!("job retention task disabled (retention=0)");
        return;
    }

    // Check every hour or retention/2, whichever is smaller (but min 1s).
    let interval_seconds = (retention_secs / 2).clamp(1, 3600);
    let mut ticker = interval(Duration::from_secs(interval_seconds));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(retention_secs, interval_seconds, "starting job retention task");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let cutoff_ms = crate::now_ms() - (retention_secs as i64) * 1000;
        match broker.prune_completed(cutoff_ms).await {
            Ok(0) => {}
            Ok(pruned) => tracing::info!(count = pruned, "archived completed jobs"),
            Err(e) => tracing::error!("failed to archive completed jobs: {}", e),
        }
    }
    tracing::debug!("job retention task stopped");
}

/// Starts the rate-limit counter sweep. Runs until shutdown.
pub async fn start_rate_limit_sweep(
    limiter: RateLimiter,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match limiter.sweep_expired().await {
            Ok(0) => {}
            Ok(swept) => tracing::debug!(count = swept, "swept expired rate limit counters"),
            Err(e) => tracing::warn!("rate limit sweep failed: {}", e),
        }
    }
    tracing::debug!("rate limit sweep stopped");
}
