//! Per-category request budgets.
//!
//! A [`RateLimiter`] consults the shared SQLite store when one is configured
//! and an in-process counter otherwise. Callers see the same
//! [`RateDecision`] either way. If the shared store errors, the check fails
//! open: the request is allowed and the event is logged as degraded mode.

use rusqlite::{params, TransactionBehavior};
use serde::{Deserialize, Serialize};
use solace_db::DbPool;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::config::RateLimitConfig;

/// Independent budget categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitCategory {
    Auth,
    Message,
    Voice,
    Assessment,
    Api,
}

impl RateLimitCategory {
    pub const ALL: [RateLimitCategory; 5] = [
        RateLimitCategory::Auth,
        RateLimitCategory::Message,
        RateLimitCategory::Voice,
        RateLimitCategory::Assessment,
        RateLimitCategory::Api,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Message => "message",
            Self::Voice => "voice",
            Self::Assessment => "assessment",
            Self::Api => "api",
        }
    }

    pub fn default_rule(self) -> RateLimitRule {
        match self {
            Self::Auth => RateLimitRule::new(50, 5 * 60),
            Self::Message => RateLimitRule::new(30, 60),
            Self::Voice => RateLimitRule::new(10, 60),
            Self::Assessment => RateLimitRule::new(10, 3600),
            Self::Api => RateLimitRule::new(100, 60),
        }
    }
}

impl fmt::Display for RateLimitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `limit` requests per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_secs: u64,
}

impl RateLimitRule {
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    pub fn window_ms(&self) -> i64 {
        (self.window_secs as i64).saturating_mul(1000)
    }
}

/// Outcome of one check. Surfaced to clients whether or not it was allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds at which the budget next frees up.
    pub reset_at: i64,
}

impl RateDecision {
    fn fail_open(rule: RateLimitRule, now_ms: i64) -> Self {
        Self {
            allowed: true,
            limit: rule.limit,
            remaining: rule.limit,
            reset_at: now_ms + rule.window_ms(),
        }
    }

    /// Seconds until `reset_at`, rounded up, at least 1.
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let ms = (self.reset_at - now_ms).max(0) as u64;
        ms.div_ceil(1000).max(1)
    }
}

/// Errors raised by a shared rate-limit store.
#[derive(Debug, Error)]
pub enum RateLimitStoreError {
    #[error("store pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("store database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("store task failed: {0}")]
    Join(String),
}

/// Backend holding the counters. Calls are blocking.
pub trait RateLimitStore: Send + Sync + 'static {
    /// Records one request for `key` at `now_ms` if the budget allows it.
    /// Denied requests are not recorded.
    fn hit(
        &self,
        key: &str,
        rule: RateLimitRule,
        now_ms: i64,
    ) -> Result<RateDecision, RateLimitStoreError>;

    /// Drops bookkeeping older than `max_window_ms`. Returns rows removed.
    fn sweep(&self, now_ms: i64, max_window_ms: i64) -> Result<usize, RateLimitStoreError>;
}

/// Sliding-window log in the `rate_limit_hits` table.
///
/// Each check runs in an immediate transaction, so concurrent processes
/// sharing the database serialise on SQLite's write lock.
#[derive(Clone)]
pub struct SqliteRateStore {
    pool: DbPool,
}

impl SqliteRateStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl RateLimitStore for SqliteRateStore {
    fn hit(
        &self,
        key: &str,
        rule: RateLimitRule,
        now_ms: i64,
    ) -> Result<RateDecision, RateLimitStoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let window_start = now_ms - rule.window_ms();

        tx.execute(
            "DELETE FROM rate_limit_hits WHERE rate_key = ?1 AND hit_at_ms <= ?2",
            params![key, window_start],
        )?;
        let (count, oldest): (u32, Option<i64>) = tx.query_row(
            "SELECT COUNT(*), MIN(hit_at_ms) FROM rate_limit_hits WHERE rate_key = ?1",
            [key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let decision = if count < rule.limit {
            tx.execute(
                "INSERT INTO rate_limit_hits (rate_key, hit_at_ms) VALUES (?1, ?2)",
                params![key, now_ms],
            )?;
            RateDecision {
                allowed: true,
                limit: rule.limit,
                remaining: rule.limit - count - 1,
                reset_at: oldest.unwrap_or(now_ms) + rule.window_ms(),
            }
        } else {
            RateDecision {
                allowed: false,
                limit: rule.limit,
                remaining: 0,
                reset_at: oldest.unwrap_or(now_ms) + rule.window_ms(),
            }
        };
        tx.commit()?;
        Ok(decision)
    }

    fn sweep(&self, now_ms: i64, max_window_ms: i64) -> Result<usize, RateLimitStoreError> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM rate_limit_hits WHERE hit_at_ms <= ?1",
            [now_ms - max_window_ms],
        )?;
        Ok(removed)
    }
}

/// Fixed-window counter for one `(category, identifier)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub window_start_ms: i64,
    /// Length of this key's window. Keys of different categories share one
    /// map, so expiry is always judged per entry.
    pub window_ms: i64,
    pub count: u32,
    pub limit: u32,
}

impl RateWindow {
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.window_start_ms >= self.window_ms
    }
}

/// Entries beyond this trigger an opportunistic sweep of expired windows.
const MEMORY_SWEEP_THRESHOLD: usize = 10_000;

/// In-process fixed-window counters.
#[derive(Clone, Debug, Default)]
pub struct MemoryRateStore {
    windows: Arc<Mutex<HashMap<String, RateWindow>>>,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RateWindow>> {
        match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                // A stale counter is preferable to refusing every request.
                tracing::error!("rate limiter lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RateLimitStore for MemoryRateStore {
    fn hit(
        &self,
        key: &str,
        rule: RateLimitRule,
        now_ms: i64,
    ) -> Result<RateDecision, RateLimitStoreError> {
        let window_ms = rule.window_ms();
        let mut windows = self.lock();

        if windows.len() > MEMORY_SWEEP_THRESHOLD {
            windows.retain(|_, w| !w.is_expired(now_ms));
        }

        let window = windows.entry(key.to_string()).or_insert(RateWindow {
            window_start_ms: now_ms,
            window_ms,
            count: 0,
            limit: rule.limit,
        });
        if window.is_expired(now_ms) {
            window.window_start_ms = now_ms;
            window.count = 0;
        }
        window.window_ms = window_ms;
        window.limit = rule.limit;

        let reset_at = window.window_start_ms + window_ms;
        if window.count < rule.limit {
            window.count += 1;
            Ok(RateDecision {
                allowed: true,
                limit: rule.limit,
                remaining: rule.limit - window.count,
                reset_at,
            })
        } else {
            Ok(RateDecision {
                allowed: false,
                limit: rule.limit,
                remaining: 0,
                reset_at,
            })
        }
    }

    /// Each entry expires by its own window; `max_window_ms` is not needed.
    fn sweep(&self, now_ms: i64, _max_window_ms: i64) -> Result<usize, RateLimitStoreError> {
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, w| !w.is_expired(now_ms));
        Ok(before - windows.len())
    }
}

/// Entry point for all budget checks.
#[derive(Clone)]
pub struct RateLimiter {
    rules: Arc<HashMap<RateLimitCategory, RateLimitRule>>,
    shared: Option<Arc<dyn RateLimitStore>>,
    local: MemoryRateStore,
}

impl RateLimiter {
    /// A limiter counting in-process only.
    pub fn in_memory(config: &RateLimitConfig) -> Self {
        Self::build(config, None)
    }

    /// A limiter backed by a shared store.
    pub fn with_store(config: &RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: &RateLimitConfig, shared: Option<Arc<dyn RateLimitStore>>) -> Self {
        let rules = RateLimitCategory::ALL
            .into_iter()
            .map(|c| (c, config.rule(c)))
            .collect();
        Self {
            rules: Arc::new(rules),
            shared,
            local: MemoryRateStore::new(),
        }
    }

    pub fn rule(&self, category: RateLimitCategory) -> RateLimitRule {
        self.rules
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_rule())
    }

    pub fn is_shared(&self) -> bool {
        self.shared.is_some()
    }

    pub async fn check(&self, category: RateLimitCategory, identifier: &str) -> RateDecision {
        self.check_at(category, identifier, crate::now_ms()).await
    }

    /// [`check`](Self::check) at an explicit clock reading.
    pub async fn check_at(
        &self,
        category: RateLimitCategory,
        identifier: &str,
        now_ms: i64,
    ) -> RateDecision {
        let rule = self.rule(category);
        let key = format!("{}:{}", category.as_str(), identifier);

        let result = match &self.shared {
            Some(store) => {
                let store = store.clone();
                let key = key.clone();
                tokio::task::spawn_blocking(move || store.hit(&key, rule, now_ms))
                    .await
                    .unwrap_or_else(|e| Err(RateLimitStoreError::Join(e.to_string())))
            }
            None => self.local.hit(&key, rule, now_ms),
        };

        match result {
            Ok(decision) => {
                if !decision.allowed {
                    tracing::debug!(
                        category = category.as_str(),
                        identifier,
                        limit = decision.limit,
                        reset_at = decision.reset_at,
                        "rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => {
                tracing::warn!(
                    category = category.as_str(),
                    identifier,
                    "rate limit store unavailable, failing open (degraded mode): {}",
                    e
                );
                RateDecision::fail_open(rule, now_ms)
            }
        }
    }

    /// Garbage-collects counters whose windows have expired.
    pub async fn sweep_expired(&self) -> Result<usize, RateLimitStoreError> {
        let now = crate::now_ms();
        let max_window_ms = self
            .rules
            .values()
            .map(|r| r.window_ms())
            .max()
            .unwrap_or(0);
        let local = self.local.sweep(now, max_window_ms)?;
        let shared = match &self.shared {
            Some(store) => {
                let store = store.clone();
                tokio::task::spawn_blocking(move || store.sweep(now, max_window_ms))
                    .await
                    .map_err(|e| RateLimitStoreError::Join(e.to_string()))??
            }
            None => 0,
        };
        Ok(local + shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULE: RateLimitRule = RateLimitRule::new(3, 60);

    #[test]
    fn memory_store_denies_after_limit_and_resets() {
        let store = MemoryRateStore::new();
        let t0 = 1_000_000;
        for expected_remaining in [2, 1, 0] {
            let d = store.hit("voice:u1", RULE, t0).unwrap();
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }
        let denied = store.hit("voice:u1", RULE, t0 + 10).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, t0 + 60_000);

        let after = store.hit("voice:u1", RULE, t0 + 60_000).unwrap();
        assert!(after.allowed);
        assert_eq!(after.remaining, 2);
    }

    #[test]
    fn memory_store_keys_are_independent() {
        let store = MemoryRateStore::new();
        for _ in 0..3 {
            store.hit("message:a", RULE, 0).unwrap();
        }
        assert!(!store.hit("message:a", RULE, 0).unwrap().allowed);
        assert!(store.hit("message:b", RULE, 0).unwrap().allowed);
        assert!(store.hit("voice:a", RULE, 0).unwrap().allowed);
    }

    #[test]
    fn memory_sweep_keeps_live_windows() {
        let store = MemoryRateStore::new();
        store.hit("api:old", RULE, 0).unwrap();
        store.hit("api:new", RULE, 59_000).unwrap();
        assert_eq!(store.sweep(60_000, 60_000).unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn crowded_map_keeps_longer_windows_of_other_categories() {
        let store = MemoryRateStore::new();
        let hourly = RateLimitRule::new(2, 3600);
        let minutely = RateLimitRule::new(30, 60);
        let t0 = 1_000_000;

        for _ in 0..2 {
            assert!(store.hit("assessment:ana", hourly, t0).unwrap().allowed);
        }

        // Two minutes later enough one-minute keys pile up to trigger the
        // opportunistic eviction on the next hit.
        let later = t0 + 120_000;
        for i in 0..=MEMORY_SWEEP_THRESHOLD {
            store.hit(&format!("message:u{}", i), minutely, later).unwrap();
        }
        store.hit("message:trigger", minutely, later).unwrap();

        let third = store.hit("assessment:ana", hourly, later).unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert_eq!(third.reset_at, t0 + 3_600_000);
    }

    #[test]
    fn sweep_judges_each_key_by_its_own_window() {
        let store = MemoryRateStore::new();
        store.hit("assessment:ana", RateLimitRule::new(10, 3600), 0).unwrap();
        store.hit("auth:ana", RateLimitRule::new(50, 300), 0).unwrap();
        store.hit("api:ana", RULE, 0).unwrap();

        // A short maximum must not evict windows that are still running.
        assert_eq!(store.sweep(120_000, 60_000).unwrap(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.sweep(400_000, 60_000).unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn retry_after_rounds_up() {
        let d = RateDecision {
            allowed: false,
            limit: 1,
            remaining: 0,
            reset_at: 10_500,
        };
        assert_eq!(d.retry_after_secs(9_000), 2);
        assert_eq!(d.retry_after_secs(20_000), 1);
    }

    #[test]
    fn default_rules_match_policy() {
        assert_eq!(RateLimitCategory::Auth.default_rule(), RateLimitRule::new(50, 300));
        assert_eq!(RateLimitCategory::Message.default_rule(), RateLimitRule::new(30, 60));
        assert_eq!(RateLimitCategory::Voice.default_rule(), RateLimitRule::new(10, 60));
        assert_eq!(
            RateLimitCategory::Assessment.default_rule(),
            RateLimitRule::new(10, 3600)
        );
        assert_eq!(RateLimitCategory::Api.default_rule(), RateLimitRule::new(100, 60));
    }
}
