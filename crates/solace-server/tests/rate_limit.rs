//! Rate limiter behaviour against both stores.

use solace_db::{create_pool, run_migrations, DbRuntimeSettings};
use solace_server::config::RateLimitConfig;
use solace_server::ratelimit::{
    RateDecision, RateLimitCategory, RateLimitRule, RateLimitStore, RateLimitStoreError,
    RateLimiter, SqliteRateStore,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const T0: i64 = 1_700_000_000_000;

fn config() -> RateLimitConfig {
    RateLimitConfig {
        message: RateLimitRule::new(3, 60),
        ..RateLimitConfig::default()
    }
}

fn shared_store(dir: &tempfile::TempDir) -> Arc<SqliteRateStore> {
    let path = dir.path().join("limits.db");
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    run_migrations(&pool.get().unwrap()).unwrap();
    Arc::new(SqliteRateStore::new(pool))
}

async fn exhaust(limiter: &RateLimiter, identifier: &str, now_ms: i64) -> Vec<RateDecision> {
    let mut decisions = Vec::new();
    for _ in 0..4 {
        decisions.push(
            limiter
                .check_at(RateLimitCategory::Message, identifier, now_ms)
                .await,
        );
    }
    decisions
}

#[tokio::test]
async fn in_memory_denies_the_request_after_the_limit() {
    let limiter = RateLimiter::in_memory(&config());
    let decisions = exhaust(&limiter, "user:ana", T0).await;

    let remaining: Vec<u32> = decisions.iter().map(|d| d.remaining).collect();
    assert_eq!(remaining, [2, 1, 0, 0]);
    assert!(decisions[..3].iter().all(|d| d.allowed));
    assert!(!decisions[3].allowed);
    assert!(decisions[3].reset_at > T0);

    // A fresh window restores the full budget.
    let after = limiter
        .check_at(RateLimitCategory::Message, "user:ana", T0 + 61_000)
        .await;
    assert!(after.allowed);
    assert_eq!(after.remaining, 2);
}

#[tokio::test]
async fn shared_store_enforces_one_budget_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let store = shared_store(&dir);
    let first = RateLimiter::with_store(&config(), store.clone());
    let second = RateLimiter::with_store(&config(), store);
    assert!(first.is_shared());

    for limiter in [&first, &second, &first] {
        let decision = limiter
            .check_at(RateLimitCategory::Message, "user:ana", T0)
            .await;
        assert!(decision.allowed);
    }
    let denied = second
        .check_at(RateLimitCategory::Message, "user:ana", T0 + 10)
        .await;
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
    // The oldest hit leaves the sliding window first.
    assert_eq!(denied.reset_at, T0 + 60_000);

    let later = first
        .check_at(RateLimitCategory::Message, "user:ana", T0 + 60_001)
        .await;
    assert!(later.allowed);
}

#[tokio::test]
async fn categories_and_identities_do_not_share_budgets() {
    let limiter = RateLimiter::in_memory(&config());
    exhaust(&limiter, "user:ana", T0).await;

    let other_user = limiter
        .check_at(RateLimitCategory::Message, "user:bruno", T0)
        .await;
    assert!(other_user.allowed);
    let other_category = limiter
        .check_at(RateLimitCategory::Api, "user:ana", T0)
        .await;
    assert!(other_category.allowed);
    assert_eq!(other_category.limit, 100);
}

struct BrokenStore {
    calls: AtomicUsize,
}

impl RateLimitStore for BrokenStore {
    fn hit(
        &self,
        _key: &str,
        _rule: RateLimitRule,
        _now_ms: i64,
    ) -> Result<RateDecision, RateLimitStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RateLimitStoreError::Join("store offline".to_string()))
    }

    fn sweep(&self, _now_ms: i64, _max_window_ms: i64) -> Result<usize, RateLimitStoreError> {
        Err(RateLimitStoreError::Join("store offline".to_string()))
    }
}

#[tokio::test]
async fn unreachable_store_fails_open() {
    let store = Arc::new(BrokenStore {
        calls: AtomicUsize::new(0),
    });
    let limiter = RateLimiter::with_store(&config(), store.clone());

    let decisions = exhaust(&limiter, "user:ana", T0).await;
    assert!(decisions.iter().all(|d| d.allowed));
    assert_eq!(decisions[3].limit, 3);
    assert_eq!(store.calls.load(Ordering::SeqCst), 4);
    assert!(limiter.sweep_expired().await.is_err());
}

#[tokio::test]
async fn sweep_clears_expired_shared_hits() {
    let dir = tempfile::tempdir().unwrap();
    let store = shared_store(&dir);
    let limiter = RateLimiter::with_store(&config(), store);

    // Hits from long ago, outside every configured window.
    exhaust(&limiter, "user:ana", 1_000).await;
    let swept = limiter.sweep_expired().await.unwrap();
    assert_eq!(swept, 3);
}
