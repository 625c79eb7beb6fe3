//! Admission pipeline tests against the in-process counter store

mod common;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use common::{batch, single, Harness};
use gatekeeper_api::degraded::{Component, DegradedSignal};
use gatekeeper_api::gatekeeper::SearchResponse;
use gatekeeper_api::quota::{month_key, QuotaDecision, QuotaTracker};
use gatekeeper_api::rate_limiting::{RateDecision, RateLimiter};
use gatekeeper_api::ErrorCode;
use gatekeeper_core::{ManualClock, PlanTier};
use gatekeeper_storage::{
    CounterStore, MemoryCounterStore, PrivilegedDirectory, SlowCounterStore, StoreResult,
    TenantDirectory, UnavailableCounterStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

const STORE_TIMEOUT: Duration = Duration::from_millis(50);

async fn set_plan_quota(h: &Harness, tier: PlanTier, monthly_quota: u64) {
    let mut plan = h.directory.get_plan(tier).await.unwrap();
    plan.monthly_quota = monthly_quota;
    h.directory.upsert_plan(plan).await.unwrap();
}

fn single_results(body: &SearchResponse) -> (String, bool) {
    match body {
        SearchResponse::Single {
            results, cached, ..
        } => (results.get().to_string(), *cached),
        other => panic!("expected single response, got {:?}", other),
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test]
async fn test_free_tier_eleventh_request_rate_limited() {
    let mut h = Harness::new();
    let (_, key) = h.signup("acme", PlanTier::Free).await;

    for i in 0..10 {
        let response = h
            .state
            .gatekeeper
            .search(Some(&key), &single(&format!("door {}", i)))
            .await
            .unwrap();
        let rate = response.rate_limit.unwrap();
        assert_eq!(rate.limit, 10);
        assert_eq!(rate.remaining, 9 - i);
    }

    let err = h
        .state
        .gatekeeper
        .search(Some(&key), &single("door 11"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::RateLimited);
    // Clock sits 10s into the window
    assert_eq!(err.retry_after, Some(50));
    assert_eq!(err.rate_limit.unwrap().remaining, 0);

    let usage = h.drain_usage();
    assert_eq!(usage.len(), 11);
    assert_eq!(usage.last().unwrap().status_code, 429);
}

#[tokio::test]
async fn test_next_window_admits_again() {
    let h = Harness::new();
    let (_, key) = h.signup("acme", PlanTier::Free).await;

    for _ in 0..10 {
        h.state.gatekeeper.search(Some(&key), &single("slab")).await.unwrap();
    }
    assert!(h.state.gatekeeper.search(Some(&key), &single("slab")).await.is_err());

    h.clock.advance(ChronoDuration::seconds(50));
    let response = h
        .state
        .gatekeeper
        .search(Some(&key), &single("slab"))
        .await
        .unwrap();
    assert_eq!(response.rate_limit.unwrap().remaining, 9);
}

#[tokio::test]
async fn test_concurrent_requests_never_exceed_limit() {
    let clock = Arc::new(ManualClock::new(common::start_time()));
    let store = Arc::new(MemoryCounterStore::new(clock.clone()));
    let limiter = Arc::new(RateLimiter::new(
        store,
        clock,
        STORE_TIMEOUT,
        Arc::new(DegradedSignal::new()),
    ));

    let mut handles = Vec::new();
    for _ in 0..25 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move { limiter.check("t1", 10).await }));
    }

    let mut admitted = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), RateDecision::Admitted(_)) {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

// ============================================================================
// Quota
// ============================================================================

#[tokio::test]
async fn test_batch_larger_than_remaining_quota_rejected_without_consuming() {
    let h = Harness::new();
    set_plan_quota(&h, PlanTier::Starter, 10).await;
    let (tenant, key) = h.signup("acme", PlanTier::Starter).await;

    for i in 0..7 {
        h.state
            .gatekeeper
            .search(Some(&key), &single(&format!("wall {}", i)))
            .await
            .unwrap();
    }

    let err = h
        .state
        .gatekeeper
        .search(Some(&key), &batch(&["a", "b", "c", "d", "e"]))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::QuotaExceeded);
    assert!(err.rate_limit.is_some());

    let status = h.state.gatekeeper.quota().status(&tenant.id, 10).await;
    assert_eq!(status.used, 7);
    assert_eq!(status.remaining, 3);

    // A batch that fits is still admitted
    h.state
        .gatekeeper
        .search(Some(&key), &batch(&["a", "b", "c"]))
        .await
        .unwrap();
    let status = h.state.gatekeeper.quota().status(&tenant.id, 10).await;
    assert_eq!(status.used, 10);
}

#[tokio::test]
async fn test_batch_needs_plan_feature() {
    let h = Harness::new();
    let (_, key) = h.signup("acme", PlanTier::Free).await;

    let err = h
        .state
        .gatekeeper
        .search(Some(&key), &batch(&["a", "b"]))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
    assert!(err.message.contains("batch_search"));
}

/// Holds every quota read until `parties` readers have arrived, forcing the
/// read-before-write interleaving.
struct BarrierStore {
    inner: MemoryCounterStore,
    barrier: Barrier,
}

#[async_trait]
impl CounterStore for BarrierStore {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let value = self.inner.get(key).await;
        self.barrier.wait().await;
        value
    }

    async fn incr_by_with_expiry(&self, key: &str, delta: i64, ttl: Duration) -> StoreResult<i64> {
        self.inner.incr_by_with_expiry(key, delta, ttl).await
    }

    async fn get_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get_bytes(key).await
    }

    async fn set_bytes_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.inner.set_bytes_with_expiry(key, value, ttl).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }
}

#[tokio::test]
async fn test_concurrent_quota_overshoot_is_bounded() {
    let clock = Arc::new(ManualClock::new(common::start_time()));
    let store = Arc::new(BarrierStore {
        inner: MemoryCounterStore::new(clock.clone()),
        barrier: Barrier::new(2),
    });
    let tracker = Arc::new(QuotaTracker::new(
        store.clone(),
        clock.clone(),
        Duration::from_secs(5),
        Arc::new(DegradedSignal::new()),
    ));

    let quota = 5;
    let batch_size = 3;
    let first = {
        let tracker = tracker.clone();
        tokio::spawn(async move { tracker.check_and_consume("t1", batch_size, quota).await })
    };
    let second = {
        let tracker = tracker.clone();
        tokio::spawn(async move { tracker.check_and_consume("t1", batch_size, quota).await })
    };

    let decisions = [first.await.unwrap(), second.await.unwrap()];
    assert!(decisions
        .iter()
        .all(|d| matches!(d, QuotaDecision::Admitted { .. })));

    let used = store
        .inner
        .get(&month_key("t1", common::start_time()))
        .await
        .unwrap()
        .unwrap() as u64;
    assert!(used > quota);
    assert!(used <= quota + u64::from(batch_size) - 1);
}

#[tokio::test]
async fn test_serialized_quota_never_overshoots() {
    let clock = Arc::new(ManualClock::new(common::start_time()));
    let tracker = QuotaTracker::new(
        Arc::new(MemoryCounterStore::new(clock.clone())),
        clock,
        STORE_TIMEOUT,
        Arc::new(DegradedSignal::new()),
    );

    let mut admitted = 0;
    for _ in 0..4 {
        if let QuotaDecision::Admitted { .. } = tracker.check_and_consume("t1", 3, 10).await {
            admitted += 3;
        }
    }
    assert_eq!(admitted, 9);
}

// ============================================================================
// Result cache
// ============================================================================

#[tokio::test]
async fn test_cache_hit_returns_identical_results_until_ttl() {
    let config = common::base_config().with_cache_ttl(Duration::from_secs(60));
    let mut h = Harness::with_config(config);
    let (_, key) = h.signup("acme", PlanTier::Starter).await;

    let first = h
        .state
        .gatekeeper
        .search(Some(&key), &single("Concrete Slab"))
        .await
        .unwrap();
    let second = h
        .state
        .gatekeeper
        .search(Some(&key), &single("  concrete slab "))
        .await
        .unwrap();

    let (first_results, first_cached) = single_results(&first.body);
    let (second_results, second_cached) = single_results(&second.body);
    assert!(!first_cached);
    assert!(second_cached);
    assert_eq!(first_results, second_results);
    assert_eq!(h.backend.calls(), 1);

    h.clock.advance(ChronoDuration::seconds(61));
    let third = h
        .state
        .gatekeeper
        .search(Some(&key), &single("concrete slab"))
        .await
        .unwrap();
    assert!(!single_results(&third.body).1);
    assert_eq!(h.backend.calls(), 2);

    let usage = h.drain_usage();
    let hits: Vec<bool> = usage.iter().map(|u| u.cache_hit).collect();
    assert_eq!(hits, vec![false, true, false]);
}

#[tokio::test]
async fn test_cache_is_scoped_per_tenant() {
    let h = Harness::new();
    let (_, key_a) = h.signup("acme", PlanTier::Free).await;
    let (_, key_b) = h.signup("globex", PlanTier::Free).await;

    h.state.gatekeeper.search(Some(&key_a), &single("roof")).await.unwrap();
    let other = h
        .state
        .gatekeeper
        .search(Some(&key_b), &single("roof"))
        .await
        .unwrap();
    assert!(!single_results(&other.body).1);
    assert_eq!(h.backend.calls(), 2);
}

#[tokio::test]
async fn test_batch_reports_cache_hits() {
    let mut h = Harness::new();
    let (_, key) = h.signup("acme", PlanTier::Starter).await;

    h.state.gatekeeper.search(Some(&key), &single("door")).await.unwrap();
    let response = h
        .state
        .gatekeeper
        .search(Some(&key), &batch(&["door", "window"]))
        .await
        .unwrap();
    match response.body {
        SearchResponse::Batch {
            count, cache_hits, ..
        } => {
            assert_eq!(count, 2);
            assert_eq!(cache_hits, 1);
        }
        other => panic!("expected batch response, got {:?}", other),
    }

    let usage = h.drain_usage();
    assert_eq!(usage[1].query_count, 2);
    assert!(!usage[1].cache_hit);
}

// ============================================================================
// Degraded counter store
// ============================================================================

#[tokio::test]
async fn test_unavailable_store_fails_open() {
    let h = Harness::with_store(Arc::new(UnavailableCounterStore));
    let (_, key) = h.signup("acme", PlanTier::Free).await;

    let response = h
        .state
        .gatekeeper
        .search(Some(&key), &single("door"))
        .await
        .unwrap();
    assert!(response.rate_limit.is_none());
    assert!(!single_results(&response.body).1);

    assert_eq!(h.state.degraded.count(Component::RateLimiter), 1);
    assert_eq!(h.state.degraded.count(Component::QuotaTracker), 1);
    // The failed lookup turns the cache off, so no store is attempted
    assert_eq!(h.state.degraded.count(Component::ResultCache), 1);
}

#[tokio::test]
async fn test_slow_store_costs_one_cache_timeout_per_batch() {
    let clock = Arc::new(ManualClock::new(common::start_time()));
    let slow = SlowCounterStore::new(
        MemoryCounterStore::new(clock.clone()),
        Duration::from_millis(200),
    );
    let h = Harness::with_store(Arc::new(slow));
    let (_, key) = h.signup("acme", PlanTier::Starter).await;

    let response = h
        .state
        .gatekeeper
        .search(Some(&key), &batch(&["door", "window", "stair", "roof"]))
        .await
        .unwrap();
    match response.body {
        SearchResponse::Batch {
            count, cache_hits, ..
        } => {
            assert_eq!(count, 4);
            assert_eq!(cache_hits, 0);
        }
        other => panic!("expected batch response, got {:?}", other),
    }

    assert_eq!(h.state.degraded.count(Component::ResultCache), 1);
    assert_eq!(h.backend.calls(), 4);
}

#[tokio::test]
async fn test_invalid_key_rejected_while_store_down() {
    let h = Harness::with_store(Arc::new(UnavailableCounterStore));
    let err = h
        .state
        .gatekeeper
        .search(Some(&format!("uc_live_{}", "0".repeat(48))), &single("door"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unauthorized);
}

// ============================================================================
// Usage logging
// ============================================================================

#[tokio::test]
async fn test_one_usage_record_per_request() {
    let mut h = Harness::new();
    let (tenant, key) = h.signup("acme", PlanTier::Free).await;

    h.state.gatekeeper.search(Some(&key), &single("door")).await.unwrap();
    let _ = h.state.gatekeeper.search(Some(&key), b"{not json").await;
    let _ = h.state.gatekeeper.search(None, &single("door")).await;

    let usage = h.drain_usage();
    assert_eq!(usage.len(), 3);

    assert_eq!(usage[0].status_code, 200);
    assert_eq!(usage[0].tenant_id.as_deref(), Some(tenant.id.as_str()));
    assert_eq!(usage[1].status_code, 400);
    assert_eq!(usage[1].error.as_deref(), Some("INVALID_REQUEST"));
    assert_eq!(usage[2].status_code, 401);
    assert_eq!(usage[2].tenant_id, None);
}

struct StalledBackend;

#[async_trait]
impl gatekeeper_api::search::SearchBackend for StalledBackend {
    async fn search(
        &self,
        _query: &str,
        _top_k: u32,
    ) -> Result<Vec<gatekeeper_api::search::SearchHit>, gatekeeper_api::search::SearchError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_cancelled_request_still_logged_once() {
    let clock = Arc::new(ManualClock::new(common::start_time()));
    let directory = Arc::new(gatekeeper_storage::SqliteDirectory::open_in_memory().unwrap());
    let (state, mut jobs) = gatekeeper_api::AppState::build(
        directory,
        Arc::new(MemoryCounterStore::new(clock.clone())),
        Arc::new(StalledBackend),
        clock,
        &common::base_config(),
    );
    let signup = state
        .provisioning
        .signup("Acme", "acme", PlanTier::Free)
        .await
        .unwrap();

    let request = single("door");
    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        state
            .gatekeeper
            .search(Some(&signup.api_key.raw_key), &request),
    )
    .await;
    assert!(outcome.is_err());

    let mut usage = Vec::new();
    while let Ok(job) = jobs.try_recv() {
        if let gatekeeper_api::usage_recorder::BackgroundJob::RecordUsage(outcome) = job {
            usage.push(outcome);
        }
    }
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].status_code, 499);
    assert_eq!(usage[0].query_count, 1);
    assert_eq!(usage[0].tenant_id.as_deref(), Some(signup.tenant.id.as_str()));
}
