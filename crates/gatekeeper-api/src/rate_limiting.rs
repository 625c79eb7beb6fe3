//! Per-tenant requests-per-minute limit
//!
//! Fixed-window counter in the shared counter store, keyed by tenant and UTC
//! minute: `gk:ratelimit:{tenant_id}:{YYYYMMDDHHMM}`. Each request is one
//! atomic increment; the key gets a 60 second expiry when it is created and
//! is never extended.
//!
//! ## Accepted imprecision
//!
//! Fixed windows let a tenant send up to twice its limit across a minute
//! boundary (a burst at the end of one minute and the start of the next).
//! Rejected requests still count toward the window, so the counter can
//! overshoot the limit, but the number of admitted requests cannot.
//!
//! ## Store failures
//!
//! On a store error or timeout the request is admitted without headers and
//! the event is reported to the [`DegradedSignal`].

use crate::degraded::{Component, DegradedSignal};
use axum::http::{
    header::{HeaderName, HeaderValue},
    HeaderMap,
};
use chrono::{DateTime, Utc};
use gatekeeper_core::Clock;
use gatekeeper_storage::{with_timeout, CounterStore};
use std::sync::Arc;
use std::time::Duration;

/// Length of a rate-limit window in seconds
pub const WINDOW_SECS: i64 = 60;

/// Window state reported in `X-RateLimit-*` headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitMetadata {
    pub limit: u32,
    pub remaining: u32,
    /// Window end as epoch seconds
    pub reset: i64,
}

impl RateLimitMetadata {
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderValue::from(self.limit),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderValue::from(self.remaining),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-reset"),
            HeaderValue::from(self.reset),
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Admitted(RateLimitMetadata),
    Rejected {
        metadata: RateLimitMetadata,
        retry_after: u64,
    },
    /// Store unreachable; admitted without enforcement
    Degraded,
}

/// Counter key for the minute containing `at`
pub fn window_key(tenant_id: &str, at: DateTime<Utc>) -> String {
    format!("gk:ratelimit:{}:{}", tenant_id, at.format("%Y%m%d%H%M"))
}

fn window_start(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(WINDOW_SECS) * WINDOW_SECS
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    degraded: Arc<DegradedSignal>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        degraded: Arc<DegradedSignal>,
    ) -> Self {
        Self {
            store,
            clock,
            timeout,
            degraded,
        }
    }

    /// Count one request against `limit` for the current minute.
    pub async fn check(&self, tenant_id: &str, limit: u32) -> RateDecision {
        let now = self.clock.now();
        let key = window_key(tenant_id, now);
        let reset = window_start(now) + WINDOW_SECS;
        // The key lives until its window closes, never less than a second.
        let ttl = Duration::from_secs((reset - now.timestamp()).max(1) as u64);

        let count = match with_timeout(
            self.timeout,
            self.store.incr_by_with_expiry(&key, 1, ttl),
        )
        .await
        {
            Ok(count) => count,
            Err(e) => {
                self.degraded.record(Component::RateLimiter, &e);
                return RateDecision::Degraded;
            }
        };

        let remaining = (i64::from(limit) - count).max(0) as u32;
        let metadata = RateLimitMetadata {
            limit,
            remaining,
            reset,
        };

        if count > i64::from(limit) {
            let retry_after = (reset - now.timestamp()).max(1) as u64;
            tracing::debug!(
                tenant_id = %tenant_id,
                count,
                limit,
                retry_after,
                "Rate limit exceeded"
            );
            RateDecision::Rejected {
                metadata,
                retry_after,
            }
        } else {
            RateDecision::Admitted(metadata)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gatekeeper_core::ManualClock;
    use gatekeeper_storage::{MemoryCounterStore, UnavailableCounterStore};

    fn limiter_at(
        start: DateTime<Utc>,
    ) -> (Arc<ManualClock>, Arc<DegradedSignal>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let degraded = Arc::new(DegradedSignal::new());
        let limiter = RateLimiter::new(
            store,
            clock.clone(),
            Duration::from_millis(25),
            degraded.clone(),
        );
        (clock, degraded, limiter)
    }

    #[test]
    fn test_window_key_format() {
        let at = Utc.with_ymd_and_hms(2026, 3, 7, 14, 5, 59).unwrap();
        assert_eq!(window_key("t-1", at), "gk:ratelimit:t-1:202603071405");
    }

    #[tokio::test]
    async fn test_eleventh_request_rejected() {
        let start = Utc.with_ymd_and_hms(2026, 3, 7, 14, 5, 10).unwrap();
        let (_, _, limiter) = limiter_at(start);

        for i in 1..=10u32 {
            match limiter.check("t-1", 10).await {
                RateDecision::Admitted(meta) => assert_eq!(meta.remaining, 10 - i),
                other => panic!("request {} not admitted: {:?}", i, other),
            }
        }

        match limiter.check("t-1", 10).await {
            RateDecision::Rejected {
                metadata,
                retry_after,
            } => {
                assert_eq!(metadata.remaining, 0);
                assert_eq!(retry_after, 50);
                assert_eq!(metadata.reset, start.timestamp() + 50);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fresh_window_after_rollover() {
        let start = Utc.with_ymd_and_hms(2026, 3, 7, 14, 5, 58).unwrap();
        let (clock, _, limiter) = limiter_at(start);

        for _ in 0..3 {
            limiter.check("t-1", 2).await;
        }
        assert!(matches!(
            limiter.check("t-1", 2).await,
            RateDecision::Rejected { .. }
        ));

        clock.advance(chrono::Duration::seconds(3));
        assert!(matches!(
            limiter.check("t-1", 2).await,
            RateDecision::Admitted(RateLimitMetadata { remaining: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_tenants_do_not_share_windows() {
        let start = Utc.with_ymd_and_hms(2026, 3, 7, 14, 5, 0).unwrap();
        let (_, _, limiter) = limiter_at(start);

        limiter.check("t-1", 1).await;
        assert!(matches!(
            limiter.check("t-1", 1).await,
            RateDecision::Rejected { .. }
        ));
        assert!(matches!(
            limiter.check("t-2", 1).await,
            RateDecision::Admitted(_)
        ));
    }

    #[tokio::test]
    async fn test_window_key_expires_with_its_window() {
        let start = Utc.with_ymd_and_hms(2026, 3, 7, 14, 5, 59).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let limiter = RateLimiter::new(
            store.clone(),
            clock.clone(),
            Duration::from_millis(25),
            Arc::new(DegradedSignal::new()),
        );

        limiter.check("t-1", 10).await;
        assert_eq!(
            store.ttl(&window_key("t-1", start)),
            Some(Duration::from_secs(1))
        );

        clock.advance(chrono::Duration::seconds(11));
        limiter.check("t-1", 10).await;
        assert_eq!(
            store.ttl(&window_key("t-1", clock.now())),
            Some(Duration::from_secs(50))
        );
    }

    #[tokio::test]
    async fn test_retry_after_is_at_least_one_second() {
        let start = Utc.with_ymd_and_hms(2026, 3, 7, 14, 5, 59).unwrap()
            + chrono::Duration::milliseconds(900);
        let (_, _, limiter) = limiter_at(start);

        limiter.check("t-1", 1).await;
        match limiter.check("t-1", 1).await {
            RateDecision::Rejected { retry_after, .. } => assert_eq!(retry_after, 1),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_open() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let degraded = Arc::new(DegradedSignal::new());
        let limiter = RateLimiter::new(
            Arc::new(UnavailableCounterStore),
            clock,
            Duration::from_millis(25),
            degraded.clone(),
        );

        assert_eq!(limiter.check("t-1", 10).await, RateDecision::Degraded);
        assert_eq!(degraded.count(Component::RateLimiter), 1);
    }
}
