//! Degraded-mode signal
//!
//! Rate limiting, quota tracking and result caching fail open: when the
//! counter store is slow or down the request proceeds unmetered. Each such
//! event is logged, exported as a metric and counted here so tests and the
//! health endpoint can observe it.

use gatekeeper_storage::StoreError;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Component that skipped its work because of a store failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    RateLimiter,
    QuotaTracker,
    ResultCache,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::RateLimiter => "rate_limiter",
            Component::QuotaTracker => "quota_tracker",
            Component::ResultCache => "result_cache",
        }
    }

    fn index(&self) -> usize {
        match self {
            Component::RateLimiter => 0,
            Component::QuotaTracker => 1,
            Component::ResultCache => 2,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct DegradedSignal {
    counts: [AtomicU64; 3],
}

/// Point-in-time copy of the degraded counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DegradedSnapshot {
    pub rate_limiter: u64,
    pub quota_tracker: u64,
    pub result_cache: u64,
}

impl DegradedSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, component: Component, error: &StoreError) {
        self.counts[component.index()].fetch_add(1, Ordering::Relaxed);

        tracing::warn!(
            component = component.as_str(),
            error = %error,
            "Counter store failure, continuing in degraded mode"
        );

        #[cfg(feature = "metrics")]
        crate::metrics::record_degraded_event(component.as_str());
    }

    pub fn count(&self, component: Component) -> u64 {
        self.counts[component.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn snapshot(&self) -> DegradedSnapshot {
        DegradedSnapshot {
            rate_limiter: self.count(Component::RateLimiter),
            quota_tracker: self.count(Component::QuotaTracker),
            result_cache: self.count(Component::ResultCache),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_counts_per_component() {
        let signal = DegradedSignal::new();
        let err = StoreError::Timeout(Duration::from_millis(25));

        signal.record(Component::RateLimiter, &err);
        signal.record(Component::ResultCache, &err);
        signal.record(Component::ResultCache, &err);

        assert_eq!(signal.count(Component::RateLimiter), 1);
        assert_eq!(signal.count(Component::QuotaTracker), 0);
        assert_eq!(signal.count(Component::ResultCache), 2);
        assert_eq!(signal.total(), 3);
        assert_eq!(
            signal.snapshot(),
            DegradedSnapshot {
                rate_limiter: 1,
                quota_tracker: 0,
                result_cache: 2,
            }
        );
    }
}
