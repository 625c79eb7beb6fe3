//! Dependency reachability for external monitoring

use crate::degraded::{DegradedSignal, DegradedSnapshot};
use gatekeeper_storage::{with_timeout, CounterStore, StoreTimeouts, TenantDirectory};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// "ok" when every dependency answered, else "degraded"
    pub status: &'static str,
    pub counter_store: bool,
    pub directory: bool,
    pub degraded_events: DegradedSnapshot,
    pub version: &'static str,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.counter_store && self.directory
    }
}

pub async fn check_health<D>(
    store: &dyn CounterStore,
    directory: &D,
    timeouts: &StoreTimeouts,
    degraded: &DegradedSignal,
) -> HealthReport
where
    D: TenantDirectory + ?Sized,
{
    let (store_result, directory_result) = tokio::join!(
        with_timeout(timeouts.counter, store.ping()),
        tokio::time::timeout(timeouts.directory, directory.ping()),
    );

    let counter_store = match store_result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Health check: counter store unreachable");
            false
        }
    };
    let directory = match directory_result {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Health check: directory unreachable");
            false
        }
        Err(_) => {
            tracing::warn!("Health check: directory ping timed out");
            false
        }
    };

    HealthReport {
        status: if counter_store && directory { "ok" } else { "degraded" },
        counter_store,
        directory,
        degraded_events: degraded.snapshot(),
        version: env!("CARGO_PKG_VERSION"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_core::SystemClock;
    use gatekeeper_storage::{MemoryCounterStore, SqliteDirectory, UnavailableCounterStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_all_reachable() {
        let store = MemoryCounterStore::new(Arc::new(SystemClock));
        let directory = SqliteDirectory::open_in_memory().unwrap();

        let report = check_health(
            &store,
            &directory,
            &StoreTimeouts::default(),
            &DegradedSignal::new(),
        )
        .await;
        assert!(report.is_healthy());
        assert_eq!(report.status, "ok");
    }

    #[tokio::test]
    async fn test_unreachable_store_reported() {
        let directory = SqliteDirectory::open_in_memory().unwrap();

        let report = check_health(
            &UnavailableCounterStore,
            &directory,
            &StoreTimeouts::default(),
            &DegradedSignal::new(),
        )
        .await;
        assert!(!report.counter_store);
        assert!(report.directory);
        assert_eq!(report.status, "degraded");
    }
}
