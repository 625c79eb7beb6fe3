//! Per-tenant monthly query quota
//!
//! Counter key: `gk:quota:{tenant_id}:{YYYY-MM}` (UTC calendar month).
//!
//! Unlike rate limiting, the quota gates billable usage and must not
//! overshoot, so the check reads before it writes: if `used + requested`
//! would pass the quota the request is rejected and the counter is left
//! untouched. Admitted requests then add `requested` in one atomic
//! increment. Two requests that both read before either writes can jointly
//! overshoot by at most one batch; that race is accepted instead of locking.
//!
//! The key expires 32 days after the start of its month, so old months
//! clean themselves up.

use crate::degraded::{Component, DegradedSignal};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use gatekeeper_core::Clock;
use gatekeeper_storage::{with_timeout, CounterStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Quota keys live this long past the first instant of their month
pub const QUOTA_KEY_LIFETIME_DAYS: i64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Admitted { used: u64, remaining: u64 },
    Rejected { used: u64, remaining: u64 },
    /// Store unreachable; admitted without metering
    Degraded,
}

/// Current month's consumption for a tenant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    /// First instant of the next month (UTC)
    pub reset_date: DateTime<Utc>,
    pub percentage_used: f64,
}

pub fn month_key(tenant_id: &str, at: DateTime<Utc>) -> String {
    format!("gk:quota:{}:{}", tenant_id, at.format("%Y-%m"))
}

pub fn month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let first = NaiveDate::from_ymd_opt(at.year(), at.month(), 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default();
    Utc.from_utc_datetime(&first)
}

pub fn next_month_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default();
    Utc.from_utc_datetime(&first)
}

fn key_ttl(now: DateTime<Utc>) -> Duration {
    let expires = month_start(now) + chrono::Duration::days(QUOTA_KEY_LIFETIME_DAYS);
    (expires - now)
        .to_std()
        .unwrap_or(Duration::from_secs(1))
        .max(Duration::from_secs(1))
}

pub struct QuotaTracker {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    degraded: Arc<DegradedSignal>,
}

impl QuotaTracker {
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

    /// Admit `requested` queries against `monthly_quota` and consume them.
    pub async fn check_and_consume(
        &self,
        tenant_id: &str,
        requested: u32,
        monthly_quota: u64,
    ) -> QuotaDecision {
        let now = self.clock.now();
        let key = month_key(tenant_id, now);

        let used = match with_timeout(self.timeout, self.store.get(&key)).await {
            Ok(value) => value.unwrap_or(0).max(0) as u64,
            Err(e) => {
                self.degraded.record(Component::QuotaTracker, &e);
                return QuotaDecision::Degraded;
            }
        };

        if used + u64::from(requested) > monthly_quota {
            tracing::debug!(
                tenant_id = %tenant_id,
                used,
                requested,
                monthly_quota,
                "Monthly quota exceeded"
            );
            return QuotaDecision::Rejected {
                used,
                remaining: monthly_quota.saturating_sub(used),
            };
        }

        match with_timeout(
            self.timeout,
            self.store
                .incr_by_with_expiry(&key, i64::from(requested), key_ttl(now)),
        )
        .await
        {
            Ok(total) => {
                let used = total.max(0) as u64;
                QuotaDecision::Admitted {
                    used,
                    remaining: monthly_quota.saturating_sub(used),
                }
            }
            Err(e) => {
                self.degraded.record(Component::QuotaTracker, &e);
                QuotaDecision::Degraded
            }
        }
    }

    /// Read-only view of the current month. A store failure reads as zero used.
    pub async fn status(&self, tenant_id: &str, monthly_quota: u64) -> QuotaStatus {
        let now = self.clock.now();
        let used = match with_timeout(self.timeout, self.store.get(&month_key(tenant_id, now)))
            .await
        {
            Ok(value) => value.unwrap_or(0).max(0) as u64,
            Err(e) => {
                self.degraded.record(Component::QuotaTracker, &e);
                0
            }
        };

        let percentage_used = if monthly_quota == 0 {
            100.0
        } else {
            ((used as f64 / monthly_quota as f64) * 10_000.0).round() / 100.0
        };

        QuotaStatus {
            used,
            limit: monthly_quota,
            remaining: monthly_quota.saturating_sub(used),
            reset_date: next_month_start(now),
            percentage_used,
        }
    }
}
