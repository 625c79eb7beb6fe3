//! Tenant directory interfaces
//!
//! Two traits split the directory by trust level. [`TenantDirectory`] is what
//! ordinary request handling gets: every tenant-owned row it touches is
//! filtered by the caller's [`TenantContext`]. [`PrivilegedDirectory`] adds the
//! cross-tenant operations needed to authenticate a key, apply billing
//! notifications and provision tenants; only those code paths hold one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gatekeeper_core::{
    ApiKeyRecord, BillingEvent, PlanConfiguration, PlanTier, Result, SubscriptionStatus, Tenant,
    TenantContext, UsageLogEntry,
};
use serde::Serialize;

/// Everything needed to admit a request, fetched in one directory call
#[derive(Debug, Clone, PartialEq)]
pub struct KeyLookup {
    pub api_key: ApiKeyRecord,
    pub tenant: Tenant,
    pub plan: PlanConfiguration,
}

/// Fields for a new tenant row
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub name: String,
    pub slug: String,
    pub plan_tier: PlanTier,
    pub subscription_status: SubscriptionStatus,
}

/// Fields for a new API key row. Only the hash of the secret is passed in.
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: Vec<String>,
    pub rate_limit_override: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Partial update applied by billing notifications. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionChange {
    pub plan_tier: Option<PlanTier>,
    pub subscription_status: Option<SubscriptionStatus>,
    pub subscription_ref: Option<String>,
}

impl SubscriptionChange {
    pub fn is_empty(&self) -> bool {
        self.plan_tier.is_none()
            && self.subscription_status.is_none()
            && self.subscription_ref.is_none()
    }
}

/// Where a billing event is in its record/apply/mark sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventState {
    /// Never seen
    Unknown,
    /// Recorded but not yet marked processed
    Pending,
    Processed,
}

/// Aggregated usage log rows for one tenant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub requests: u64,
    pub queries: u64,
    pub cache_hits: u64,
    pub errors: u64,
}

/// Tenant-scoped directory access
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn get_tenant(&self, ctx: &TenantContext) -> Result<Tenant>;

    /// Fails with `PlanNotConfigured` when the tier has no row.
    async fn get_plan(&self, tier: PlanTier) -> Result<PlanConfiguration>;

    async fn list_plans(&self) -> Result<Vec<PlanConfiguration>>;

    async fn create_api_key(
        &self,
        ctx: &TenantContext,
        key: NewApiKey,
        now: DateTime<Utc>,
    ) -> Result<ApiKeyRecord>;

    async fn get_api_key(&self, ctx: &TenantContext, key_id: &str) -> Result<ApiKeyRecord>;

    async fn list_api_keys(&self, ctx: &TenantContext) -> Result<Vec<ApiKeyRecord>>;

    /// Soft-deactivate a key owned by the tenant.
    async fn revoke_api_key(&self, ctx: &TenantContext, key_id: &str) -> Result<ApiKeyRecord>;

    async fn touch_api_key(
        &self,
        ctx: &TenantContext,
        key_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Append a usage row. The entry must belong to `ctx`.
    async fn append_usage(&self, ctx: &TenantContext, entry: UsageLogEntry) -> Result<()>;

    async fn usage_since(&self, ctx: &TenantContext, since: DateTime<Utc>)
        -> Result<UsageSummary>;

    async fn ping(&self) -> Result<()>;
}

/// Cross-tenant directory access for authentication, billing sync and provisioning
#[async_trait]
pub trait PrivilegedDirectory: TenantDirectory {
    /// Look up a key by the hash of its secret, joined with tenant and plan.
    ///
    /// Returns the row even if the key or tenant is inactive; deciding what
    /// that means is up to the caller.
    async fn resolve_key_hash(&self, key_hash: &str) -> Result<Option<KeyLookup>>;

    async fn find_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>>;

    async fn find_tenant_by_subscription(&self, subscription_ref: &str)
        -> Result<Option<Tenant>>;

    async fn create_tenant(&self, tenant: NewTenant, now: DateTime<Utc>) -> Result<Tenant>;

    async fn set_tenant_active(
        &self,
        tenant_id: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Tenant>;

    /// Last writer wins on plan tier and subscription status.
    async fn apply_subscription_change(
        &self,
        tenant_id: &str,
        change: SubscriptionChange,
        now: DateTime<Utc>,
    ) -> Result<Tenant>;

    async fn billing_event_state(&self, event_id: &str) -> Result<BillingEventState>;

    /// Insert the event. Returns `false` if the id was already recorded.
    async fn record_billing_event(&self, event: BillingEvent) -> Result<bool>;

    async fn mark_billing_event_processed(&self, event_id: &str, at: DateTime<Utc>)
        -> Result<()>;

    /// Insert or replace a plan row, bumping its version.
    async fn upsert_plan(&self, plan: PlanConfiguration) -> Result<PlanConfiguration>;
}

// =============================================================================
// Test doubles
// =============================================================================

#[cfg(any(test, feature = "test-utils"))]
pub use faulty::{DirectoryFaults, FaultyDirectory};

#[cfg(any(test, feature = "test-utils"))]
mod faulty {
    use super::*;
    use gatekeeper_core::GatekeeperError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    type Hook = Box<dyn Fn() + Send + Sync>;

    /// Switches and counters for [`FaultyDirectory`]
    #[derive(Default)]
    pub struct DirectoryFaults {
        /// Report every billing event as never seen, like a reader racing a
        /// concurrent delivery of the same id.
        pub stale_event_state: AtomicBool,
        pub fail_key_creation: AtomicBool,
        /// Number of `apply_subscription_change` calls that reached the inner directory
        pub subscription_changes: AtomicUsize,
        key_lookup_hook: Mutex<Option<Hook>>,
    }

    impl DirectoryFaults {
        /// Run `hook` inside every `resolve_key_hash`, before the inner lookup.
        pub fn on_key_lookup(&self, hook: impl Fn() + Send + Sync + 'static) {
            *self.key_lookup_hook.lock() = Some(Box::new(hook));
        }
    }

    /// Delegating directory that injects faults and interleavings
    pub struct FaultyDirectory<D> {
        inner: Arc<D>,
        pub faults: DirectoryFaults,
    }

    impl<D> FaultyDirectory<D> {
        pub fn new(inner: Arc<D>) -> Self {
            Self {
                inner,
                faults: DirectoryFaults::default(),
            }
        }
    }

    #[async_trait]
    impl<D: PrivilegedDirectory> TenantDirectory for FaultyDirectory<D> {
        async fn get_tenant(&self, ctx: &TenantContext) -> Result<Tenant> {
            self.inner.get_tenant(ctx).await
        }

        async fn get_plan(&self, tier: PlanTier) -> Result<PlanConfiguration> {
            self.inner.get_plan(tier).await
        }

        async fn list_plans(&self) -> Result<Vec<PlanConfiguration>> {
            self.inner.list_plans().await
        }

        async fn create_api_key(
            &self,
            ctx: &TenantContext,
            key: NewApiKey,
            now: DateTime<Utc>,
        ) -> Result<ApiKeyRecord> {
            if self.faults.fail_key_creation.load(Ordering::SeqCst) {
                return Err(GatekeeperError::Other("injected key creation failure".to_string()));
            }
            self.inner.create_api_key(ctx, key, now).await
        }

        async fn get_api_key(&self, ctx: &TenantContext, key_id: &str) -> Result<ApiKeyRecord> {
            self.inner.get_api_key(ctx, key_id).await
        }

        async fn list_api_keys(&self, ctx: &TenantContext) -> Result<Vec<ApiKeyRecord>> {
            self.inner.list_api_keys(ctx).await
        }

        async fn revoke_api_key(&self, ctx: &TenantContext, key_id: &str) -> Result<ApiKeyRecord> {
            self.inner.revoke_api_key(ctx, key_id).await
        }

        async fn touch_api_key(
            &self,
            ctx: &TenantContext,
            key_id: &str,
            at: DateTime<Utc>,
        ) -> Result<()> {
            self.inner.touch_api_key(ctx, key_id, at).await
        }

        async fn append_usage(&self, ctx: &TenantContext, entry: UsageLogEntry) -> Result<()> {
            self.inner.append_usage(ctx, entry).await
        }

        async fn usage_since(
            &self,
            ctx: &TenantContext,
            since: DateTime<Utc>,
        ) -> Result<UsageSummary> {
            self.inner.usage_since(ctx, since).await
        }

        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }
    }

    #[async_trait]
    impl<D: PrivilegedDirectory> PrivilegedDirectory for FaultyDirectory<D> {
        async fn resolve_key_hash(&self, key_hash: &str) -> Result<Option<KeyLookup>> {
            if let Some(hook) = self.faults.key_lookup_hook.lock().as_ref() {
                hook();
            }
            self.inner.resolve_key_hash(key_hash).await
        }

        async fn find_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
            self.inner.find_tenant(tenant_id).await
        }

        async fn find_tenant_by_subscription(
            &self,
            subscription_ref: &str,
        ) -> Result<Option<Tenant>> {
            self.inner.find_tenant_by_subscription(subscription_ref).await
        }

        async fn create_tenant(&self, tenant: NewTenant, now: DateTime<Utc>) -> Result<Tenant> {
            self.inner.create_tenant(tenant, now).await
        }

        async fn set_tenant_active(
            &self,
            tenant_id: &str,
            active: bool,
            now: DateTime<Utc>,
        ) -> Result<Tenant> {
            self.inner.set_tenant_active(tenant_id, active, now).await
        }

        async fn apply_subscription_change(
            &self,
            tenant_id: &str,
            change: SubscriptionChange,
            now: DateTime<Utc>,
        ) -> Result<Tenant> {
            self.faults.subscription_changes.fetch_add(1, Ordering::SeqCst);
            self.inner.apply_subscription_change(tenant_id, change, now).await
        }

        async fn billing_event_state(&self, event_id: &str) -> Result<BillingEventState> {
            if self.faults.stale_event_state.load(Ordering::SeqCst) {
                return Ok(BillingEventState::Unknown);
            }
            self.inner.billing_event_state(event_id).await
        }

        async fn record_billing_event(&self, event: BillingEvent) -> Result<bool> {
            self.inner.record_billing_event(event).await
        }

        async fn mark_billing_event_processed(
            &self,
            event_id: &str,
            at: DateTime<Utc>,
        ) -> Result<()> {
            self.inner.mark_billing_event_processed(event_id, at).await
        }

        async fn upsert_plan(&self, plan: PlanConfiguration) -> Result<PlanConfiguration> {
            self.inner.upsert_plan(plan).await
        }
    }
}
