//! API key resolution
//!
//! Maps a bearer credential to its tenant, plan configuration and key record.
//!
//! # Resolution chain
//!
//! 1. **Format**: the credential must carry the configured environment prefix
//!    (`uc_live_` or `uc_test_`) and 48 hex characters, else
//!    `INVALID_CREDENTIAL`.
//! 2. **Hash**: SHA-256 of the raw secret. The secret itself is never stored.
//! 3. **Lookup**: a local LRU cache keyed by hash, entries valid for a short
//!    TTL (default 2s) and discarded when the configuration epoch moves. On a
//!    miss the directory is queried under the directory timeout.
//! 4. **Checks**: inactive or expired key, or inactive tenant, is
//!    `UNAUTHORIZED`; a subscription that does not permit access is
//!    `SUBSCRIPTION_REQUIRED`.
//! 5. **Last used**: a fire-and-forget job on the work queue.
//!
//! # Failure policy
//!
//! The directory dependency is fail-closed. A timeout or error is
//! `INTERNAL_ERROR`; an unauthenticated request is never admitted.

use crate::error::GateError;
use crate::usage_recorder::{BackgroundJob, WorkQueue};
use chrono::{DateTime, Utc};
use gatekeeper_core::credentials::{check_key_format, hash_api_key, KeyEnvironment};
use gatekeeper_core::{ApiKeyRecord, Clock, PlanConfiguration, Tenant, TenantContext};
use gatekeeper_storage::{KeyLookup, PrivilegedDirectory};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default lifetime of a cached key lookup
pub const DEFAULT_KEY_CACHE_TTL: Duration = Duration::from_secs(2);

/// Default number of cached key lookups
pub const DEFAULT_KEY_CACHE_CAPACITY: usize = 10_000;

/// Shared counter bumped whenever tenant or plan configuration changes.
///
/// Cached lookups remember the epoch they were loaded under and are ignored
/// once it moves on.
#[derive(Debug, Clone, Default)]
pub struct ConfigEpoch(Arc<AtomicU64>);

impl ConfigEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedKey {
    pub tenant: Tenant,
    pub plan: PlanConfiguration,
    pub api_key: ApiKeyRecord,
    context: TenantContext,
}

impl ResolvedKey {
    pub fn tenant_id(&self) -> &str {
        &self.tenant.id
    }

    /// Scope for tenant-restricted directory access
    pub fn context(&self) -> &TenantContext {
        &self.context
    }

    /// Per-key override when set, else the plan limit
    pub fn effective_rate_limit(&self) -> u32 {
        self.api_key
            .rate_limit_override
            .unwrap_or(self.plan.rate_limit_per_minute)
    }
}

#[derive(Debug, Clone)]
pub struct KeyCacheConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_KEY_CACHE_TTL,
            capacity: DEFAULT_KEY_CACHE_CAPACITY,
        }
    }
}

struct CachedLookup {
    lookup: KeyLookup,
    loaded_at: DateTime<Utc>,
    epoch: u64,
}

pub struct KeyResolver {
    directory: Arc<dyn PrivilegedDirectory>,
    environment: KeyEnvironment,
    clock: Arc<dyn Clock>,
    directory_timeout: Duration,
    cache_ttl: chrono::Duration,
    cache: Mutex<LruCache<String, CachedLookup>>,
    epoch: ConfigEpoch,
    work: WorkQueue,
}

impl KeyResolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<dyn PrivilegedDirectory>,
        environment: KeyEnvironment,
        clock: Arc<dyn Clock>,
        directory_timeout: Duration,
        cache: KeyCacheConfig,
        epoch: ConfigEpoch,
        work: WorkQueue,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            directory,
            environment,
            clock,
            directory_timeout,
            cache_ttl: chrono::Duration::from_std(cache.ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(2)),
            cache: Mutex::new(LruCache::new(capacity)),
            epoch,
            work,
        }
    }

    pub fn epoch(&self) -> &ConfigEpoch {
        &self.epoch
    }

    /// Drop every cached lookup, e.g. after a key is revoked.
    pub fn invalidate(&self) {
        self.epoch.bump();
    }

    /// Authenticate `credential` (the bearer token, if any).
    pub async fn resolve(&self, credential: Option<&str>) -> Result<ResolvedKey, GateError> {
        let raw = credential.ok_or_else(|| {
            GateError::unauthorized("Missing API key. Use 'Authorization: Bearer <key>'")
        })?;

        check_key_format(raw, self.environment)
            .map_err(|_| GateError::invalid_credential("Malformed API key"))?;

        let key_hash = hash_api_key(raw);
        let now = self.clock.now();

        let lookup = match self.cached(&key_hash, now) {
            Some(lookup) => lookup,
            None => {
                // Read before loading so a bump during the load invalidates this entry.
                let epoch = self.epoch.current();
                let lookup = self.load(&key_hash).await?;
                self.cache.lock().put(
                    key_hash,
                    CachedLookup {
                        lookup: lookup.clone(),
                        loaded_at: now,
                        epoch,
                    },
                );
                lookup
            }
        };

        let resolved = admit(lookup, now)?;

        self.work.submit(BackgroundJob::TouchApiKey {
            tenant_id: resolved.tenant.id.clone(),
            key_id: resolved.api_key.id.clone(),
            at: now,
        });

        Ok(resolved)
    }

    fn cached(&self, key_hash: &str, now: DateTime<Utc>) -> Option<KeyLookup> {
        let mut cache = self.cache.lock();
        let fresh = match cache.get(key_hash) {
            Some(entry) => {
                entry.epoch == self.epoch.current() && now < entry.loaded_at + self.cache_ttl
            }
            None => {
                #[cfg(feature = "metrics")]
                crate::metrics::record_key_cache(false);
                return None;
            }
        };

        #[cfg(feature = "metrics")]
        crate::metrics::record_key_cache(fresh);

        if fresh {
            cache.get(key_hash).map(|entry| entry.lookup.clone())
        } else {
            cache.pop(key_hash);
            None
        }
    }

    async fn load(&self, key_hash: &str) -> Result<KeyLookup, GateError> {
        let found = tokio::time::timeout(
            self.directory_timeout,
            self.directory.resolve_key_hash(key_hash),
        )
        .await
        .map_err(|_| {
            GateError::internal(format!(
                "directory lookup timed out after {:?}",
                self.directory_timeout
            ))
        })?
        .map_err(GateError::internal)?;

        found.ok_or_else(|| GateError::unauthorized("Invalid API key"))
    }
}

fn admit(lookup: KeyLookup, now: DateTime<Utc>) -> Result<ResolvedKey, GateError> {
    if !lookup.api_key.is_usable_at(now) {
        tracing::debug!(key_id = %lookup.api_key.id, "Rejected inactive or expired API key");
        return Err(GateError::unauthorized("Invalid API key"));
    }

    if !lookup.tenant.is_active {
        tracing::debug!(tenant_id = %lookup.tenant.id, "Rejected key of inactive tenant");
        return Err(GateError::unauthorized("Invalid API key"));
    }

    if !lookup.tenant.subscription_status.permits_access() {
        return Err(GateError::new(
            crate::error::ErrorCode::SubscriptionRequired,
            format!(
                "Subscription is {}. An active subscription is required.",
                lookup.tenant.subscription_status.as_str()
            ),
        ));
    }

    let context = TenantContext::new(lookup.tenant.id.clone()).map_err(GateError::internal)?;
    Ok(ResolvedKey {
        tenant: lookup.tenant,
        plan: lookup.plan,
        api_key: lookup.api_key,
        context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use gatekeeper_core::credentials::{generate_api_key, GeneratedKey};
    use gatekeeper_core::{ManualClock, PlanTier, SubscriptionStatus};
    use gatekeeper_storage::{
        FaultyDirectory, NewApiKey, NewTenant, SqliteDirectory, SubscriptionChange,
        TenantDirectory,
    };
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct Fixture {
        directory: Arc<SqliteDirectory>,
        clock: Arc<ManualClock>,
        resolver: KeyResolver,
        jobs: mpsc::Receiver<BackgroundJob>,
        tenant: Tenant,
        key: GeneratedKey,
        key_id: String,
    }

    async fn fixture() -> Fixture {
        let directory = Arc::new(SqliteDirectory::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tenant = directory
            .create_tenant(
                NewTenant {
                    name: "Acme".to_string(),
                    slug: "acme".to_string(),
                    plan_tier: PlanTier::Starter,
                    subscription_status: SubscriptionStatus::Active,
                },
                clock.now(),
            )
            .await
            .unwrap();

        let key = generate_api_key(KeyEnvironment::Live);
        let ctx = TenantContext::new(tenant.id.clone()).unwrap();
        let record = directory
            .create_api_key(
                &ctx,
                NewApiKey {
                    name: "Default".to_string(),
                    key_hash: key.hash.clone(),
                    key_prefix: key.prefix.clone(),
                    scopes: vec!["search".to_string()],
                    rate_limit_override: None,
                    expires_at: None,
                },
                clock.now(),
            )
            .await
            .unwrap();

        let (work, jobs) = WorkQueue::new(64);
        let resolver = KeyResolver::new(
            directory.clone(),
            KeyEnvironment::Live,
            clock.clone(),
            Duration::from_millis(250),
            KeyCacheConfig::default(),
            ConfigEpoch::new(),
            work,
        );

        Fixture {
            directory,
            clock,
            resolver,
            jobs,
            tenant,
            key,
            key_id: record.id,
        }
    }

    #[tokio::test]
    async fn test_resolves_valid_key_and_queues_touch() {
        let mut f = fixture().await;

        let resolved = f.resolver.resolve(Some(&f.key.raw)).await.unwrap();
        assert_eq!(resolved.tenant_id(), f.tenant.id);
        assert_eq!(resolved.plan.tier, PlanTier::Starter);
        assert_eq!(resolved.effective_rate_limit(), 60);

        match f.jobs.try_recv().unwrap() {
            BackgroundJob::TouchApiKey { key_id, .. } => assert_eq!(key_id, f.key_id),
            other => panic!("unexpected job {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_and_malformed_credentials() {
        let f = fixture().await;

        let err = f.resolver.resolve(None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);

        let err = f.resolver.resolve(Some("uc_live_nothex")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidCredential);

        let test_key = generate_api_key(KeyEnvironment::Test);
        let err = f.resolver.resolve(Some(&test_key.raw)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidCredential);
    }

    #[tokio::test]
    async fn test_unknown_key_is_unauthorized() {
        let f = fixture().await;
        let other = generate_api_key(KeyEnvironment::Live);
        let err = f.resolver.resolve(Some(&other.raw)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_revocation_visible_after_cache_ttl() {
        let f = fixture().await;
        f.resolver.resolve(Some(&f.key.raw)).await.unwrap();

        let ctx = TenantContext::new(f.tenant.id.clone()).unwrap();
        f.directory.revoke_api_key(&ctx, &f.key_id).await.unwrap();

        // Still served from cache inside the TTL
        assert!(f.resolver.resolve(Some(&f.key.raw)).await.is_ok());

        f.clock.advance(chrono::Duration::seconds(3));
        let err = f.resolver.resolve(Some(&f.key.raw)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_epoch_bump_invalidates_immediately() {
        let f = fixture().await;
        f.resolver.resolve(Some(&f.key.raw)).await.unwrap();

        f.directory
            .apply_subscription_change(
                &f.tenant.id,
                SubscriptionChange {
                    subscription_status: Some(SubscriptionStatus::PastDue),
                    ..Default::default()
                },
                f.clock.now(),
            )
            .await
            .unwrap();
        f.resolver.epoch().bump();

        let err = f.resolver.resolve(Some(&f.key.raw)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SubscriptionRequired);
    }

    #[tokio::test]
    async fn test_epoch_bump_during_load_is_not_cached_over() {
        let f = fixture().await;
        let directory = Arc::new(FaultyDirectory::new(f.directory.clone()));
        let epoch = ConfigEpoch::new();
        let lookups = Arc::new(AtomicUsize::new(0));

        // A revocation lands while the first lookup is in flight
        let hook_epoch = epoch.clone();
        let hook_lookups = lookups.clone();
        directory.faults.on_key_lookup(move || {
            if hook_lookups.fetch_add(1, Ordering::SeqCst) == 0 {
                hook_epoch.bump();
            }
        });

        let (work, _jobs) = WorkQueue::new(64);
        let resolver = KeyResolver::new(
            directory,
            KeyEnvironment::Live,
            f.clock.clone(),
            Duration::from_millis(250),
            KeyCacheConfig::default(),
            epoch,
            work,
        );

        resolver.resolve(Some(&f.key.raw)).await.unwrap();
        resolver.resolve(Some(&f.key.raw)).await.unwrap();
        assert_eq!(lookups.load(Ordering::SeqCst), 2);

        // No bump during the second load, so the third call hits the cache
        resolver.resolve(Some(&f.key.raw)).await.unwrap();
        assert_eq!(lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_inactive_tenant_is_unauthorized() {
        let f = fixture().await;
        f.directory
            .set_tenant_active(&f.tenant.id, false, f.clock.now())
            .await
            .unwrap();

        let err = f.resolver.resolve(Some(&f.key.raw)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_expired_key_is_unauthorized() {
        let f = fixture().await;
        let ctx = TenantContext::new(f.tenant.id.clone()).unwrap();
        let short_lived = generate_api_key(KeyEnvironment::Live);
        f.directory
            .create_api_key(
                &ctx,
                NewApiKey {
                    name: "Short".to_string(),
                    key_hash: short_lived.hash.clone(),
                    key_prefix: short_lived.prefix.clone(),
                    scopes: vec!["search".to_string()],
                    rate_limit_override: Some(5),
                    expires_at: Some(f.clock.now() + chrono::Duration::minutes(1)),
                },
                f.clock.now(),
            )
            .await
            .unwrap();

        let resolved = f.resolver.resolve(Some(&short_lived.raw)).await.unwrap();
        assert_eq!(resolved.effective_rate_limit(), 5);

        f.clock.advance(chrono::Duration::minutes(2));
        let err = f.resolver.resolve(Some(&short_lived.raw)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }
}
