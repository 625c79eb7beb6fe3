//! SQLite tenant directory
//!
//! One connection behind a mutex; every call runs on the blocking pool so the
//! async request path never waits on SQLite directly.

use crate::directory::{
    BillingEventState, KeyLookup, NewApiKey, NewTenant, PrivilegedDirectory, SubscriptionChange,
    TenantDirectory, UsageSummary,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gatekeeper_core::plans::seed_default_plans;
use gatekeeper_core::{
    init_sqlite_schema, ApiKeyRecord, BillingEvent, GatekeeperError, PlanConfiguration, PlanTier,
    Result, Tenant, TenantContext, UsageLogEntry,
};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

const TENANT_COLUMNS: &str = "id, name, slug, plan_tier, subscription_status, subscription_ref, \
     is_active, created_at, updated_at";

const API_KEY_COLUMNS: &str = "id, tenant_id, key_hash, key_prefix, name, scopes, \
     rate_limit_override, is_active, expires_at, last_used_at, created_at";

const PLAN_COLUMNS: &str =
    "tier, monthly_quota, rate_limit_per_minute, features, price_cents, version, updated_at";

/// Tenant directory stored in a local SQLite file
#[derive(Clone, Debug)]
pub struct SqliteDirectory {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteDirectory {
    /// Open (creating if needed) a directory at `path`
    ///
    /// Enables foreign keys, creates the schema and seeds the default plans
    /// for tiers that have no row yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::prepare(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.as_ref().to_path_buf()),
        })
    }

    /// Private in-memory directory, mainly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Create a new directory file, failing if one already exists
    pub fn initialize<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Err(GatekeeperError::Other(format!(
                "Directory already exists at {:?}",
                path.as_ref()
            )));
        }
        Self::open(path)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn prepare(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
        init_sqlite_schema(conn)?;
        seed_default_plans(conn, Utc::now())?;
        Ok(())
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            op(&mut guard)
        })
        .await
        .map_err(|e| GatekeeperError::Other(format!("Directory task failed: {}", e)))?
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = GatekeeperError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn tenant_from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(at)?,
        name: row.get(at + 1)?,
        slug: row.get(at + 2)?,
        plan_tier: parse_column(row, at + 3)?,
        subscription_status: parse_column(row, at + 4)?,
        subscription_ref: row.get(at + 5)?,
        is_active: row.get(at + 6)?,
        created_at: row.get(at + 7)?,
        updated_at: row.get(at + 8)?,
    })
}

fn api_key_from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: row.get(at)?,
        tenant_id: row.get(at + 1)?,
        key_hash: row.get(at + 2)?,
        key_prefix: row.get(at + 3)?,
        name: row.get(at + 4)?,
        scopes: json_list(row, at + 5)?,
        rate_limit_override: row.get(at + 6)?,
        is_active: row.get(at + 7)?,
        expires_at: row.get(at + 8)?,
        last_used_at: row.get(at + 9)?,
        created_at: row.get(at + 10)?,
    })
}

fn plan_from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<PlanConfiguration> {
    let monthly_quota: i64 = row.get(at + 1)?;
    Ok(PlanConfiguration {
        tier: parse_column(row, at)?,
        monthly_quota: monthly_quota.max(0) as u64,
        rate_limit_per_minute: row.get(at + 2)?,
        features: json_list(row, at + 3)?,
        price_cents: row.get(at + 4)?,
        version: row.get(at + 5)?,
        updated_at: row.get(at + 6)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn select_tenant(conn: &Connection, tenant_id: &str) -> Result<Option<Tenant>> {
    let sql = format!("SELECT {} FROM tenants WHERE id = ?1", TENANT_COLUMNS);
    Ok(conn
        .query_row(&sql, params![tenant_id], |row| tenant_from_row(row, 0))
        .optional()?)
}

fn select_plan(conn: &Connection, tier: PlanTier) -> Result<PlanConfiguration> {
    let sql = format!(
        "SELECT {} FROM plan_configurations WHERE tier = ?1",
        PLAN_COLUMNS
    );
    conn.query_row(&sql, params![tier.as_str()], |row| plan_from_row(row, 0))
        .optional()?
        .ok_or_else(|| GatekeeperError::PlanNotConfigured(tier.to_string()))
}

fn select_api_key(conn: &Connection, tenant_id: &str, key_id: &str) -> Result<ApiKeyRecord> {
    let sql = format!(
        "SELECT {} FROM api_keys WHERE id = ?1 AND tenant_id = ?2",
        API_KEY_COLUMNS
    );
    conn.query_row(&sql, params![key_id, tenant_id], |row| {
        api_key_from_row(row, 0)
    })
    .optional()?
    .ok_or_else(|| GatekeeperError::ApiKeyNotFound(key_id.to_string()))
}

// =============================================================================
// Tenant-scoped operations
// =============================================================================

#[async_trait]
impl TenantDirectory for SqliteDirectory {
    async fn get_tenant(&self, ctx: &TenantContext) -> Result<Tenant> {
        let tenant_id = ctx.tenant_id().to_string();
        self.run(move |conn| {
            select_tenant(conn, &tenant_id)?.ok_or(GatekeeperError::TenantNotFound(tenant_id))
        })
        .await
    }

    async fn get_plan(&self, tier: PlanTier) -> Result<PlanConfiguration> {
        self.run(move |conn| select_plan(conn, tier)).await
    }

    async fn list_plans(&self) -> Result<Vec<PlanConfiguration>> {
        self.run(|conn| {
            let sql = format!(
                "SELECT {} FROM plan_configurations ORDER BY monthly_quota",
                PLAN_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let plans = stmt
                .query_map([], |row| plan_from_row(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(plans)
        })
        .await
    }

    async fn create_api_key(
        &self,
        ctx: &TenantContext,
        key: NewApiKey,
        now: DateTime<Utc>,
    ) -> Result<ApiKeyRecord> {
        let tenant_id = ctx.tenant_id().to_string();
        self.run(move |conn| {
            if select_tenant(conn, &tenant_id)?.is_none() {
                return Err(GatekeeperError::TenantNotFound(tenant_id));
            }

            let id = uuid::Uuid::new_v4().to_string();
            let inserted = conn.execute(
                "INSERT INTO api_keys
                   (id, tenant_id, key_hash, key_prefix, name, scopes, rate_limit_override,
                    is_active, expires_at, last_used_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, NULL, ?9)",
                params![
                    id,
                    tenant_id,
                    key.key_hash,
                    key.key_prefix,
                    key.name,
                    serde_json::to_string(&key.scopes)?,
                    key.rate_limit_override,
                    key.expires_at,
                    now,
                ],
            );

            match inserted {
                Ok(_) => select_api_key(conn, &tenant_id, &id),
                Err(e) if is_constraint_violation(&e) => Err(GatekeeperError::ConflictError(
                    "API key hash already exists".to_string(),
                )),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_api_key(&self, ctx: &TenantContext, key_id: &str) -> Result<ApiKeyRecord> {
        let tenant_id = ctx.tenant_id().to_string();
        let key_id = key_id.to_string();
        self.run(move |conn| select_api_key(conn, &tenant_id, &key_id))
            .await
    }

    async fn list_api_keys(&self, ctx: &TenantContext) -> Result<Vec<ApiKeyRecord>> {
        let tenant_id = ctx.tenant_id().to_string();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM api_keys WHERE tenant_id = ?1 ORDER BY created_at, id",
                API_KEY_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let keys = stmt
                .query_map(params![tenant_id], |row| api_key_from_row(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }

    async fn revoke_api_key(&self, ctx: &TenantContext, key_id: &str) -> Result<ApiKeyRecord> {
        let tenant_id = ctx.tenant_id().to_string();
        let key_id = key_id.to_string();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE api_keys SET is_active = 0 WHERE id = ?1 AND tenant_id = ?2",
                params![key_id, tenant_id],
            )?;
            if updated == 0 {
                return Err(GatekeeperError::ApiKeyNotFound(key_id));
            }
            select_api_key(conn, &tenant_id, &key_id)
        })
        .await
    }

    async fn touch_api_key(
        &self,
        ctx: &TenantContext,
        key_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let tenant_id = ctx.tenant_id().to_string();
        let key_id = key_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2 AND tenant_id = ?3",
                params![at, key_id, tenant_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_usage(&self, ctx: &TenantContext, entry: UsageLogEntry) -> Result<()> {
        if entry.tenant_id != ctx.tenant_id() {
            return Err(GatekeeperError::ValidationError(format!(
                "Usage entry for tenant {} cannot be written under tenant {}",
                entry.tenant_id, ctx
            )));
        }

        self.run(move |conn| {
            conn.execute(
                "INSERT INTO usage_logs
                   (tenant_id, api_key_id, endpoint, query_count, cache_hit, latency_ms,
                    status_code, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.tenant_id,
                    entry.api_key_id,
                    entry.endpoint,
                    entry.query_count,
                    entry.cache_hit,
                    entry.latency_ms as i64,
                    entry.status_code,
                    entry.error,
                    entry.created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn usage_since(
        &self,
        ctx: &TenantContext,
        since: DateTime<Utc>,
    ) -> Result<UsageSummary> {
        let tenant_id = ctx.tenant_id().to_string();
        self.run(move |conn| {
            let summary = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(query_count), 0),
                        COALESCE(SUM(cache_hit), 0),
                        COALESCE(SUM(CASE WHEN status_code >= 400 THEN 1 ELSE 0 END), 0)
                 FROM usage_logs
                 WHERE tenant_id = ?1 AND created_at >= ?2",
                params![tenant_id, since],
                |row| {
                    let requests: i64 = row.get(0)?;
                    let queries: i64 = row.get(1)?;
                    let cache_hits: i64 = row.get(2)?;
                    let errors: i64 = row.get(3)?;
                    Ok(UsageSummary {
                        requests: requests.max(0) as u64,
                        queries: queries.max(0) as u64,
                        cache_hits: cache_hits.max(0) as u64,
                        errors: errors.max(0) as u64,
                    })
                },
            )?;
            Ok(summary)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

// =============================================================================
// Privileged operations
// =============================================================================

#[async_trait]
impl PrivilegedDirectory for SqliteDirectory {
    async fn resolve_key_hash(&self, key_hash: &str) -> Result<Option<KeyLookup>> {
        let key_hash = key_hash.to_string();
        self.run(move |conn| {
            let sql = "SELECT k.id, k.tenant_id, k.key_hash, k.key_prefix, k.name, k.scopes,
                              k.rate_limit_override, k.is_active, k.expires_at, k.last_used_at,
                              k.created_at,
                              t.id, t.name, t.slug, t.plan_tier, t.subscription_status,
                              t.subscription_ref, t.is_active, t.created_at, t.updated_at,
                              p.tier, p.monthly_quota, p.rate_limit_per_minute, p.features,
                              p.price_cents, p.version, p.updated_at
                       FROM api_keys k
                       JOIN tenants t ON t.id = k.tenant_id
                       LEFT JOIN plan_configurations p ON p.tier = t.plan_tier
                       WHERE k.key_hash = ?1";

            let found = conn
                .query_row(sql, params![key_hash], |row| {
                    let api_key = api_key_from_row(row, 0)?;
                    let tenant = tenant_from_row(row, 11)?;
                    let plan_tier: Option<String> = row.get(20)?;
                    let plan = match plan_tier {
                        Some(_) => Some(plan_from_row(row, 20)?),
                        None => None,
                    };
                    Ok((api_key, tenant, plan))
                })
                .optional()?;

            match found {
                None => Ok(None),
                Some((api_key, tenant, Some(plan))) => Ok(Some(KeyLookup {
                    api_key,
                    tenant,
                    plan,
                })),
                Some((_, tenant, None)) => {
                    Err(GatekeeperError::PlanNotConfigured(tenant.plan_tier.to_string()))
                }
            }
        })
        .await
    }

    async fn find_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let tenant_id = tenant_id.to_string();
        self.run(move |conn| select_tenant(conn, &tenant_id)).await
    }

    async fn find_tenant_by_subscription(
        &self,
        subscription_ref: &str,
    ) -> Result<Option<Tenant>> {
        let subscription_ref = subscription_ref.to_string();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM tenants WHERE subscription_ref = ?1",
                TENANT_COLUMNS
            );
            Ok(conn
                .query_row(&sql, params![subscription_ref], |row| {
                    tenant_from_row(row, 0)
                })
                .optional()?)
        })
        .await
    }

    async fn create_tenant(&self, tenant: NewTenant, now: DateTime<Utc>) -> Result<Tenant> {
        self.run(move |conn| {
            select_plan(conn, tenant.plan_tier)?;

            let id = uuid::Uuid::new_v4().to_string();
            let inserted = conn.execute(
                "INSERT INTO tenants
                   (id, name, slug, plan_tier, subscription_status, subscription_ref,
                    is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, 1, ?6, ?6)",
                params![
                    id,
                    tenant.name,
                    tenant.slug,
                    tenant.plan_tier.as_str(),
                    tenant.subscription_status.as_str(),
                    now,
                ],
            );

            match inserted {
                Ok(_) => select_tenant(conn, &id)?.ok_or(GatekeeperError::TenantNotFound(id)),
                Err(e) if is_constraint_violation(&e) => Err(GatekeeperError::ConflictError(
                    format!("Tenant slug already taken: {}", tenant.slug),
                )),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn set_tenant_active(
        &self,
        tenant_id: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Tenant> {
        let tenant_id = tenant_id.to_string();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE tenants SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                params![active, now, tenant_id],
            )?;
            if updated == 0 {
                return Err(GatekeeperError::TenantNotFound(tenant_id));
            }
            select_tenant(conn, &tenant_id)?.ok_or(GatekeeperError::TenantNotFound(tenant_id))
        })
        .await
    }

    async fn apply_subscription_change(
        &self,
        tenant_id: &str,
        change: SubscriptionChange,
        now: DateTime<Utc>,
    ) -> Result<Tenant> {
        let tenant_id = tenant_id.to_string();
        self.run(move |conn| {
            if let Some(tier) = change.plan_tier {
                select_plan(conn, tier)?;
            }

            let updated = conn.execute(
                "UPDATE tenants SET
                   plan_tier = COALESCE(?1, plan_tier),
                   subscription_status = COALESCE(?2, subscription_status),
                   subscription_ref = COALESCE(?3, subscription_ref),
                   updated_at = ?4
                 WHERE id = ?5",
                params![
                    change.plan_tier.map(|t| t.as_str()),
                    change.subscription_status.map(|s| s.as_str()),
                    change.subscription_ref,
                    now,
                    tenant_id,
                ],
            )?;
            if updated == 0 {
                return Err(GatekeeperError::TenantNotFound(tenant_id));
            }
            select_tenant(conn, &tenant_id)?.ok_or(GatekeeperError::TenantNotFound(tenant_id))
        })
        .await
    }

    async fn billing_event_state(&self, event_id: &str) -> Result<BillingEventState> {
        let event_id = event_id.to_string();
        self.run(move |conn| {
            let processed: Option<bool> = conn
                .query_row(
                    "SELECT processed FROM billing_events WHERE event_id = ?1",
                    params![event_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(match processed {
                None => BillingEventState::Unknown,
                Some(false) => BillingEventState::Pending,
                Some(true) => BillingEventState::Processed,
            })
        })
        .await
    }

    async fn record_billing_event(&self, event: BillingEvent) -> Result<bool> {
        self.run(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO billing_events
                   (event_id, event_type, payload, processed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.event_id,
                    event.event_type,
                    event.payload,
                    event.processed,
                    event.created_at,
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn mark_billing_event_processed(
        &self,
        event_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let event_id = event_id.to_string();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE billing_events SET processed = 1, processed_at = ?1 WHERE event_id = ?2",
                params![at, event_id],
            )?;
            if updated == 0 {
                return Err(GatekeeperError::Other(format!(
                    "Billing event not recorded: {}",
                    event_id
                )));
            }
            Ok(())
        })
        .await
    }

    async fn upsert_plan(&self, plan: PlanConfiguration) -> Result<PlanConfiguration> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO plan_configurations
                   (tier, monthly_quota, rate_limit_per_minute, features, price_cents, version, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
                 ON CONFLICT(tier) DO UPDATE SET
                   monthly_quota = excluded.monthly_quota,
                   rate_limit_per_minute = excluded.rate_limit_per_minute,
                   features = excluded.features,
                   price_cents = excluded.price_cents,
                   version = plan_configurations.version + 1,
                   updated_at = excluded.updated_at",
                params![
                    plan.tier.as_str(),
                    plan.monthly_quota as i64,
                    plan.rate_limit_per_minute,
                    serde_json::to_string(&plan.features)?,
                    plan.price_cents,
                    plan.updated_at,
                ],
            )?;
            select_plan(conn, plan.tier)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_core::SubscriptionStatus;
    use tempfile::NamedTempFile;

    fn new_tenant(slug: &str, tier: PlanTier) -> NewTenant {
        NewTenant {
            name: format!("{} inc", slug),
            slug: slug.to_string(),
            plan_tier: tier,
            subscription_status: tier.initial_status(),
        }
    }

    fn new_key(hash: &str) -> NewApiKey {
        NewApiKey {
            name: "Default".to_string(),
            key_hash: hash.to_string(),
            key_prefix: "uc_live_abcd".to_string(),
            scopes: vec!["search".to_string()],
            rate_limit_override: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_open_seeds_plans() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        let plans = dir.list_plans().await.unwrap();
        assert_eq!(plans.len(), 4);
        assert_eq!(plans[0].tier, PlanTier::Free);

        let free = dir.get_plan(PlanTier::Free).await.unwrap();
        assert_eq!(free.rate_limit_per_minute, 10);
        assert_eq!(free.monthly_quota, 1_000);
        dir.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_refuses_existing_file() {
        let temp = NamedTempFile::new().unwrap();
        assert!(SqliteDirectory::initialize(temp.path()).is_err());

        std::fs::remove_file(temp.path()).unwrap();
        let dir = SqliteDirectory::initialize(temp.path()).unwrap();
        assert_eq!(dir.path(), Some(temp.path()));

        // Reopening keeps data and does not reseed edited plans
        let mut plan = dir.get_plan(PlanTier::Free).await.unwrap();
        plan.monthly_quota = 42;
        dir.upsert_plan(plan).await.unwrap();
        drop(dir);

        let reopened = SqliteDirectory::open(temp.path()).unwrap();
        let plan = reopened.get_plan(PlanTier::Free).await.unwrap();
        assert_eq!(plan.monthly_quota, 42);
        assert_eq!(plan.version, 2);
    }

    #[tokio::test]
    async fn test_resolve_key_hash_joins_tenant_and_plan() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        let now = Utc::now();
        let tenant = dir
            .create_tenant(new_tenant("acme", PlanTier::Starter), now)
            .await
            .unwrap();
        assert_eq!(tenant.subscription_status, SubscriptionStatus::Trialing);

        let ctx = TenantContext::new(&tenant.id).unwrap();
        let key = dir.create_api_key(&ctx, new_key("hash-1"), now).await.unwrap();
        assert_eq!(key.scopes, vec!["search".to_string()]);

        let lookup = dir.resolve_key_hash("hash-1").await.unwrap().unwrap();
        assert_eq!(lookup.api_key.id, key.id);
        assert_eq!(lookup.tenant.id, tenant.id);
        assert_eq!(lookup.plan.tier, PlanTier::Starter);
        assert_eq!(lookup.plan.rate_limit_per_minute, 60);

        assert!(dir.resolve_key_hash("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_slug_conflicts() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        let now = Utc::now();
        dir.create_tenant(new_tenant("acme", PlanTier::Free), now)
            .await
            .unwrap();
        let err = dir
            .create_tenant(new_tenant("acme", PlanTier::Free), now)
            .await
            .unwrap_err();
        assert!(matches!(err, GatekeeperError::ConflictError(_)));
    }

    #[tokio::test]
    async fn test_key_operations_are_tenant_scoped() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        let now = Utc::now();
        let a = dir
            .create_tenant(new_tenant("tenant-a", PlanTier::Free), now)
            .await
            .unwrap();
        let b = dir
            .create_tenant(new_tenant("tenant-b", PlanTier::Free), now)
            .await
            .unwrap();
        let ctx_a = TenantContext::new(&a.id).unwrap();
        let ctx_b = TenantContext::new(&b.id).unwrap();

        let key_a = dir.create_api_key(&ctx_a, new_key("hash-a"), now).await.unwrap();

        assert_eq!(dir.list_api_keys(&ctx_a).await.unwrap().len(), 1);
        assert!(dir.list_api_keys(&ctx_b).await.unwrap().is_empty());

        // Tenant B cannot revoke or read tenant A's key
        let err = dir.revoke_api_key(&ctx_b, &key_a.id).await.unwrap_err();
        assert!(matches!(err, GatekeeperError::ApiKeyNotFound(_)));
        assert!(dir.get_api_key(&ctx_b, &key_a.id).await.is_err());

        let revoked = dir.revoke_api_key(&ctx_a, &key_a.id).await.unwrap();
        assert!(!revoked.is_active);
    }

    #[tokio::test]
    async fn test_usage_append_and_summary() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        let now = Utc::now();
        let tenant = dir
            .create_tenant(new_tenant("acme", PlanTier::Free), now)
            .await
            .unwrap();
        let ctx = TenantContext::new(&tenant.id).unwrap();

        let entry = |status_code, cache_hit, query_count| UsageLogEntry {
            tenant_id: tenant.id.clone(),
            api_key_id: None,
            endpoint: "search".to_string(),
            query_count,
            cache_hit,
            latency_ms: 12,
            status_code,
            error: None,
            created_at: now,
        };

        dir.append_usage(&ctx, entry(200, false, 1)).await.unwrap();
        dir.append_usage(&ctx, entry(200, true, 5)).await.unwrap();
        dir.append_usage(&ctx, entry(429, false, 1)).await.unwrap();

        let summary = dir
            .usage_since(&ctx, now - chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(
            summary,
            UsageSummary {
                requests: 3,
                queries: 7,
                cache_hits: 1,
                errors: 1
            }
        );

        // Writing another tenant's entry under this context is refused
        let mut foreign = entry(200, false, 1);
        foreign.tenant_id = "someone-else".to_string();
        assert!(dir.append_usage(&ctx, foreign).await.is_err());
    }

    #[tokio::test]
    async fn test_subscription_change_is_partial() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        let now = Utc::now();
        let tenant = dir
            .create_tenant(new_tenant("acme", PlanTier::Free), now)
            .await
            .unwrap();

        let updated = dir
            .apply_subscription_change(
                &tenant.id,
                SubscriptionChange {
                    plan_tier: Some(PlanTier::Professional),
                    subscription_status: None,
                    subscription_ref: Some("sub_123".to_string()),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(updated.plan_tier, PlanTier::Professional);
        assert_eq!(updated.subscription_status, SubscriptionStatus::Active);

        let by_ref = dir.find_tenant_by_subscription("sub_123").await.unwrap();
        assert_eq!(by_ref.map(|t| t.id), Some(tenant.id.clone()));

        let err = dir
            .apply_subscription_change("missing", SubscriptionChange::default(), now)
            .await
            .unwrap_err();
        assert!(matches!(err, GatekeeperError::TenantNotFound(_)));
    }

    #[tokio::test]
    async fn test_billing_event_lifecycle() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        let now = Utc::now();
        let event = BillingEvent {
            event_id: "evt_1".to_string(),
            event_type: "invoice.paid".to_string(),
            payload: "{}".to_string(),
            processed: false,
            created_at: now,
        };

        assert_eq!(
            dir.billing_event_state("evt_1").await.unwrap(),
            BillingEventState::Unknown
        );
        assert!(dir.record_billing_event(event.clone()).await.unwrap());
        assert!(!dir.record_billing_event(event).await.unwrap());
        assert_eq!(
            dir.billing_event_state("evt_1").await.unwrap(),
            BillingEventState::Pending
        );

        dir.mark_billing_event_processed("evt_1", now).await.unwrap();
        assert_eq!(
            dir.billing_event_state("evt_1").await.unwrap(),
            BillingEventState::Processed
        );
        assert!(dir
            .mark_billing_event_processed("evt_missing", now)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_deactivated_tenant_still_resolves() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        let now = Utc::now();
        let tenant = dir
            .create_tenant(new_tenant("acme", PlanTier::Free), now)
            .await
            .unwrap();
        let ctx = TenantContext::new(&tenant.id).unwrap();
        dir.create_api_key(&ctx, new_key("hash-x"), now).await.unwrap();

        let tenant = dir.set_tenant_active(&tenant.id, false, now).await.unwrap();
        assert!(!tenant.is_active);

        let lookup = dir.resolve_key_hash("hash-x").await.unwrap().unwrap();
        assert!(!lookup.tenant.is_active);
    }
}
