//! Gatekeeper Core
//!
//! Core types, credential helpers, and SQLite schema for the search gatekeeper.

pub mod clock;
pub mod credentials;
pub mod plans;
pub mod validation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use clock::{Clock, ManualClock, SystemClock};

// =============================================================================
// Enums
// =============================================================================

/// Billing plan a tenant is subscribed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Starter,
    Professional,
    Enterprise,
}

impl PlanTier {
    pub const ALL: [PlanTier; 4] = [
        PlanTier::Free,
        PlanTier::Starter,
        PlanTier::Professional,
        PlanTier::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Starter => "starter",
            PlanTier::Professional => "professional",
            PlanTier::Enterprise => "enterprise",
        }
    }

    /// Paid tiers start out trialing until the payment provider confirms them.
    pub fn initial_status(&self) -> SubscriptionStatus {
        match self {
            PlanTier::Free => SubscriptionStatus::Active,
            _ => SubscriptionStatus::Trialing,
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "free" => Ok(PlanTier::Free),
            "starter" => Ok(PlanTier::Starter),
            "professional" => Ok(PlanTier::Professional),
            "enterprise" => Ok(PlanTier::Enterprise),
            other => Err(GatekeeperError::ValidationError(format!(
                "Unknown plan tier: {}",
                other
            ))),
        }
    }
}

/// Subscription state as reported by the payment provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Whether requests from a tenant in this state may be served.
    pub fn permits_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            // Providers disagree on the spelling.
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Canceled),
            other => Err(GatekeeperError::ValidationError(format!(
                "Unknown subscription status: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// A billable organization account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    /// Opaque unique identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// URL-safe unique slug
    pub slug: String,
    pub plan_tier: PlanTier,
    pub subscription_status: SubscriptionStatus,
    /// Payment-provider subscription reference, once one exists
    pub subscription_ref: Option<String>,
    /// Soft-deactivation flag
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stored API key. The plaintext secret is never part of this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub tenant_id: String,
    /// SHA-256 hex digest of the secret
    #[serde(skip_serializing, default)]
    pub key_hash: String,
    /// Leading characters of the secret, for display
    pub key_prefix: String,
    pub name: String,
    pub scopes: Vec<String>,
    /// Requests per minute, overriding the plan limit when set
    pub rate_limit_override: Option<u32>,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    /// Active and not past its expiry at `now`.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |expiry| expiry > now)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Limits and features attached to a plan tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConfiguration {
    pub tier: PlanTier,
    /// Queries per calendar month
    pub monthly_quota: u64,
    /// Requests per minute
    pub rate_limit_per_minute: u32,
    pub features: Vec<String>,
    pub price_cents: i64,
    /// Incremented on every edit of the row
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl PlanConfiguration {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// Outcome of one completed request. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub tenant_id: String,
    pub api_key_id: Option<String>,
    pub endpoint: String,
    pub query_count: u32,
    pub cache_hit: bool,
    pub latency_ms: u64,
    pub status_code: u16,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A payment-provider notification, recorded for idempotency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    /// Provider-assigned id, unique
    pub event_id: String,
    pub event_type: String,
    /// Raw JSON payload as received
    pub payload: String,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

/// Authenticated tenant scope for directory reads and writes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantContext {
    tenant_id: String,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Result<Self> {
        let tenant_id = tenant_id.into();
        validation::validate_identifier(&tenant_id, "tenant id")?;
        Ok(Self { tenant_id })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

impl fmt::Display for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tenant_id)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in gatekeeper directory operations
#[derive(Debug, thiserror::Error)]
pub enum GatekeeperError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("API key not found: {0}")]
    ApiKeyNotFound(String),

    /// A tenant references a tier with no configuration row. Fatal, never defaulted.
    #[error("No plan configuration for tier: {0}")]
    PlanNotConfigured(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict detected: {0}")]
    ConflictError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for GatekeeperError {
    fn from(err: serde_json::Error) -> Self {
        GatekeeperError::SerializationError(err.to_string())
    }
}

/// Result type for gatekeeper operations
pub type Result<T> = std::result::Result<T, GatekeeperError>;

// =============================================================================
// Schema
// =============================================================================

/// Initialize the SQLite schema for the tenant directory
///
/// Creates all tables if they don't exist:
/// - `gatekeeper_meta`: schema version
/// - `plan_configurations`: tier limits, one row per tier
/// - `tenants`: tenant registry; `plan_tier` references a plan row
/// - `api_keys`: hashed credentials, many per tenant
/// - `usage_logs`: append-only request outcomes
/// - `billing_events`: provider notifications keyed by event id
pub fn init_sqlite_schema(conn: &rusqlite::Connection) -> Result<()> {
    let ddl = r#"
    CREATE TABLE IF NOT EXISTS gatekeeper_meta (
      key TEXT PRIMARY KEY,
      value TEXT NOT NULL
    );

    INSERT OR IGNORE INTO gatekeeper_meta (key, value) VALUES ('schema_version', '1');

    CREATE TABLE IF NOT EXISTS plan_configurations (
      tier TEXT PRIMARY KEY
        CHECK (tier IN ('free', 'starter', 'professional', 'enterprise')),
      monthly_quota INTEGER NOT NULL CHECK (monthly_quota >= 0),
      rate_limit_per_minute INTEGER NOT NULL CHECK (rate_limit_per_minute > 0),
      features TEXT NOT NULL DEFAULT '[]',
      price_cents INTEGER NOT NULL DEFAULT 0,
      version INTEGER NOT NULL DEFAULT 1,
      updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tenants (
      id TEXT PRIMARY KEY,
      name TEXT NOT NULL,
      slug TEXT UNIQUE NOT NULL,
      plan_tier TEXT NOT NULL,
      subscription_status TEXT NOT NULL
        CHECK (subscription_status IN ('active', 'trialing', 'past_due', 'canceled')),
      subscription_ref TEXT UNIQUE,
      is_active INTEGER NOT NULL DEFAULT 1,
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL,
      FOREIGN KEY (plan_tier) REFERENCES plan_configurations(tier)
    );

    CREATE TABLE IF NOT EXISTS api_keys (
      id TEXT PRIMARY KEY,
      tenant_id TEXT NOT NULL,
      key_hash TEXT UNIQUE NOT NULL,
      key_prefix TEXT NOT NULL,
      name TEXT NOT NULL,
      scopes TEXT NOT NULL DEFAULT '["search"]',
      rate_limit_override INTEGER CHECK (rate_limit_override IS NULL OR rate_limit_override > 0),
      is_active INTEGER NOT NULL DEFAULT 1,
      expires_at TEXT,
      last_used_at TEXT,
      created_at TEXT NOT NULL,
      FOREIGN KEY (tenant_id) REFERENCES tenants(id)
    );

    CREATE INDEX IF NOT EXISTS idx_api_keys_tenant ON api_keys(tenant_id);

    CREATE TABLE IF NOT EXISTS usage_logs (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      tenant_id TEXT NOT NULL,
      api_key_id TEXT,
      endpoint TEXT NOT NULL,
      query_count INTEGER NOT NULL DEFAULT 1,
      cache_hit INTEGER NOT NULL DEFAULT 0,
      latency_ms INTEGER NOT NULL,
      status_code INTEGER NOT NULL,
      error TEXT,
      created_at TEXT NOT NULL,
      FOREIGN KEY (tenant_id) REFERENCES tenants(id)
    );

    CREATE INDEX IF NOT EXISTS idx_usage_logs_tenant_time ON usage_logs(tenant_id, created_at);

    CREATE TABLE IF NOT EXISTS billing_events (
      event_id TEXT PRIMARY KEY,
      event_type TEXT NOT NULL,
      payload TEXT NOT NULL,
      processed INTEGER NOT NULL DEFAULT 0,
      created_at TEXT NOT NULL,
      processed_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_billing_events_unprocessed ON billing_events(processed)
      WHERE processed = 0;
    "#;

    conn.execute_batch(ddl)?;
    Ok(())
}

/// Get the schema version recorded in `gatekeeper_meta`
pub fn get_schema_version(conn: &rusqlite::Connection) -> Result<i64> {
    let version: String = conn.query_row(
        "SELECT value FROM gatekeeper_meta WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    )?;

    version
        .parse()
        .map_err(|e| GatekeeperError::Other(format!("Invalid schema version: {}", e)))
}
