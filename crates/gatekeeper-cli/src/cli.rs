//! CLI argument definitions and command dispatch.
//!
//! Commands write straight to the SQLite directory. A running server picks up
//! plan and key changes made here once its key cache entries expire.

use chrono::{Duration, Utc};
use clap::{Args, Parser, Subcommand};
use gatekeeper_api::key_resolver::ConfigEpoch;
use gatekeeper_api::provisioning::{KeyRequest, ProvisioningError, ProvisioningService};
use gatekeeper_core::credentials::KeyEnvironment;
use gatekeeper_core::{GatekeeperError, PlanTier, SystemClock, TenantContext};
use gatekeeper_storage::{PrivilegedDirectory, SqliteDirectory, TenantDirectory};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Directory(#[from] GatekeeperError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
}

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(about = "Manage tenants, API keys and plans in the gatekeeper directory")]
#[command(version)]
pub struct Cli {
    /// SQLite tenant directory
    #[arg(
        long,
        global = true,
        env = "GATEKEEPER_DB_PATH",
        default_value = "gatekeeper.db"
    )]
    pub db: PathBuf,

    /// Prefix for issued keys (live or test)
    #[arg(
        long,
        global = true,
        env = "GATEKEEPER_KEY_ENVIRONMENT",
        default_value = "live"
    )]
    pub key_env: KeyEnvironment,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a new directory file with the default plans
    Init,

    /// Create a tenant and issue its first key
    Signup(SignupCmd),

    /// Issue an additional key for a tenant
    CreateKey(CreateKeyCmd),

    /// List a tenant's keys
    ListKeys(TenantArg),

    /// Revoke a key
    RevokeKey(KeyArg),

    /// Revoke a key and issue its replacement
    RotateKey(KeyArg),

    /// Deactivate a tenant; its keys stop resolving
    Deactivate(TenantArg),

    /// Reactivate a tenant
    Activate(TenantArg),

    /// Show the configured plans
    Plans,

    /// Change a plan's limits
    SetPlan(SetPlanCmd),

    /// Summarize a tenant's recent usage log
    Usage(UsageCmd),
}

#[derive(Args)]
pub struct TenantArg {
    #[arg(long)]
    pub tenant: String,
}

#[derive(Args)]
pub struct KeyArg {
    #[arg(long)]
    pub tenant: String,
    #[arg(long)]
    pub key_id: String,
}

#[derive(Args)]
pub struct SignupCmd {
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub slug: String,
    #[arg(long, default_value = "free")]
    pub plan: PlanTier,
}

#[derive(Args)]
pub struct CreateKeyCmd {
    #[arg(long)]
    pub tenant: String,
    #[arg(long)]
    pub name: String,
    /// Repeat for several scopes; defaults to `search`
    #[arg(long = "scope")]
    pub scopes: Vec<String>,
    /// Requests per minute, replacing the plan limit for this key
    #[arg(long)]
    pub rate_limit: Option<u32>,
    /// Days until the key expires
    #[arg(long)]
    pub expires_in_days: Option<i64>,
}

#[derive(Args)]
pub struct SetPlanCmd {
    #[arg(long)]
    pub tier: PlanTier,
    /// Queries per calendar month
    #[arg(long = "quota")]
    pub monthly_quota: Option<u64>,
    #[arg(long)]
    pub rate_limit: Option<u32>,
    #[arg(long)]
    pub price_cents: Option<i64>,
}

#[derive(Args)]
pub struct UsageCmd {
    #[arg(long)]
    pub tenant: String,
    #[arg(long, default_value_t = 30)]
    pub days: i64,
}

impl Cli {
    pub async fn execute(&self) -> Result<Value> {
        match &self.command {
            Command::Init => self.init().await,
            command => self.run(command).await,
        }
    }

    async fn init(&self) -> Result<Value> {
        let directory = SqliteDirectory::initialize(&self.db)?;
        let plans = directory.list_plans().await?;
        Ok(json!({ "initialized": self.db, "plans": plans }))
    }

    async fn run(&self, command: &Command) -> Result<Value> {
        let directory = Arc::new(SqliteDirectory::open(&self.db)?);
        let service = ProvisioningService::new(
            directory.clone(),
            self.key_env,
            Arc::new(SystemClock),
            ConfigEpoch::new(),
        );

        match command {
            Command::Init => self.init().await,
            Command::Signup(cmd) => {
                let result = service.signup(&cmd.name, &cmd.slug, cmd.plan).await?;
                Ok(json!(result))
            }
            Command::CreateKey(cmd) => {
                let ctx = TenantContext::new(cmd.tenant.clone())?;
                let request = KeyRequest {
                    name: cmd.name.clone(),
                    scopes: (!cmd.scopes.is_empty()).then(|| cmd.scopes.clone()),
                    rate_limit_override: cmd.rate_limit,
                    expires_at: cmd
                        .expires_in_days
                        .map(|days| Utc::now() + Duration::days(days)),
                };
                Ok(json!(service.issue_key(&ctx, request).await?))
            }
            Command::ListKeys(arg) => {
                let ctx = TenantContext::new(arg.tenant.clone())?;
                Ok(json!({ "keys": service.list_keys(&ctx).await? }))
            }
            Command::RevokeKey(arg) => {
                let ctx = TenantContext::new(arg.tenant.clone())?;
                Ok(json!(service.revoke_key(&ctx, &arg.key_id).await?))
            }
            Command::RotateKey(arg) => {
                let ctx = TenantContext::new(arg.tenant.clone())?;
                Ok(json!(service.rotate_key(&ctx, &arg.key_id).await?))
            }
            Command::Deactivate(arg) => {
                Ok(json!(service.set_tenant_active(&arg.tenant, false).await?))
            }
            Command::Activate(arg) => Ok(json!(service.set_tenant_active(&arg.tenant, true).await?)),
            Command::Plans => Ok(json!({ "plans": directory.list_plans().await? })),
            Command::SetPlan(cmd) => {
                let mut plan = directory.get_plan(cmd.tier).await?;
                if let Some(quota) = cmd.monthly_quota {
                    plan.monthly_quota = quota;
                }
                if let Some(limit) = cmd.rate_limit {
                    plan.rate_limit_per_minute = limit;
                }
                if let Some(price) = cmd.price_cents {
                    plan.price_cents = price;
                }
                plan.updated_at = Utc::now();
                Ok(json!(directory.upsert_plan(plan).await?))
            }
            Command::Usage(cmd) => {
                let ctx = TenantContext::new(cmd.tenant.clone())?;
                let since = Utc::now() - Duration::days(cmd.days);
                let summary = directory.usage_since(&ctx, since).await?;
                Ok(json!({ "tenant_id": ctx.to_string(), "since": since, "usage": summary }))
            }
        }
    }
}
