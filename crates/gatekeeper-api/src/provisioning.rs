//! Tenant and API key provisioning
//!
//! Signup is an explicit service call: create the tenant, then issue its
//! first key. Nothing happens implicitly on a directory insert.

use crate::error::{ErrorCode, GateError};
use crate::key_resolver::ConfigEpoch;
use chrono::{DateTime, Utc};
use gatekeeper_core::credentials::{generate_api_key, KeyEnvironment};
use gatekeeper_core::validation::{
    validate_identifier, validate_name, validate_rate_limit_override, validate_slug,
};
use gatekeeper_core::{ApiKeyRecord, Clock, GatekeeperError, PlanTier, Tenant, TenantContext};
use gatekeeper_storage::{NewApiKey, NewTenant, PrivilegedDirectory};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Name of the key issued at signup
pub const DEFAULT_KEY_NAME: &str = "Default";

/// Scope set given to keys that do not ask for one
pub const DEFAULT_SCOPES: &[&str] = &["search"];

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("Tenant is inactive: {0}")]
    TenantInactive(String),

    #[error(transparent)]
    Directory(#[from] GatekeeperError),
}

impl From<ProvisioningError> for GateError {
    fn from(err: ProvisioningError) -> Self {
        match err {
            ProvisioningError::TenantInactive(id) => GateError::new(
                ErrorCode::TenantInactive,
                format!("Tenant {} is deactivated; keys cannot be issued", id),
            ),
            ProvisioningError::Directory(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisioningError>;

/// Parameters for a new key
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyRequest {
    pub name: String,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub rate_limit_override: Option<u32>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl KeyRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A freshly issued key. `raw_key` is shown to the caller once and never stored.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedKey {
    pub raw_key: String,
    #[serde(flatten)]
    pub record: ApiKeyRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignupResult {
    pub tenant: Tenant,
    pub api_key: IssuedKey,
}

pub struct ProvisioningService {
    directory: Arc<dyn PrivilegedDirectory>,
    environment: KeyEnvironment,
    clock: Arc<dyn Clock>,
    epoch: ConfigEpoch,
}

impl ProvisioningService {
    pub fn new(
        directory: Arc<dyn PrivilegedDirectory>,
        environment: KeyEnvironment,
        clock: Arc<dyn Clock>,
        epoch: ConfigEpoch,
    ) -> Self {
        Self {
            directory,
            environment,
            clock,
            epoch,
        }
    }

    /// Create a tenant on `tier` and issue its first API key.
    ///
    /// Free tenants start `active`, paid tiers start `trialing`.
    pub async fn signup(&self, name: &str, slug: &str, tier: PlanTier) -> Result<SignupResult> {
        validate_name(name, "tenant name")?;
        validate_slug(slug)?;
        // Refuse to create a tenant whose tier has no plan row
        self.directory.get_plan(tier).await?;

        let tenant = self
            .directory
            .create_tenant(
                NewTenant {
                    name: name.trim().to_string(),
                    slug: slug.to_string(),
                    plan_tier: tier,
                    subscription_status: tier.initial_status(),
                },
                self.clock.now(),
            )
            .await?;

        let ctx = TenantContext::new(tenant.id.clone())?;
        let api_key = self
            .issue_key(&ctx, KeyRequest::named(DEFAULT_KEY_NAME))
            .await?;

        info!(
            tenant_id = %tenant.id,
            slug = %tenant.slug,
            plan_tier = tier.as_str(),
            "Provisioned tenant"
        );

        Ok(SignupResult { tenant, api_key })
    }

    pub async fn issue_key(&self, ctx: &TenantContext, request: KeyRequest) -> Result<IssuedKey> {
        validate_name(&request.name, "key name")?;
        validate_rate_limit_override(request.rate_limit_override)?;
        let scopes = match request.scopes {
            Some(scopes) if !scopes.is_empty() => scopes,
            Some(_) => {
                return Err(GatekeeperError::ValidationError(
                    "scopes cannot be empty".to_string(),
                )
                .into())
            }
            None => DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        };
        for scope in &scopes {
            validate_identifier(scope, "scope")?;
        }

        self.create_key(
            ctx,
            request.name,
            scopes,
            request.rate_limit_override,
            request.expires_at,
        )
        .await
    }

    pub async fn list_keys(&self, ctx: &TenantContext) -> Result<Vec<ApiKeyRecord>> {
        Ok(self.directory.list_api_keys(ctx).await?)
    }

    pub async fn revoke_key(&self, ctx: &TenantContext, key_id: &str) -> Result<ApiKeyRecord> {
        let record = self.directory.revoke_api_key(ctx, key_id).await?;
        self.epoch.bump();
        info!(tenant_id = %ctx, key_id = %key_id, "Revoked API key");
        Ok(record)
    }

    /// Issue a replacement for `key_id` with the same scopes and override, then
    /// revoke the original. The old key stays usable if issuing fails.
    pub async fn rotate_key(&self, ctx: &TenantContext, key_id: &str) -> Result<IssuedKey> {
        self.ensure_active(ctx).await?;
        let old = self.directory.get_api_key(ctx, key_id).await?;

        let name = format!("{} (rotated)", old.name);
        let issued = self
            .create_key(ctx, name, old.scopes, old.rate_limit_override, old.expires_at)
            .await?;
        self.revoke_key(ctx, key_id).await?;
        info!(
            tenant_id = %ctx,
            old_key_id = %key_id,
            new_key_id = %issued.record.id,
            "Rotated API key"
        );
        Ok(issued)
    }

    pub async fn set_tenant_active(&self, tenant_id: &str, active: bool) -> Result<Tenant> {
        let tenant = self
            .directory
            .set_tenant_active(tenant_id, active, self.clock.now())
            .await?;
        self.epoch.bump();
        info!(tenant_id = %tenant_id, active, "Changed tenant activation");
        Ok(tenant)
    }

    async fn ensure_active(&self, ctx: &TenantContext) -> Result<()> {
        let tenant = self.directory.get_tenant(ctx).await?;
        if tenant.is_active {
            Ok(())
        } else {
            Err(ProvisioningError::TenantInactive(tenant.id))
        }
    }

    async fn create_key(
        &self,
        ctx: &TenantContext,
        name: String,
        scopes: Vec<String>,
        rate_limit_override: Option<u32>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IssuedKey> {
        self.ensure_active(ctx).await?;

        let generated = generate_api_key(self.environment);
        let record = self
            .directory
            .create_api_key(
                ctx,
                NewApiKey {
                    name,
                    key_hash: generated.hash,
                    key_prefix: generated.prefix,
                    scopes,
                    rate_limit_override,
                    expires_at,
                },
                self.clock.now(),
            )
            .await?;

        Ok(IssuedKey {
            raw_key: generated.raw,
            record,
        })
    }
}
