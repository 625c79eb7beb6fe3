//! Billing notification consumer
//!
//! Applies payment-provider notifications to tenant plan tier and
//! subscription status, exactly once per provider event id.
//!
//! # Ordering
//!
//! For an event id never seen before: record the event, apply the tenant
//! change, mark the event processed. A crash between any two steps leaves a
//! recorded but unprocessed event, which the provider's retry completes. An
//! event already marked processed is acknowledged without doing anything, and
//! so is a delivery that loses the record step to a concurrent delivery of the
//! same id.
//!
//! # Authentication
//!
//! `X-Webhook-Signature: sha256=<hex>` carries HMAC-SHA256 of the raw body
//! under the shared secret, compared in constant time. With no secret
//! configured the check is skipped.
//!
//! # Event mapping
//!
//! | event type | tenant change |
//! |---|---|
//! | `customer.subscription.created` | subscription ref, status and tier from payload |
//! | `customer.subscription.updated` | status and tier from payload |
//! | `customer.subscription.deleted` | `canceled`, tier `free` |
//! | `invoice.payment_failed` | `past_due` |
//! | `invoice.paid` | `active` |
//! | anything else | none (recorded only) |

use crate::key_resolver::ConfigEpoch;
use gatekeeper_core::validation::validate_identifier;
use gatekeeper_core::{
    BillingEvent, Clock, GatekeeperError, PlanTier, SubscriptionStatus, Tenant,
};
use gatekeeper_storage::{BillingEventState, PrivilegedDirectory, SubscriptionChange};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
const SIGNATURE_SCHEME: &str = "sha256=";

/// Webhook body as delivered by the provider
#[derive(Debug, Clone, Deserialize)]
pub struct BillingNotification {
    pub event_id: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("missing webhook signature")]
    MissingSignature,

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("malformed notification: {0}")]
    Malformed(String),

    #[error("no tenant for reference: {0}")]
    UnknownTenant(String),

    #[error(transparent)]
    Directory(#[from] GatekeeperError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The tenant row was updated
    Applied,
    /// Event type carries no tenant change; recorded and marked processed
    Recorded,
    /// Event id was already processed
    Duplicate,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Applied => "applied",
            SyncOutcome::Recorded => "recorded",
            SyncOutcome::Duplicate => "duplicate",
        }
    }
}

/// `sha256=<hex>` signature of `body` under `secret`
pub fn sign_payload(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!(
        "{}{}",
        SIGNATURE_SCHEME,
        hex::encode(mac.finalize().into_bytes())
    )
}

pub struct ConfigSync {
    directory: Arc<dyn PrivilegedDirectory>,
    clock: Arc<dyn Clock>,
    epoch: ConfigEpoch,
    secret: Option<Vec<u8>>,
}

impl ConfigSync {
    pub fn new(
        directory: Arc<dyn PrivilegedDirectory>,
        clock: Arc<dyn Clock>,
        epoch: ConfigEpoch,
        secret: Option<String>,
    ) -> Self {
        Self {
            directory,
            clock,
            epoch,
            secret: secret.map(String::into_bytes),
        }
    }

    pub fn verify_signature(&self, body: &[u8], header: Option<&str>) -> Result<(), SyncError> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };

        let provided = header.ok_or(SyncError::MissingSignature)?;
        let expected = sign_payload(secret, body);
        if expected.is_empty() {
            return Err(SyncError::InvalidSignature);
        }

        if bool::from(provided.trim().as_bytes().ct_eq(expected.as_bytes())) {
            Ok(())
        } else {
            Err(SyncError::InvalidSignature)
        }
    }

    /// Verify, parse and process a raw webhook delivery.
    pub async fn handle(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<SyncOutcome, SyncError> {
        self.verify_signature(body, signature)?;
        let notification: BillingNotification = serde_json::from_slice(body)
            .map_err(|e| SyncError::Malformed(e.to_string()))?;
        self.process(notification, body).await
    }

    /// Apply one notification. `raw` is stored verbatim on the event row.
    pub async fn process(
        &self,
        notification: BillingNotification,
        raw: &[u8],
    ) -> Result<SyncOutcome, SyncError> {
        validate_identifier(&notification.event_id, "event id")
            .map_err(|e| SyncError::Malformed(e.to_string()))?;

        let event_id = notification.event_id.as_str();
        match self.directory.billing_event_state(event_id).await? {
            BillingEventState::Processed => {
                debug!(event_id = %event_id, "Billing event already processed");
                return Ok(SyncOutcome::Duplicate);
            }
            BillingEventState::Pending => {
                info!(event_id = %event_id, "Resuming unprocessed billing event");
            }
            BillingEventState::Unknown => {
                let now = self.clock.now();
                let inserted = self
                    .directory
                    .record_billing_event(BillingEvent {
                        event_id: event_id.to_string(),
                        event_type: notification.event_type.clone(),
                        payload: String::from_utf8_lossy(raw).into_owned(),
                        processed: false,
                        created_at: now,
                    })
                    .await?;
                if !inserted {
                    // Another delivery of this id owns the apply step.
                    debug!(event_id = %event_id, "Billing event recorded concurrently");
                    return Ok(SyncOutcome::Duplicate);
                }
            }
        }

        let outcome = match subscription_change(&notification)? {
            Some(change) => {
                let tenant = self.find_tenant(&notification.payload).await?;
                let updated = self
                    .directory
                    .apply_subscription_change(&tenant.id, change, self.clock.now())
                    .await?;
                self.epoch.bump();
                info!(
                    event_id = %event_id,
                    event_type = %notification.event_type,
                    tenant_id = %updated.id,
                    plan_tier = updated.plan_tier.as_str(),
                    subscription_status = updated.subscription_status.as_str(),
                    "Applied billing event"
                );
                SyncOutcome::Applied
            }
            None => {
                debug!(
                    event_type = %notification.event_type,
                    "Billing event type has no tenant effect"
                );
                SyncOutcome::Recorded
            }
        };

        self.directory
            .mark_billing_event_processed(event_id, self.clock.now())
            .await?;
        Ok(outcome)
    }

    async fn find_tenant(&self, payload: &Value) -> Result<Tenant, SyncError> {
        if let Some(tenant_id) = payload
            .pointer("/metadata/tenant_id")
            .and_then(Value::as_str)
        {
            return self
                .directory
                .find_tenant(tenant_id)
                .await?
                .ok_or_else(|| SyncError::UnknownTenant(tenant_id.to_string()));
        }

        if let Some(subscription_id) = payload.get("subscription_id").and_then(Value::as_str) {
            return self
                .directory
                .find_tenant_by_subscription(subscription_id)
                .await?
                .ok_or_else(|| SyncError::UnknownTenant(subscription_id.to_string()));
        }

        warn!("Billing event carries no tenant reference");
        Err(SyncError::Malformed(
            "payload has neither metadata.tenant_id nor subscription_id".to_string(),
        ))
    }
}

fn payload_str<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload.get(field).and_then(Value::as_str)
}

fn parse_status(payload: &Value) -> Result<Option<SubscriptionStatus>, SyncError> {
    payload_str(payload, "status")
        .map(|s| s.parse().map_err(|e: GatekeeperError| SyncError::Malformed(e.to_string())))
        .transpose()
}

fn parse_tier(payload: &Value) -> Result<Option<PlanTier>, SyncError> {
    payload_str(payload, "plan_tier")
        .map(|s| s.parse().map_err(|e: GatekeeperError| SyncError::Malformed(e.to_string())))
        .transpose()
}

/// Tenant change implied by an event, or `None` for event types with no effect
fn subscription_change(
    notification: &BillingNotification,
) -> Result<Option<SubscriptionChange>, SyncError> {
    let payload = &notification.payload;
    let change = match notification.event_type.as_str() {
        "customer.subscription.created" => SubscriptionChange {
            plan_tier: parse_tier(payload)?,
            subscription_status: parse_status(payload)?,
            subscription_ref: payload_str(payload, "subscription_id").map(str::to_string),
        },
        "customer.subscription.updated" => SubscriptionChange {
            plan_tier: parse_tier(payload)?,
            subscription_status: parse_status(payload)?,
            subscription_ref: None,
        },
        "customer.subscription.deleted" => SubscriptionChange {
            plan_tier: Some(PlanTier::Free),
            subscription_status: Some(SubscriptionStatus::Canceled),
            subscription_ref: None,
        },
        "invoice.payment_failed" => SubscriptionChange {
            subscription_status: Some(SubscriptionStatus::PastDue),
            ..Default::default()
        },
        "invoice.paid" => SubscriptionChange {
            subscription_status: Some(SubscriptionStatus::Active),
            ..Default::default()
        },
        _ => return Ok(None),
    };

    Ok((!change.is_empty()).then_some(change))
}
