//! HTTP surface
//!
//! | route | auth |
//! |---|---|
//! | `POST /v1/search` | API key |
//! | `GET /v1/usage` | API key |
//! | `GET, POST /v1/api-keys` | API key |
//! | `DELETE /v1/api-keys/{id}` | API key |
//! | `POST /v1/api-keys/{id}/rotate` | API key |
//! | `POST /v1/admin/signup` | admin token |
//! | `POST /webhooks/billing` | webhook signature |
//! | `GET /health` | none |
//! | `GET /metrics` | none |

use crate::config::ServerConfig;
use crate::config_sync::{ConfigSync, SyncError, SIGNATURE_HEADER};
use crate::degraded::DegradedSignal;
use crate::error::GateError;
use crate::gatekeeper::Gatekeeper;
use crate::health::check_health;
use crate::key_resolver::{ConfigEpoch, KeyResolver, ResolvedKey};
use crate::provisioning::{KeyRequest, ProvisioningService};
use crate::quota::{month_start, QuotaTracker};
use crate::rate_limiting::RateLimiter;
use crate::result_cache::ResultCache;
use crate::search::SearchBackend;
use crate::usage_recorder::{BackgroundJob, UsageRecorder, WorkQueue};
use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{
        header::{HeaderName, HeaderValue, AUTHORIZATION},
        HeaderMap, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use gatekeeper_core::{Clock, PlanTier};
use gatekeeper_storage::{CounterStore, PrivilegedDirectory, StoreTimeouts, TenantDirectory};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::Instrument;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub gatekeeper: Arc<Gatekeeper>,
    pub provisioning: Arc<ProvisioningService>,
    pub config_sync: Arc<ConfigSync>,
    pub store: Arc<dyn CounterStore>,
    pub directory: Arc<dyn PrivilegedDirectory>,
    pub degraded: Arc<DegradedSignal>,
    pub timeouts: StoreTimeouts,
    pub clock: Arc<dyn Clock>,
    admin_token: Option<String>,
}

impl AppState {
    /// Wire every component over one directory, counter store and backend.
    ///
    /// Returns the state and the receiving end of the background work queue,
    /// which the caller hands to [`crate::usage_recorder::background_worker`].
    pub fn build<D>(
        directory: Arc<D>,
        store: Arc<dyn CounterStore>,
        backend: Arc<dyn SearchBackend>,
        clock: Arc<dyn Clock>,
        config: &ServerConfig,
    ) -> (Self, mpsc::Receiver<BackgroundJob>)
    where
        D: PrivilegedDirectory + 'static,
    {
        let privileged: Arc<dyn PrivilegedDirectory> = directory;
        let degraded = Arc::new(DegradedSignal::new());
        let epoch = ConfigEpoch::new();
        let (work, jobs) = WorkQueue::new(config.work_queue_capacity);
        let counter_timeout = config.timeouts.counter;

        let resolver = Arc::new(KeyResolver::new(
            privileged.clone(),
            config.key_environment,
            clock.clone(),
            config.timeouts.directory,
            config.key_cache.clone(),
            epoch.clone(),
            work.clone(),
        ));

        let gatekeeper = Gatekeeper::new(
            resolver,
            RateLimiter::new(store.clone(), clock.clone(), counter_timeout, degraded.clone()),
            QuotaTracker::new(store.clone(), clock.clone(), counter_timeout, degraded.clone()),
            ResultCache::new(
                store.clone(),
                config.cache_ttl,
                counter_timeout,
                degraded.clone(),
            ),
            backend,
            UsageRecorder::new(work),
            clock.clone(),
        );

        let provisioning = ProvisioningService::new(
            privileged.clone(),
            config.key_environment,
            clock.clone(),
            epoch.clone(),
        );
        let config_sync = ConfigSync::new(
            privileged.clone(),
            clock.clone(),
            epoch,
            config.webhook_secret.clone(),
        );

        let state = Self {
            gatekeeper: Arc::new(gatekeeper),
            provisioning: Arc::new(provisioning),
            config_sync: Arc::new(config_sync),
            store,
            directory: privileged,
            degraded,
            timeouts: config.timeouts,
            clock,
            admin_token: config.admin_token.clone(),
        };
        (state, jobs)
    }
}

pub fn router(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/v1/search", post(search_handler))
        .route("/v1/usage", get(usage_handler))
        .route("/v1/api-keys", get(list_keys_handler).post(create_key_handler))
        .route("/v1/api-keys/{id}", delete(revoke_key_handler))
        .route("/v1/api-keys/{id}/rotate", post(rotate_key_handler))
        .route("/v1/admin/signup", post(signup_handler))
        .route("/webhooks/billing", post(billing_webhook_handler));

    #[cfg(feature = "metrics")]
    let router = router
        .route("/metrics", get(crate::metrics::metrics_handler))
        .layer(middleware::from_fn(crate::metrics::track_metrics));

    router
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Echo the client's `x-request-id`, or assign a fresh UUID.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Credential from `Authorization`, given as `Bearer <key>` or as the bare key.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<ResolvedKey, GateError> {
    state.gatekeeper.resolver().resolve(bearer_token(headers)).await
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, GateError> {
    serde_json::from_slice(body)
        .map_err(|e| GateError::invalid_request(format!("Invalid request body: {}", e)))
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let report = check_health(
        state.store.as_ref(),
        state.directory.as_ref(),
        &state.timeouts,
        &state.degraded,
    )
    .await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn search_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match state.gatekeeper.search(bearer_token(&headers), &body).await {
        Ok(gated) => {
            let mut response = Json(gated.body).into_response();
            if let Some(metadata) = gated.rate_limit {
                metadata.apply_headers(response.headers_mut());
            }
            response
        }
        Err(e) => e.into_response(),
    }
}

async fn usage_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GateError> {
    let resolved = authenticate(&state, &headers).await?;
    let quota = state
        .gatekeeper
        .quota()
        .status(resolved.tenant_id(), resolved.plan.monthly_quota)
        .await;
    let since = month_start(state.clock.now());
    let summary = tokio::time::timeout(
        state.timeouts.directory,
        state.directory.usage_since(resolved.context(), since),
    )
    .await
    .map_err(|_| GateError::internal("usage summary timed out"))??;

    Ok(Json(json!({
        "period": "current_month",
        "plan_tier": resolved.plan.tier,
        "rate_limit_per_minute": resolved.effective_rate_limit(),
        "total_queries": quota.used,
        "quota_limit": quota.limit,
        "quota_remaining": quota.remaining,
        "quota_reset": quota.reset_date,
        "percentage_used": quota.percentage_used,
        "requests": summary,
    }))
    .into_response())
}

async fn list_keys_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GateError> {
    let resolved = authenticate(&state, &headers).await?;
    let keys = state.provisioning.list_keys(resolved.context()).await?;
    Ok(Json(json!({ "keys": keys })).into_response())
}

async fn create_key_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GateError> {
    let resolved = authenticate(&state, &headers).await?;
    let request: KeyRequest = parse_body(&body)?;
    let issued = state
        .provisioning
        .issue_key(resolved.context(), request)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "key": issued,
            "warning": "Save this key! It will not be shown again.",
        })),
    )
        .into_response())
}

async fn revoke_key_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> Result<Response, GateError> {
    let resolved = authenticate(&state, &headers).await?;
    let revoked = state
        .provisioning
        .revoke_key(resolved.context(), &key_id)
        .await?;
    Ok(Json(json!({ "status": "revoked", "key_id": revoked.id })).into_response())
}

async fn rotate_key_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> Result<Response, GateError> {
    let resolved = authenticate(&state, &headers).await?;
    let issued = state
        .provisioning
        .rotate_key(resolved.context(), &key_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "key": issued,
            "revoked_key_id": key_id,
            "warning": "Save this key! It will not be shown again.",
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct SignupRequest {
    name: String,
    slug: String,
    #[serde(default)]
    plan_tier: Option<PlanTier>,
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), GateError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(GateError::unauthorized("Admin API is disabled"));
    };
    let provided = bearer_token(headers).unwrap_or_default();
    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(GateError::unauthorized("Invalid admin token"))
    }
}

async fn signup_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GateError> {
    require_admin(&state, &headers)?;
    let request: SignupRequest = parse_body(&body)?;
    let result = state
        .provisioning
        .signup(
            &request.name,
            &request.slug,
            request.plan_tier.unwrap_or(PlanTier::Free),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(result)).into_response())
}

impl From<SyncError> for GateError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::MissingSignature | SyncError::InvalidSignature => {
                GateError::unauthorized(err.to_string())
            }
            SyncError::Malformed(_) | SyncError::UnknownTenant(_) => {
                GateError::invalid_request(err.to_string())
            }
            SyncError::Directory(e) => GateError::internal(e),
        }
    }
}

async fn billing_webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    match state.config_sync.handle(&body, signature).await {
        Ok(outcome) => {
            #[cfg(feature = "metrics")]
            crate::metrics::record_billing_event(outcome.as_str());
            Json(json!({ "received": true, "outcome": outcome.as_str() })).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Billing webhook rejected");
            #[cfg(feature = "metrics")]
            crate::metrics::record_billing_event(match e {
                SyncError::Directory(_) => "failed",
                _ => "rejected",
            });
            GateError::from(e).into_response()
        }
    }
}
