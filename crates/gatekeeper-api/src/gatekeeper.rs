//! Request admission orchestrator
//!
//! Every search request walks the same sequence:
//!
//! ```text
//! RESOLVING -> RATE_CHECKING -> QUOTA_CHECKING -> CACHE_LOOKUP
//!     CACHE_HIT  -> RESPONDING
//!     CACHE_MISS -> COMPUTING -> CACHE_STORE -> RESPONDING
//! -> LOGGING (detached) -> DONE
//! ```
//!
//! A failed check short-circuits to RESPONDING with its typed error. LOGGING
//! happens exactly once per request whichever state it ended in, including
//! when the client disconnects and the request future is dropped mid-flight:
//! the usage record is emitted by a drop guard.

use crate::error::{ErrorCode, GateError};
use crate::key_resolver::{KeyResolver, ResolvedKey};
use crate::quota::{QuotaDecision, QuotaTracker};
use crate::rate_limiting::{RateDecision, RateLimitMetadata, RateLimiter};
use crate::result_cache::{CacheLookup, ResultCache};
use crate::search::SearchBackend;
use crate::usage_recorder::{RequestOutcome, UsageRecorder};
use gatekeeper_core::plans::{FEATURE_BATCH_SEARCH, FEATURE_SINGLE_SEARCH};
use gatekeeper_core::validation::{validate_batch, validate_query, validate_top_k, DEFAULT_TOP_K};
use gatekeeper_core::Clock;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::sync::Arc;
use std::time::Instant;

/// Endpoint name recorded in usage logs
pub const SEARCH_ENDPOINT: &str = "search";

/// Status recorded when the client went away before a response was produced
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Scope a key needs for search
pub const SEARCH_SCOPE: &str = "search";

fn default_top_k() -> u32 {
    DEFAULT_TOP_K
}

/// A search request body.
///
/// `action` selects `single` or `batch`. When it is missing or empty the body
/// is a batch if it carries `queries` and a single search otherwise.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RequestBody")]
pub enum SearchRequest {
    Single {
        query: String,
        #[serde(default = "default_top_k")]
        top_k: u32,
    },
    Batch {
        queries: Vec<String>,
        #[serde(default = "default_top_k")]
        top_k: u32,
    },
}

#[derive(Deserialize)]
struct RequestBody {
    #[serde(default)]
    action: Option<String>,
    query: Option<String>,
    queries: Option<Vec<String>>,
    #[serde(default = "default_top_k")]
    top_k: u32,
}

impl TryFrom<RequestBody> for SearchRequest {
    type Error = String;

    fn try_from(body: RequestBody) -> Result<Self, Self::Error> {
        let action = match body.action.as_deref() {
            None | Some("") if body.queries.is_some() => "batch",
            None | Some("") => "single",
            Some(action) => action,
        };

        match action {
            "single" => Ok(SearchRequest::Single {
                query: body.query.ok_or("missing field `query`")?,
                top_k: body.top_k,
            }),
            "batch" => Ok(SearchRequest::Batch {
                queries: body.queries.ok_or("missing field `queries`")?,
                top_k: body.top_k,
            }),
            other => Err(format!("unknown action `{}`", other)),
        }
    }
}

impl SearchRequest {
    /// Units charged against the monthly quota
    pub fn query_count(&self) -> u32 {
        match self {
            SearchRequest::Single { .. } => 1,
            SearchRequest::Batch { queries, .. } => queries.len() as u32,
        }
    }

    fn validate(&self) -> Result<(), GateError> {
        match self {
            SearchRequest::Single { query, top_k } => {
                validate_query(query)?;
                validate_top_k(*top_k)?;
            }
            SearchRequest::Batch { queries, top_k } => {
                validate_batch(queries)?;
                validate_top_k(*top_k)?;
            }
        }
        Ok(())
    }

    fn required_feature(&self) -> &'static str {
        match self {
            SearchRequest::Single { .. } => FEATURE_SINGLE_SEARCH,
            SearchRequest::Batch { .. } => FEATURE_BATCH_SEARCH,
        }
    }
}

/// Results for one query within a batch
#[derive(Debug, Serialize)]
pub struct BatchItem {
    pub query: String,
    pub results: Box<RawValue>,
    pub cached: bool,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SearchResponse {
    Single {
        query: String,
        top_k: u32,
        /// Serialized hits, byte-for-byte as computed or cached
        results: Box<RawValue>,
        cached: bool,
        latency_ms: u64,
    },
    Batch {
        count: usize,
        top_k: u32,
        results: Vec<BatchItem>,
        cache_hits: usize,
        latency_ms: u64,
    },
}

/// An admitted and answered request
#[derive(Debug)]
pub struct GatedResponse {
    pub body: SearchResponse,
    /// Absent when the rate limiter ran degraded
    pub rate_limit: Option<RateLimitMetadata>,
}

/// Emits the usage record when dropped, so it fires exactly once.
struct UsageGuard<'a> {
    recorder: &'a UsageRecorder,
    started: Instant,
    outcome: RequestOutcome,
}

impl<'a> UsageGuard<'a> {
    fn new(recorder: &'a UsageRecorder, clock: &dyn Clock, endpoint: &str) -> Self {
        Self {
            recorder,
            started: Instant::now(),
            outcome: RequestOutcome {
                tenant_id: None,
                api_key_id: None,
                endpoint: endpoint.to_string(),
                query_count: 0,
                cache_hit: false,
                latency_ms: 0,
                status_code: CLIENT_CLOSED_REQUEST,
                error: Some("client closed request".to_string()),
                created_at: clock.now(),
            },
        }
    }

    fn attribute(&mut self, resolved: &ResolvedKey) {
        self.outcome.tenant_id = Some(resolved.tenant.id.clone());
        self.outcome.api_key_id = Some(resolved.api_key.id.clone());
    }

    fn finish(&mut self, result: &Result<GatedResponse, GateError>) {
        match result {
            Ok(_) => {
                self.outcome.status_code = 200;
                self.outcome.error = None;
            }
            Err(e) => {
                self.outcome.status_code = e.status().as_u16();
                self.outcome.error = Some(e.code.as_str().to_string());
            }
        }
    }
}

impl Drop for UsageGuard<'_> {
    fn drop(&mut self) {
        self.outcome.latency_ms = self.started.elapsed().as_millis() as u64;
        self.recorder.record(self.outcome.clone());
    }
}

pub struct Gatekeeper {
    resolver: Arc<KeyResolver>,
    rate_limiter: RateLimiter,
    quota: QuotaTracker,
    cache: ResultCache,
    backend: Arc<dyn SearchBackend>,
    recorder: UsageRecorder,
    clock: Arc<dyn Clock>,
}

impl Gatekeeper {
    pub fn new(
        resolver: Arc<KeyResolver>,
        rate_limiter: RateLimiter,
        quota: QuotaTracker,
        cache: ResultCache,
        backend: Arc<dyn SearchBackend>,
        recorder: UsageRecorder,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            resolver,
            rate_limiter,
            quota,
            cache,
            backend,
            recorder,
            clock,
        }
    }

    pub fn resolver(&self) -> &Arc<KeyResolver> {
        &self.resolver
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    /// Admit and answer one search request. `body` is the raw JSON request.
    pub async fn search(
        &self,
        credential: Option<&str>,
        body: &[u8],
    ) -> Result<GatedResponse, GateError> {
        let mut usage = UsageGuard::new(&self.recorder, self.clock.as_ref(), SEARCH_ENDPOINT);
        let result = self.admit_and_answer(credential, body, &mut usage).await;
        usage.finish(&result);

        #[cfg(feature = "metrics")]
        crate::metrics::record_gated_request(
            SEARCH_ENDPOINT,
            result.as_ref().map_or_else(|e| e.code.as_str(), |_| "OK"),
        );

        result
    }

    async fn admit_and_answer(
        &self,
        credential: Option<&str>,
        body: &[u8],
        usage: &mut UsageGuard<'_>,
    ) -> Result<GatedResponse, GateError> {
        let started = Instant::now();

        // RESOLVING
        let resolved = self.resolver.resolve(credential).await?;
        usage.attribute(&resolved);
        if !resolved.api_key.has_scope(SEARCH_SCOPE) {
            return Err(GateError::unauthorized(format!(
                "API key lacks the '{}' scope",
                SEARCH_SCOPE
            )));
        }
        let tenant_id = resolved.tenant_id();
        let tier = resolved.plan.tier.as_str();

        // RATE_CHECKING
        let rate_limit = match self
            .rate_limiter
            .check(tenant_id, resolved.effective_rate_limit())
            .await
        {
            RateDecision::Admitted(metadata) => Some(metadata),
            RateDecision::Degraded => None,
            RateDecision::Rejected {
                metadata,
                retry_after,
            } => {
                #[cfg(feature = "metrics")]
                crate::metrics::record_rate_limit_rejection(tier);
                return Err(GateError::rate_limited(metadata, retry_after));
            }
        };

        let request: SearchRequest = serde_json::from_slice(body)
            .map_err(|e| GateError::invalid_request(format!("Invalid request body: {}", e)))?;
        request.validate()?;
        if !resolved.plan.has_feature(request.required_feature()) {
            return Err(GateError::invalid_request(format!(
                "The {} plan does not include {}",
                tier,
                request.required_feature()
            )));
        }
        usage.outcome.query_count = request.query_count();

        // QUOTA_CHECKING
        match self
            .quota
            .check_and_consume(tenant_id, request.query_count(), resolved.plan.monthly_quota)
            .await
        {
            QuotaDecision::Admitted { .. } | QuotaDecision::Degraded => {}
            QuotaDecision::Rejected { remaining, .. } => {
                #[cfg(feature = "metrics")]
                crate::metrics::record_quota_rejection(tier);
                let mut err = GateError::new(
                    ErrorCode::QuotaExceeded,
                    format!(
                        "Monthly quota of {} queries exceeded ({} remaining, {} requested)",
                        resolved.plan.monthly_quota,
                        remaining,
                        request.query_count()
                    ),
                );
                err.rate_limit = rate_limit;
                return Err(err);
            }
        }

        let body = match request {
            SearchRequest::Single { query, top_k } => {
                let mut cache_usable = true;
                let (results, cached) = self
                    .answer(tenant_id, &query, top_k, &mut cache_usable)
                    .await?;
                usage.outcome.cache_hit = cached;
                SearchResponse::Single {
                    query,
                    top_k,
                    results,
                    cached,
                    latency_ms: started.elapsed().as_millis() as u64,
                }
            }
            SearchRequest::Batch { queries, top_k } => {
                let mut results = Vec::with_capacity(queries.len());
                // One cache failure turns the cache off for the remaining queries
                let mut cache_usable = true;
                for query in queries {
                    let (hits, cached) = self
                        .answer(tenant_id, &query, top_k, &mut cache_usable)
                        .await?;
                    results.push(BatchItem {
                        query,
                        results: hits,
                        cached,
                    });
                }
                let cache_hits = results.iter().filter(|item| item.cached).count();
                usage.outcome.cache_hit = cache_hits == results.len();
                SearchResponse::Batch {
                    count: results.len(),
                    top_k,
                    results,
                    cache_hits,
                    latency_ms: started.elapsed().as_millis() as u64,
                }
            }
        };

        Ok(GatedResponse { body, rate_limit })
    }

    /// CACHE_LOOKUP, then on a miss COMPUTING and CACHE_STORE.
    ///
    /// Both cache steps are skipped once `cache_usable` is false, and a failed
    /// cache call clears it.
    async fn answer(
        &self,
        tenant_id: &str,
        query: &str,
        top_k: u32,
        cache_usable: &mut bool,
    ) -> Result<(Box<RawValue>, bool), GateError> {
        if *cache_usable {
            match self.cache.lookup(tenant_id, query, top_k).await {
                CacheLookup::Hit(bytes) => {
                    let raw = String::from_utf8(bytes)
                        .ok()
                        .and_then(|s| RawValue::from_string(s).ok());
                    match raw {
                        Some(raw) => return Ok((raw, true)),
                        None => tracing::warn!(
                            tenant_id = %tenant_id,
                            "Discarding unreadable cache entry"
                        ),
                    }
                }
                CacheLookup::Miss => {}
                CacheLookup::Unavailable => *cache_usable = false,
            }
        }

        let hits = self
            .backend
            .search(query.trim(), top_k)
            .await
            .map_err(GateError::internal)?;
        let payload = serde_json::to_string(&hits).map_err(GateError::internal)?;
        if *cache_usable {
            *cache_usable = self
                .cache
                .store(tenant_id, query, top_k, payload.as_bytes())
                .await;
        }

        let raw = RawValue::from_string(payload).map_err(GateError::internal)?;
        Ok((raw, false))
    }
}
