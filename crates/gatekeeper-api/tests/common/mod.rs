//! Shared fixture for gatekeeper integration tests
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use gatekeeper_api::search::StaticSearchBackend;
use gatekeeper_api::usage_recorder::{BackgroundJob, RequestOutcome};
use gatekeeper_api::{router, AppState, ServerConfig};
use gatekeeper_core::{Clock, ManualClock, PlanTier, Tenant};
use gatekeeper_storage::{CounterStore, MemoryCounterStore, SqliteDirectory};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const ADMIN_TOKEN: &str = "admin-token-for-tests";
pub const WEBHOOK_SECRET: &str = "whsec_test";

/// 12:00:10 UTC, ten seconds into a rate window
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 10).unwrap()
}

pub struct Harness {
    pub directory: Arc<SqliteDirectory>,
    pub clock: Arc<ManualClock>,
    pub backend: Arc<StaticSearchBackend>,
    pub state: AppState,
    pub jobs: mpsc::Receiver<BackgroundJob>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(base_config())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        Self::build(config, clock, store)
    }

    pub fn with_store(store: Arc<dyn CounterStore>) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        Self::build(base_config(), clock, store)
    }

    fn build(config: ServerConfig, clock: Arc<ManualClock>, store: Arc<dyn CounterStore>) -> Self {
        let directory = Arc::new(SqliteDirectory::open_in_memory().unwrap());
        let backend = Arc::new(StaticSearchBackend::new());
        let (state, jobs) =
            AppState::build(directory.clone(), store, backend.clone(), clock.clone(), &config);
        Self {
            directory,
            clock,
            backend,
            state,
            jobs,
        }
    }

    pub fn app(&self) -> Router {
        router(self.state.clone())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Sign up a tenant and return it with its raw default key.
    pub async fn signup(&self, slug: &str, tier: PlanTier) -> (Tenant, String) {
        let result = self
            .state
            .provisioning
            .signup(&format!("Tenant {}", slug), slug, tier)
            .await
            .unwrap();
        (result.tenant, result.api_key.raw_key)
    }

    /// Everything queued so far, without waiting
    pub fn drain_jobs(&mut self) -> Vec<BackgroundJob> {
        let mut jobs = Vec::new();
        while let Ok(job) = self.jobs.try_recv() {
            jobs.push(job);
        }
        jobs
    }

    pub fn drain_usage(&mut self) -> Vec<RequestOutcome> {
        self.drain_jobs()
            .into_iter()
            .filter_map(|job| match job {
                BackgroundJob::RecordUsage(outcome) => Some(outcome),
                _ => None,
            })
            .collect()
    }
}

pub fn base_config() -> ServerConfig {
    ServerConfig::default()
        .with_admin_token(ADMIN_TOKEN)
        .with_webhook_secret(WEBHOOK_SECRET)
}

pub fn single(query: &str) -> Vec<u8> {
    serde_json::json!({ "action": "single", "query": query, "top_k": 5 })
        .to_string()
        .into_bytes()
}

pub fn batch(queries: &[&str]) -> Vec<u8> {
    serde_json::json!({ "action": "batch", "queries": queries, "top_k": 5 })
        .to_string()
        .into_bytes()
}

pub fn search_request(key: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/search")
        .header("authorization", format!("Bearer {}", key))
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
