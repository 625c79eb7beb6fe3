//! The protected search computation
//!
//! The gatekeeper never ranks anything itself. It hands admitted queries to a
//! [`SearchBackend`] and treats the answer as an opaque, cacheable payload.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One ranked classification match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub code: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub similarity: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search backend unavailable: {0}")]
    Unavailable(String),

    #[error("search backend returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, top_k: u32) -> Result<Vec<SearchHit>, SearchError>;
}

#[derive(Serialize)]
struct BackendRequest<'a> {
    query: &'a str,
    top_k: u32,
}

#[derive(Deserialize)]
struct BackendResponse {
    results: Vec<SearchHit>,
}

/// Calls a remote search service with `POST {base_url}/search`
#[derive(Clone)]
pub struct HttpSearchBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSearchBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SearchError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/search", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn search(&self, query: &str, top_k: u32) -> Result<Vec<SearchHit>, SearchError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&BackendRequest { query, top_k })
            .send()
            .await
            .map_err(|e| SearchError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SearchError::Unavailable(format!(
                "search backend responded with {}",
                response.status()
            )));
        }

        let body: BackendResponse = response
            .json()
            .await
            .map_err(|e| SearchError::InvalidResponse(e.to_string()))?;
        Ok(body.results)
    }
}

/// Deterministic in-process backend for tests and local development
#[derive(Debug, Default)]
pub struct StaticSearchBackend {
    calls: std::sync::atomic::AtomicUsize,
}

impl StaticSearchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of searches actually computed
    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchBackend for StaticSearchBackend {
    async fn search(&self, query: &str, top_k: u32) -> Result<Vec<SearchHit>, SearchError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let normalized = query.trim().to_lowercase();
        Ok((0..top_k.min(3))
            .map(|rank| SearchHit {
                code: format!("Pr_{:02}_{:02}", normalized.len() % 100, rank),
                title: format!("{} match {}", normalized, rank + 1),
                table: Some("Pr".to_string()),
                similarity: 1.0 - f64::from(rank) * 0.05,
            })
            .collect())
    }
}
