//! Advisory cache of search results
//!
//! Keys are derived from the normalized query (trimmed, lowercased) and the
//! parameters that change the answer, hashed to a fixed length and scoped to
//! the tenant: `gk:cache:{tenant_id}:{32 hex chars}`. Values are the exact
//! serialized result bytes, so a hit is byte-identical to the response that
//! populated it.
//!
//! Any store failure degrades to "uncached"; the cache never fails a request.

use crate::degraded::{Component, DegradedSignal};
use gatekeeper_storage::{with_timeout, CounterStore};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Default time-to-live for cached results
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const KEY_HASH_LEN: usize = 32;

pub fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase()
}

pub fn cache_key(tenant_id: &str, query: &str, top_k: u32) -> String {
    let material = format!("{}:{}", normalize_query(query), top_k);
    let digest = hex::encode(Sha256::digest(material.as_bytes()));
    format!("gk:cache:{}:{}", tenant_id, &digest[..KEY_HASH_LEN])
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(Vec<u8>),
    Miss,
    /// The store failed or timed out; callers should stop using the cache
    /// for the rest of the request.
    Unavailable,
}

pub struct ResultCache {
    store: Arc<dyn CounterStore>,
    ttl: Duration,
    timeout: Duration,
    degraded: Arc<DegradedSignal>,
}

impl ResultCache {
    pub fn new(
        store: Arc<dyn CounterStore>,
        ttl: Duration,
        timeout: Duration,
        degraded: Arc<DegradedSignal>,
    ) -> Self {
        Self {
            store,
            ttl,
            timeout,
            degraded,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached payload. A store failure is recorded and reported as `Unavailable`.
    pub async fn lookup(&self, tenant_id: &str, query: &str, top_k: u32) -> CacheLookup {
        let key = cache_key(tenant_id, query, top_k);
        match with_timeout(self.timeout, self.store.get_bytes(&key)).await {
            Ok(Some(bytes)) => {
                #[cfg(feature = "metrics")]
                crate::metrics::record_result_cache("hit");
                CacheLookup::Hit(bytes)
            }
            Ok(None) => {
                #[cfg(feature = "metrics")]
                crate::metrics::record_result_cache("miss");
                CacheLookup::Miss
            }
            Err(e) => {
                #[cfg(feature = "metrics")]
                crate::metrics::record_result_cache("error");
                self.degraded.record(Component::ResultCache, &e);
                CacheLookup::Unavailable
            }
        }
    }

    /// Store a freshly computed payload. Failures are absorbed; returns
    /// whether the write succeeded.
    pub async fn store(&self, tenant_id: &str, query: &str, top_k: u32, payload: &[u8]) -> bool {
        let key = cache_key(tenant_id, query, top_k);
        match with_timeout(
            self.timeout,
            self.store.set_bytes_with_expiry(&key, payload, self.ttl),
        )
        .await
        {
            Ok(()) => true,
            Err(e) => {
                self.degraded.record(Component::ResultCache, &e);
                false
            }
        }
    }
}
