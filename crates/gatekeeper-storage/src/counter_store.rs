//! Counter store abstraction
//!
//! Rate-limit windows, quota months and cached results all live in a shared
//! key-value store. Every mutation is a single atomic store operation so that
//! many gatekeeper instances can share one store without local read-modify-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gatekeeper_core::Clock;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Errors returned by counter store backends
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("counter store error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Shared key-value store for counters and cached payloads
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current integer value, or `None` if the key is absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Atomically add `delta` and return the new value.
    ///
    /// When the key does not exist it is created with expiry `ttl`. Later
    /// increments never touch the expiry.
    async fn incr_by_with_expiry(&self, key: &str, delta: i64, ttl: Duration)
        -> StoreResult<i64>;

    async fn get_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Store `value`, replacing any previous value and expiry.
    async fn set_bytes_with_expiry(&self, key: &str, value: &[u8], ttl: Duration)
        -> StoreResult<()>;

    async fn ping(&self) -> StoreResult<()>;
}

/// Run a store call under a time budget.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

// =============================================================================
// In-process store
// =============================================================================

#[derive(Debug, Clone)]
enum StoredValue {
    Int(i64),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: DateTime<Utc>,
}

/// Expired entries are swept once every this many writes.
pub const PURGE_EVERY_WRITES: u64 = 256;

/// In-process counter store for single-instance deployments and tests.
///
/// Expiry is evaluated against the injected clock, so a `ManualClock` can roll
/// windows over deterministically. Writes sweep expired keys periodically, so
/// the map stays bounded by the keys live within the longest TTL plus
/// `PURGE_EVERY_WRITES`.
#[derive(Debug)]
pub struct MemoryCounterStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Sweep expired entries every `period` until the store is dropped.
    ///
    /// Covers idle stretches where no writes arrive to trigger a sweep.
    pub fn spawn_purger(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else { break };
                let removed = store.purge_expired();
                if removed > 0 {
                    tracing::debug!(removed, remaining = store.len(), "Purged expired counters");
                }
            }
        })
    }

    /// Number of stored keys, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    // Must not be called while holding an entry guard: `retain` locks every shard.
    fn note_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % PURGE_EVERY_WRITES == 0 {
            self.purge_expired();
        }
    }

    /// Remaining lifetime of a key, if it exists.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .and_then(|entry| (entry.expires_at - now).to_std().ok())
    }

    fn expiry_from(&self, now: DateTime<Utc>, ttl: Duration) -> StoreResult<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .map(|ttl| now + ttl)
            .map_err(|e| StoreError::Backend(format!("invalid ttl {:?}: {}", ttl, e)))
    }

    fn live_value(&self, key: &str) -> Option<StoredValue> {
        let now = self.clock.now();
        let value = self
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone());

        if value.is_none() {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        value
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        match self.live_value(key) {
            None => Ok(None),
            Some(StoredValue::Int(value)) => Ok(Some(value)),
            Some(StoredValue::Bytes(_)) => Err(StoreError::Backend(format!(
                "key {} holds bytes, not a counter",
                key
            ))),
        }
    }

    async fn incr_by_with_expiry(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> StoreResult<i64> {
        let now = self.clock.now();
        let expires_at = self.expiry_from(now, ttl)?;

        let result = {
            // The entry guard holds the shard lock, making create-or-increment atomic.
            let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: StoredValue::Int(0),
                expires_at,
            });

            if entry.expires_at <= now {
                *entry = Entry {
                    value: StoredValue::Int(0),
                    expires_at,
                };
            }

            match &mut entry.value {
                StoredValue::Int(value) => {
                    *value += delta;
                    Ok(*value)
                }
                StoredValue::Bytes(_) => Err(StoreError::Backend(format!(
                    "key {} holds bytes, not a counter",
                    key
                ))),
            }
        };

        self.note_write();
        result
    }

    async fn get_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        match self.live_value(key) {
            None => Ok(None),
            Some(StoredValue::Bytes(bytes)) => Ok(Some(bytes)),
            Some(StoredValue::Int(value)) => Ok(Some(value.to_string().into_bytes())),
        }
    }

    async fn set_bytes_with_expiry(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<()> {
        let expires_at = self.expiry_from(self.clock.now(), ttl)?;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: StoredValue::Bytes(value.to_vec()),
                expires_at,
            },
        );
        self.note_write();
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

// =============================================================================
// Test doubles
// =============================================================================

/// A store whose every call fails, standing in for an unreachable backend
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableCounterStore;

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl CounterStore for UnavailableCounterStore {
    async fn get(&self, _key: &str) -> StoreResult<Option<i64>> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn incr_by_with_expiry(
        &self,
        _key: &str,
        _delta: i64,
        _ttl: Duration,
    ) -> StoreResult<i64> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn get_bytes(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn set_bytes_with_expiry(
        &self,
        _key: &str,
        _value: &[u8],
        _ttl: Duration,
    ) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn ping(&self) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

/// A store that answers every call only after `delay`, for timeout tests
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug)]
pub struct SlowCounterStore<S> {
    inner: S,
    delay: Duration,
}

#[cfg(any(test, feature = "test-utils"))]
impl<S: CounterStore> SlowCounterStore<S> {
    pub fn new(inner: S, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl<S: CounterStore> CounterStore for SlowCounterStore<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn incr_by_with_expiry(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> StoreResult<i64> {
        tokio::time::sleep(self.delay).await;
        self.inner.incr_by_with_expiry(key, delta, ttl).await
    }

    async fn get_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get_bytes(key).await
    }

    async fn set_bytes_with_expiry(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.set_bytes_with_expiry(key, value, ttl).await
    }

    async fn ping(&self) -> StoreResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.ping().await
    }
}
