//! Gatekeeper Storage
//!
//! The gatekeeper's two leaf dependencies:
//! - a [`CounterStore`] for rate-limit windows, quota months and cached
//!   results (in-process or Redis)
//! - a tenant directory ([`TenantDirectory`], [`PrivilegedDirectory`]) for
//!   tenants, API keys, plans, usage logs and billing events (SQLite)

pub mod counter_store;
pub mod directory;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod sqlite;
pub mod timeouts;

pub use counter_store::{with_timeout, CounterStore, MemoryCounterStore, StoreError, StoreResult};
#[cfg(any(test, feature = "test-utils"))]
pub use counter_store::{SlowCounterStore, UnavailableCounterStore};
#[cfg(any(test, feature = "test-utils"))]
pub use directory::{DirectoryFaults, FaultyDirectory};
pub use directory::{
    BillingEventState, KeyLookup, NewApiKey, NewTenant, PrivilegedDirectory, SubscriptionChange,
    TenantDirectory, UsageSummary,
};
#[cfg(feature = "redis-store")]
pub use redis_store::RedisCounterStore;
pub use sqlite::SqliteDirectory;
pub use timeouts::{env_parse, StoreTimeouts};
