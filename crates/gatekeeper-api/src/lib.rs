//! Uniclass Gatekeeper
//!
//! Admission, metering and caching in front of the classification search
//! backend. Every search passes the same pipeline: key resolution, per-minute
//! rate limit, monthly quota, result cache, backend call, usage record.

pub mod config;
pub mod config_sync;
pub mod degraded;
pub mod error;
pub mod gatekeeper;
pub mod health;
pub mod key_resolver;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod provisioning;
pub mod quota;
pub mod rate_limiting;
pub mod result_cache;
pub mod routes;
pub mod search;
pub mod usage_recorder;

pub use config::ServerConfig;
pub use error::{ErrorCode, GateError};
pub use gatekeeper::Gatekeeper;
pub use routes::{router, AppState};
