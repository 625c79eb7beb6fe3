//! Timeout budgets for calls into the counter store and tenant directory.
//!
//! Every external call on the request path is bounded; what happens when a
//! budget is exceeded (fail-open or fail-closed) is decided by the caller.

use std::time::Duration;

/// Default budget for a single counter/cache operation.
pub const DEFAULT_COUNTER_TIMEOUT_MS: u64 = 25;

/// Default budget for a single tenant directory operation.
pub const DEFAULT_DIRECTORY_TIMEOUT_MS: u64 = 250;

/// Store timeout configuration.
///
/// # Environment Variables
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `GATEKEEPER_COUNTER_TIMEOUT_MS` | 25 | Counter store and result cache calls |
/// | `GATEKEEPER_DIRECTORY_TIMEOUT_MS` | 250 | Tenant directory calls |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTimeouts {
    /// Budget for counter store operations.
    pub counter: Duration,

    /// Budget for tenant directory operations.
    pub directory: Duration,
}

impl Default for StoreTimeouts {
    fn default() -> Self {
        Self {
            counter: Duration::from_millis(DEFAULT_COUNTER_TIMEOUT_MS),
            directory: Duration::from_millis(DEFAULT_DIRECTORY_TIMEOUT_MS),
        }
    }
}

impl StoreTimeouts {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.counter.is_zero() {
            return Err("counter timeout must be > 0".to_string());
        }
        if self.directory.is_zero() {
            return Err("directory timeout must be > 0".to_string());
        }
        Ok(())
    }

    /// Create configuration from environment variables.
    ///
    /// Falls back to defaults for any unset variables.
    pub fn from_env() -> Self {
        Self {
            counter: Duration::from_millis(env_parse(
                "GATEKEEPER_COUNTER_TIMEOUT_MS",
                DEFAULT_COUNTER_TIMEOUT_MS,
            )),
            directory: Duration::from_millis(env_parse(
                "GATEKEEPER_DIRECTORY_TIMEOUT_MS",
                DEFAULT_DIRECTORY_TIMEOUT_MS,
            )),
        }
    }

    /// Set the counter store budget.
    pub fn with_counter_timeout(mut self, timeout: Duration) -> Self {
        self.counter = timeout;
        self
    }

    /// Set the tenant directory budget.
    pub fn with_directory_timeout(mut self, timeout: Duration) -> Self {
        self.directory = timeout;
        self
    }
}

/// Parse an environment variable with a default fallback.
pub fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
