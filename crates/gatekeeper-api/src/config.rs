//! Server configuration
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GATEKEEPER_HOST` | `0.0.0.0` | Bind address |
//! | `GATEKEEPER_PORT` | 8080 | Bind port |
//! | `GATEKEEPER_DB_PATH` | `gatekeeper.db` | SQLite tenant directory |
//! | `GATEKEEPER_REDIS_URL` | unset | Shared counter store; in-process store when unset |
//! | `GATEKEEPER_SEARCH_URL` | `http://127.0.0.1:9000` | Search backend base URL |
//! | `GATEKEEPER_KEY_ENVIRONMENT` | `live` | Accepted key prefix (`live` or `test`) |
//! | `GATEKEEPER_CACHE_TTL_SECS` | 86400 | Result cache lifetime |
//! | `GATEKEEPER_KEY_CACHE_TTL_MS` | 2000 | Key lookup cache lifetime |
//! | `GATEKEEPER_KEY_CACHE_CAPACITY` | 10000 | Key lookup cache entries |
//! | `GATEKEEPER_SEARCH_TIMEOUT_MS` | 10000 | Search backend call budget |
//! | `GATEKEEPER_WORK_QUEUE_CAPACITY` | 1000 | Background job queue size |
//! | `GATEKEEPER_WEBHOOK_SECRET` | unset | Billing webhook HMAC secret |
//! | `GATEKEEPER_ADMIN_TOKEN` | unset | Bearer token for admin routes; admin routes disabled when unset |
//!
//! Counter and directory timeouts come from [`StoreTimeouts`].

use crate::key_resolver::{KeyCacheConfig, DEFAULT_KEY_CACHE_CAPACITY, DEFAULT_KEY_CACHE_TTL};
use crate::result_cache::DEFAULT_CACHE_TTL;
use crate::usage_recorder::DEFAULT_QUEUE_CAPACITY;
use gatekeeper_core::credentials::KeyEnvironment;
use gatekeeper_storage::{env_parse, StoreTimeouts};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DB_PATH: &str = "gatekeeper.db";
pub const DEFAULT_SEARCH_URL: &str = "http://127.0.0.1:9000";
pub const DEFAULT_SEARCH_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub redis_url: Option<String>,
    pub search_url: String,
    pub key_environment: KeyEnvironment,
    pub cache_ttl: Duration,
    pub key_cache: KeyCacheConfig,
    pub search_timeout: Duration,
    pub work_queue_capacity: usize,
    pub webhook_secret: Option<String>,
    pub admin_token: Option<String>,
    pub timeouts: StoreTimeouts,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            db_path: DEFAULT_DB_PATH.to_string(),
            redis_url: None,
            search_url: DEFAULT_SEARCH_URL.to_string(),
            key_environment: KeyEnvironment::Live,
            cache_ttl: DEFAULT_CACHE_TTL,
            key_cache: KeyCacheConfig::default(),
            search_timeout: Duration::from_millis(DEFAULT_SEARCH_TIMEOUT_MS),
            work_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            webhook_secret: None,
            admin_token: None,
            timeouts: StoreTimeouts::default(),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl ServerConfig {
    /// Create configuration from environment variables.
    ///
    /// Falls back to defaults for any unset or unparseable variables.
    pub fn from_env() -> Self {
        Self {
            host: env_parse("GATEKEEPER_HOST", "0.0.0.0".to_string()),
            port: env_parse("GATEKEEPER_PORT", DEFAULT_PORT),
            db_path: env_parse("GATEKEEPER_DB_PATH", DEFAULT_DB_PATH.to_string()),
            redis_url: env_opt("GATEKEEPER_REDIS_URL"),
            search_url: env_parse("GATEKEEPER_SEARCH_URL", DEFAULT_SEARCH_URL.to_string()),
            key_environment: env_parse("GATEKEEPER_KEY_ENVIRONMENT", KeyEnvironment::Live),
            cache_ttl: Duration::from_secs(env_parse(
                "GATEKEEPER_CACHE_TTL_SECS",
                DEFAULT_CACHE_TTL.as_secs(),
            )),
            key_cache: KeyCacheConfig {
                ttl: Duration::from_millis(env_parse(
                    "GATEKEEPER_KEY_CACHE_TTL_MS",
                    DEFAULT_KEY_CACHE_TTL.as_millis() as u64,
                )),
                capacity: env_parse("GATEKEEPER_KEY_CACHE_CAPACITY", DEFAULT_KEY_CACHE_CAPACITY),
            },
            search_timeout: Duration::from_millis(env_parse(
                "GATEKEEPER_SEARCH_TIMEOUT_MS",
                DEFAULT_SEARCH_TIMEOUT_MS,
            )),
            work_queue_capacity: env_parse(
                "GATEKEEPER_WORK_QUEUE_CAPACITY",
                DEFAULT_QUEUE_CAPACITY,
            ),
            webhook_secret: env_opt("GATEKEEPER_WEBHOOK_SECRET"),
            admin_token: env_opt("GATEKEEPER_ADMIN_TOKEN"),
            timeouts: StoreTimeouts::from_env(),
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        self.timeouts.validate()?;
        if self.cache_ttl.is_zero() {
            return Err("cache TTL must be > 0".to_string());
        }
        if self.key_cache.capacity == 0 {
            return Err("key cache capacity must be > 0".to_string());
        }
        // Revocation must propagate promptly
        if self.key_cache.ttl > Duration::from_secs(10) {
            return Err("key cache TTL must be <= 10s".to_string());
        }
        if self.work_queue_capacity == 0 {
            return Err("work queue capacity must be > 0".to_string());
        }
        if self.search_timeout.is_zero() {
            return Err("search timeout must be > 0".to_string());
        }
        Ok(())
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_key_cache_ttl(mut self, ttl: Duration) -> Self {
        self.key_cache.ttl = ttl;
        self
    }

    pub fn with_key_environment(mut self, environment: KeyEnvironment) -> Self {
        self.key_environment = environment;
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    pub fn with_work_queue_capacity(mut self, capacity: usize) -> Self {
        self.work_queue_capacity = capacity;
        self
    }

    pub fn with_timeouts(mut self, timeouts: StoreTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}
