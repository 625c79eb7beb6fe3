//! Redis-backed counter store shared by every gatekeeper instance

use crate::counter_store::{CounterStore, StoreError, StoreResult};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use std::time::Duration;

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Unavailable(err.to_string())
        } else if err.is_timeout() {
            StoreError::Timeout(Duration::ZERO)
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

#[derive(Clone)]
pub struct RedisCounterStore {
    manager: ConnectionManager,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;

        // ConnectionManager reconnects on its own after a dropped connection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to get Redis connection manager");
            StoreError::from(e)
        })?;

        tracing::info!("Connected to Redis counter store");
        Ok(Self { manager })
    }
}

/// Redis expiries are whole seconds; never round a live key down to "no expiry".
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let mut conn = self.manager.clone();
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn incr_by_with_expiry(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> StoreResult<i64> {
        let mut conn = self.manager.clone();

        // SET NX only succeeds for a new key, so the expiry is attached exactly
        // once per window. MULTI keeps creation and increment indivisible.
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .arg("NX")
            .ignore()
            .cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn get_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_bytes_with_expiry(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
