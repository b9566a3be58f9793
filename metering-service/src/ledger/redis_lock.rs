//! Redis-backed lease locks (`SET NX PX` with token-checked release).

use super::lock::LockManager;
use crate::config::RedisConfig;
use crate::error::LockError;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use service_core::error::AppError;
use std::time::Duration;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLockManager {
    _client: Client,
    manager: ConnectionManager,
    release: Script,
}

impl RedisLockManager {
    pub async fn new(config: &RedisConfig) -> Result<Self, AppError> {
        tracing::info!("Connecting to Redis for lease locks");
        let client = Client::open(config.url.clone())?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            AppError::RedisError(e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(AppError::RedisError)
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.manager.clone();
        let deleted: i64 = self
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::RedisError)?;
        Ok(deleted == 1)
    }

    async fn is_held(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.manager.clone();
        let holder: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(AppError::RedisError)?;
        Ok(holder.as_deref() == Some(token))
    }
}
