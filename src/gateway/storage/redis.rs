//! Redis credential store.
//!
//! The natural backend for multi-replica deployments: every replica points at
//! the same Redis, acquisition uses `SET NX PX` and release runs a
//! compare-and-delete script, so both are atomic server-side.

use super::{CredentialStore, StoreStats};
use crate::GatewayError;
use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::MultiplexedConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Redis-based credential store shared by every process replica.
///
/// # Example
///
/// ```rust,no_run
/// use market_gateway::storage::RedisStore;
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), market_gateway::GatewayError> {
/// let store = Arc::new(RedisStore::new("redis://localhost:6379", "market_gateway")?);
/// # Ok(())
/// # }
/// ```
pub struct RedisStore {
    client: Client,
    key_prefix: String,
    /// Shared persistent connection
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
    compare_and_delete: Script,
}

impl RedisStore {
    /// Create a new Redis store.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `key_prefix` - Prefix for all keys, so several gateways can share one Redis
    pub fn new(redis_url: &str, key_prefix: &str) -> Result<Self, GatewayError> {
        let client = Client::open(redis_url).map_err(GatewayError::from_redis_error)?;

        Ok(Self {
            client,
            key_prefix: key_prefix.to_string(),
            conn: Arc::new(Mutex::new(None)),
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        })
    }

    /// Get or create the persistent connection.
    async fn get_connection(&self) -> Result<MultiplexedConnection, GatewayError> {
        let mut conn_guard = self.conn.lock().await;

        if let Some(conn) = conn_guard.as_ref() {
            let mut test_conn = conn.clone();
            match redis::cmd("PING")
                .query_async::<_, String>(&mut test_conn)
                .await
            {
                Ok(_) => return Ok(conn.clone()),
                Err(_) => {
                    // Dead connection, reconnect below
                    *conn_guard = None;
                }
            }
        }

        let new_conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(GatewayError::from_redis_error)?;

        *conn_guard = Some(new_conn.clone());
        Ok(new_conn)
    }

    fn make_key(&self, key: &str) -> String {
        let mut full = String::with_capacity(self.key_prefix.len() + key.len() + 1);
        full.push_str(&self.key_prefix);
        full.push(':');
        full.push_str(key);
        full
    }

    /// Redis wants a positive millisecond expiry.
    fn ttl_millis(ttl: Duration) -> usize {
        (ttl.as_millis() as usize).max(1)
    }

    /// Scan keys with SCAN instead of KEYS.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, GatewayError> {
        let mut conn = self.get_connection().await?;
        let mut keys = Vec::new();
        let mut cursor = 0u64;

        loop {
            let (new_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(GatewayError::from_redis_error)?;

            keys.extend(batch);
            cursor = new_cursor;

            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl CredentialStore for RedisStore {
    async fn init(&self) -> Result<(), GatewayError> {
        let mut conn = self.get_connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| GatewayError::from_storage_message(format!("Redis ping failed: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let mut conn = self.get_connection().await?;
        conn.get(self.make_key(key))
            .await
            .map_err(GatewayError::from_redis_error)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), GatewayError> {
        let mut conn = self.get_connection().await?;
        let key = self.make_key(key);

        let result: redis::RedisResult<()> = match ttl {
            Some(ttl) => {
                conn.set_options(
                    &key,
                    value,
                    redis::SetOptions::default()
                        .with_expiration(redis::SetExpiry::PX(Self::ttl_millis(ttl))),
                )
                .await
            }
            None => conn.set(&key, value).await,
        };

        result.map_err(GatewayError::from_redis_error)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, GatewayError> {
        let mut conn = self.get_connection().await?;
        let key = self.make_key(key);

        let result: Option<String> = conn
            .set_options(
                &key,
                value,
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::PX(Self::ttl_millis(ttl))),
            )
            .await
            .map_err(GatewayError::from_redis_error)?;

        // A nil reply means the key already existed
        Ok(result.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, GatewayError> {
        let mut conn = self.get_connection().await?;
        let deleted: usize = conn
            .del(self.make_key(key))
            .await
            .map_err(GatewayError::from_redis_error)?;
        Ok(deleted > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, GatewayError> {
        let mut conn = self.get_connection().await?;
        let deleted: i64 = self
            .compare_and_delete
            .key(self.make_key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(GatewayError::from_redis_error)?;
        Ok(deleted > 0)
    }

    async fn get_stats(&self) -> Result<StoreStats, GatewayError> {
        let mut conn = self.get_connection().await?;

        let pattern = format!("{}:*", self.key_prefix);
        let total_records = self.scan_keys(&pattern).await?.len();

        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await
            .map_err(GatewayError::from_redis_error)?;

        let memory_usage = info
            .lines()
            .find(|line| line.starts_with("used_memory_human:"))
            .and_then(|line| line.split(':').nth(1))
            .map(str::trim)
            .unwrap_or("unknown");

        Ok(StoreStats {
            total_records,
            backend_info: format!(
                "Redis store (memory: {}, prefix: {})",
                memory_usage, self.key_prefix
            ),
        })
    }
}
