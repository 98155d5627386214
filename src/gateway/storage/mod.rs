//! Pluggable backends for the shared credential store.
//!
//! The gateway keeps exactly two kinds of records in the store: the cached
//! bearer token and the refresh lock. Every replica of the surrounding service
//! must point at the same store for the refresh lock to be meaningful, so
//! [`MemoryStore`] is only appropriate for tests and single-process
//! deployments.

use crate::GatewayError;
use async_trait::async_trait;
use std::time::Duration;

// Always available
mod memory;
pub use memory::MemoryStore;

// Feature-gated storage backends
#[cfg(feature = "sqlite-store")]
mod sqlite;
#[cfg(feature = "sqlite-store")]
pub use sqlite::SqliteStore;

#[cfg(feature = "redis-store")]
mod redis;
#[cfg(feature = "redis-store")]
pub use redis::RedisStore;

/// Statistics about the credential store backend.
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Number of live records in the store
    pub total_records: usize,
    /// Additional backend-specific information
    pub backend_info: String,
}

/// Shared key-value store used for cross-process coordination.
///
/// Values are opaque strings. Records may carry a time-to-live after which
/// they must behave as absent for every reader, whether or not the backend has
/// physically removed them yet.
///
/// # Atomicity
///
/// [`set_if_absent`](Self::set_if_absent) and
/// [`delete_if_equals`](Self::delete_if_equals) must be atomic across every
/// process sharing the store. They are the only primitives the token manager
/// uses to write the refresh lock.
///
/// # Available Implementations
///
/// - [`MemoryStore`] - Always available, in-process HashMap
/// - `SqliteStore` - With `sqlite-store`, a database file shared by processes on one host
/// - `RedisStore` - With `redis-store`, shared by any number of hosts
///
/// # Example Implementation
///
/// ```rust
/// use market_gateway::storage::{CredentialStore, StoreStats};
/// use market_gateway::GatewayError;
/// use async_trait::async_trait;
/// use std::collections::HashMap;
/// use std::time::Duration;
/// use tokio::sync::Mutex;
///
/// #[derive(Default)]
/// pub struct NoExpiryStore {
///     data: Mutex<HashMap<String, String>>,
/// }
///
/// #[async_trait]
/// impl CredentialStore for NoExpiryStore {
///     async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
///         Ok(self.data.lock().await.get(key).cloned())
///     }
///
///     async fn set(&self, key: &str, value: &str, _ttl: Option<Duration>) -> Result<(), GatewayError> {
///         self.data.lock().await.insert(key.to_string(), value.to_string());
///         Ok(())
///     }
///
///     async fn set_if_absent(&self, key: &str, value: &str, _ttl: Duration) -> Result<bool, GatewayError> {
///         let mut data = self.data.lock().await;
///         if data.contains_key(key) {
///             return Ok(false);
///         }
///         data.insert(key.to_string(), value.to_string());
///         Ok(true)
///     }
///
///     async fn delete(&self, key: &str) -> Result<bool, GatewayError> {
///         Ok(self.data.lock().await.remove(key).is_some())
///     }
///
///     async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, GatewayError> {
///         let mut data = self.data.lock().await;
///         if data.get(key).map(String::as_str) == Some(expected) {
///             data.remove(key);
///             return Ok(true);
///         }
///         Ok(false)
///     }
///
///     async fn get_stats(&self) -> Result<StoreStats, GatewayError> {
///         Ok(StoreStats {
///             total_records: self.data.lock().await.len(),
///             backend_info: "No-expiry map".to_string(),
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Optional backend initialization (schema creation, connection check).
    ///
    /// Called once when the gateway is built.
    async fn init(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Returns the value stored under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// With `ttl = None` the record never expires on its own.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
    -> Result<(), GatewayError>;

    /// Atomically stores `value` under `key` only if no live record exists.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The record was created by this call
    /// * `Ok(false)` - A live record already existed and was left untouched
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, GatewayError>;

    /// Removes `key`. Returns whether a record was removed.
    async fn delete(&self, key: &str) -> Result<bool, GatewayError>;

    /// Atomically removes `key` only if its current value equals `expected`.
    ///
    /// Used to release a lock without deleting one that has since expired and
    /// been taken by another owner.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, GatewayError>;

    /// Physically removes expired records. Returns how many were removed.
    ///
    /// Backends with native expiry can keep the default.
    async fn purge_expired(&self) -> Result<usize, GatewayError> {
        Ok(0)
    }

    /// Returns statistics about the backend.
    async fn get_stats(&self) -> Result<StoreStats, GatewayError>;
}
