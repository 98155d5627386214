//! In-memory credential store.
//!
//! Suitable for tests and single-process deployments. Nothing is shared with
//! other processes, so the refresh lock only excludes tasks of this process.

use super::{CredentialStore, StoreStats};
use crate::GatewayError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

/// A `HashMap`-backed credential store with TTL support.
///
/// Expiry is evaluated on read against tokio's clock, so paused-time tests can
/// advance past a lock's TTL deterministically. Expired entries are only
/// physically removed by [`purge_expired`](CredentialStore::purge_expired) or
/// when overwritten.
///
/// # Example
///
/// ```rust
/// use market_gateway::storage::{CredentialStore, MemoryStore};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), market_gateway::GatewayError> {
/// let store = MemoryStore::new();
///
/// assert!(store.set_if_absent("lock", "owner-a", Duration::from_secs(10)).await?);
/// assert!(!store.set_if_absent("lock", "owner-b", Duration::from_secs(10)).await?);
///
/// assert!(!store.delete_if_equals("lock", "owner-b").await?);
/// assert!(store.delete_if_equals("lock", "owner-a").await?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    data: Arc<RwLock<HashMap<String, MemoryEntry>>>,
}

impl MemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn deadline(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|ttl| Instant::now() + ttl)
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let data = self.data.read().await;
        let now = Instant::now();
        Ok(data
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), GatewayError> {
        let entry = MemoryEntry {
            value: value.to_string(),
            expires_at: Self::deadline(ttl),
        };
        self.data.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, GatewayError> {
        let mut data = self.data.write().await;
        let now = Instant::now();
        if data.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, GatewayError> {
        let mut data = self.data.write().await;
        let now = Instant::now();
        Ok(data.remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, GatewayError> {
        let mut data = self.data.write().await;
        let now = Instant::now();
        let matches = data
            .get(key)
            .is_some_and(|entry| entry.is_live(now) && entry.value == expected);
        if matches {
            data.remove(key);
        }
        Ok(matches)
    }

    async fn purge_expired(&self) -> Result<usize, GatewayError> {
        let mut data = self.data.write().await;
        let now = Instant::now();
        let initial_count = data.len();
        data.retain(|_, entry| entry.is_live(now));
        Ok(initial_count - data.len())
    }

    async fn get_stats(&self) -> Result<StoreStats, GatewayError> {
        let data = self.data.read().await;
        let now = Instant::now();
        let live = data.values().filter(|entry| entry.is_live(now)).count();
        Ok(StoreStats {
            total_records: live,
            backend_info: format!("In-memory HashMap store ({} entries held)", data.len()),
        })
    }
}
