//! SQLite credential store.
//!
//! A database file can be shared by every process on one host. Expiry is
//! stored as wall-clock milliseconds so all processes agree on it, and lock
//! acquisition runs inside an `IMMEDIATE` transaction so two processes cannot
//! both observe the key as absent.

use super::{CredentialStore, StoreStats};
use crate::GatewayError;
use crate::gateway::time_utils::{current_timestamp_millis, duration_millis};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How long a connection waits for another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-based credential store.
///
/// # Example
///
/// ```rust
/// use market_gateway::storage::SqliteStore;
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), market_gateway::GatewayError> {
/// // Shared by every process that opens the same file
/// let store = Arc::new(SqliteStore::new("/var/lib/market-gateway/credentials.db")?);
///
/// // In-memory (tests only, nothing is shared)
/// let memory_store = Arc::new(SqliteStore::new(":memory:")?);
/// # Ok(())
/// # }
/// ```
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `db_path`, or an in-memory database
    /// for `":memory:"`.
    pub fn new(db_path: &str) -> Result<Self, GatewayError> {
        let connection = if db_path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(db_path)
        }
        .map_err(GatewayError::from_database_error)?;

        connection
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(GatewayError::from_database_error)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, GatewayError> {
        self.connection
            .lock()
            .map_err(|_| GatewayError::from_storage_message("SQLite connection mutex poisoned"))
    }

    fn init_schema(&self) -> Result<(), GatewayError> {
        let conn = self.lock()?;

        // WAL lets readers in other processes proceed during a write
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(GatewayError::from_database_error)?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credential_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )
            "#,
            [],
        )
        .map_err(GatewayError::from_database_error)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_credential_expires_at ON credential_store (expires_at)",
            [],
        )
        .map_err(GatewayError::from_database_error)?;

        Ok(())
    }

    fn expires_at(now: i64, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|ttl| now.saturating_add(duration_millis(ttl)))
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn init(&self) -> Result<(), GatewayError> {
        self.init_schema()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let now = current_timestamp_millis()?;
        let conn = self.lock()?;

        conn.query_row(
            "SELECT value FROM credential_store \
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            params![key, now],
            |row| row.get(0),
        )
        .optional()
        .map_err(GatewayError::from_database_error)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), GatewayError> {
        let now = current_timestamp_millis()?;
        let conn = self.lock()?;

        conn.execute(
            "INSERT OR REPLACE INTO credential_store (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, Self::expires_at(now, ttl)],
        )
        .map_err(GatewayError::from_database_error)?;

        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, GatewayError> {
        let now = current_timestamp_millis()?;
        let mut conn = self.lock()?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(GatewayError::from_database_error)?;

        tx.execute(
            "DELETE FROM credential_store \
             WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![key, now],
        )
        .map_err(GatewayError::from_database_error)?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO credential_store (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, Self::expires_at(now, Some(ttl))],
            )
            .map_err(GatewayError::from_database_error)?;

        tx.commit().map_err(GatewayError::from_database_error)?;

        Ok(inserted == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, GatewayError> {
        let now = current_timestamp_millis()?;
        let mut conn = self.lock()?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(GatewayError::from_database_error)?;

        // An expired row is removed but does not count as a deletion
        tx.execute(
            "DELETE FROM credential_store \
             WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![key, now],
        )
        .map_err(GatewayError::from_database_error)?;

        let changes = tx
            .execute("DELETE FROM credential_store WHERE key = ?1", params![key])
            .map_err(GatewayError::from_database_error)?;

        tx.commit().map_err(GatewayError::from_database_error)?;

        Ok(changes > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, GatewayError> {
        let now = current_timestamp_millis()?;
        let conn = self.lock()?;
        let changes = conn
            .execute(
                "DELETE FROM credential_store \
                 WHERE key = ?1 AND value = ?2 AND (expires_at IS NULL OR expires_at > ?3)",
                params![key, expected, now],
            )
            .map_err(GatewayError::from_database_error)?;
        Ok(changes > 0)
    }

    async fn purge_expired(&self) -> Result<usize, GatewayError> {
        let now = current_timestamp_millis()?;
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM credential_store WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )
        .map_err(GatewayError::from_database_error)
    }

    async fn get_stats(&self) -> Result<StoreStats, GatewayError> {
        let now = current_timestamp_millis()?;
        let conn = self.lock()?;

        let count: usize = conn
            .query_row(
                "SELECT COUNT(*) FROM credential_store WHERE expires_at IS NULL OR expires_at > ?1",
                params![now],
                |row| row.get(0),
            )
            .map_err(GatewayError::from_database_error)?;

        let page_count: i64 = conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .unwrap_or(0);
        let page_size: i64 = conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .unwrap_or(4096);

        Ok(StoreStats {
            total_records: count,
            backend_info: format!(
                "SQLite store ({} bytes, {} pages)",
                page_count * page_size,
                page_count
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path(name: &str) -> String {
        format!("/tmp/test_market_gateway_{}_{}.db", name, std::process::id())
    }

    fn remove_db(path: &str) {
        for suffix in ["", "-wal", "-shm"] {
            std::fs::remove_file(format!("{path}{suffix}")).ok();
        }
    }

    #[tokio::test]
    async fn test_sqlite_store_basic_operations() -> Result<(), GatewayError> {
        let store = SqliteStore::new(":memory:")?;
        store.init().await?;

        store.set("token", "abc", None).await?;
        assert_eq!(store.get("token").await?.as_deref(), Some("abc"));

        store
            .set("token", "def", Some(Duration::from_secs(60)))
            .await?;
        assert_eq!(store.get("token").await?.as_deref(), Some("def"));

        assert!(store.delete("token").await?);
        assert!(store.get("token").await?.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_expiry() -> Result<(), GatewayError> {
        let store = SqliteStore::new(":memory:")?;
        store.init().await?;

        assert!(
            store
                .set_if_absent("lock", "a", Duration::from_millis(50))
                .await?
        );
        assert!(
            !store
                .set_if_absent("lock", "b", Duration::from_millis(50))
                .await?
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.get("lock").await?.is_none());
        assert!(!store.delete_if_equals("lock", "a").await?);
        assert!(
            store
                .set_if_absent("lock", "b", Duration::from_secs(30))
                .await?
        );
        assert!(store.delete_if_equals("lock", "b").await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_delete_expired_is_absent() -> Result<(), GatewayError> {
        let store = SqliteStore::new(":memory:")?;
        store.init().await?;

        store.set("token", "old", Some(Duration::from_millis(20))).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!store.delete("token").await?);
        assert_eq!(store.purge_expired().await?, 0);

        store.set("token", "new", None).await?;
        assert!(store.delete("token").await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_purge_and_stats() -> Result<(), GatewayError> {
        let store = SqliteStore::new(":memory:")?;
        store.init().await?;

        store.set("a", "1", Some(Duration::from_millis(10))).await?;
        store.set("b", "2", None).await?;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let stats = store.get_stats().await?;
        assert_eq!(stats.total_records, 1);
        assert!(stats.backend_info.contains("SQLite"));

        assert_eq!(store.purge_expired().await?, 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_sqlite_store_shared_between_connections() -> Result<(), GatewayError> {
        let path = temp_db_path("shared");
        remove_db(&path);

        // Two handles on one file stand in for two processes
        let first = SqliteStore::new(&path)?;
        first.init().await?;
        let second = SqliteStore::new(&path)?;
        second.init().await?;

        let ttl = Duration::from_secs(30);
        assert!(first.set_if_absent("lock", "first", ttl).await?);
        assert!(!second.set_if_absent("lock", "second", ttl).await?);
        assert!(!second.delete_if_equals("lock", "second").await?);

        first.set("token", "shared-value", None).await?;
        assert_eq!(second.get("token").await?.as_deref(), Some("shared-value"));

        assert!(first.delete_if_equals("lock", "first").await?);
        assert!(second.set_if_absent("lock", "second", ttl).await?);

        drop(first);
        drop(second);
        remove_db(&path);

        Ok(())
    }
}
