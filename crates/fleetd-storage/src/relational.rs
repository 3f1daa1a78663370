//! `RelationalStore` abstraction (spec §6) backing the token blacklist table.
//!
//! Queries use parameterized statements — no string-built SQL, matching the
//! cloud repository's convention in the teacher's server crate.

use chrono::{DateTime, Utc};

use crate::error::StorageError;

/// The subset of relational access the authorization core needs: a revoked
/// JWT id table with an expiry so entries can be swept once they'd have
/// expired anyway.
#[async_trait::async_trait]
pub trait RelationalStore: Send + Sync + 'static {
    async fn blacklist_insert(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<(), StorageError>;

    /// `Ok(true)` iff `jti` is present and not yet past its recorded expiry.
    async fn blacklist_contains(&self, jti: &str) -> Result<bool, StorageError>;

    /// Remove entries whose `expires_at` has passed. Returns the count removed.
    async fn blacklist_sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError>;
}

/// In-memory `RelationalStore`, used by the default local-agent deployment
/// and by tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelationalStore {
    blacklist: std::sync::Arc<tokio::sync::RwLock<std::collections::HashMap<String, DateTime<Utc>>>>,
}

impl MemoryRelationalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn blacklist_insert(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<(), StorageError> {
        self.blacklist.write().await.insert(jti.to_owned(), expires_at);
        Ok(())
    }

    async fn blacklist_contains(&self, jti: &str) -> Result<bool, StorageError> {
        let guard = self.blacklist.read().await;
        Ok(guard.get(jti).is_some_and(|expires_at| *expires_at > Utc::now()))
    }

    async fn blacklist_sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut guard = self.blacklist.write().await;
        let before = guard.len();
        guard.retain(|_, expires_at| *expires_at > now);
        Ok((before - guard.len()) as u64)
    }
}

#[cfg(feature = "postgres-backend")]
mod postgres {
    use super::{DateTime, RelationalStore, StorageError, Utc};
    use sqlx::PgPool;

    /// `token_blacklist(jti text primary key, expires_at timestamp not null,
    /// created_at timestamp default now)` with an index on `expires_at`.
    #[derive(Debug, Clone)]
    pub struct PostgresRelationalStore {
        pool: PgPool,
    }

    impl PostgresRelationalStore {
        #[must_use]
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        /// Creates `token_blacklist` and its `expires_at` index if absent.
        ///
        /// # Errors
        ///
        /// Returns [`StorageError::Query`] if the migration statement fails.
        pub async fn migrate(&self) -> Result<(), StorageError> {
            sqlx::query(
                r"CREATE TABLE IF NOT EXISTS token_blacklist (
                    jti TEXT PRIMARY KEY,
                    expires_at TIMESTAMPTZ NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )",
            )
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

            sqlx::query("CREATE INDEX IF NOT EXISTS token_blacklist_expires_at_idx ON token_blacklist (expires_at)")
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Query(e.to_string()))?;

            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl RelationalStore for PostgresRelationalStore {
        async fn blacklist_insert(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<(), StorageError> {
            sqlx::query("INSERT INTO token_blacklist (jti, expires_at) VALUES ($1, $2) ON CONFLICT (jti) DO UPDATE SET expires_at = EXCLUDED.expires_at")
                .bind(jti)
                .bind(expires_at)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Query(e.to_string()))?;
            Ok(())
        }

        async fn blacklist_contains(&self, jti: &str) -> Result<bool, StorageError> {
            let row: Option<(DateTime<Utc>,)> = sqlx::query_as("SELECT expires_at FROM token_blacklist WHERE jti = $1")
                .bind(jti)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Query(e.to_string()))?;
            Ok(row.is_some_and(|(expires_at,)| expires_at > Utc::now()))
        }

        async fn blacklist_sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
            let result = sqlx::query("DELETE FROM token_blacklist WHERE expires_at <= $1")
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Query(e.to_string()))?;
            Ok(result.rows_affected())
        }
    }
}

#[cfg(feature = "postgres-backend")]
pub use postgres::PostgresRelationalStore;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn contains_false_before_insert() {
        let store = MemoryRelationalStore::new();
        assert!(!store.blacklist_contains("jti-1").await.unwrap());
    }

    #[tokio::test]
    async fn contains_true_after_insert_while_unexpired() {
        let store = MemoryRelationalStore::new();
        store.blacklist_insert("jti-1", Utc::now() + ChronoDuration::hours(1)).await.unwrap();
        assert!(store.blacklist_contains("jti-1").await.unwrap());
    }

    #[tokio::test]
    async fn contains_false_once_expired() {
        let store = MemoryRelationalStore::new();
        store.blacklist_insert("jti-1", Utc::now() - ChronoDuration::hours(1)).await.unwrap();
        assert!(!store.blacklist_contains("jti-1").await.unwrap());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let store = MemoryRelationalStore::new();
        let now = Utc::now();
        store.blacklist_insert("expired", now - ChronoDuration::hours(1)).await.unwrap();
        store.blacklist_insert("fresh", now + ChronoDuration::hours(1)).await.unwrap();
        let removed = store.blacklist_sweep_expired(now).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.blacklist_contains("fresh").await.unwrap());
    }
}
