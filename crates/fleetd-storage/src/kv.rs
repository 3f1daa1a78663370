//! `KVStore` abstraction (spec §6) — a pure key-value interface with no
//! knowledge of what's stored above it (credential ciphertext, policy JSON).

use crate::error::StorageError;

/// A pluggable key-value storage backend.
///
/// Keys are UTF-8 strings using `/` as a separator. Implementations must be
/// safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait KVStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Idempotent — deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Default implementation delegates to [`get`](KVStore::get); backends
    /// may override with a cheaper existence check.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// In-memory `KVStore`, for tests and the default local-agent deployment.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: std::sync::Arc<tokio::sync::RwLock<std::collections::BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KVStore for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.data.write().await.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.read().await.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = MemoryBackend::new();
        store.put("sys/config", b"hello").await.unwrap();
        assert_eq!(store.get("sys/config").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn delete_missing_is_noop() {
        let store = MemoryBackend::new();
        store.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn list_respects_prefix() {
        let store = MemoryBackend::new();
        store.put("kv/a", b"1").await.unwrap();
        store.put("kv/b", b"2").await.unwrap();
        store.put("sys/config", b"3").await.unwrap();
        let keys = store.list("kv/").await.unwrap();
        assert_eq!(keys, vec!["kv/a".to_owned(), "kv/b".to_owned()]);
    }

    #[tokio::test]
    async fn exists_reflects_presence() {
        let store = MemoryBackend::new();
        assert!(!store.exists("key").await.unwrap());
        store.put("key", b"v").await.unwrap();
        assert!(store.exists("key").await.unwrap());
    }
}
