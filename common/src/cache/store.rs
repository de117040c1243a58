// Key-value cache store seam and an in-process implementation

use crate::errors::StorageError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// The six key-value operations the query cache relies on
///
/// Values are opaque bytes (JSON-encoded rows). TTLs are in seconds.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn set(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<(), StorageError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StorageError>;

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), StorageError>;

    /// Delete `key`; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
enum Slot {
    Plain(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

fn wrong_type(key: &str) -> StorageError {
    StorageError::RedisError(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
        key
    ))
}

/// In-process cache store with passive TTL expiry
///
/// Mirrors Redis semantics for strings and hashes, including WRONGTYPE
/// errors. Used in tests and for running without a Redis server.
#[derive(Clone, Default)]
pub struct MemoryCacheStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    writes: Arc<AtomicU64>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live entry exists under `key`
    pub async fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remaining time to live of `key`, `None` if missing or persistent
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let entry = entries.get(key).filter(|entry| entry.is_live(now))?;
        entry.expires_at.map(|at| at - now)
    }

    /// Number of mutating calls (set, hset, expire, delete) received
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn count_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        match entries.get(key).filter(|entry| entry.is_live(now)) {
            None => Ok(None),
            Some(Entry {
                slot: Slot::Plain(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<(), StorageError> {
        self.count_write();
        if ttl_seconds == 0 {
            return Err(StorageError::RedisError(
                "invalid expire time in 'set' command".to_string(),
            ));
        }

        let entry = Entry {
            slot: Slot::Plain(value.to_vec()),
            expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        match entries.get(key).filter(|entry| entry.is_live(now)) {
            None => Ok(None),
            Some(Entry {
                slot: Slot::Hash(fields),
                ..
            }) => Ok(fields.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StorageError> {
        self.count_write();
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.slot {
            Slot::Hash(fields) => {
                fields.insert(field.to_string(), value.to_vec());
                Ok(())
            }
            Slot::Plain(_) => Err(wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), StorageError> {
        self.count_write();
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get_mut(key).filter(|entry| entry.is_live(now)) {
            entry.expires_at = Some(now + Duration::from_secs(ttl_seconds));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.count_write();
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_expires_passively() {
        let store = MemoryCacheStore::new();
        store.set("q:a", b"{}", 60).await.unwrap();
        assert_eq!(store.get("q:a").await.unwrap(), Some(b"{}".to_vec()));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.get("q:a").await.unwrap(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hash_fields_share_outer_ttl() {
        let store = MemoryCacheStore::new();
        store.hset("q:a", "[1]", b"one").await.unwrap();
        store.hset("q:a", "[2]", b"two").await.unwrap();
        assert_eq!(store.ttl("q:a").await, None);

        store.expire("q:a", 30).await.unwrap();
        assert_eq!(store.hget("q:a", "[2]").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.hget("q:a", "[3]").await.unwrap(), None);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.hget("q:a", "[1]").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wrong_type_access_fails() {
        let store = MemoryCacheStore::new();
        store.set("q:a", b"{}", 60).await.unwrap();
        assert!(store.hget("q:a", "f").await.is_err());
        assert!(store.hset("q:a", "f", b"v").await.is_err());

        store.hset("q:b", "f", b"v").await.unwrap();
        assert!(store.get("q:b").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_noop() {
        let store = MemoryCacheStore::new();
        store.delete("q:missing").await.unwrap();
        store.expire("q:missing", 10).await.unwrap();
        assert!(!store.contains("q:missing").await);
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_rejected() {
        let store = MemoryCacheStore::new();
        assert!(store.set("q:a", b"{}", 0).await.is_err());
        assert!(!store.contains("q:a").await);
    }
}
