//! Pluggable key-value store.
//!
//! The default backend is an in-memory store with a fixed item capacity,
//! per-key expiry checked at read time, and insertion-order eviction.
//! Additional backends register under a name and are selected by DSN.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum KvError {
    /// The sole miss signal.
    #[error("kv: key not found")]
    NotFound,

    #[error("kv: unknown backend {0}")]
    UnknownBackend(String),

    #[error("kv: backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Returns [`KvError::NotFound`] when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<String, KvError>;

    /// Stores a key with an optional TTL; `None` uses the backend default.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

pub type BackendFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn Store>, KvError> + Send + Sync + 'static>;

static BACKENDS: Lazy<RwLock<HashMap<String, BackendFactory>>> = Lazy::new(|| {
    let mut backends: HashMap<String, BackendFactory> = HashMap::new();
    backends.insert(
        "memory".to_string(),
        Arc::new(|_dsn| {
            Ok(Arc::new(MemoryStore::new(10_000, Duration::from_secs(30 * 60))) as Arc<dyn Store>)
        }),
    );
    RwLock::new(backends)
});

/// Registers a named backend factory. Runtime registration is guarded by
/// the registry's exclusive lock.
pub fn register_backend(name: &str, factory: BackendFactory) {
    BACKENDS
        .write()
        .expect("kv backend registry poisoned")
        .insert(name.to_string(), factory);
}

/// Opens a store by backend name; empty name falls back to `memory`.
pub fn open(name: &str, dsn: &str) -> Result<Arc<dyn Store>, KvError> {
    let name = if name.is_empty() { "memory" } else { name };
    let factory = BACKENDS
        .read()
        .expect("kv backend registry poisoned")
        .get(name)
        .cloned()
        .ok_or_else(|| KvError::UnknownBackend(name.to_string()))?;
    factory(dsn)
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

struct MemoryInner {
    data: HashMap<String, Entry>,
    /// Insertion order for eviction. `delete` does not purge entries here;
    /// eviction skips keys no longer present in `data`.
    order: VecDeque<String>,
}

/// In-memory store guarded by a single writer / multiple reader lock.
/// `get` takes the read lock; `set`/`delete` (and eviction, which happens
/// inside `set`) take the write lock.
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    max_items: usize,
    default_ttl: Duration,
}

impl MemoryStore {
    pub fn new(max_items: usize, default_ttl: Duration) -> Self {
        MemoryStore {
            inner: RwLock::new(MemoryInner {
                data: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_items,
            default_ttl,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<String, KvError> {
        let inner = self.inner.read().expect("kv store poisoned");
        let entry = inner.data.get(key).ok_or(KvError::NotFound)?;
        if let Some(expires_at) = entry.expires_at {
            if Instant::now() > expires_at {
                return Err(KvError::NotFound);
            }
        }
        Ok(entry.value.clone())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };

        let mut inner = self.inner.write().expect("kv store poisoned");
        if !inner.data.contains_key(key) {
            // Evict oldest live entries once at capacity, skipping
            // tombstones left behind by delete.
            while inner.data.len() >= self.max_items {
                match inner.order.pop_front() {
                    Some(oldest) => {
                        inner.data.remove(&oldest);
                    }
                    None => break,
                }
            }
            inner.order.push_back(key.to_string());
        }
        inner.data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut inner = self.inner.write().expect("kv store poisoned");
        inner.data.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_delete() {
        let store = MemoryStore::new(16, Duration::from_secs(60));
        assert_eq!(store.get("a").await, Err(KvError::NotFound));
        store.set("a", "1", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), "1");
        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await, Err(KvError::NotFound));
    }

    #[tokio::test]
    async fn read_time_expiry() {
        let store = MemoryStore::new(16, Duration::from_secs(60));
        store
            .set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await, Err(KvError::NotFound));
    }

    #[tokio::test]
    async fn eviction_is_insertion_order_and_skips_tombstones() {
        let store = MemoryStore::new(2, Duration::from_secs(60));
        store.set("a", "1", None).await.unwrap();
        store.set("b", "2", None).await.unwrap();
        // Deleting leaves a tombstone in the order list.
        store.delete("a").await.unwrap();
        store.set("c", "3", None).await.unwrap();
        store.set("d", "4", None).await.unwrap();
        // "a" was already gone; "b" is the oldest live entry and got
        // evicted to make room.
        assert_eq!(store.get("b").await, Err(KvError::NotFound));
        assert_eq!(store.get("c").await.unwrap(), "3");
        assert_eq!(store.get("d").await.unwrap(), "4");
    }

    #[tokio::test]
    async fn overwrites_do_not_duplicate_order_entries() {
        let store = MemoryStore::new(2, Duration::from_secs(60));
        store.set("a", "1", None).await.unwrap();
        store.set("a", "2", None).await.unwrap();
        store.set("b", "3", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), "2");
        assert_eq!(store.get("b").await.unwrap(), "3");
    }

    #[tokio::test]
    async fn open_falls_back_to_memory() {
        let store = open("", "").unwrap();
        store.set("x", "y", None).await.unwrap();
        assert_eq!(store.get("x").await.unwrap(), "y");
        assert!(matches!(
            open("redis", "redis://nowhere"),
            Err(KvError::UnknownBackend(_))
        ));
    }
}
