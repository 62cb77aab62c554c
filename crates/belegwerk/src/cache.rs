//! Cache seam for the meta-search client: an external TTL KV when one is
//! configured and healthy, a bounded in-process LRU otherwise.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;

/// External KV contract (§6). `set_ex` takes a TTL in seconds.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, ttl_secs: u64, value: &str) -> Result<()>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
    async fn del(&self, keys: &[String]) -> Result<u64>;
    /// Cheap liveness check; a failing ping flips the client to memory.
    async fn ping(&self) -> Result<()>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Bounded in-process TTL cache. Capacity-evicting (LRU) and lazily
/// expiring on read.
pub struct MemoryTtlCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl MemoryTtlCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn set_ex(&self, key: &str, ttl: Duration, value: &str) {
        self.entries.lock().put(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// TTL cache that prefers the external backend and degrades to the in-process
/// LRU whenever the backend is absent or its last ping failed.
pub struct FallbackCache {
    backend: Option<Arc<dyn KvBackend>>,
    backend_healthy: AtomicBool,
    memory: MemoryTtlCache,
}

impl FallbackCache {
    pub fn new(backend: Option<Arc<dyn KvBackend>>, memory_capacity: usize) -> Self {
        Self {
            backend_healthy: AtomicBool::new(backend.is_some()),
            backend,
            memory: MemoryTtlCache::new(memory_capacity),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(backend) = self.usable_backend().await {
            match backend.get(key).await {
                Ok(hit) => return hit,
                Err(e) => {
                    tracing::warn!(error = %e, "cache backend get failed, using memory cache");
                    self.backend_healthy.store(false, Ordering::Relaxed);
                }
            }
        }
        self.memory.get(key)
    }

    pub async fn set_ex(&self, key: &str, ttl: Duration, value: &str) {
        if let Some(backend) = self.usable_backend().await {
            match backend.set_ex(key, ttl.as_secs(), value).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "cache backend set failed, using memory cache");
                    self.backend_healthy.store(false, Ordering::Relaxed);
                }
            }
        }
        self.memory.set_ex(key, ttl, value);
    }

    /// Return the backend if it is configured and currently healthy. An
    /// unhealthy backend gets one re-ping per call so it can recover.
    async fn usable_backend(&self) -> Option<Arc<dyn KvBackend>> {
        let backend = self.backend.as_ref()?;
        if self.backend_healthy.load(Ordering::Relaxed) {
            return Some(backend.clone());
        }
        match backend.ping().await {
            Ok(()) => {
                self.backend_healthy.store(true, Ordering::Relaxed);
                Some(backend.clone())
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_cache_expires_entries() {
        let cache = MemoryTtlCache::new(10);
        cache.set_ex("k", Duration::from_millis(0), "v");
        // Zero TTL is expired on the next read.
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn memory_cache_bounds_capacity() {
        let cache = MemoryTtlCache::new(2);
        cache.set_ex("a", Duration::from_secs(60), "1");
        cache.set_ex("b", Duration::from_secs(60), "2");
        cache.set_ex("c", Duration::from_secs(60), "3");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("c"), Some("3".to_string()));
    }

    #[tokio::test]
    async fn fallback_cache_without_backend_uses_memory() {
        let cache = FallbackCache::new(None, 10);
        cache.set_ex("k", Duration::from_secs(60), "v").await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));
    }
}
