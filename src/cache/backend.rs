//! Cache backend implementations.

use super::key::CacheKey;
use crate::Result;
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CacheEntry {
    data: Vec<u8>,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data,
            created_at: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &CacheKey, value: &[u8], ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &CacheKey) -> Result<bool>;
    async fn clear(&self) -> Result<()>;
    async fn len(&self) -> Result<usize>;
    fn name(&self) -> &'static str;
}

/// LRU-bounded in-memory cache. A capacity of zero stores nothing.
pub struct MemoryCache {
    entries: Option<Mutex<LruCache<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut LruCache<String, CacheEntry>) -> R) -> Option<R> {
        self.entries.as_ref().map(|m| {
            let mut guard = m.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        Ok(self
            .with_entries(|entries| {
                let expired = entries.get(&key.hash)?.is_expired();
                if expired {
                    entries.pop(&key.hash);
                    return None;
                }
                entries.get(&key.hash).map(|e| e.data.clone())
            })
            .flatten())
    }

    async fn set(&self, key: &CacheKey, value: &[u8], ttl: Duration) -> Result<()> {
        self.with_entries(|entries| {
            entries.put(key.hash.clone(), CacheEntry::new(value.to_vec(), ttl));
        });
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        Ok(self
            .with_entries(|entries| entries.pop(&key.hash).is_some())
            .unwrap_or(false))
    }

    async fn clear(&self) -> Result<()> {
        self.with_entries(|entries| entries.clear());
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self
            .with_entries(|entries| entries.iter().filter(|(_, e)| !e.is_expired()).count())
            .unwrap_or(0))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

pub struct NullCache;

impl NullCache {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for NullCache {
    async fn get(&self, _: &CacheKey) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
    async fn set(&self, _: &CacheKey, _: &[u8], _: Duration) -> Result<()> {
        Ok(())
    }
    async fn delete(&self, _: &CacheKey) -> Result<bool> {
        Ok(false)
    }
    async fn clear(&self) -> Result<()> {
        Ok(())
    }
    async fn len(&self) -> Result<usize> {
        Ok(0)
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
