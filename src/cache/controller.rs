//! Path registry and cache access for control-plane responses.

use super::backend::CacheBackend;
use super::key::{CachableEndpoint, CacheKey};
use crate::http::{ControlRequest, ControlResponse};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

pub struct PathCacheController {
    registries: RwLock<Vec<CachableEndpoint>>,
    backend: Box<dyn CacheBackend>,
    ttl: Duration,
    stats: AtomicStats,
}

impl PathCacheController {
    pub fn new(backend: Box<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            registries: RwLock::new(Vec::new()),
            backend,
            ttl,
            stats: AtomicStats::default(),
        }
    }

    pub fn is_registered(&self, path: &str) -> bool {
        self.registries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|reg| reg.overlaps(path))
    }

    /// Overlapping registrations are ignored unless `update` is set, in which
    /// case the existing entry is replaced by the shorter path, the union of
    /// methods and the new key generator.
    pub fn register_cachable(&self, cachable: CachableEndpoint, update: bool) {
        let mut registries = self.registries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(pos) = registries.iter().position(|reg| reg.overlaps(&cachable.path)) else {
            registries.push(cachable);
            return;
        };
        if !update {
            return;
        }
        let existing = registries.remove(pos);
        let path = if cachable.path.len() <= existing.path.len() {
            cachable.path
        } else {
            existing.path
        };
        let methods = existing.methods.union(&cachable.methods).copied().collect();
        registries.push(CachableEndpoint {
            path,
            methods,
            key_generator: cachable.key_generator,
        });
    }

    /// The key for `request`, or `None` when no registry covers it.
    pub fn cache_key(&self, request: &ControlRequest) -> Option<CacheKey> {
        let registries = self.registries.read().unwrap_or_else(PoisonError::into_inner);
        let reg = registries
            .iter()
            .find(|reg| reg.matches(&request.path, request.method))?;
        let request_key = reg.generate_key(&request.body_bytes());
        Some(CacheKey::derive(&reg.path, request.method, &request_key))
    }

    pub async fn lookup(&self, key: &CacheKey) -> Option<ControlResponse> {
        match self.backend.get(key).await {
            Ok(Some(data)) => match decode(&data) {
                Some(resp) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    Some(resp)
                }
                None => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "cache read failed");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Only successful responses are stored.
    pub async fn store(&self, key: &CacheKey, response: &ControlResponse) {
        if !response.is_success() {
            return;
        }
        match self.backend.set(key, &encode(response), self.ttl).await {
            Ok(()) => {
                self.stats.sets.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::debug!(error = %e, "cache write failed");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub async fn clear(&self) {
        if let Err(e) = self.backend.clear().await {
            tracing::debug!(error = %e, "cache clear failed");
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

// Stored layout: big-endian status code followed by the raw body.
fn encode(response: &ControlResponse) -> Vec<u8> {
    let mut data = Vec::with_capacity(2 + response.body.len());
    data.extend_from_slice(&response.status.as_u16().to_be_bytes());
    data.extend_from_slice(&response.body);
    data
}

fn decode(data: &[u8]) -> Option<ControlResponse> {
    if data.len() < 2 {
        return None;
    }
    let (status, body) = data.split_at(2);
    let status = StatusCode::from_u16(u16::from_be_bytes([status[0], status[1]])).ok()?;
    let mut resp = ControlResponse::new(status, body.to_vec());
    resp.from_cache = true;
    Some(resp)
}
