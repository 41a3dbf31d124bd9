//! 响应缓存模块：按路径注册的控制平面响应缓存。
//!
//! # Path-Based Response Cache
//!
//! Control-plane calls such as connection checks and token issuance are
//! idempotent for a given identity, so their successful responses are kept
//! for a short while. Only paths explicitly registered as cachable take part.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`PathCacheController`] | Registry of cachable paths, key derivation and statistics |
//! | [`CachableEndpoint`] | Path prefix + methods + key generator |
//! | [`CacheBackend`] | Trait for storage backends |
//! | [`MemoryCache`] | In-memory LRU backend with per-entry TTL |
//! | [`CacheKey`] | Hashed key of one cachable request |
//!
//! ## Example
//!
//! ```rust
//! use alltrue_guardrails::cache::{CachableEndpoint, MemoryCache, PathCacheController};
//! use alltrue_guardrails::http::HttpMethod;
//! use std::time::Duration;
//!
//! let controller = PathCacheController::new(
//!     Box::new(MemoryCache::new(32)),
//!     Duration::from_secs(600),
//! );
//! controller.register_cachable(CachableEndpoint::new("/v1/auth/", [HttpMethod::Post]), false);
//! assert!(controller.is_registered("/v1/auth/issue-jwt-token"));
//! ```

mod backend;
mod controller;
mod key;

pub use backend::{CacheBackend, MemoryCache, NullCache};
pub use controller::{CacheStats, PathCacheController};
pub use key::{CachableEndpoint, CacheKey, KeyGenerator};
