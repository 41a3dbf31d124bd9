//! Cache key generation.

use crate::http::HttpMethod;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub hash: String,
}

impl CacheKey {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }

    /// SHA-256 over path, method and the generated request key, as 32 hex chars.
    pub fn derive(path: &str, method: HttpMethod, request_key: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update(method.as_str().as_bytes());
        hasher.update(request_key);
        let hash: String = hasher
            .finalize()
            .iter()
            .take(16)
            .map(|b| format!("{:02x}", b))
            .collect();
        Self::new(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Maps a request body to the bytes that identify it for caching.
pub type KeyGenerator = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

#[derive(Clone)]
pub struct CachableEndpoint {
    pub path: String,
    pub methods: BTreeSet<HttpMethod>,
    pub key_generator: KeyGenerator,
}

impl CachableEndpoint {
    /// Keys requests by their raw body.
    pub fn new(path: impl Into<String>, methods: impl IntoIterator<Item = HttpMethod>) -> Self {
        Self {
            path: path.into(),
            methods: methods.into_iter().collect(),
            key_generator: Arc::new(|body: &[u8]| body.to_vec()),
        }
    }

    pub fn with_key_generator<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.key_generator = Arc::new(f);
        self
    }

    /// Either path is a prefix of the other.
    pub fn overlaps(&self, path: &str) -> bool {
        path.starts_with(&self.path) || self.path.starts_with(path)
    }

    pub fn matches(&self, path: &str, method: HttpMethod) -> bool {
        path.starts_with(&self.path) && self.methods.contains(&method)
    }

    pub fn generate_key(&self, body: &[u8]) -> Vec<u8> {
        (self.key_generator)(body)
    }
}

impl fmt::Debug for CachableEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachableEndpoint")
            .field("path", &self.path)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_key_is_stable_and_distinct() {
        let a = CacheKey::derive("/v1/auth/", HttpMethod::Post, b"k1");
        let b = CacheKey::derive("/v1/auth/", HttpMethod::Post, b"k1");
        let c = CacheKey::derive("/v1/auth/", HttpMethod::Get, b"k1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_endpoint_matching() {
        let ep = CachableEndpoint::new("/v1/llm-firewall/chat/check-connection/", [HttpMethod::Post]);
        assert!(ep.matches("/v1/llm-firewall/chat/check-connection/openai", HttpMethod::Post));
        assert!(!ep.matches("/v1/llm-firewall/chat/check-connection/openai", HttpMethod::Get));
        assert!(!ep.matches("/v1/llm-firewall/chat/process-input/openai", HttpMethod::Post));
        assert!(ep.overlaps("/v1/llm-firewall/"));
    }

    #[test]
    fn test_custom_key_generator() {
        let ep = CachableEndpoint::new("/x", [HttpMethod::Post])
            .with_key_generator(|body| body.iter().rev().copied().collect());
        assert_eq!(ep.generate_key(b"abc"), b"cba".to_vec());
    }
}
