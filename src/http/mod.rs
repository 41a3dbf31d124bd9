//! HTTP 传输层：控制平面调用的请求/响应类型与可缓存客户端。
//!
//! # HTTP Transport Module
//!
//! Request/response types shared by every control-plane call, the
//! [`HttpTransport`] capability consumed by the token-gated client and the
//! batch dispatcher, and the default [`CachingHttpClient`] implementation.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`HttpMethod`] | Ordered HTTP verb (used as part of batch group keys) |
//! | [`ControlRequest`] | One outbound call: path, JSON body, headers, timeout, cache policy |
//! | [`ControlResponse`] | Status + body bytes, possibly served from cache |
//! | [`CachePolicy`] | How a single call interacts with the response cache |
//! | [`HttpTransport`] | Trait for "issue a possibly-cached HTTP call" |

mod client;

pub use client::CachingHttpClient;

use crate::cache::CachableEndpoint;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    pub(crate) fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(crate::Error::validation_with_context(
                format!("unsupported HTTP method: {other}"),
                crate::ErrorContext::new().with_source("http"),
            )),
        }
    }
}

/// 401 and 403 both mean the bearer token should be refreshed.
pub fn is_unauthorized(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

pub fn is_error(status: StatusCode) -> bool {
    status.is_client_error() || status.is_server_error()
}

/// How a single call interacts with the response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Serve from cache when present; store a fresh successful response.
    Force,
    /// Skip the cache lookup but store a fresh successful response.
    Refresh,
    /// Neither read from nor write to the cache.
    #[default]
    Disabled,
}

impl CachePolicy {
    pub fn from_flag(cache: bool) -> Self {
        if cache {
            CachePolicy::Force
        } else {
            CachePolicy::Disabled
        }
    }

    pub fn reads(&self) -> bool {
        matches!(self, CachePolicy::Force)
    }

    pub fn writes(&self) -> bool {
        matches!(self, CachePolicy::Force | CachePolicy::Refresh)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub cache: CachePolicy,
}

impl ControlRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
            timeout: None,
            cache: CachePolicy::Disabled,
        }
    }

    pub fn with_json(mut self, body: Option<serde_json::Value>) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_bearer(self, token: &str) -> Self {
        self.with_header("Authorization", format!("Bearer {token}"))
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    /// Bytes used for cache key generation; mirrors what goes on the wire.
    pub fn body_bytes(&self) -> Vec<u8> {
        self.body
            .as_ref()
            .and_then(|b| serde_json::to_vec(b).ok())
            .unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub from_cache: bool,
}

impl ControlResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            from_cache: false,
        }
    }

    /// A response produced locally without any network round-trip.
    pub fn synthesized(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status, Bytes::from(message.into()))
    }

    pub fn json_body(status: StatusCode, body: &serde_json::Value) -> Self {
        Self::new(status, Bytes::from(body.to_string()))
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// The "issue a possibly-cached HTTP call" capability.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: ControlRequest) -> Result<ControlResponse>;

    /// Register a path prefix whose responses may be cached.
    fn register_cachable(&self, endpoint: CachableEndpoint, update: bool);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Transport error: {0}")]
    Other(String),
}
