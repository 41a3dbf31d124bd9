//! 配置模块：控制平面连接、HTTP 与批处理参数。
//!
//! # Configuration
//!
//! Explicit builder values always win; anything left unset falls back to the
//! process environment.
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `ALLTRUE_API_URL` | Control-plane base URL (required) |
//! | `ALLTRUE_API_KEY` | API key exchanged for bearer tokens (required) |
//! | `ALLTRUE_CUSTOMER_ID` | Customer id attached to processing calls (optional) |
//! | `CONFIG_LLM_API_PROVIDER` | LLM provider; falls back to `CONFIG_PROXY_TYPE` |
//! | `CONFIG_HTTP_TIMEOUT` | `none`, `default` or seconds |
//! | `CONFIG_HTTP_KEEPALIVE` | `none`, `no`, `disabled`, `0` or `false` turn pooling off |

use crate::{Error, ErrorContext, Result};
use std::time::Duration;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_CACHE_CAPACITY: usize = 32;

pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_QUEUE_TIME: Duration = Duration::from_secs(3);
pub const DEFAULT_BATCH_CONCURRENCY: usize = 3;

/// `PREFIX_NAME` from the environment, or `default`.
pub fn get_or_default(name: &str, prefix: Option<&str>, default: Option<&str>) -> Option<String> {
    std::env::var(env_key(name, prefix))
        .ok()
        .or_else(|| default.map(str::to_string))
}

/// A required `PREFIX_NAME` value; empty counts as missing.
pub fn get_value(name: &str, prefix: &str) -> Result<String> {
    lookup_required(&|key| std::env::var(key).ok(), name, prefix)
}

fn env_key(name: &str, prefix: Option<&str>) -> String {
    match prefix {
        Some(p) => format!("{}_{}", p.to_uppercase(), name.to_uppercase()),
        None => name.to_uppercase(),
    }
}

fn lookup_required(
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &str,
    prefix: &str,
) -> Result<String> {
    let key = env_key(name, Some(prefix));
    match lookup(&key) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::configuration_with_context(
            format!("{key} is required but not set"),
            ErrorContext::new().with_field_path(key).with_source("config"),
        )),
    }
}

/// Canonical provider name used in control-plane paths.
pub fn normalize_provider(provider: &str) -> String {
    match provider {
        "gemini" => "google".to_string(),
        p if p.starts_with("ibmwatsonx") => "ibmwatsonx".to_string(),
        p => p.to_string(),
    }
}

/// Control-plane identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlConfig {
    pub api_url: String,
    pub api_key: String,
    pub customer_id: Option<String>,
    pub llm_api_provider: String,
}

impl ControlConfig {
    pub fn builder() -> ControlConfigBuilder {
        ControlConfigBuilder::new()
    }

    /// Everything from the environment.
    pub fn from_env() -> Result<Self> {
        ControlConfigBuilder::new().build()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ControlConfigBuilder {
    api_url: Option<String>,
    api_key: Option<String>,
    customer_id: Option<String>,
    llm_api_provider: Option<String>,
}

impl ControlConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_customer_id(mut self, id: impl Into<String>) -> Self {
        self.customer_id = Some(id.into());
        self
    }

    pub fn with_llm_api_provider(mut self, provider: impl Into<String>) -> Self {
        self.llm_api_provider = Some(provider.into());
        self
    }

    pub fn build(self) -> Result<ControlConfig> {
        self.build_with(&|key| std::env::var(key).ok())
    }

    fn build_with(self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<ControlConfig> {
        let api_url = match self.api_url {
            Some(v) => v,
            None => lookup_required(lookup, "api_url", "ALLTRUE")?,
        };
        let api_key = match self.api_key {
            Some(v) => v,
            None => lookup_required(lookup, "api_key", "ALLTRUE")?,
        };
        let customer_id = self
            .customer_id
            .or_else(|| lookup("ALLTRUE_CUSTOMER_ID").filter(|v| !v.is_empty()));
        let provider = match self.llm_api_provider {
            Some(v) => v,
            None => match lookup("CONFIG_LLM_API_PROVIDER").filter(|v| !v.is_empty()) {
                Some(v) => v,
                None => lookup_required(lookup, "proxy_type", "CONFIG")?,
            },
        };

        Ok(ControlConfig {
            api_url,
            api_key,
            customer_id,
            llm_api_provider: normalize_provider(&provider),
        })
    }
}

/// `none` disables the timeout, `default` (or anything unparsable) keeps
/// [`DEFAULT_HTTP_TIMEOUT`], a number is taken as seconds.
pub fn parse_timeout(value: &str) -> Option<Duration> {
    match value.trim().to_lowercase().as_str() {
        "none" => None,
        "default" => Some(DEFAULT_HTTP_TIMEOUT),
        v => match v.parse::<f64>() {
            Ok(secs) if secs < 0.0 => None,
            Ok(secs) => Some(Duration::from_secs_f64(secs)),
            Err(_) => {
                tracing::warn!(value = v, "invalid CONFIG_HTTP_TIMEOUT, using default");
                Some(DEFAULT_HTTP_TIMEOUT)
            }
        },
    }
}

pub fn parse_keep_alive(value: &str) -> bool {
    !matches!(
        value.trim().to_lowercase().as_str(),
        "none" | "no" | "disabled" | "0" | "false"
    )
}

/// Transport tuning for the control-plane client.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpSettings {
    /// `None` disables the per-request timeout.
    pub timeout: Option<Duration>,
    pub keep_alive: bool,
    /// Extra attempts on connection failures.
    pub retries: u32,
    pub verify_tls: bool,
    pub cache_ttl: Duration,
    /// Zero disables response caching.
    pub cache_capacity: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_HTTP_TIMEOUT),
            keep_alive: true,
            retries: 0,
            verify_tls: true,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl HttpSettings {
    /// Defaults with timeout and keep-alive taken from the environment.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(v) = get_or_default("HTTP_TIMEOUT", Some("CONFIG"), None) {
            settings.timeout = parse_timeout(&v);
        }
        if let Some(v) = get_or_default("HTTP_KEEPALIVE", Some("CONFIG"), None) {
            settings.keep_alive = parse_keep_alive(&v);
        }
        settings
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn with_cache(mut self, ttl: Duration, capacity: usize) -> Self {
        self.cache_ttl = ttl;
        self.cache_capacity = capacity;
        self
    }
}

/// Micro-batching parameters. A zero size or zero queue time disables batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub queue_time: Duration,
    pub concurrency: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            queue_time: DEFAULT_QUEUE_TIME,
            concurrency: DEFAULT_BATCH_CONCURRENCY,
        }
    }
}

impl BatchSettings {
    pub fn new(batch_size: usize, queue_time: Duration) -> Self {
        Self {
            batch_size,
            queue_time,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.batch_size > 0 && !self.queue_time.is_zero()
    }
}
