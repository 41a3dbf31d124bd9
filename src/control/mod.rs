//! 控制平面客户端：令牌鉴权调用与聊天规则处理。
//!
//! # Control-Plane Client
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ApiClient`] | Token-gated calls with bounded refresh-on-401/403 retries |
//! | [`RuleProcessor`] | Process inputs/outputs, connection and usage checks, optional batching |
//! | [`ChatEndpoint`] | Explicit chat endpoints, classified once as batchable or direct |
//!
//! ## Example
//!
//! ```rust,no_run
//! use alltrue_guardrails::control::{ProcessRequest, RuleProcessor};
//!
//! # async fn demo() -> alltrue_guardrails::Result<()> {
//! let processor = RuleProcessor::builder()
//!     .with_api_url("https://api.example.com")
//!     .with_api_key("key")
//!     .with_llm_api_provider("openai")
//!     .build()?;
//! let result = processor
//!     .process_request(ProcessRequest::new(r#"{"messages":[]}"#, "req-1", "endpoint-1"))
//!     .await;
//! # Ok(())
//! # }
//! ```

mod chat;
mod endpoint;

pub use chat::{
    FlowInfo, ProcessRequest, ProcessResponse, ProcessResult, PromptRequest, RuleProcessor,
    RuleProcessorBuilder, Validation, CHECK_CONNECTION_PREFIX, USAGE_ENDPOINT,
};
pub use endpoint::{optimistic_echo, ChatEndpoint, EndpointKind, PayloadKind};

use crate::auth::TokenRetriever;
use crate::batch::{Downstream, DownstreamCall};
use crate::config::{ControlConfig, HttpSettings};
use crate::http::{
    is_unauthorized, CachePolicy, CachingHttpClient, ControlRequest, ControlResponse, HttpMethod,
    HttpTransport,
};
use crate::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const MAX_TOKEN_REFRESH_RETRIES: u32 = 3;
pub const CHAT_PREFIX: &str = "/v1/llm-firewall/chat/";
pub const TOKEN_RETRIES_EXHAUSTED: &str = "Too many token refresh errors. Giving up.";

/// Shared connection + identity for everything that talks to the control plane.
pub struct ApiClient {
    config: ControlConfig,
    transport: Arc<dyn HttpTransport>,
    tokens: TokenRetriever,
}

impl ApiClient {
    pub fn new(config: ControlConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let tokens = TokenRetriever::new(config.api_key.clone(), Arc::clone(&transport));
        Self {
            config,
            transport,
            tokens,
        }
    }

    /// Builds the default `reqwest` transport against `config.api_url`.
    pub fn connect(config: ControlConfig, settings: &HttpSettings) -> Result<Self> {
        let transport = Arc::new(CachingHttpClient::new(&config.api_url, settings)?);
        Ok(Self::new(config, transport))
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    /// Issue one call with a bearer token, refreshing the token and retrying
    /// on 401/403 up to [`MAX_TOKEN_REFRESH_RETRIES`] attempts. Exhaustion
    /// yields a synthesized 401 rather than an error.
    pub async fn request(
        &self,
        endpoint: &str,
        method: HttpMethod,
        body: Option<Value>,
        timeout: Option<Duration>,
        cache: bool,
    ) -> Result<ControlResponse> {
        let mut failures = 0;
        while failures < MAX_TOKEN_REFRESH_RETRIES {
            if let Some(token) = self.tokens.get_token(failures > 0).await? {
                tracing::debug!(method = %method, endpoint, "calling control plane");
                let request = ControlRequest::new(method, endpoint)
                    .with_header("content-type", "application/json")
                    .with_bearer(&token)
                    .with_json(body.clone())
                    .with_timeout(timeout)
                    .with_cache(CachePolicy::from_flag(cache));
                let reply = self.transport.send(request).await?;
                if !is_unauthorized(reply.status) {
                    return Ok(reply);
                }
            }
            failures += 1;
            tracing::info!(
                attempt = failures,
                max = MAX_TOKEN_REFRESH_RETRIES,
                "auth failed with control plane, retrying"
            );
        }
        tracing::warn!("failed too many times retrieving a valid token, giving up");
        Ok(ControlResponse::synthesized(
            StatusCode::UNAUTHORIZED,
            TOKEN_RETRIES_EXHAUSTED,
        ))
    }

    /// [`request`](Self::request) under the chat API prefix.
    pub async fn chat(
        &self,
        endpoint: &str,
        method: HttpMethod,
        body: Option<Value>,
        timeout: Option<Duration>,
        cache: bool,
    ) -> Result<ControlResponse> {
        let path = format!("{}{}", CHAT_PREFIX, endpoint.trim_start_matches('/'));
        self.request(&path, method, body, timeout, cache).await
    }
}

/// Routes batch calls through the token-gated chat path, uncached.
pub(crate) struct ChatDownstream {
    api: Arc<ApiClient>,
}

impl ChatDownstream {
    pub(crate) fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Downstream for ChatDownstream {
    async fn call(&self, call: DownstreamCall) -> Result<ControlResponse> {
        self.api
            .chat(&call.path, call.method, call.body, Some(call.timeout), false)
            .await
    }
}
