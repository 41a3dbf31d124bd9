//! Rule processor facade over the chat endpoints.

use super::endpoint::{optimistic_echo, ChatEndpoint, EndpointKind, PayloadKind};
use super::{ApiClient, ChatDownstream};
use crate::batch::{BatchDispatcher, BatchScheduler, StopOutcome, SubmittedUnit};
use crate::cache::CachableEndpoint;
use crate::config::{BatchSettings, ControlConfig, ControlConfigBuilder, HttpSettings};
use crate::http::{ControlResponse, HttpMethod, HttpTransport};
use crate::{Error, ErrorContext, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;

pub const CHECK_CONNECTION_PREFIX: &str = "/v1/llm-firewall/chat/check-connection/";
pub const USAGE_ENDPOINT: &str = "/v1/ai-usage/quarantine/llm-endpoint";

const CHECK_TIMEOUT: Duration = Duration::from_millis(500);
const NO_CACHE_HEADER: (&str, &str) = ("x-alltrue-llm-cache-control", "no-cache");

static LLM_API_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(x-[\w\-]*key|[aA]uthorization)$").expect("valid regex"));

/// Outcome of a processing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// Processed payload as JSON text.
    pub content: String,
    pub status_code: u16,
    pub message: Option<String>,
}

impl ProcessResult {
    pub fn is_rejected(&self) -> bool {
        self.status_code == StatusCode::UNAUTHORIZED.as_u16()
            || self.status_code == StatusCode::FORBIDDEN.as_u16()
    }
}

/// Where an intercepted LLM call came from and was headed.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowInfo {
    pub url: String,
    pub method: HttpMethod,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub scheme: Option<String>,
    pub client_ip: String,
    pub client_port: u16,
    /// Unix timestamp (seconds) of the flow start.
    pub start_time: f64,
    pub llm_api_provider: Option<String>,
}

impl Default for FlowInfo {
    fn default() -> Self {
        Self {
            url: "https://httpbin.org".to_string(),
            method: HttpMethod::Post,
            host: None,
            port: None,
            scheme: None,
            client_ip: "192.0.2.0".to_string(),
            client_port: 0,
            start_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
            llm_api_provider: None,
        }
    }
}

impl FlowInfo {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_client(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.client_ip = ip.into();
        self.client_port = port;
        self
    }

    pub fn with_start_time(mut self, start_time: f64) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.llm_api_provider = Some(provider.into());
        self
    }

    /// Explicit host/port/scheme win over what the URL says.
    fn url_fields(&self) -> Map<String, Value> {
        let parsed = url::Url::parse(&self.url).ok();
        let host = self
            .host
            .clone()
            .or_else(|| parsed.as_ref().and_then(|u| u.host_str().map(str::to_string)));
        let port = self
            .port
            .or_else(|| parsed.as_ref().and_then(|u| u.port_or_known_default()));
        let scheme = self
            .scheme
            .clone()
            .or_else(|| parsed.as_ref().map(|u| u.scheme().to_string()));

        let mut fields = Map::new();
        fields.insert("url".into(), json!(self.url));
        fields.insert("host".into(), json!(host));
        fields.insert("port".into(), json!(port));
        fields.insert("scheme".into(), json!(scheme));
        fields
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRequest {
    pub body: String,
    pub request_id: String,
    pub endpoint_identifier: String,
    pub headers: Vec<(String, String)>,
    pub flow: FlowInfo,
}

impl ProcessRequest {
    pub fn new(
        body: impl Into<String>,
        request_id: impl Into<String>,
        endpoint_identifier: impl Into<String>,
    ) -> Self {
        Self {
            body: body.into(),
            request_id: request_id.into(),
            endpoint_identifier: endpoint_identifier.into(),
            headers: Vec::new(),
            flow: FlowInfo::default(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_flow(mut self, flow: FlowInfo) -> Self {
        self.flow = flow;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessResponse {
    pub body: String,
    pub original_request_input: String,
    pub request_id: String,
    pub endpoint_identifier: String,
    pub request_headers: Vec<(String, String)>,
    pub response_headers: Vec<(String, String)>,
    pub flow: FlowInfo,
}

impl ProcessResponse {
    pub fn new(
        body: impl Into<String>,
        original_request_input: impl Into<String>,
        request_id: impl Into<String>,
        endpoint_identifier: impl Into<String>,
    ) -> Self {
        Self {
            body: body.into(),
            original_request_input: original_request_input.into(),
            request_id: request_id.into(),
            endpoint_identifier: endpoint_identifier.into(),
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            flow: FlowInfo::default(),
        }
    }

    pub fn with_request_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.request_headers = headers;
        self
    }

    pub fn with_response_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.response_headers = headers;
        self
    }

    pub fn with_flow(mut self, flow: FlowInfo) -> Self {
        self.flow = flow;
        self
    }
}

/// Check performed before a prompt is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validation {
    #[default]
    None,
    /// Skip processing when the endpoint cannot be reached.
    Connection,
    /// Reject with 403 when the endpoint is not sanctioned.
    Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptRequest {
    pub request_id: String,
    pub endpoint_identifier: String,
    pub prompt_input: String,
    pub prompt_output: Option<String>,
    pub validation: Validation,
    /// When false the control plane is asked not to serve cached verdicts.
    pub quick_response: bool,
    pub headers: Option<Vec<(String, String)>>,
    pub llm_api_provider: Option<String>,
}

impl PromptRequest {
    pub fn input(
        request_id: impl Into<String>,
        endpoint_identifier: impl Into<String>,
        prompt_input: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            endpoint_identifier: endpoint_identifier.into(),
            prompt_input: prompt_input.into(),
            prompt_output: None,
            validation: Validation::None,
            quick_response: true,
            headers: None,
            llm_api_provider: None,
        }
    }

    pub fn output(
        request_id: impl Into<String>,
        endpoint_identifier: impl Into<String>,
        prompt_input: impl Into<String>,
        prompt_output: impl Into<String>,
    ) -> Self {
        let mut req = Self::input(request_id, endpoint_identifier, prompt_input);
        req.prompt_output = Some(prompt_output.into());
        req
    }

    pub fn with_validation(mut self, validation: Validation) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_quick_response(mut self, quick: bool) -> Self {
        self.quick_response = quick;
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.llm_api_provider = Some(provider.into());
        self
    }
}

/// Request/response processing against the control plane. With batching
/// enabled, `process-input` and `process-output` calls are queued and
/// answered immediately with an optimistic echo; everything else is direct.
pub struct RuleProcessor {
    api: Arc<ApiClient>,
    batcher: Option<BatchScheduler<BatchDispatcher>>,
    runtime: Option<Handle>,
    closed: AtomicBool,
}

impl RuleProcessor {
    pub fn builder() -> RuleProcessorBuilder {
        RuleProcessorBuilder::new()
    }

    /// A non-batching processor over an existing client.
    pub fn from_api(api: Arc<ApiClient>) -> Self {
        register_cachables(api.transport().as_ref());
        Self {
            api,
            batcher: None,
            runtime: None,
            closed: AtomicBool::new(false),
        }
    }

    /// A new processor sharing `original`'s connection and configuration,
    /// batching with `settings`. `original` keeps its own scheduler, if any.
    pub fn batched_from(original: &RuleProcessor, settings: BatchSettings) -> Result<Self> {
        let runtime = original.runtime.clone();
        let batcher = start_batcher(&original.api, settings, runtime.as_ref())?;
        Ok(Self {
            api: Arc::clone(&original.api),
            batcher,
            runtime,
            closed: AtomicBool::new(false),
        })
    }

    /// Stop the current scheduler completely, then attach one with `settings`.
    pub async fn rebatch(&mut self, settings: BatchSettings, timeout: Duration) -> Result<StopOutcome> {
        let outcome = match self.batcher.take() {
            Some(old) => old.stop(timeout).await,
            None => StopOutcome::Drained,
        };
        self.batcher = start_batcher(&self.api, settings, self.runtime.as_ref())?;
        Ok(outcome)
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn config(&self) -> &ControlConfig {
        self.api.config()
    }

    pub fn batch_settings(&self) -> Option<BatchSettings> {
        self.batcher.as_ref().map(|b| b.settings())
    }

    pub fn is_batching(&self) -> bool {
        self.batcher.is_some()
    }

    pub fn is_running(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.batcher.as_ref().map_or(true, |b| b.is_running())
    }

    /// Drain and stop the batcher. A timeout is logged, not raised.
    pub async fn close(&self, timeout: Duration) -> StopOutcome {
        self.closed.store(true, Ordering::Release);
        let Some(batcher) = &self.batcher else {
            return StopOutcome::Drained;
        };
        tracing::info!("closing batcher");
        let outcome = batcher.stop(timeout).await;
        if outcome.is_drained() {
            tracing::info!("batcher closed");
        }
        outcome
    }

    /// Call a chat endpoint, through the batcher when it applies.
    pub async fn chat(
        &self,
        endpoint: &ChatEndpoint,
        body: Option<Value>,
        timeout: Option<Duration>,
        cache: bool,
    ) -> Result<ControlResponse> {
        if let (Some(batcher), EndpointKind::Batchable(kind)) = (&self.batcher, endpoint.kind()) {
            let echo = optimistic_echo(kind, body.as_ref());
            let path = endpoint.path();
            // Fire-and-forget: the dispatcher logs the real outcome. Only an
            // already-closed batcher is reported here.
            let mut submitted = batcher.submit(SubmittedUnit::new(&path, endpoint.method(), body));
            if let Some(Err(err)) = submitted.try_result() {
                tracing::warn!(endpoint = %path, error = %err, "batcher rejected request");
                return Err(err.into());
            }
            tracing::debug!(endpoint = %path, "request batched");
            return Ok(echo);
        }
        self.api
            .chat(&endpoint.path(), endpoint.method(), body, timeout, cache)
            .await
    }

    fn provider(&self, explicit: Option<&str>) -> String {
        explicit
            .map(str::to_string)
            .unwrap_or_else(|| self.config().llm_api_provider.clone())
    }

    /// Whether the LLM endpoint is reachable through the control plane.
    pub async fn check_connection(
        &self,
        endpoint_identifier: &str,
        llm_api_provider: Option<&str>,
        headers: &[(String, String)],
        cache: bool,
    ) -> Result<bool> {
        let header_map: Map<String, Value> = headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let endpoint = ChatEndpoint::CheckConnection {
            provider: self.provider(llm_api_provider),
        };
        let reply = self
            .chat(
                &endpoint,
                Some(json!({
                    "endpoint_identifier": endpoint_identifier,
                    "headers": Value::Object(header_map).to_string(),
                })),
                Some(CHECK_TIMEOUT),
                cache,
            )
            .await?;
        if !reply.is_success() {
            tracing::warn!(
                status = reply.status.as_u16(),
                body = %reply.text(),
                "connection check failed"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Whether use of the LLM endpoint is sanctioned. Identified by
    /// `endpoint_identifier`, or else by the request headers.
    pub async fn check_usage(
        &self,
        endpoint_identifier: Option<&str>,
        headers: Option<&[(String, String)]>,
        llm_api_provider: Option<&str>,
        cache: bool,
    ) -> Result<bool> {
        let body = match (endpoint_identifier.filter(|id| !id.is_empty()), headers) {
            (Some(id), _) => json!({ "endpoint_identifier": id }),
            (None, Some(headers)) => {
                let header_map: Map<String, Value> = headers
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                json!({
                    "llm_api_request": {
                        "provider": self.provider(llm_api_provider),
                        "request_headers": header_map,
                    }
                })
            }
            (None, None) => {
                tracing::warn!("invalid endpoint info for usage check");
                return Ok(false);
            }
        };

        let reply = self
            .api
            .request(USAGE_ENDPOINT, HttpMethod::Post, Some(body), Some(CHECK_TIMEOUT), cache)
            .await?;
        if !reply.is_success() {
            return Ok(true);
        }
        let sanctioned = reply
            .json::<Value>()
            .ok()
            .and_then(|v| v.get("sanctioned").and_then(Value::as_bool))
            .unwrap_or(true);
        Ok(sanctioned)
    }

    fn base_body(&self, flow: &FlowInfo) -> Map<String, Value> {
        let mut body = flow.url_fields();
        body.insert("method".into(), json!(flow.method));
        body.insert("client_ip".into(), json!(flow.client_ip));
        body.insert("client_port".into(), json!(flow.client_port));
        body.insert("start_time".into(), json!(flow.start_time));
        if let Some(customer_id) = &self.config().customer_id {
            body.insert("customer_id".into(), json!(customer_id));
        }
        body
    }

    /// Send an LLM request payload for processing. Failures of any kind are
    /// logged and yield `None`, leaving the caller's payload untouched.
    pub async fn process_request(&self, req: ProcessRequest) -> Option<ProcessResult> {
        let mut body = self.base_body(&req.flow);
        body.insert("original_request_body".into(), json!(req.body));
        body.insert("completion_request_id".into(), json!(req.request_id));
        body.insert("headers".into(), json!(req.headers));
        body.insert("endpoint_identifier".into(), json!(req.endpoint_identifier));

        let endpoint = ChatEndpoint::ProcessInput {
            provider: self.provider(req.flow.llm_api_provider.as_deref()),
        };
        self.process(&endpoint, PayloadKind::Input, Value::Object(body))
            .await
    }

    /// Send an LLM response payload for processing; see [`process_request`](Self::process_request).
    pub async fn process_response(&self, req: ProcessResponse) -> Option<ProcessResult> {
        let mut body = self.base_body(&req.flow);
        body.insert("original_response_body".into(), json!(req.body));
        body.insert("original_request_body".into(), json!(req.original_request_input));
        body.insert("completion_request_id".into(), json!(req.request_id));
        body.insert("headers".into(), json!(req.request_headers));
        body.insert("response_headers".into(), json!(req.response_headers));
        body.insert("endpoint_identifier".into(), json!(req.endpoint_identifier));

        let endpoint = ChatEndpoint::ProcessOutput {
            provider: self.provider(req.flow.llm_api_provider.as_deref()),
        };
        self.process(&endpoint, PayloadKind::Output, Value::Object(body))
            .await
    }

    async fn process(
        &self,
        endpoint: &ChatEndpoint,
        kind: PayloadKind,
        body: Value,
    ) -> Option<ProcessResult> {
        let reply = match self.chat(endpoint, Some(body), None, false).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    payload = kind.as_str(),
                    "failed to call control plane processing API"
                );
                return None;
            }
        };
        if !reply.is_success() {
            tracing::warn!(
                status = reply.status.as_u16(),
                body = %reply.text(),
                payload = kind.as_str(),
                "control plane processing API unsuccessful"
            );
            return None;
        }
        tracing::debug!(reply = %reply.text(), "control plane replied");

        match parse_process_reply(&reply, kind) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    payload = kind.as_str(),
                    "failed to parse control plane processing response"
                );
                None
            }
        }
    }

    /// Validate (optionally) and then process a prompt or a completion.
    pub async fn process_prompt(&self, req: PromptRequest) -> Result<Option<ProcessResult>> {
        let mut headers = req
            .headers
            .clone()
            .unwrap_or_else(|| vec![("Content-Type".to_string(), "application/json".to_string())]);
        if !req.quick_response {
            headers.push((NO_CACHE_HEADER.0.to_string(), NO_CACHE_HEADER.1.to_string()));
        }
        let cache = req.quick_response;
        let provider = req.llm_api_provider.as_deref();

        match req.validation {
            Validation::Usage => {
                let sanctioned = self
                    .check_usage(
                        Some(req.endpoint_identifier.as_str()),
                        Some(headers.as_slice()),
                        provider,
                        cache,
                    )
                    .await?;
                if !sanctioned {
                    return Ok(Some(ProcessResult {
                        content: String::new(),
                        status_code: StatusCode::FORBIDDEN.as_u16(),
                        message: Some("Unsanctioned endpoint".to_string()),
                    }));
                }
            }
            Validation::Connection => {
                let connected = self
                    .check_connection(&req.endpoint_identifier, provider, &headers, cache)
                    .await?;
                if !connected {
                    return Ok(None);
                }
            }
            Validation::None => {}
        }

        let flow = match &req.llm_api_provider {
            Some(p) => FlowInfo::default().with_provider(p),
            None => FlowInfo::default(),
        };

        let result = match req.prompt_output {
            None => {
                self.process_request(
                    ProcessRequest::new(req.prompt_input, req.request_id, req.endpoint_identifier)
                        .with_headers(headers)
                        .with_flow(flow),
                )
                .await
            }
            Some(output) => {
                self.process_response(
                    ProcessResponse::new(
                        output,
                        req.prompt_input,
                        req.request_id,
                        req.endpoint_identifier,
                    )
                    .with_request_headers(headers)
                    .with_flow(flow),
                )
                .await
            }
        };
        Ok(result)
    }

    /// Summary of what the control plane did for one request session.
    pub async fn get_processed_traces(&self, request_id: &str) -> Option<ProcessResult> {
        let endpoint = ChatEndpoint::Session {
            request_id: request_id.to_string(),
        };
        let reply = match self.chat(&endpoint, None, None, false).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, request_id, "failed to query session");
                return None;
            }
        };
        if !reply.is_success() {
            tracing::warn!(status = reply.status.as_u16(), request_id, "session query unsuccessful");
            return None;
        }
        match reply.json::<Value>() {
            Ok(session) => Some(ProcessResult {
                content: summarize_session(request_id, &session).to_string(),
                status_code: reply.status.as_u16(),
                message: None,
            }),
            Err(e) => {
                tracing::error!(error = %e, "failed to parse session query response");
                None
            }
        }
    }
}

fn parse_process_reply(reply: &ControlResponse, kind: PayloadKind) -> Result<ProcessResult> {
    let parsed: Value = reply.json()?;
    let missing = |field: &str| {
        Error::validation_with_context(
            "missing field in control plane reply",
            ErrorContext::new()
                .with_field_path(field)
                .with_source("rule_processor"),
        )
    };
    let content = match parsed.get(kind.processed_field()) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => return Err(missing(kind.processed_field())),
    };
    let status_code = parsed
        .get("status_code")
        .and_then(Value::as_u64)
        .and_then(|c| u16::try_from(c).ok())
        .ok_or_else(|| missing("status_code"))?;
    let message = parsed
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(ProcessResult {
        content,
        status_code,
        message,
    })
}

fn summarize_session(request_id: &str, session: &Value) -> Value {
    let mut content = json!({
        "id": request_id,
        "llm_provider_name": session.get("llm_provider_name"),
        "llm_model_name": session.get("llm_model_name"),
    });
    for kind in ["input", "output"] {
        let Some(req) = session.get(format!("{kind}_request")).filter(|r| !r.is_null()) else {
            continue;
        };
        let actions: Vec<Value> = req
            .get(format!("{kind}_actions"))
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .map(|action| action.get("action_json").cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .unwrap_or_default();
        content[format!("{kind}_process")] = json!({
            "at": req.get("created_at"),
            "actions": actions,
        });
    }
    content
}

/// Cache key for connection and usage checks: the endpoint identifier,
/// else the first API-key-like header, else the raw body.
fn check_cache_key(body: &[u8]) -> Vec<u8> {
    let Ok(parsed) = serde_json::from_slice::<Value>(body) else {
        tracing::debug!("skip body parsing for generating cache key");
        return body.to_vec();
    };
    if let Some(id) = parsed.get("endpoint_identifier").and_then(Value::as_str) {
        return id.as_bytes().to_vec();
    }

    let mut headers = parsed.get("headers").cloned().unwrap_or(Value::Null);
    if is_empty_headers(&headers) {
        headers = parsed
            .pointer("/llm_api_request/request_headers")
            .cloned()
            .unwrap_or(Value::Null);
    }
    if let Value::String(raw) = &headers {
        headers = serde_json::from_str(raw).unwrap_or(Value::Null);
    }
    header_pairs(&headers)
        .into_iter()
        .find(|(name, _)| LLM_API_KEY_PATTERN.is_match(name))
        .map(|(_, value)| value.into_bytes())
        .unwrap_or_else(|| body.to_vec())
}

fn is_empty_headers(headers: &Value) -> bool {
    match headers {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Headers arrive either as an object or as `[name, value]` pairs.
fn header_pairs(headers: &Value) -> Vec<(String, String)> {
    match headers {
        Value::Object(map) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|pair| match pair.as_array().map(Vec::as_slice) {
                Some([Value::String(k), Value::String(v)]) => Some((k.clone(), v.clone())),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn register_cachables(transport: &dyn HttpTransport) {
    transport.register_cachable(
        CachableEndpoint::new(CHECK_CONNECTION_PREFIX, [HttpMethod::Post])
            .with_key_generator(check_cache_key),
        false,
    );
    transport.register_cachable(
        CachableEndpoint::new(USAGE_ENDPOINT, [HttpMethod::Post]).with_key_generator(check_cache_key),
        false,
    );
}

fn start_batcher(
    api: &Arc<ApiClient>,
    settings: BatchSettings,
    runtime: Option<&Handle>,
) -> Result<Option<BatchScheduler<BatchDispatcher>>> {
    if !settings.is_enabled() {
        return Ok(None);
    }
    let handle = match runtime {
        Some(handle) => handle.clone(),
        None => Handle::try_current().map_err(|e| {
            Error::configuration_with_context(
                "batching needs a tokio runtime",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("rule_processor"),
            )
        })?,
    };
    let dispatcher = BatchDispatcher::new(Arc::new(ChatDownstream::new(Arc::clone(api))));
    Ok(Some(BatchScheduler::start(dispatcher, settings, &handle)))
}

/// Builder for [`RuleProcessor`].
#[derive(Default)]
pub struct RuleProcessorBuilder {
    config: Option<ControlConfig>,
    config_builder: ControlConfigBuilder,
    http: Option<HttpSettings>,
    transport: Option<Arc<dyn HttpTransport>>,
    batch: Option<BatchSettings>,
    runtime: Option<Handle>,
}

impl RuleProcessorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a complete configuration; individual `with_api_*` values are then ignored.
    pub fn with_config(mut self, config: ControlConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.with_api_url(url);
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.with_api_key(key);
        self
    }

    pub fn with_customer_id(mut self, id: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.with_customer_id(id);
        self
    }

    pub fn with_llm_api_provider(mut self, provider: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.with_llm_api_provider(provider);
        self
    }

    /// Defaults to [`HttpSettings::from_env`].
    pub fn with_http_settings(mut self, settings: HttpSettings) -> Self {
        self.http = Some(settings);
        self
    }

    /// Replace the `reqwest` transport, e.g. with a test double.
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_batching(mut self, settings: BatchSettings) -> Self {
        self.batch = Some(settings);
        self
    }

    /// Runtime for the batch scheduler; defaults to the current one.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<RuleProcessor> {
        let config = match self.config {
            Some(config) => config,
            None => self.config_builder.build()?,
        };
        let api = match self.transport {
            Some(transport) => ApiClient::new(config, transport),
            None => {
                let settings = self.http.unwrap_or_else(HttpSettings::from_env);
                ApiClient::connect(config, &settings)?
            }
        };
        let mut processor = RuleProcessor::from_api(Arc::new(api));
        processor.runtime = self.runtime;
        if let Some(settings) = self.batch {
            processor.batcher = start_batcher(&processor.api, settings, processor.runtime.as_ref())?;
        }
        Ok(processor)
    }
}
