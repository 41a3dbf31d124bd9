//! Mock control plane setup for integration tests

use alltrue_guardrails::auth::TOKEN_ENDPOINT;
use alltrue_guardrails::config::HttpSettings;
use alltrue_guardrails::control::{RuleProcessor, RuleProcessorBuilder};
use alltrue_guardrails::guardrails::{ChatGuardrails, ChatGuardrailsBuilder};
use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::Value;

pub const API_KEY: &str = "dummy-app-key";
pub const TOKEN: &str = "tok-1";
pub const CUSTOMER_ID: &str = "customer-id";
pub const ENDPOINT_ID: &str = "endpoint-1";

/// Test fixture that manages a mock server
pub struct MockServerFixture {
    pub server: ServerGuard,
    pub base_url: String,
}

impl MockServerFixture {
    pub async fn new() -> Self {
        let server = Server::new_async().await;
        let base_url = server.url();
        Self { server, base_url }
    }

    /// For tests that run outside any tokio runtime.
    pub fn new_blocking() -> Self {
        let server = Server::new();
        let base_url = server.url();
        Self { server, base_url }
    }

    /// Processor builder pointed at the mock server, provider `openai`.
    pub fn processor(&self) -> RuleProcessorBuilder {
        RuleProcessor::builder()
            .with_api_url(&self.base_url)
            .with_api_key(API_KEY)
            .with_customer_id(CUSTOMER_ID)
            .with_llm_api_provider("openai")
            .with_http_settings(HttpSettings::default())
    }

    pub fn guardrails(&self) -> ChatGuardrailsBuilder {
        ChatGuardrails::builder()
            .with_api_url(&self.base_url)
            .with_api_key(API_KEY)
            .with_endpoint_identifier(ENDPOINT_ID)
            .with_http_settings(HttpSettings::default())
    }

    /// Token endpoint issuing [`TOKEN`], expected exactly `hits` times.
    pub async fn mock_token(&mut self, hits: usize) -> Mock {
        self.server
            .mock("POST", TOKEN_ENDPOINT)
            .match_body(Matcher::Json(serde_json::json!({ "api_key": API_KEY })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(r#"{{"access_token":"{TOKEN}"}}"#))
            .expect(hits)
            .create_async()
            .await
    }

    /// Create a mock for a JSON response to an authorized call
    pub async fn mock_json_response(
        &mut self,
        method: &str,
        path: &str,
        status: u16,
        body: Value,
    ) -> Mock {
        self.server
            .mock(method, path)
            .match_header("authorization", format!("Bearer {TOKEN}").as_str())
            .with_status(status.into())
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await
    }
}
