//! Direct (non-batched) rule processor calls

use super::mock_server::{MockServerFixture, CUSTOMER_ID, ENDPOINT_ID, TOKEN};
use alltrue_guardrails::control::{
    ProcessRequest, ProcessResponse, PromptRequest, Validation, CHECK_CONNECTION_PREFIX,
    TOKEN_RETRIES_EXHAUSTED, USAGE_ENDPOINT,
};
use alltrue_guardrails::http::HttpMethod;
use mockito::Matcher;
use serde_json::json;

const PROCESS_INPUT: &str = "/v1/llm-firewall/chat/process-input/openai";
const PROCESS_OUTPUT: &str = "/v1/llm-firewall/chat/process-output/openai";

#[tokio::test]
async fn test_process_request_round_trip() {
    let mut fixture = MockServerFixture::new().await;
    let token = fixture.mock_token(1).await;
    let process = fixture
        .server
        .mock("POST", PROCESS_INPUT)
        .match_header("authorization", format!("Bearer {TOKEN}").as_str())
        .match_body(Matcher::PartialJson(json!({
            "completion_request_id": "r-1",
            "endpoint_identifier": ENDPOINT_ID,
            "customer_id": CUSTOMER_ID,
            "original_request_body": "{\"messages\":[]}",
            "method": "POST",
            "client_ip": "192.0.2.0",
        })))
        .with_status(200)
        .with_body(
            json!({
                "processed_input": "{\"messages\":[\"redacted\"]}",
                "status_code": 200,
                "message": "ok",
            })
            .to_string(),
        )
        .expect(2)
        .create_async()
        .await;

    let processor = fixture.processor().build().unwrap();
    for _ in 0..2 {
        let result = processor
            .process_request(ProcessRequest::new("{\"messages\":[]}", "r-1", ENDPOINT_ID))
            .await
            .expect("processed");
        assert_eq!(result.content, "{\"messages\":[\"redacted\"]}");
        assert_eq!(result.status_code, 200);
        assert_eq!(result.message.as_deref(), Some("ok"));
    }

    process.assert_async().await;
    // Second call reuses the cached token.
    token.assert_async().await;
}

#[tokio::test]
async fn test_process_response_failure_is_none() {
    let mut fixture = MockServerFixture::new().await;
    let _token = fixture.mock_token(1).await;
    let _process = fixture
        .mock_json_response("POST", PROCESS_OUTPUT, 500, json!({"detail": "boom"}))
        .await;

    let processor = fixture.processor().build().unwrap();
    let result = processor
        .process_response(ProcessResponse::new("{}", "{}", "r-2", ENDPOINT_ID))
        .await;
    assert!(result.is_none());
}

#[tokio::test]
async fn test_unparsable_reply_is_none() {
    let mut fixture = MockServerFixture::new().await;
    let _token = fixture.mock_token(1).await;
    let _process = fixture
        .mock_json_response("POST", PROCESS_INPUT, 200, json!({"status_code": 200}))
        .await;

    let processor = fixture.processor().build().unwrap();
    let result = processor
        .process_request(ProcessRequest::new("{}", "r-3", ENDPOINT_ID))
        .await;
    assert!(result.is_none());
}

#[tokio::test]
async fn test_token_refresh_retries_are_bounded() {
    let mut fixture = MockServerFixture::new().await;
    let token = fixture.mock_token(3).await;
    let process = fixture
        .server
        .mock("POST", PROCESS_INPUT)
        .with_status(401)
        .with_body("expired")
        .expect(3)
        .create_async()
        .await;

    let processor = fixture.processor().build().unwrap();
    let reply = processor
        .api()
        .chat("/process-input/openai", HttpMethod::Post, Some(json!({})), None, false)
        .await
        .unwrap();
    assert_eq!(reply.status.as_u16(), 401);
    assert_eq!(reply.text(), TOKEN_RETRIES_EXHAUSTED);

    token.assert_async().await;
    process.assert_async().await;
}

#[tokio::test]
async fn test_check_connection_is_cached() {
    let mut fixture = MockServerFixture::new().await;
    let _token = fixture.mock_token(1).await;
    let check = fixture
        .server
        .mock("POST", format!("{CHECK_CONNECTION_PREFIX}openai").as_str())
        .match_body(Matcher::PartialJson(json!({"endpoint_identifier": ENDPOINT_ID})))
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let processor = fixture.processor().build().unwrap();
    assert!(processor.check_connection(ENDPOINT_ID, None, &[], true).await.unwrap());
    assert!(processor.check_connection(ENDPOINT_ID, None, &[], true).await.unwrap());
    check.assert_async().await;
}

#[tokio::test]
async fn test_check_connection_failure() {
    let mut fixture = MockServerFixture::new().await;
    let _token = fixture.mock_token(1).await;
    let _check = fixture
        .mock_json_response(
            "POST",
            &format!("{CHECK_CONNECTION_PREFIX}openai"),
            404,
            json!({"detail": "unknown endpoint"}),
        )
        .await;

    let processor = fixture.processor().build().unwrap();
    assert!(!processor.check_connection(ENDPOINT_ID, None, &[], false).await.unwrap());
}

#[tokio::test]
async fn test_unsanctioned_prompt_is_rejected_without_processing() {
    let mut fixture = MockServerFixture::new().await;
    let _token = fixture.mock_token(1).await;
    let _usage = fixture
        .mock_json_response("POST", USAGE_ENDPOINT, 200, json!({"sanctioned": false}))
        .await;
    let process = fixture
        .server
        .mock("POST", PROCESS_INPUT)
        .expect(0)
        .create_async()
        .await;

    let processor = fixture.processor().build().unwrap();
    let result = processor
        .process_prompt(
            PromptRequest::input("r-4", ENDPOINT_ID, "{}").with_validation(Validation::Usage),
        )
        .await
        .unwrap()
        .expect("rejection result");
    assert_eq!(result.status_code, 403);
    assert!(result.is_rejected());
    assert_eq!(result.message.as_deref(), Some("Unsanctioned endpoint"));
    process.assert_async().await;
}

#[tokio::test]
async fn test_slow_response_marks_no_cache() {
    let mut fixture = MockServerFixture::new().await;
    let _token = fixture.mock_token(1).await;
    let process = fixture
        .server
        .mock("POST", PROCESS_INPUT)
        .match_body(Matcher::PartialJson(json!({
            "headers": [
                ["Content-Type", "application/json"],
                ["x-alltrue-llm-cache-control", "no-cache"],
            ],
        })))
        .with_status(200)
        .with_body(json!({"processed_input": "{}", "status_code": 200}).to_string())
        .expect(1)
        .create_async()
        .await;

    let processor = fixture.processor().build().unwrap();
    let result = processor
        .process_prompt(PromptRequest::input("r-5", ENDPOINT_ID, "{}").with_quick_response(false))
        .await
        .unwrap();
    assert_eq!(result.map(|r| r.status_code), Some(200));
    process.assert_async().await;
}

#[tokio::test]
async fn test_processed_traces_summary() {
    let mut fixture = MockServerFixture::new().await;
    let _token = fixture.mock_token(1).await;
    let _session = fixture
        .mock_json_response(
            "GET",
            "/v1/llm-firewall/chat/session/r-6",
            200,
            json!({
                "llm_provider_name": "openai",
                "llm_model_name": "gpt-4o",
                "input_request": {
                    "created_at": "2025-01-01T00:00:00Z",
                    "input_actions": [{"action_json": {"action": "redact"}}],
                },
            }),
        )
        .await;

    let processor = fixture.processor().build().unwrap();
    let trace = processor.get_processed_traces("r-6").await.expect("trace");
    let content: serde_json::Value = serde_json::from_str(&trace.content).unwrap();
    assert_eq!(content["id"], json!("r-6"));
    assert_eq!(content["llm_model_name"], json!("gpt-4o"));
    assert_eq!(content["input_process"]["actions"], json!([{"action": "redact"}]));
}
