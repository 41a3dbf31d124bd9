//! Observe-path batching over HTTP

use super::mock_server::{MockServerFixture, CUSTOMER_ID, ENDPOINT_ID};
use alltrue_guardrails::batch::StopOutcome;
use alltrue_guardrails::config::BatchSettings;
use alltrue_guardrails::control::{FlowInfo, ProcessRequest, ProcessResponse};
use mockito::Matcher;
use serde_json::{json, Value};
use std::time::Duration;

const BATCH_INPUT: &str = "/v1/llm-firewall/chat/batch/process-input/openai";
const BATCH_OUTPUT: &str = "/v1/llm-firewall/chat/batch/process-output/openai";

fn flow() -> FlowInfo {
    FlowInfo::default().with_start_time(1.5)
}

fn prompt(i: usize) -> String {
    json!({"messages": [{"role": "user", "content": format!("hi {i}")}]}).to_string()
}

/// The wire body `process_request` builds for [`flow`].
fn input_body(i: usize) -> Value {
    json!({
        "url": "https://httpbin.org",
        "host": "httpbin.org",
        "port": 443,
        "scheme": "https",
        "method": "POST",
        "client_ip": "192.0.2.0",
        "client_port": 0,
        "start_time": 1.5,
        "customer_id": CUSTOMER_ID,
        "original_request_body": prompt(i),
        "completion_request_id": format!("r-{i}"),
        "headers": [],
        "endpoint_identifier": ENDPOINT_ID,
    })
}

fn output_body(i: usize) -> Value {
    json!({
        "url": "https://httpbin.org",
        "host": "httpbin.org",
        "port": 443,
        "scheme": "https",
        "method": "POST",
        "client_ip": "192.0.2.0",
        "client_port": 0,
        "start_time": 1.5,
        "customer_id": CUSTOMER_ID,
        "original_response_body": "{\"choices\":[]}",
        "original_request_body": prompt(i),
        "completion_request_id": format!("r-{i}"),
        "headers": [],
        "response_headers": [],
        "endpoint_identifier": ENDPOINT_ID,
    })
}

#[tokio::test]
async fn test_size_trigger_sends_one_grouped_call() {
    let mut fixture = MockServerFixture::new().await;
    let _token = fixture.mock_token(1).await;
    let batch = fixture
        .server
        .mock("POST", BATCH_INPUT)
        .match_body(Matcher::Json(json!({
            "requests": [input_body(0), input_body(1), input_body(2)],
        })))
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let processor = fixture
        .processor()
        .with_batching(BatchSettings::new(3, Duration::from_secs(30)))
        .build()
        .unwrap();
    assert!(processor.is_batching());

    for i in 0..3 {
        let echo = processor
            .process_request(
                ProcessRequest::new(prompt(i), format!("r-{i}"), ENDPOINT_ID).with_flow(flow()),
            )
            .await
            .expect("optimistic echo");
        assert_eq!(echo.status_code, 200);
        assert_eq!(echo.message.as_deref(), Some("Request batched"));
        let content: Value = serde_json::from_str(&echo.content).unwrap();
        let original: Value = serde_json::from_str(&prompt(i)).unwrap();
        assert_eq!(content, original);
    }

    assert_eq!(processor.close(Duration::from_secs(5)).await, StopOutcome::Drained);
    assert!(!processor.is_running());
    batch.assert_async().await;
}

#[tokio::test]
async fn test_cohort_is_split_by_endpoint() {
    let mut fixture = MockServerFixture::new().await;
    let _token = fixture.mock_token(1).await;
    let inputs = fixture
        .server
        .mock("POST", BATCH_INPUT)
        .match_body(Matcher::Json(json!({"requests": [input_body(0), input_body(2)]})))
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;
    let outputs = fixture
        .server
        .mock("POST", BATCH_OUTPUT)
        .match_body(Matcher::Json(json!({"requests": [output_body(1)]})))
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let processor = fixture
        .processor()
        .with_batching(BatchSettings::new(10, Duration::from_secs(30)))
        .build()
        .unwrap();

    processor
        .process_request(ProcessRequest::new(prompt(0), "r-0", ENDPOINT_ID).with_flow(flow()))
        .await
        .expect("echo");
    processor
        .process_response(
            ProcessResponse::new("{\"choices\":[]}", prompt(1), "r-1", ENDPOINT_ID).with_flow(flow()),
        )
        .await
        .expect("echo");
    processor
        .process_request(ProcessRequest::new(prompt(2), "r-2", ENDPOINT_ID).with_flow(flow()))
        .await
        .expect("echo");

    // Nothing is due yet; closing drains the partial cohort.
    assert_eq!(processor.close(Duration::from_secs(5)).await, StopOutcome::Drained);
    inputs.assert_async().await;
    outputs.assert_async().await;
}

#[tokio::test]
async fn test_time_trigger_flushes_partial_batch() {
    let mut fixture = MockServerFixture::new().await;
    let _token = fixture.mock_token(1).await;
    let batch = fixture
        .server
        .mock("POST", BATCH_INPUT)
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let processor = fixture
        .processor()
        .with_batching(BatchSettings::new(10, Duration::from_millis(100)))
        .build()
        .unwrap();
    processor
        .process_request(ProcessRequest::new(prompt(0), "r-0", ENDPOINT_ID))
        .await
        .expect("echo");

    tokio::time::sleep(Duration::from_millis(600)).await;
    batch.assert_async().await;
    assert_eq!(processor.close(Duration::from_secs(1)).await, StopOutcome::Drained);
}

#[tokio::test]
async fn test_downstream_errors_do_not_reach_callers() {
    let mut fixture = MockServerFixture::new().await;
    let _token = fixture.mock_token(1).await;
    let batch = fixture
        .server
        .mock("POST", BATCH_INPUT)
        .with_status(502)
        .with_body("bad gateway")
        .expect(1)
        .create_async()
        .await;

    let processor = fixture
        .processor()
        .with_batching(BatchSettings::new(2, Duration::from_secs(30)))
        .build()
        .unwrap();
    for i in 0..2 {
        let echo = processor
            .process_request(ProcessRequest::new(prompt(i), format!("r-{i}"), ENDPOINT_ID))
            .await;
        assert_eq!(echo.map(|r| r.status_code), Some(200));
    }
    assert_eq!(processor.close(Duration::from_secs(5)).await, StopOutcome::Drained);
    batch.assert_async().await;
}
