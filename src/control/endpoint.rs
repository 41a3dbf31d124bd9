use crate::http::{ControlResponse, HttpMethod};
use reqwest::StatusCode;
use serde_json::{json, Value};

/// Which half of a chat exchange a processing call carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Input,
    Output,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Input => "input",
            PayloadKind::Output => "output",
        }
    }

    /// Field of the control-plane reply holding the processed payload.
    pub fn processed_field(&self) -> &'static str {
        match self {
            PayloadKind::Input => "processed_input",
            PayloadKind::Output => "processed_output",
        }
    }

    /// Field of the request body holding the raw payload.
    pub fn original_field(&self) -> &'static str {
        match self {
            PayloadKind::Input => "original_request_body",
            PayloadKind::Output => "original_response_body",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Observe-path processing; may go through the batcher.
    Batchable(PayloadKind),
    /// Always called directly.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEndpoint {
    ProcessInput { provider: String },
    ProcessOutput { provider: String },
    CheckConnection { provider: String },
    Session { request_id: String },
}

impl ChatEndpoint {
    /// Path relative to the chat API prefix.
    pub fn path(&self) -> String {
        match self {
            ChatEndpoint::ProcessInput { provider } => format!("/process-input/{provider}"),
            ChatEndpoint::ProcessOutput { provider } => format!("/process-output/{provider}"),
            ChatEndpoint::CheckConnection { provider } => format!("/check-connection/{provider}"),
            ChatEndpoint::Session { request_id } => format!("/session/{request_id}"),
        }
    }

    pub fn method(&self) -> HttpMethod {
        match self {
            ChatEndpoint::Session { .. } => HttpMethod::Get,
            _ => HttpMethod::Post,
        }
    }

    pub fn kind(&self) -> EndpointKind {
        match self {
            ChatEndpoint::ProcessInput { .. } => EndpointKind::Batchable(PayloadKind::Input),
            ChatEndpoint::ProcessOutput { .. } => EndpointKind::Batchable(PayloadKind::Output),
            ChatEndpoint::CheckConnection { .. } | ChatEndpoint::Session { .. } => {
                EndpointKind::Direct
            }
        }
    }
}

/// The 200 reply handed back for a batched call: the original payload,
/// unchanged, under `processed_{input|output}`.
pub fn optimistic_echo(kind: PayloadKind, body: Option<&Value>) -> ControlResponse {
    let processed = match body.and_then(|b| b.get(kind.original_field())) {
        Some(Value::String(raw)) if raw.is_empty() => json!({}),
        Some(Value::String(raw)) => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        }
        Some(Value::Null) | None => json!({}),
        Some(other) => other.clone(),
    };
    ControlResponse::json_body(
        StatusCode::OK,
        &json!({
            "status_code": StatusCode::OK.as_u16(),
            kind.processed_field(): processed,
            "message": "Request batched",
        }),
    )
}
