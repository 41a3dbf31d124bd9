//! Guardable message model and hook types.

use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

fn default_role() -> String {
    "user".to_string()
}

/// One chat message as seen by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardableMessage {
    pub content: String,
    #[serde(default = "default_role")]
    pub role: String,
}

impl GuardableMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            role: default_role(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Lenient conversion from arbitrary JSON. Objects contribute their
    /// `content` and `role` fields and ignore the rest; any other value
    /// becomes the content, with `role` applied when given.
    pub fn parse(value: &Value, role: Option<&str>) -> Self {
        match value {
            Value::Object(map) => {
                let content = match map.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                let role = map
                    .get("role")
                    .and_then(Value::as_str)
                    .or(role)
                    .map(str::to_string)
                    .unwrap_or_else(default_role);
                Self { content, role }
            }
            Value::String(s) => Self::new(s.clone()).with_role(role.unwrap_or("user")),
            other => Self::new(other.to_string()).with_role(role.unwrap_or("user")),
        }
    }

    pub fn parse_all(values: &[Value]) -> Vec<Self> {
        values.iter().map(|v| Self::parse(v, None)).collect()
    }

    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// A caller-side message shape. Guarded results come back in the same shape
/// they went in.
pub trait Guardable: Clone + Send + Sync {
    fn to_message(&self) -> GuardableMessage;
    fn from_message(message: GuardableMessage) -> Self;
}

impl Guardable for GuardableMessage {
    fn to_message(&self) -> GuardableMessage {
        self.clone()
    }

    fn from_message(message: GuardableMessage) -> Self {
        message
    }
}

impl Guardable for String {
    fn to_message(&self) -> GuardableMessage {
        GuardableMessage::new(self.clone())
    }

    fn from_message(message: GuardableMessage) -> Self {
        message.content
    }
}

impl Guardable for Value {
    fn to_message(&self) -> GuardableMessage {
        GuardableMessage::parse(self, None)
    }

    fn from_message(message: GuardableMessage) -> Self {
        json!({ "content": message.content, "role": message.role })
    }
}

pub fn to_messages<T: Guardable>(items: &[T]) -> Vec<GuardableMessage> {
    items.iter().map(Guardable::to_message).collect()
}

pub fn all_blank(messages: &[GuardableMessage]) -> bool {
    messages.iter().all(GuardableMessage::is_blank)
}

/// Identity of a conversation turn: SHA-256 over the message contents.
pub fn message_key(messages: &[GuardableMessage]) -> String {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update(message.content.as_bytes());
        hasher.update([0u8]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub type SerializeHook = Arc<dyn Fn(&[GuardableMessage]) -> Result<String> + Send + Sync>;
pub type DeserializeHook = Arc<dyn Fn(&str) -> Result<Vec<GuardableMessage>> + Send + Sync>;

/// Converts messages to the wire payload (`before`) and the processed
/// payload back to messages (`after`).
#[derive(Clone)]
pub struct GuardHooks {
    pub before: SerializeHook,
    pub after: DeserializeHook,
}

impl GuardHooks {
    pub fn new<B, A>(before: B, after: A) -> Self
    where
        B: Fn(&[GuardableMessage]) -> Result<String> + Send + Sync + 'static,
        A: Fn(&str) -> Result<Vec<GuardableMessage>> + Send + Sync + 'static,
    {
        Self {
            before: Arc::new(before),
            after: Arc::new(after),
        }
    }
}

impl Default for GuardHooks {
    /// A plain JSON array of messages.
    fn default() -> Self {
        Self::new(
            |messages| Ok(serde_json::to_string(messages)?),
            |payload| {
                let values: Vec<Value> = serde_json::from_str(payload)?;
                Ok(GuardableMessage::parse_all(&values))
            },
        )
    }
}

impl std::fmt::Debug for GuardHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardHooks").finish_non_exhaustive()
    }
}
