//! 聊天护栏模块：对 LLM 输入输出进行阻塞式校验或后台观测。
//!
//! # Chat Guardrails Module
//!
//! High-level entry points for applications that call an LLM directly and
//! want the control plane to validate or observe each conversation turn.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ChatGuardian`] | Blocking `guard_input` / `guard_output` and `trace` |
//! | [`ChatGuardrails`] | OpenAI-shaped payloads plus background `observe_*` and `flush` |
//! | [`GuardableMessage`] | `{content, role}` message sent to the control plane |
//! | [`Guardable`] | Caller message shapes; results come back in the same shape |
//! | [`GuardHooks`] | Serialize messages to a payload and parse them back |
//!
//! ## Example
//!
//! ```rust,no_run
//! use alltrue_guardrails::guardrails::ChatGuardrails;
//!
//! # async fn demo() -> alltrue_guardrails::Result<()> {
//! let guardrails = ChatGuardrails::builder()
//!     .with_api_url("https://api.example.com")
//!     .with_api_key("key")
//!     .with_endpoint_identifier("endpoint-1")
//!     .build()?;
//!
//! let prompt = vec!["What's the weather like?".to_string()];
//! let guarded = guardrails.guard_input(&prompt, None, true).await?;
//! guardrails.observe_output(&guarded, &["Sunny.".to_string()], None)?;
//! guardrails.flush(std::time::Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! A rejected turn surfaces as [`Error::Guardrails`](crate::Error::Guardrails).

mod chat;
mod guardian;
mod message;

pub use chat::{
    openai_completion_hooks, openai_prompt_hooks, ChatGuardrails, ChatGuardrailsBuilder, Executor,
    DEFAULT_FLUSH_TIMEOUT,
};
pub use guardian::{ChatGuardian, REQUEST_ID_CACHE_SIZE};
pub use message::{
    all_blank, message_key, to_messages, DeserializeHook, GuardHooks, Guardable, GuardableMessage,
    SerializeHook,
};
