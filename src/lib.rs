//! # alltrue-guardrails
//!
//! 面向 LLM 聊天调用的护栏 SDK：令牌鉴权的控制平面客户端、基于路径的响应缓存与请求微批处理。
//!
//! LLM chat guardrails SDK. Prompts and completions are sent to a remote
//! control plane that validates, rewrites or merely observes them.
//!
//! ## Overview
//!
//! Blocking guard calls wait for the control plane's verdict. Observe calls
//! return immediately and report in the background, where many small calls
//! are coalesced into grouped `/batch/...` requests.
//!
//! ## Key Features
//!
//! - **Guardrails**: [`guardrails::ChatGuardrails`] for input/output guarding and observation
//! - **Rule processing**: [`control::RuleProcessor`] over the chat control-plane endpoints
//! - **Micro-batching**: size/time triggered flushes, grouping and bounded concurrency via [`batch`]
//! - **Token auth**: bearer tokens refreshed on 401/403 with a bounded retry count
//! - **Caching**: path-registered response caching via [`cache`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use alltrue_guardrails::guardrails::ChatGuardrails;
//!
//! #[tokio::main]
//! async fn main() -> alltrue_guardrails::Result<()> {
//!     alltrue_guardrails::logging::init_logging("info");
//!
//!     let guardrails = ChatGuardrails::builder()
//!         .with_api_url("https://api.example.com")
//!         .with_api_key("your-api-key")
//!         .with_endpoint_identifier("endpoint-1")
//!         .build()?;
//!
//!     let prompt = vec!["Hello, how are you?".to_string()];
//!     let guarded = guardrails.guard_input(&prompt, None, true).await?;
//!     println!("{guarded:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`guardrails`] | Chat guardian and OpenAI-shaped guardrails |
//! | [`control`] | Token-gated control-plane client and rule processor |
//! | [`batch`] | Request micro-batching: buffer, scheduler, dispatcher |
//! | [`http`] | Request/response types and the caching HTTP transport |
//! | [`cache`] | Cache backends, keys and the path cache controller |
//! | [`auth`] | Bearer token retrieval |
//! | [`config`] | Environment-backed configuration |
//! | [`runtime`] | Background worker thread for hosts without a runtime |
//! | [`logging`] | `tracing` subscriber setup |

pub mod auth;
pub mod batch;
pub mod cache;
pub mod config;
pub mod control;
pub mod guardrails;
pub mod http;
pub mod logging;
pub mod runtime;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
