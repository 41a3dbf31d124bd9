//! 请求批处理模块：将大量小型控制平面调用合并为少量批量调用。
//!
//! # Request Micro-Batching Module
//!
//! Many concurrent observe-path calls are coalesced into fewer network
//! round-trips. Submitted units accumulate in a buffer, are flushed when a
//! size or time trigger fires, get grouped by `(method, endpoint)` and go out
//! as one `/batch/...` call per group.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ResultChannel`] | Single-assignment future the submitter may await |
//! | [`BatchBuffer`] | Pending items with size/time trigger bookkeeping |
//! | [`BatchScheduler`] | Flush loop, concurrency ceiling and graceful drain |
//! | [`BatchDispatcher`] | Groups a cohort and issues one downstream call per group |
//! | [`Downstream`] | Trait for the transport the dispatcher calls into |
//!
//! ## Example
//!
//! ```rust,no_run
//! use alltrue_guardrails::batch::{BatchDispatcher, BatchScheduler, Downstream, SubmittedUnit};
//! use alltrue_guardrails::config::BatchSettings;
//! use alltrue_guardrails::http::HttpMethod;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo(downstream: Arc<dyn Downstream>) {
//! let scheduler = BatchScheduler::start(
//!     BatchDispatcher::new(downstream),
//!     BatchSettings::default(),
//!     &tokio::runtime::Handle::current(),
//! );
//! let ack = scheduler.submit(SubmittedUnit::new(
//!     "/process-input/openai",
//!     HttpMethod::Post,
//!     Some(serde_json::json!({"original_request_body": "{}"})),
//! ));
//! scheduler.stop(Duration::from_secs(5)).await;
//! let _ = ack.await;
//! # }
//! ```
//!
//! ## Delivery
//!
//! Batching is best effort. The dispatcher logs each group's downstream
//! outcome; submitters only learn which batch carried their unit.

mod buffer;
mod channel;
mod dispatch;
mod scheduler;

pub use buffer::{BatchAddResult, BatchBuffer, BatchItem};
pub use channel::{channel, BatchError, Resolver, ResultChannel};
pub use dispatch::{
    batch_path, group_cohort, BatchDispatcher, Dispatched, Downstream, DownstreamCall,
    DownstreamEnvelope, GroupKey, SubBatch, SubmittedUnit, DEFAULT_BATCH_TIMEOUT,
};
pub use scheduler::{BatchProcessor, BatchScheduler, StopOutcome};
