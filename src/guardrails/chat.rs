//! OpenAI-shaped guardrails with a background observe path.

use super::guardian::ChatGuardian;
use super::message::{all_blank, to_messages, GuardHooks, Guardable, GuardableMessage};
use crate::batch::StopOutcome;
use crate::config::{BatchSettings, HttpSettings};
use crate::control::{PromptRequest, RuleProcessor, RuleProcessorBuilder, Validation};
use crate::http::HttpTransport;
use crate::runtime::BackgroundWorker;
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwap;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
const WORKER_NAME: &str = "alltrue-guardrails";
const MODEL: &str = "gpt-4o";

/// `{"model": ..., "messages": [...]}` chat completion requests.
pub fn openai_prompt_hooks() -> GuardHooks {
    GuardHooks::new(
        |messages| Ok(json!({ "model": MODEL, "messages": messages }).to_string()),
        |payload| {
            let parsed: Value = serde_json::from_str(payload)?;
            let messages = parsed
                .get("messages")
                .and_then(Value::as_array)
                .map(|m| GuardableMessage::parse_all(m))
                .unwrap_or_default();
            Ok(messages)
        },
    )
}

/// `chat.completion` objects with one choice per message.
pub fn openai_completion_hooks() -> GuardHooks {
    GuardHooks::new(
        |messages| {
            let created = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            let choices: Vec<Value> = messages
                .iter()
                .enumerate()
                .map(|(index, message)| {
                    json!({ "message": message, "index": index, "finish_reason": "stop" })
                })
                .collect();
            Ok(json!({
                "id": uuid::Uuid::new_v4().to_string(),
                "created": created,
                "object": "chat.completion",
                "model": MODEL,
                "choices": choices,
                "usage": {
                    "prompt_tokens": 0,
                    "completion_tokens": 0,
                    "total_tokens": 0,
                    "completion_tokens_details": {},
                },
            })
            .to_string())
        },
        |payload| {
            let parsed: Value = serde_json::from_str(payload)?;
            let empty = json!({});
            let messages = parsed
                .get("choices")
                .and_then(Value::as_array)
                .map(|choices| {
                    choices
                        .iter()
                        .map(|c| GuardableMessage::parse(c.get("message").unwrap_or(&empty), Some("assistant")))
                        .collect()
                })
                .unwrap_or_default();
            Ok(messages)
        },
    )
}

/// Where observe-path work runs.
pub enum Executor {
    /// The host application's runtime.
    Runtime(Handle),
    /// A dedicated thread, for hosts without a runtime.
    Worker(Arc<BackgroundWorker>),
}

impl Executor {
    pub fn handle(&self) -> &Handle {
        match self {
            Executor::Runtime(handle) => handle,
            Executor::Worker(worker) => worker.handle(),
        }
    }

    /// The current runtime if there is one, else a freshly started worker.
    pub fn detect() -> Result<Self> {
        match Handle::try_current() {
            Ok(handle) => Ok(Executor::Runtime(handle)),
            Err(_) => {
                tracing::info!("no running runtime, a background worker will be used");
                Ok(Executor::Worker(Arc::new(BackgroundWorker::start(WORKER_NAME)?)))
            }
        }
    }
}

/// Chat guardrails for OpenAI-style payloads.
///
/// `guard_*` calls block on the control plane's verdict. `observe_*` calls
/// return at once and report in the background, batched when configured.
pub struct ChatGuardrails {
    guardian: ChatGuardian,
    observing: ArcSwap<RuleProcessor>,
    batch: BatchSettings,
    executor: Executor,
    observers: TaskTracker,
}

impl ChatGuardrails {
    pub fn builder() -> ChatGuardrailsBuilder {
        ChatGuardrailsBuilder::new()
    }

    pub fn guardian(&self) -> &ChatGuardian {
        &self.guardian
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn is_batching(&self) -> bool {
        self.batch.is_enabled()
    }

    /// The processor currently used by `observe_*`.
    pub fn observing_processor(&self) -> Arc<RuleProcessor> {
        self.observing.load_full()
    }

    pub fn register_prompt_hooks(&mut self, hooks: GuardHooks) {
        self.guardian.register_prompt_hooks(hooks);
    }

    pub fn register_completion_hooks(&mut self, hooks: GuardHooks) {
        self.guardian.register_completion_hooks(hooks);
    }

    pub async fn guard_input<T: Guardable>(
        &self,
        messages: &[T],
        chat_id: Option<&str>,
        quick_response: bool,
    ) -> Result<Vec<T>> {
        self.guardian.guard_input(messages, chat_id, quick_response).await
    }

    pub async fn guard_output<P: Guardable, T: Guardable>(
        &self,
        prompt_messages: &[P],
        completion_messages: &[T],
        chat_id: Option<&str>,
        quick_response: bool,
    ) -> Result<Vec<T>> {
        self.guardian
            .guard_output(prompt_messages, completion_messages, chat_id, quick_response)
            .await
    }

    pub async fn trace(&self, chat_id: &str) -> Result<Option<Value>> {
        self.guardian.trace(chat_id).await
    }

    /// Report prompt messages in the background.
    pub fn observe_input<T: Guardable>(&self, messages: &[T], chat_id: Option<&str>) -> Result<()> {
        let prompt = to_messages(messages);
        let request_id = self
            .guardian
            .remember_prompt(&prompt, chat_id.map(str::to_string));
        if all_blank(&prompt) {
            tracing::debug!("skipped observing input");
            return Ok(());
        }

        tracing::debug!(request_id = %request_id, "observing input");
        let request = PromptRequest::input(
            request_id,
            self.guardian.endpoint_identifier(),
            (self.guardian.prompt_hooks().before)(&prompt)?,
        );
        self.observe("observe_input", request);
        Ok(())
    }

    /// Report completion messages in the background.
    pub fn observe_output<P: Guardable, T: Guardable>(
        &self,
        prompt_messages: &[P],
        completion_messages: &[T],
        chat_id: Option<&str>,
    ) -> Result<()> {
        let completion = to_messages(completion_messages);
        if all_blank(&completion) {
            tracing::debug!("skipped observing output");
            return Ok(());
        }
        let prompt = to_messages(prompt_messages);
        let request_id = self.guardian.output_request_id(&prompt, chat_id);

        tracing::debug!(request_id = %request_id, "observing output");
        let request = PromptRequest::output(
            request_id,
            self.guardian.endpoint_identifier(),
            (self.guardian.prompt_hooks().before)(&prompt)?,
            (self.guardian.completion_hooks().before)(&completion)?,
        );
        self.observe("observe_output", request);
        Ok(())
    }

    fn observe(&self, task: &str, request: PromptRequest) {
        let request = request
            .with_validation(Validation::Connection)
            .with_quick_response(false);
        let processor = self.observing.load_full();
        let work = async move { processor.process_prompt(request).await.map(|_| ()) };
        self.spawn(task, work);
    }

    fn spawn<F>(&self, task: &str, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        match &self.executor {
            Executor::Worker(worker) => {
                let token = self.observers.token();
                worker.spawn(task, async move {
                    let _token = token;
                    future.await
                });
            }
            Executor::Runtime(handle) => {
                let task = task.to_string();
                self.observers.spawn_on(
                    async move {
                        match future.await {
                            Ok(()) => tracing::debug!(task = %task, "completed task"),
                            Err(e) => tracing::info!(task = %task, error = %e, "exception observed on task"),
                        }
                    },
                    handle,
                );
            }
        }
    }

    /// Start a fresh batcher with the same settings, then wait for in-flight
    /// observations and drain the previous batcher, all within `timeout`.
    pub async fn flush(&self, timeout: Duration) -> Result<StopOutcome> {
        self.guardian.clear_request_ids();
        let previous = self.restart_batching()?;
        Ok(drain(self.observers.clone(), previous, timeout).await)
    }

    /// [`flush`](Self::flush) for hosts without a runtime. Requires the
    /// background worker executor.
    pub fn flush_blocking(&self, timeout: Duration) -> Result<StopOutcome> {
        let Executor::Worker(worker) = &self.executor else {
            return Err(Error::runtime_with_context(
                "flush_blocking needs the background worker executor",
                ErrorContext::new()
                    .with_details("await flush() on the host runtime instead")
                    .with_source("chat_guardrails"),
            ));
        };
        self.guardian.clear_request_ids();
        let previous = self.restart_batching()?;
        worker.run_blocking(drain(self.observers.clone(), previous, timeout))
    }

    /// Swap in a fresh batcher so new observations never reach the one being
    /// drained. Returns the processor to drain.
    fn restart_batching(&self) -> Result<Arc<RuleProcessor>> {
        let current = self.observing.load_full();
        if !self.batch.is_enabled() {
            return Ok(current);
        }
        let fresh = RuleProcessor::batched_from(&current, self.batch)?;
        Ok(self.observing.swap(Arc::new(fresh)))
    }
}

async fn drain(observers: TaskTracker, processor: Arc<RuleProcessor>, timeout: Duration) -> StopOutcome {
    let deadline = Instant::now() + timeout;
    observers.close();
    if tokio::time::timeout_at(deadline, observers.wait()).await.is_err() {
        tracing::warn!(pending = observers.len(), "observations still running at flush deadline");
    }
    observers.reopen();
    let remaining = deadline.saturating_duration_since(Instant::now());
    processor.close(remaining).await
}

/// Builder for [`ChatGuardrails`]. Batching is off unless configured.
pub struct ChatGuardrailsBuilder {
    processor: RuleProcessorBuilder,
    endpoint_identifier: Option<String>,
    batch: BatchSettings,
    executor: Option<Executor>,
}

impl Default for ChatGuardrailsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatGuardrailsBuilder {
    pub fn new() -> Self {
        Self {
            processor: RuleProcessor::builder().with_llm_api_provider("openai"),
            endpoint_identifier: None,
            batch: BatchSettings::disabled(),
            executor: None,
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.processor = self.processor.with_api_url(url);
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.processor = self.processor.with_api_key(key);
        self
    }

    pub fn with_customer_id(mut self, id: impl Into<String>) -> Self {
        self.processor = self.processor.with_customer_id(id);
        self
    }

    /// Falls back to `ALLTRUE_ENDPOINT_IDENTIFIER`.
    pub fn with_endpoint_identifier(mut self, id: impl Into<String>) -> Self {
        self.endpoint_identifier = Some(id.into());
        self
    }

    pub fn with_http_settings(mut self, settings: HttpSettings) -> Self {
        self.processor = self.processor.with_http_settings(settings);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.processor = self.processor.with_transport(transport);
        self
    }

    /// Batch the observe path; a zero size or queue time leaves it off.
    pub fn with_batching(mut self, settings: BatchSettings) -> Self {
        self.batch = settings;
        self
    }

    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.executor = Some(Executor::Runtime(handle));
        self
    }

    pub fn with_worker(mut self, worker: Arc<BackgroundWorker>) -> Self {
        self.executor = Some(Executor::Worker(worker));
        self
    }

    pub fn build(self) -> Result<ChatGuardrails> {
        let executor = match self.executor {
            Some(executor) => executor,
            None => Executor::detect()?,
        };
        let guard = Arc::new(
            self.processor
                .with_runtime(executor.handle().clone())
                .build()?,
        );
        let observing = if self.batch.is_enabled() {
            tracing::info!(
                batch_size = self.batch.batch_size,
                queue_time_ms = self.batch.queue_time.as_millis() as u64,
                "batching enabled"
            );
            Arc::new(RuleProcessor::batched_from(&guard, self.batch)?)
        } else {
            Arc::clone(&guard)
        };
        let guardian = ChatGuardian::new(guard, self.endpoint_identifier)?;
        let mut guardrails = ChatGuardrails {
            guardian,
            observing: ArcSwap::new(observing),
            batch: self.batch,
            executor,
            observers: TaskTracker::new(),
        };
        guardrails.register_prompt_hooks(openai_prompt_hooks());
        guardrails.register_completion_hooks(openai_completion_hooks());
        Ok(guardrails)
    }
}
