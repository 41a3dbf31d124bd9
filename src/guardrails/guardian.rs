//! Blocking input/output guard over a [`RuleProcessor`].

use super::message::{all_blank, to_messages, GuardHooks, Guardable, GuardableMessage};
use crate::config::get_value;
use crate::control::{ProcessResult, PromptRequest, RuleProcessor, Validation};
use crate::{Error, Result};
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

/// Request ids remembered between a prompt and its completion.
pub const REQUEST_ID_CACHE_SIZE: usize = 20;

const REJECTED_FALLBACK: &str = "Invalid messages";

/// Guards chat prompts and completions through the control plane.
///
/// `guard_input` records the request id under the prompt's
/// [`message_key`](super::message_key) so a later `guard_output` for the
/// same prompt is correlated without the caller passing the id around.
pub struct ChatGuardian {
    endpoint_identifier: String,
    processor: Arc<RuleProcessor>,
    prompt_hooks: GuardHooks,
    completion_hooks: GuardHooks,
    request_ids: Mutex<LruCache<String, String>>,
}

impl ChatGuardian {
    /// `endpoint_identifier` falls back to `ALLTRUE_ENDPOINT_IDENTIFIER`.
    pub fn new(processor: Arc<RuleProcessor>, endpoint_identifier: Option<String>) -> Result<Self> {
        let endpoint_identifier = match endpoint_identifier.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => get_value("endpoint_identifier", "ALLTRUE")?,
        };
        let capacity = NonZeroUsize::new(REQUEST_ID_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            endpoint_identifier,
            processor,
            prompt_hooks: GuardHooks::default(),
            completion_hooks: GuardHooks::default(),
            request_ids: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Everything from the environment, provider `any`.
    pub fn from_env() -> Result<Self> {
        let processor = RuleProcessor::builder()
            .with_llm_api_provider("any")
            .build()?;
        Self::new(Arc::new(processor), None)
    }

    pub fn endpoint_identifier(&self) -> &str {
        &self.endpoint_identifier
    }

    pub fn processor(&self) -> &Arc<RuleProcessor> {
        &self.processor
    }

    pub fn register_prompt_hooks(&mut self, hooks: GuardHooks) {
        self.prompt_hooks = hooks;
    }

    pub fn register_completion_hooks(&mut self, hooks: GuardHooks) {
        self.completion_hooks = hooks;
    }

    pub fn prompt_hooks(&self) -> &GuardHooks {
        &self.prompt_hooks
    }

    pub fn completion_hooks(&self) -> &GuardHooks {
        &self.completion_hooks
    }

    /// Remember `request_id` (or a fresh one) for this prompt.
    pub(crate) fn remember_prompt(
        &self,
        prompt: &[GuardableMessage],
        request_id: Option<String>,
    ) -> String {
        let request_id = request_id.unwrap_or_else(new_request_id);
        self.request_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(super::message_key(prompt), request_id.clone());
        request_id
    }

    /// Take the id remembered for this prompt, or a fresh one.
    pub(crate) fn take_prompt_id(&self, prompt: &[GuardableMessage]) -> String {
        self.request_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop(&super::message_key(prompt))
            .unwrap_or_else(new_request_id)
    }

    pub(crate) fn clear_request_ids(&self) {
        self.request_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Request id for an output call: explicit, else correlated to the prompt.
    pub(crate) fn output_request_id(&self, prompt: &[GuardableMessage], chat_id: Option<&str>) -> String {
        match chat_id {
            Some(id) => id.to_string(),
            None => self.take_prompt_id(prompt),
        }
    }

    /// Validate prompt messages and return the control plane's version of
    /// them, in the caller's shape. Blank prompts are returned untouched
    /// without a network call. A 401/403 verdict is an
    /// [`Error::Guardrails`].
    pub async fn guard_input<T: Guardable>(
        &self,
        messages: &[T],
        chat_id: Option<&str>,
        quick_response: bool,
    ) -> Result<Vec<T>> {
        let prompt = to_messages(messages);
        let request_id = self.remember_prompt(&prompt, chat_id.map(str::to_string));
        if all_blank(&prompt) {
            return Ok(messages.to_vec());
        }

        let request = PromptRequest::input(
            request_id.as_str(),
            self.endpoint_identifier.as_str(),
            (self.prompt_hooks.before)(&prompt)?,
        )
        .with_validation(Validation::Usage)
        .with_quick_response(quick_response);

        let Some(processed) = self.processor.process_prompt(request).await? else {
            return Ok(messages.to_vec());
        };
        ensure_accepted(&processed)?;

        let guarded = (self.prompt_hooks.after)(&processed.content)?;
        // Re-key under the processed prompt so guard_output can find it.
        self.remember_prompt(&guarded, Some(request_id));
        Ok(guarded.into_iter().map(T::from_message).collect())
    }

    /// Validate completion messages alongside their prompt.
    pub async fn guard_output<P: Guardable, T: Guardable>(
        &self,
        prompt_messages: &[P],
        completion_messages: &[T],
        chat_id: Option<&str>,
        quick_response: bool,
    ) -> Result<Vec<T>> {
        let completion = to_messages(completion_messages);
        if all_blank(&completion) {
            return Ok(completion_messages.to_vec());
        }
        let prompt = to_messages(prompt_messages);
        let request_id = self.output_request_id(&prompt, chat_id);

        let request = PromptRequest::output(
            request_id,
            self.endpoint_identifier.as_str(),
            (self.prompt_hooks.before)(&prompt)?,
            (self.completion_hooks.before)(&completion)?,
        )
        .with_validation(Validation::Usage)
        .with_quick_response(quick_response);

        let Some(processed) = self.processor.process_prompt(request).await? else {
            return Ok(completion_messages.to_vec());
        };
        ensure_accepted(&processed)?;

        let guarded = (self.completion_hooks.after)(&processed.content)?;
        Ok(guarded.into_iter().map(T::from_message).collect())
    }

    /// What the control plane recorded for `chat_id`, if anything.
    pub async fn trace(&self, chat_id: &str) -> Result<Option<Value>> {
        match self.processor.get_processed_traces(chat_id).await {
            Some(result) if (200..300).contains(&result.status_code) => {
                Ok(Some(serde_json::from_str(&result.content)?))
            }
            _ => Ok(None),
        }
    }
}

fn ensure_accepted(result: &ProcessResult) -> Result<()> {
    if result.is_rejected() {
        let message = result
            .message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| REJECTED_FALLBACK.to_string());
        tracing::info!(status = result.status_code, %message, "guardrails rejected messages");
        return Err(Error::guardrails(message));
    }
    Ok(())
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
