//! Batched Observation Example
//!
//! Observes a burst of chat turns on the background path with batching
//! enabled, then flushes before exit:
//! - ChatGuardrails built with BatchSettings
//! - observe_input / observe_output returning immediately
//! - flush draining the batcher within a deadline
//!
//! Usage:
//!   ALLTRUE_API_URL=... ALLTRUE_API_KEY=... ALLTRUE_ENDPOINT_IDENTIFIER=... \
//!   cargo run --example observe_batched

use alltrue_guardrails::config::BatchSettings;
use alltrue_guardrails::guardrails::ChatGuardrails;
use alltrue_guardrails::logging::init_logging;
use std::time::Duration;

#[tokio::main]
async fn main() -> alltrue_guardrails::Result<()> {
    init_logging("info,alltrue_guardrails=debug");

    let guardrails = ChatGuardrails::builder()
        .with_api_url(std::env::var("ALLTRUE_API_URL").unwrap_or_else(|_| "http://localhost:8000".into()))
        .with_api_key(std::env::var("ALLTRUE_API_KEY").unwrap_or_else(|_| "dummy-app-key".into()))
        .with_batching(BatchSettings::new(5, Duration::from_millis(500)))
        .build()?;

    println!("=== Batched observation ===\n");
    for i in 0..12 {
        let prompt = vec![format!("Question number {i}: what is {i} squared?")];
        let completion = vec![format!("{} squared is {}.", i, i * i)];
        guardrails.observe_input(&prompt, None)?;
        guardrails.observe_output(&prompt, &completion, None)?;
    }
    println!("queued 12 turns, flushing...");

    let outcome = guardrails.flush(Duration::from_secs(5)).await?;
    println!("flush finished: {outcome:?}");
    Ok(())
}
