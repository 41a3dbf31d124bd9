//! Guard Prompt Example
//!
//! Guards one prompt and its completion, then prints the trace:
//! - guard_input with caller-shaped JSON messages
//! - guard_output correlated to the prompt without passing an id
//! - Error::Guardrails on a rejected turn
//!
//! Usage:
//!   ALLTRUE_API_URL=... ALLTRUE_API_KEY=... ALLTRUE_ENDPOINT_IDENTIFIER=... \
//!   cargo run --example guard_prompt

use alltrue_guardrails::guardrails::ChatGuardrails;
use alltrue_guardrails::logging::init_logging;
use alltrue_guardrails::Error;
use serde_json::json;

#[tokio::main]
async fn main() -> alltrue_guardrails::Result<()> {
    init_logging("info");

    let guardrails = ChatGuardrails::builder().build()?;
    let chat_id = uuid::Uuid::new_v4().to_string();

    let prompt = vec![
        json!({"role": "system", "content": "You are a helpful assistant."}),
        json!({"role": "user", "content": "My email is jane@example.com, write me a haiku."}),
    ];
    let guarded = match guardrails.guard_input(&prompt, Some(&chat_id), true).await {
        Ok(guarded) => guarded,
        Err(Error::Guardrails { message }) => {
            println!("prompt rejected: {message}");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    println!("guarded prompt: {}", serde_json::to_string_pretty(&guarded)?);

    let completion = vec![json!({
        "role": "assistant",
        "content": "Quiet inbox waits / jane@example.com hums / spring mail arrives soon",
    })];
    let checked = guardrails
        .guard_output(&guarded, &completion, Some(&chat_id), true)
        .await?;
    println!("guarded completion: {}", serde_json::to_string_pretty(&checked)?);

    if let Some(trace) = guardrails.trace(&chat_id).await? {
        println!("trace: {}", serde_json::to_string_pretty(&trace)?);
    }
    Ok(())
}
