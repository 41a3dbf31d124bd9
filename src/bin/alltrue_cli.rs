//! alltrue-cli — 控制平面连通性检查、提示处理与会话追踪的命令行工具
//!
//! Usage:
//!   alltrue-cli check-connection <endpoint-id>                    Check the LLM endpoint is reachable
//!   alltrue-cli process-prompt <endpoint-id> <prompt> [completion] Process a prompt (and completion)
//!   alltrue-cli trace <request-id>                                Show what was done for a request

use alltrue_guardrails::control::{PromptRequest, RuleProcessor, Validation};
use alltrue_guardrails::logging::init_logging;
use anyhow::{bail, Context};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("warn");

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "check-connection" => cmd_check_connection(&args[2..]).await,
        "process-prompt" => cmd_process_prompt(&args[2..]).await,
        "trace" => cmd_trace(&args[2..]).await,
        "version" | "--version" | "-V" => {
            cmd_version();
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"alltrue-cli — AllTrue guardrails 命令行工具

USAGE:
    alltrue-cli <COMMAND> [ARGS]

COMMANDS:
    check-connection <endpoint-id>                  Check the LLM endpoint is reachable
    process-prompt <endpoint-id> <prompt> [output]  Validate usage and process a prompt
    trace <request-id>                              Show the processing trace of a request
    version                                         Show version information
    help                                            Show this help message

ENVIRONMENT:
    ALLTRUE_API_URL             Control-plane base URL
    ALLTRUE_API_KEY             API key
    ALLTRUE_CUSTOMER_ID         Customer id (optional)
    CONFIG_LLM_API_PROVIDER     LLM provider, e.g. openai
    CONFIG_HTTP_TIMEOUT         none, default or seconds
    RUST_LOG                    Log filter"#
    );
}

fn cmd_version() {
    println!("alltrue-cli {}", env!("CARGO_PKG_VERSION"));
}

fn processor() -> anyhow::Result<RuleProcessor> {
    RuleProcessor::builder()
        .build()
        .context("failed to configure the control-plane client")
}

async fn cmd_check_connection(args: &[String]) -> anyhow::Result<()> {
    let Some(endpoint_identifier) = args.first() else {
        bail!("usage: alltrue-cli check-connection <endpoint-id>");
    };
    let processor = processor()?;
    let connected = processor
        .check_connection(endpoint_identifier, None, &[], false)
        .await?;
    if connected {
        println!("✓ {endpoint_identifier} is reachable");
        Ok(())
    } else {
        println!("✗ {endpoint_identifier} is not reachable");
        std::process::exit(2);
    }
}

async fn cmd_process_prompt(args: &[String]) -> anyhow::Result<()> {
    let (Some(endpoint_identifier), Some(prompt)) = (args.first(), args.get(1)) else {
        bail!("usage: alltrue-cli process-prompt <endpoint-id> <prompt> [completion]");
    };
    let request_id = uuid::Uuid::new_v4().to_string();
    let prompt_input = json!({ "messages": [{ "role": "user", "content": prompt }] }).to_string();
    let request = match args.get(2) {
        Some(completion) => PromptRequest::output(
            request_id.as_str(),
            endpoint_identifier.as_str(),
            prompt_input,
            json!({ "choices": [{ "message": { "role": "assistant", "content": completion } }] })
                .to_string(),
        ),
        None => PromptRequest::input(request_id.as_str(), endpoint_identifier.as_str(), prompt_input),
    }
    .with_validation(Validation::Usage);

    let processor = processor()?;
    match processor.process_prompt(request).await? {
        Some(result) => {
            println!("request:  {request_id}");
            println!("status:   {}", result.status_code);
            if let Some(message) = &result.message {
                println!("message:  {message}");
            }
            println!("content:  {}", result.content);
            if result.is_rejected() {
                std::process::exit(3);
            }
        }
        None => println!("request {request_id} was not processed (see logs)"),
    }
    Ok(())
}

async fn cmd_trace(args: &[String]) -> anyhow::Result<()> {
    let Some(request_id) = args.first() else {
        bail!("usage: alltrue-cli trace <request-id>");
    };
    let processor = processor()?;
    match processor.get_processed_traces(request_id).await {
        Some(result) => {
            let parsed: serde_json::Value =
                serde_json::from_str(&result.content).context("unexpected trace content")?;
            println!("{}", serde_json::to_string_pretty(&parsed)?);
        }
        None => println!("no trace found for {request_id}"),
    }
    Ok(())
}
