//! Retry, timeout and panic capture around a single tool.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use futures::FutureExt;
use serde_json::Value;
use switchboard_core::error::ToolError;
use switchboard_core::event::ToolEvent;
use switchboard_core::tool::{Tool, ToolContext, ToolOptions};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Execute `tool` until it succeeds, fails with a non-retryable error, or
/// `options.max_retries` retries are used up. Before retry `n` (0-based) the
/// runner sleeps `retry_delay * 2^n`.
pub async fn run_with_policy<F>(
    tool: &dyn Tool,
    input: Value,
    context: &ToolContext,
    options: &ToolOptions,
    publish: F,
) -> Result<Value, ToolError>
where
    F: Fn(ToolEvent),
{
    let name = tool.name().to_string();
    let mut attempt = 0u32;

    loop {
        publish(ToolEvent::Started {
            tool_name: name.clone(),
            input: input.clone(),
            context: context.clone(),
            attempt,
        });

        let started = Instant::now();
        match run_once(tool, input.clone(), context, options).await {
            Ok(output) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                debug!(tool = %name, attempt, duration_ms, "Tool succeeded");
                publish(ToolEvent::Succeeded {
                    tool_name: name,
                    input,
                    context: context.clone(),
                    output: output.clone(),
                    attempt,
                    duration_ms,
                });
                return Ok(output);
            }
            Err(err) => {
                let retry = err.is_retryable() && attempt < options.max_retries;
                publish(ToolEvent::Failed {
                    tool_name: name.clone(),
                    input: input.clone(),
                    context: context.clone(),
                    error: err.to_string(),
                    attempt,
                    retryable: retry,
                });
                if !retry {
                    warn!(tool = %name, attempt, error = %err, "Tool failed");
                    return Err(err);
                }

                let delay = options.backoff(attempt);
                warn!(
                    tool = %name,
                    attempt = attempt + 1,
                    max_retries = options.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying tool after error"
                );
                publish(ToolEvent::Retrying {
                    tool_name: name.clone(),
                    input: input.clone(),
                    context: context.clone(),
                    error: err.to_string(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn run_once(
    tool: &dyn Tool,
    input: Value,
    context: &ToolContext,
    options: &ToolOptions,
) -> Result<Value, ToolError> {
    let cancel = CancellationToken::new();
    let execution = AssertUnwindSafe(tool.execute(input, context, cancel.clone())).catch_unwind();

    let outcome = match options.timeout() {
        Some(limit) => match tokio::time::timeout(limit, execution).await {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.cancel();
                return Err(ToolError::Timeout {
                    tool_name: tool.name().to_string(),
                    timeout_ms: limit.as_millis() as u64,
                });
            }
        },
        None => execution.await,
    };

    outcome.unwrap_or_else(|panic| {
        Err(ToolError::Panicked {
            tool_name: tool.name().to_string(),
            message: panic_message(panic.as_ref()),
        })
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
