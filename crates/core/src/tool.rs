//! Tool trait: the abstraction over agent capabilities.
//!
//! A tool is a uniform executable unit: it declares its input schema and
//! turns a JSON input into a JSON output. Validation, retry, timeouts and
//! lifecycle events are applied around `execute` by the tool runner in
//! `switchboard-tools`; implementations only do the work.

use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use crate::error::{FieldError, ToolError};
use crate::provider::ToolDefinition;

/// Where a tool call comes from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// The model's tool_call id, when the call came from one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ToolContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }
}

/// Retry and timeout policy applied around a tool's `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOptions {
    /// Extra attempts after the first failure (0 = no retry)
    #[serde(default)]
    pub max_retries: u32,

    /// Base delay; attempt `n` waits `retry_delay_ms * 2^n`
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Abort an attempt after this long
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            timeout_ms: None,
        }
    }
}

impl ToolOptions {
    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "FlightTool").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's input.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Per-tool retry/timeout policy. `None` uses the registry default.
    fn options(&self) -> Option<ToolOptions> {
        None
    }

    /// Execute the tool. `cancel` fires when the attempt times out.
    async fn execute(
        &self,
        input: serde_json::Value,
        context: &ToolContext,
        cancel: CancellationToken,
    ) -> std::result::Result<serde_json::Value, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Serializable description of a failed tool run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    /// "not_found", "validation", "execution", "timeout", "cancelled" or "panicked"
    pub kind: String,

    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl From<&ToolError> for ToolFailure {
    fn from(err: &ToolError) -> Self {
        let kind = match err {
            ToolError::NotFound(_) => "not_found",
            ToolError::Validation(_) => "validation",
            ToolError::ExecutionFailed { .. } => "execution",
            ToolError::Timeout { .. } => "timeout",
            ToolError::Panicked { .. } => "panicked",
        };
        let errors = match err {
            ToolError::Validation(v) => v.errors.clone(),
            _ => Vec::new(),
        };
        Self {
            kind: kind.into(),
            message: err.to_string(),
            errors,
            context: err.context(),
        }
    }
}

/// `{status: success, data}` or `{status: failure, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolOutcome {
    Success { data: serde_json::Value },
    Failure { error: ToolFailure },
}

/// What tool-result handlers receive for every executed tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEnvelope {
    pub tool_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,

    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolResultEnvelope {
    pub fn from_result(
        tool_name: impl Into<String>,
        call_id: Option<String>,
        result: &std::result::Result<serde_json::Value, ToolError>,
    ) -> Self {
        let outcome = match result {
            Ok(data) => ToolOutcome::Success { data: data.clone() },
            Err(e) => ToolOutcome::Failure { error: e.into() },
        };
        Self {
            tool_name: tool_name.into(),
            call_id,
            outcome,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    /// Text form used when the result goes back into the prompt.
    pub fn to_prompt_text(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success { data } => match data {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            ToolOutcome::Failure { error } => format!("Error: {}", error.message),
        }
    }
}
