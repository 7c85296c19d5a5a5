//! Error types for the Switchboard domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all Switchboard operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model transport errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Classification errors ---
    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    // --- Configuration errors (fatal, construction time) ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a fatal misconfiguration.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures talking to the model. Recovered by the agent's transport error
/// handler; a turn never aborts because of one.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),
}

/// A single schema violation, addressed by field path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Dotted path to the offending field (`""` for the root value)
    pub field: String,

    /// What is wrong with it
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.field.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Tool input rejected by the tool's schema. Never retried.
#[derive(Debug, Clone, Error)]
#[error("invalid input for {tool_name}: {}", join_errors(.errors))]
pub struct ValidationError {
    pub tool_name: String,
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Tool execution failed: {tool_name}: {message}")]
    ExecutionFailed {
        tool_name: String,
        message: String,
        context: serde_json::Map<String, serde_json::Value>,
    },

    #[error("Tool timed out: {tool_name} after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Tool panicked: {tool_name}: {message}")]
    Panicked { tool_name: String, message: String },
}

impl ToolError {
    /// Build an execution failure with an empty context map.
    pub fn failed(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            tool_name: tool_name.into(),
            message: message.into(),
            context: serde_json::Map::new(),
        }
    }

    /// Only execution-side failures are retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::NotFound(_))
    }

    /// Free-form context attached to the failure.
    pub fn context(&self) -> serde_json::Map<String, serde_json::Value> {
        match self {
            Self::ExecutionFailed { context, .. } => context.clone(),
            Self::Validation(v) => {
                let mut map = serde_json::Map::new();
                map.insert(
                    "errors".into(),
                    serde_json::to_value(&v.errors).unwrap_or_default(),
                );
                map
            }
            Self::Timeout { timeout_ms, .. } => {
                let mut map = serde_json::Map::new();
                map.insert("timeout_ms".into(), (*timeout_ms).into());
                map
            }
            _ => serde_json::Map::new(),
        }
    }
}

/// The model's finished text did not have the expected structure.
#[derive(Debug, Clone, Error)]
pub enum ClassificationError {
    #[error("Response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Response has no messageType")]
    MissingMessageType,

    #[error("Unknown messageType: {0}")]
    UnknownMessageType(String),

    #[error("Response for {message_type} does not match its schema: {}", join_errors(.errors))]
    SchemaMismatch {
        message_type: String,
        errors: Vec<FieldError>,
    },

    #[error("No classification types configured")]
    NoClassifications,
}
