//! Classification types: what a finished model turn can turn into.

use serde::{Deserialize, Serialize};
use crate::error::FieldError;
use crate::schema::ValidationLevel;

/// Field carrying the classification tag in structured responses.
pub const MESSAGE_TYPE_FIELD: &str = "messageType";

/// Discriminant of a classified response. Decides which handler chain runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    ToolCall,
    #[default]
    Event,
    Conversation,
    Routing,
    Exception,
}

impl std::fmt::Display for ResponseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ToolCall => "TOOL_CALL",
            Self::Event => "EVENT",
            Self::Conversation => "CONVERSATION",
            Self::Routing => "ROUTING",
            Self::Exception => "EXCEPTION",
        };
        f.write_str(s)
    }
}

/// One instruction/intent the agent recognizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationTypeConfig {
    /// The `messageType` tag, e.g. `BOOK_FLIGHT`
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON Schema of the fields that accompany the tag
    #[serde(default = "empty_object_schema")]
    pub schema: serde_json::Value,

    /// Which handler chain a response of this type is routed to
    #[serde(default)]
    pub kind: ResponseType,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ClassificationTypeConfig {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            kind: ResponseType::Event,
        }
    }

    pub fn with_kind(mut self, kind: ResponseType) -> Self {
        self.kind = kind;
        self
    }

    /// The schema shown to the model: the configured fields plus the
    /// `messageType` tag pinned to this classification's name.
    pub fn json_schema(&self) -> serde_json::Value {
        let mut properties = self
            .schema
            .get("properties")
            .and_then(|p| p.as_object())
            .cloned()
            .unwrap_or_default();
        properties.insert(
            MESSAGE_TYPE_FIELD.into(),
            serde_json::json!({ "type": "string", "const": self.name }),
        );

        let mut required: Vec<serde_json::Value> = vec![MESSAGE_TYPE_FIELD.into()];
        if let Some(extra) = self.schema.get("required").and_then(|r| r.as_array()) {
            required.extend(extra.iter().cloned());
        }

        let mut schema = serde_json::json!({
            "type": "object",
            "title": self.name,
            "description": self.description,
            "properties": properties,
            "required": required,
        });
        if let Some(additional) = self.schema.get("additionalProperties") {
            schema["additionalProperties"] = additional.clone();
        }
        schema
    }
}

/// Outcome of the structural checks run on a parsed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub level: ValidationLevel,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

impl ValidationResult {
    pub fn passed(level: ValidationLevel) -> Self {
        Self {
            level,
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn from_errors(level: ValidationLevel, errors: Vec<FieldError>) -> Self {
        Self {
            level,
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// A completed model turn after classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedLlmResponse {
    #[serde(rename = "type")]
    pub response_type: ResponseType,

    /// The matched classification name, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,

    /// The structured body (or the raw text as a JSON string)
    pub content: serde_json::Value,

    /// Direct user-facing answer, when the model gave one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,

    pub validation: ValidationResult,
}

/// Knobs controlling how forgiving response parsing is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseOptions {
    #[serde(default)]
    pub level: ValidationLevel,

    /// Pull a JSON object out of fenced code or surrounding prose.
    #[serde(default = "default_true")]
    pub allow_partial_match: bool,

    /// Reject responses that carry no `messageType` tag.
    #[serde(default = "default_true")]
    pub require_message_type: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            level: ValidationLevel::default(),
            allow_partial_match: true,
            require_message_type: true,
        }
    }
}
