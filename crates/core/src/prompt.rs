//! Prompt collaborators.
//!
//! The agent never hard-codes prompt wording. It asks a [`PromptTemplate`]
//! for the strings it needs and asks a [`TransportErrorHandler`] what to tell
//! the user when the model could not be reached.

use crate::classification::{ClassificationTypeConfig, MESSAGE_TYPE_FIELD};
use crate::error::ProviderError;

/// Pure string-producing functions used to assemble prompts.
pub trait PromptTemplate: Send + Sync {
    /// The system prompt for a turn.
    fn system_prompt(&self, classifications: &[ClassificationTypeConfig]) -> String;

    /// Optional assistant priming message inserted after the system prompt.
    fn assistant_prompt(&self) -> Option<String> {
        None
    }

    /// Describes the recognized classifications and their schemas to the model.
    fn classification_prompt(&self, classifications: &[ClassificationTypeConfig]) -> String;

    /// The user-facing part of a response, stored in memory for conversational turns.
    fn extract_data_from_llm_response(&self, text: &str) -> String;
}

/// Minimal template: a short role statement plus the generated schemas.
#[derive(Debug, Clone)]
pub struct DefaultPromptTemplate {
    pub role: String,
}

impl Default for DefaultPromptTemplate {
    fn default() -> Self {
        Self {
            role: "You are a helpful assistant.".into(),
        }
    }
}

impl PromptTemplate for DefaultPromptTemplate {
    fn system_prompt(&self, classifications: &[ClassificationTypeConfig]) -> String {
        if classifications.is_empty() {
            return self.role.clone();
        }
        format!("{}\n\n{}", self.role, self.classification_prompt(classifications))
    }

    fn classification_prompt(&self, classifications: &[ClassificationTypeConfig]) -> String {
        let mut prompt = format!(
            "Reply with a single JSON object whose \"{MESSAGE_TYPE_FIELD}\" is one of the types below.\n"
        );
        for config in classifications {
            let schema = serde_json::to_string(&config.json_schema()).unwrap_or_default();
            prompt.push_str(&format!("\n## {}\n{}\n{}\n", config.name, config.description, schema));
        }
        prompt
    }

    fn extract_data_from_llm_response(&self, text: &str) -> String {
        let Ok(serde_json::Value::Object(obj)) = serde_json::from_str::<serde_json::Value>(text.trim()) else {
            return text.to_string();
        };
        ["answer", "response", "message", "content"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(|v| v.as_str()))
            .map(String::from)
            .unwrap_or_else(|| text.to_string())
    }
}

/// Turns a transport failure into text the user can read.
pub trait TransportErrorHandler: Send + Sync {
    fn handle(&self, error: &ProviderError) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultTransportErrorHandler;

impl TransportErrorHandler for DefaultTransportErrorHandler {
    fn handle(&self, error: &ProviderError) -> String {
        match error {
            ProviderError::RateLimited { retry_after_secs } => format!(
                "The model is busy right now. Please try again in {retry_after_secs} seconds."
            ),
            ProviderError::AuthenticationFailed(_) | ProviderError::NotConfigured(_) => {
                "The model provider is not configured correctly.".into()
            }
            ProviderError::Timeout(_) => "The model took too long to answer. Please try again.".into(),
            _ => "Sorry, I could not reach the model. Please try again.".into(),
        }
    }
}
