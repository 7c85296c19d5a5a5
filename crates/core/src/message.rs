//! Inbound message domain types.
//!
//! A `Message` is what a session hands to its agent's mailbox:
//! Session creates it → Mailbox queues it → AgentCore runs exactly one turn for it.
//! Fields are private so a message cannot change once it has been built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduling class of a queued message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// What kind of input the payload carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    Text,
    Json,
    Event,
}

/// The content of a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub input: String,

    #[serde(default)]
    pub input_type: InputType,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// Who sent the message, when, and how urgently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub sender: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: serde_json::Map<String, serde_json::Value>,

    pub correlation_id: String,
}

/// A single inbound unit of work for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    id: String,
    session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_session_id: Option<String>,
    payload: Payload,
    metadata: MessageMetadata,
}

impl Message {
    /// Start building a message for `session_id`.
    pub fn builder(session_id: impl Into<String>, input: impl Into<String>) -> MessageBuilder {
        MessageBuilder {
            session_id: session_id.into(),
            parent_session_id: None,
            payload: Payload {
                input: input.into(),
                input_type: InputType::Text,
                parameters: serde_json::Map::new(),
            },
            sender: "user".into(),
            priority: Priority::Normal,
            context: serde_json::Map::new(),
            correlation_id: None,
        }
    }

    /// Plain text message from `sender` with default metadata.
    pub fn text(session_id: impl Into<String>, sender: impl Into<String>, input: impl Into<String>) -> Self {
        Self::builder(session_id, input).sender(sender).build()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn parent_session_id(&self) -> Option<&str> {
        self.parent_session_id.as_deref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn input(&self) -> &str {
        &self.payload.input
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn priority(&self) -> Priority {
        self.metadata.priority
    }

    pub fn sender(&self) -> &str {
        &self.metadata.sender
    }
}

/// Builder for [`Message`]. The only way to set optional fields.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    session_id: String,
    parent_session_id: Option<String>,
    payload: Payload,
    sender: String,
    priority: Priority,
    context: serde_json::Map<String, serde_json::Value>,
    correlation_id: Option<String>,
}

impl MessageBuilder {
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn parent_session(mut self, parent: impl Into<String>) -> Self {
        self.parent_session_id = Some(parent.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn input_type(mut self, input_type: InputType) -> Self {
        self.payload.input_type = input_type;
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.parameters.insert(key.into(), value);
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn build(self) -> Message {
        let id = Uuid::new_v4().to_string();
        Message {
            id: id.clone(),
            session_id: self.session_id,
            parent_session_id: self.parent_session_id,
            payload: self.payload,
            metadata: MessageMetadata {
                sender: self.sender,
                timestamp: Utc::now(),
                priority: self.priority,
                context: self.context,
                correlation_id: self.correlation_id.unwrap_or(id),
            },
        }
    }
}
