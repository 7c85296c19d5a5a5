//! Memory trait: the agent's conversation log.
//!
//! The agent only needs two things from memory: the most recent
//! role/content records to rebuild a prompt, and a way to append new ones.
//! How a backend indexes or consolidates what it stores is its own business.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::chat::{ChatMessage, Role, ToolCall};
use crate::error::MemoryError;

/// Metadata key holding the chat role of a remembered record.
pub const META_ROLE: &str = "role";
/// Metadata key holding the owning session id.
pub const META_SESSION_ID: &str = "session_id";
/// Metadata key holding serialized tool calls of an assistant record.
pub const META_TOOL_CALLS: &str = "tool_calls";
/// Metadata key holding the tool call a tool-result record answers.
pub const META_TOOL_CALL_ID: &str = "tool_call_id";

/// A single remembered record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Unique ID for this memory
    pub id: String,

    /// The content of the memory
    pub content: String,

    /// Tags for categorization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Free-form metadata (role, session id, tool calls, ...)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// When this memory was created
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn session_id(&self) -> Option<&str> {
        self.metadata.get(META_SESSION_ID).and_then(|v| v.as_str())
    }

    /// Convert into a prompt record. Entries without a known role are
    /// not part of the conversation and yield `None`.
    pub fn to_chat_message(&self) -> Option<ChatMessage> {
        let role = self
            .metadata
            .get(META_ROLE)
            .and_then(|v| v.as_str())
            .and_then(Role::parse)?;

        let tool_calls: Vec<ToolCall> = self
            .metadata
            .get(META_TOOL_CALLS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        if role == Role::Assistant && !tool_calls.is_empty() {
            return Some(ChatMessage::assistant_tool_calls(tool_calls));
        }

        Some(ChatMessage {
            role,
            content: Some(self.content.clone()),
            tool_calls: Vec::new(),
            tool_call_id: self
                .metadata
                .get(META_TOOL_CALL_ID)
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }
}

/// Which records to recall.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallQuery {
    /// Maximum number of records, newest last
    pub limit: usize,

    /// Only records remembered for this session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// The core MemoryBackend trait.
///
/// Implementations: in-memory (for testing and single-process use), none (no-op).
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// The backend name (e.g., "in_memory", "none").
    fn name(&self) -> &str;

    /// Most recent conversation records in chronological order.
    async fn recall_recent_messages(&self, query: RecallQuery) -> std::result::Result<Vec<ChatMessage>, MemoryError>;

    /// Append a record. Returns its id.
    async fn remember(
        &self,
        content: String,
        tags: Vec<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> std::result::Result<String, MemoryError>;
}
