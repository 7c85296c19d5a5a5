//! No-op memory backend: every turn starts without history.

use async_trait::async_trait;
use switchboard_core::chat::ChatMessage;
use switchboard_core::error::MemoryError;
use switchboard_core::memory::{MemoryBackend, RecallQuery};

/// A no-op memory backend that stores nothing.
pub struct NoopMemory;

#[async_trait]
impl MemoryBackend for NoopMemory {
    fn name(&self) -> &str { "none" }

    async fn recall_recent_messages(&self, _query: RecallQuery) -> Result<Vec<ChatMessage>, MemoryError> {
        Ok(Vec::new())
    }

    async fn remember(
        &self,
        _content: String,
        _tags: Vec<String>,
        _metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, MemoryError> {
        Ok(String::new())
    }
}
