//! In-memory backend: an append-only log held in process.

use async_trait::async_trait;
use chrono::Utc;
use switchboard_core::chat::{ChatMessage, Role};
use switchboard_core::error::MemoryError;
use switchboard_core::memory::{MemoryBackend, MemoryEntry, RecallQuery};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// An in-memory backend that stores records in a Vec, oldest first.
/// Useful for testing and sessions where persistence isn't needed.
pub struct InMemoryBackend {
    entries: Arc<RwLock<Vec<MemoryEntry>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Snapshot of every stored record, oldest first.
    pub async fn entries(&self) -> Vec<MemoryEntry> {
        self.entries.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    fn name(&self) -> &str { "in_memory" }

    async fn recall_recent_messages(&self, query: RecallQuery) -> Result<Vec<ChatMessage>, MemoryError> {
        let entries = self.entries.read().await;

        let mut recent: Vec<ChatMessage> = entries
            .iter()
            .rev()
            .filter(|e| match &query.session_id {
                Some(session) => e.session_id() == Some(session.as_str()),
                None => true,
            })
            .filter_map(MemoryEntry::to_chat_message)
            .take(query.limit)
            .collect();

        // Collected newest first
        recent.reverse();

        // Tool results cut off from their assistant call are not valid history
        let orphans = recent.iter().take_while(|m| m.role == Role::Tool).count();
        if orphans > 0 {
            debug!(dropped = orphans, "Dropped tool results at the start of the recall window");
            recent.drain(..orphans);
        }
        Ok(recent)
    }

    async fn remember(
        &self,
        content: String,
        tags: Vec<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, MemoryError> {
        let entry = MemoryEntry {
            id: Uuid::new_v4().to_string(),
            content,
            tags,
            metadata,
            created_at: Utc::now(),
        };
        let id = entry.id.clone();
        debug!(memory_id = %id, session_id = ?entry.session_id(), "Remembered record");
        self.entries.write().await.push(entry);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchboard_core::chat::ToolCall;

    fn meta(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn query(limit: usize, session: Option<&str>) -> RecallQuery {
        RecallQuery {
            limit,
            session_id: session.map(String::from),
        }
    }

    #[tokio::test]
    async fn remember_assigns_ids() {
        let mem = InMemoryBackend::new();
        let a = mem.remember("one".into(), vec![], meta(json!({ "role": "user" }))).await.unwrap();
        let b = mem.remember("two".into(), vec![], meta(json!({ "role": "user" }))).await.unwrap();
        assert!(!a.is_empty());
        assert_ne!(a, b);
        assert_eq!(mem.count().await, 2);
    }

    #[tokio::test]
    async fn recall_returns_newest_in_chronological_order() {
        let mem = InMemoryBackend::new();
        for text in ["first", "second", "third", "fourth"] {
            mem.remember(text.into(), vec![], meta(json!({ "role": "user", "session_id": "s1" })))
                .await
                .unwrap();
        }

        let recalled = mem.recall_recent_messages(query(2, Some("s1"))).await.unwrap();
        let texts: Vec<&str> = recalled.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["third", "fourth"]);
    }

    #[tokio::test]
    async fn recall_filters_by_session() {
        let mem = InMemoryBackend::new();
        mem.remember("mine".into(), vec![], meta(json!({ "role": "user", "session_id": "s1" }))).await.unwrap();
        mem.remember("theirs".into(), vec![], meta(json!({ "role": "user", "session_id": "s2" }))).await.unwrap();

        let recalled = mem.recall_recent_messages(query(10, Some("s1"))).await.unwrap();
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].text(), "mine");

        let all = mem.recall_recent_messages(query(10, None)).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn records_without_role_are_skipped() {
        let mem = InMemoryBackend::new();
        mem.remember("note".into(), vec!["fact".into()], serde_json::Map::new()).await.unwrap();
        mem.remember("hi".into(), vec![], meta(json!({ "role": "user" }))).await.unwrap();

        let recalled = mem.recall_recent_messages(query(10, None)).await.unwrap();
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].role, Role::User);
    }

    #[tokio::test]
    async fn tool_call_history_round_trips() {
        let mem = InMemoryBackend::new();
        let calls = vec![ToolCall::new("call_1", "search", r#"{"q":"rust"}"#)];
        mem.remember(String::new(), vec![], meta(json!({ "role": "assistant", "tool_calls": calls }))).await.unwrap();
        mem.remember("found it".into(), vec![], meta(json!({ "role": "tool", "tool_call_id": "call_1" }))).await.unwrap();

        let recalled = mem.recall_recent_messages(query(10, None)).await.unwrap();
        assert_eq!(recalled[0].tool_calls[0].id, "call_1");
        assert_eq!(recalled[1].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn recall_window_never_starts_with_tool_results() {
        let mem = InMemoryBackend::new();
        let calls = vec![
            ToolCall::new("c1", "search", "{}"),
            ToolCall::new("c2", "lookup", "{}"),
        ];
        mem.remember("find things".into(), vec![], meta(json!({ "role": "user", "session_id": "s1" }))).await.unwrap();
        mem.remember(
            String::new(),
            vec![],
            meta(json!({ "role": "assistant", "session_id": "s1", "tool_calls": calls })),
        )
        .await
        .unwrap();
        for id in ["c1", "c2"] {
            mem.remember(
                format!("result {id}"),
                vec![],
                meta(json!({ "role": "tool", "session_id": "s1", "tool_call_id": id })),
            )
            .await
            .unwrap();
        }

        let cut = mem.recall_recent_messages(query(2, Some("s1"))).await.unwrap();
        assert!(cut.is_empty());

        let cut = mem.recall_recent_messages(query(3, Some("s1"))).await.unwrap();
        let roles: Vec<Role> = cut.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::Assistant, Role::Tool, Role::Tool]);

        mem.remember("thanks".into(), vec![], meta(json!({ "role": "user", "session_id": "s1" }))).await.unwrap();
        let cut = mem.recall_recent_messages(query(2, Some("s1"))).await.unwrap();
        let roles: Vec<Role> = cut.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User]);
    }

    #[tokio::test]
    async fn clear_all() {
        let mem = InMemoryBackend::new();
        mem.remember("Entry 1".into(), vec![], serde_json::Map::new()).await.unwrap();
        mem.clear().await;
        assert_eq!(mem.count().await, 0);
    }
}
