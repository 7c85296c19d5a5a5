//! Domain event system: decoupled observation of tool runs and turns.
//!
//! Events are published when something interesting happens in the runtime.
//! Subscribers react without the publisher knowing about them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use crate::classification::ResponseType;
use crate::tool::ToolContext;

/// Lifecycle of a single tool run. `attempt` is 0-based.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ToolEvent {
    Started {
        tool_name: String,
        input: serde_json::Value,
        context: ToolContext,
        attempt: u32,
    },

    Succeeded {
        tool_name: String,
        input: serde_json::Value,
        context: ToolContext,
        output: serde_json::Value,
        attempt: u32,
        duration_ms: u64,
    },

    Failed {
        tool_name: String,
        input: serde_json::Value,
        context: ToolContext,
        error: String,
        attempt: u32,
        retryable: bool,
    },

    Retrying {
        tool_name: String,
        input: serde_json::Value,
        context: ToolContext,
        error: String,
        attempt: u32,
        delay_ms: u64,
    },
}

impl ToolEvent {
    pub fn tool_name(&self) -> &str {
        match self {
            Self::Started { tool_name, .. }
            | Self::Succeeded { tool_name, .. }
            | Self::Failed { tool_name, .. }
            | Self::Retrying { tool_name, .. } => tool_name,
        }
    }
}

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A message was queued in an agent's mailbox
    MessageQueued {
        session_id: String,
        message_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool lifecycle transition
    Tool {
        event: ToolEvent,
        timestamp: DateTime<Utc>,
    },

    /// A turn finished and was routed
    TurnCompleted {
        session_id: String,
        message_id: String,
        response_type: ResponseType,
        timestamp: DateTime<Utc>,
    },

    /// A turn ended with an error at the orchestrator boundary
    TurnFailed {
        session_id: String,
        message_id: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn tool(event: ToolEvent) -> Self {
        Self::Tool {
            event,
            timestamp: Utc::now(),
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
