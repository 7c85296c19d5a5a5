//! Agent configuration and state types.
//!
//! `AgentConfig` is built once (usually by `switchboard-config`) and injected
//! into the orchestrator and tool runner. There is no global execution context.

use std::collections::HashMap;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::classification::ParseOptions;
use crate::tool::ToolOptions;

/// Configuration for the agent's behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Owner id stamped on sessions the agent creates
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// Model to request
    pub model: String,

    #[serde(default = "default_temp")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Use the provider's streaming endpoint
    #[serde(default)]
    pub stream: bool,

    /// Mailbox poll interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How many recent records to recall per turn
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default)]
    pub parse: ParseOptions,

    /// Retry/timeout policy for tools that do not declare their own
    #[serde(default)]
    pub tool_defaults: ToolOptions,

    /// Instruction name → tool name
    #[serde(default)]
    pub instruction_tools: HashMap<String, String>,
}

fn default_agent_id() -> String {
    "switchboard".into()
}
fn default_temp() -> f32 {
    0.7
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_history_limit() -> usize {
    20
}

impl AgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            agent_id: default_agent_id(),
            model: model.into(),
            temperature: default_temp(),
            max_tokens: None,
            stream: false,
            poll_interval_ms: default_poll_interval_ms(),
            history_limit: default_history_limit(),
            parse: ParseOptions::default(),
            tool_defaults: ToolOptions::default(),
            instruction_tools: HashMap::new(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Runtime counters of an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    /// Whether the agent is currently processing a turn
    pub is_busy: bool,

    /// Turns that ran to completion since startup
    pub turns_completed: u64,

    /// Turns that ended with an error at the orchestrator boundary
    pub turns_failed: u64,

    /// Live sessions
    pub active_sessions: usize,
}
