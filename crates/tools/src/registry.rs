//! Tool registry: lookup plus the validated, retried `run` entry point.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use serde_json::Value;
use switchboard_core::error::{ToolError, ValidationError};
use switchboard_core::event::{DomainEvent, EventBus, ToolEvent};
use switchboard_core::provider::ToolDefinition;
use switchboard_core::schema::{self, ValidationLevel};
use switchboard_core::tool::{Tool, ToolContext, ToolOptions};
use tracing::{debug, warn};
use crate::runner;

/// A registry of available tools.
///
/// The agent uses this to:
/// 1. Get tool definitions to send to the LLM
/// 2. Look up and run tools when a response asks for one
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    defaults: ToolOptions,
    events: Option<Arc<EventBus>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            defaults: ToolOptions::default(),
            events: None,
        }
    }

    /// Policy for tools that do not declare their own.
    pub fn with_defaults(mut self, defaults: ToolOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Publish tool lifecycle events on `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Replacing previously registered tool");
        }
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions_excluding(&HashSet::new())
    }

    /// Definitions of every tool whose name is not in `hidden`, sorted by name.
    pub fn definitions_excluding(&self, hidden: &HashSet<&str>) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| !hidden.contains(t.name()))
            .map(|t| t.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate `input` and execute the named tool under its retry/timeout policy.
    ///
    /// Schema violations are returned as [`ToolError::Validation`] without the
    /// tool ever being invoked. Execution failures are retried with
    /// exponential backoff up to `max_retries` times.
    pub async fn run(&self, name: &str, input: Value, context: &ToolContext) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        let options = tool.options().unwrap_or(self.defaults);

        let errors = schema::validate(&input, &tool.parameters_schema(), ValidationLevel::Lenient);
        if !errors.is_empty() {
            debug!(tool = %name, violations = errors.len(), "Tool input rejected by schema");
            let err = ToolError::Validation(ValidationError {
                tool_name: name.to_string(),
                errors,
            });
            self.publish(ToolEvent::Failed {
                tool_name: name.to_string(),
                input,
                context: context.clone(),
                error: err.to_string(),
                attempt: 0,
                retryable: false,
            });
            return Err(err);
        }

        runner::run_with_policy(tool.as_ref(), input, context, &options, |event| self.publish(event)).await
    }

    fn publish(&self, event: ToolEvent) {
        if let Some(bus) = &self.events {
            bus.publish(DomainEvent::tool(event));
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
