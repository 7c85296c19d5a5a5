//! Sessions: one conversation, its mutable context, and its handler chains.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use switchboard_core::chat::{ChatMessage, ToolCall};
use switchboard_core::classification::{MESSAGE_TYPE_FIELD, ParsedLlmResponse};
use switchboard_core::error::{FieldError, ToolError, ValidationError};
use switchboard_core::event::{DomainEvent, EventBus};
use switchboard_core::message::{Message, MessageBuilder, Priority};
use switchboard_core::session_state::SessionState;
use switchboard_core::tool::{ToolContext, ToolResultEnvelope};
use switchboard_tools::ToolRegistry;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use crate::handlers::HandlerList;
use crate::mailbox::Mailbox;

/// Live sessions of one agent, by id.
pub(crate) type SessionMap = RwLock<HashMap<String, Arc<Session>>>;

/// What event handlers receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The classified instruction was mapped to a tool; this is its result.
    ToolResult(ToolResultEnvelope),

    /// No tool is mapped to the instruction; the classified response itself.
    Classified(ParsedLlmResponse),
}

/// What exception handlers receive when a response could not be classified.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExceptionEvent {
    /// Best-effort `messageType` pulled from the raw text
    pub instruction: Option<String>,

    pub error: String,

    /// The model output exactly as received
    pub raw_response: String,

    /// Set when the response did classify, as an exception-kind type
    pub parsed: Option<ParsedLlmResponse>,
}

/// Mutable per-session state. Only the orchestrator's consumer writes it.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session_id: String,
    state: SessionState,
    history: Vec<ChatMessage>,
    started_at: DateTime<Utc>,
    last_interaction_at: DateTime<Utc>,
    current_instruction: Option<String>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            state: SessionState::Start,
            history: Vec::new(),
            started_at: now,
            last_interaction_at: now,
            current_instruction: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Any transition is allowed; the state is a label.
    pub fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!(session_id = %self.session_id, from = %self.state, to = %next, "Session state changed");
            self.state = next;
        }
    }

    /// Transient history of this context, oldest first.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn push_history(&mut self, message: ChatMessage) {
        self.history.push(message);
        self.last_interaction_at = Utc::now();
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_interaction_at(&self) -> DateTime<Utc> {
        self.last_interaction_at
    }

    /// The instruction the last classified turn resolved to.
    pub fn current_instruction(&self) -> Option<&str> {
        self.current_instruction.as_deref()
    }

    pub fn set_current_instruction(&mut self, instruction: Option<String>) {
        self.current_instruction = instruction;
    }
}

/// One conversation with an agent.
///
/// A session creates messages stamped with its id and hands them to the
/// agent's mailbox. The orchestrator later routes each classified turn back
/// through the session's four handler chains.
pub struct Session {
    id: String,
    owner_id: String,
    description: String,
    parent_id: Option<String>,
    subtasks: RwLock<Vec<String>>,
    context: Mutex<SessionContext>,

    event_handlers: HandlerList<SessionEvent>,
    tool_result_handlers: HandlerList<ToolResultEnvelope>,
    conversation_handlers: HandlerList<ParsedLlmResponse>,
    exception_handlers: HandlerList<ExceptionEvent>,

    mailbox: Arc<Mailbox>,
    tools: Arc<ToolRegistry>,
    instruction_tools: Arc<HashMap<String, String>>,
    sessions: Weak<SessionMap>,
    events: Option<Arc<EventBus>>,
}

impl Session {
    /// A session that is not registered with an agent. Messages it creates
    /// still go to `mailbox`.
    pub fn new(
        owner_id: impl Into<String>,
        description: impl Into<String>,
        mailbox: Arc<Mailbox>,
        tools: Arc<ToolRegistry>,
        instruction_tools: Arc<HashMap<String, String>>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            context: Mutex::new(SessionContext::new(id.clone())),
            id,
            owner_id: owner_id.into(),
            description: description.into(),
            parent_id: None,
            subtasks: RwLock::new(Vec::new()),
            event_handlers: HandlerList::new(),
            tool_result_handlers: HandlerList::new(),
            conversation_handlers: HandlerList::new(),
            exception_handlers: HandlerList::new(),
            mailbox,
            tools,
            instruction_tools,
            sessions: Weak::new(),
            events: None,
        }
    }

    pub(crate) fn attach(mut self, sessions: Weak<SessionMap>, events: Arc<EventBus>) -> Self {
        self.sessions = sessions;
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Ids of subtasks created from this session, in creation order.
    pub fn subtask_ids(&self) -> Vec<String> {
        self.subtasks.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Exclusive access to the mutable context.
    pub async fn context(&self) -> tokio::sync::MutexGuard<'_, SessionContext> {
        self.context.lock().await
    }

    pub async fn state(&self) -> SessionState {
        self.context.lock().await.state()
    }

    /// Build a message stamped with this session's id.
    pub fn create_message(&self, text: impl Into<String>, sender: Option<&str>) -> Message {
        self.message_builder(text, sender).build()
    }

    /// A builder stamped with this session's id, sender and parent session.
    fn message_builder(&self, text: impl Into<String>, sender: Option<&str>) -> MessageBuilder {
        let builder = Message::builder(&self.id, text).sender(sender.unwrap_or("user"));
        match &self.parent_id {
            Some(parent) => builder.parent_session(parent.clone()),
            None => builder,
        }
    }

    /// Create a message and queue it for the agent at normal priority.
    /// Returns the message id.
    pub fn chat(&self, text: impl Into<String>) -> String {
        self.chat_with_priority(text, Priority::Normal)
    }

    pub fn chat_with_priority(&self, text: impl Into<String>, priority: Priority) -> String {
        self.send(self.message_builder(text, None).priority(priority).build())
    }

    /// Queue a prebuilt message under its own priority.
    pub fn send(&self, message: Message) -> String {
        let message_id = message.id().to_string();
        if let Some(bus) = &self.events {
            bus.publish(DomainEvent::MessageQueued {
                session_id: self.id.clone(),
                message_id: message_id.clone(),
                timestamp: Utc::now(),
            });
        }
        let priority = message.priority();
        self.mailbox.enqueue(message, priority);
        message_id
    }

    /// Create a child session linked to this one. If this session belongs
    /// to an agent, the child is registered with the same agent.
    pub fn create_subtask(&self, description: impl Into<String>) -> Arc<Session> {
        let mut child = Session::new(
            self.owner_id.clone(),
            description,
            Arc::clone(&self.mailbox),
            Arc::clone(&self.tools),
            Arc::clone(&self.instruction_tools),
        );
        child.parent_id = Some(self.id.clone());
        child.sessions = self.sessions.clone();
        child.events = self.events.clone();
        let child = Arc::new(child);

        self.subtasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(child.id.clone());

        match self.sessions.upgrade() {
            Some(map) => {
                map.write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(child.id.clone(), Arc::clone(&child));
                info!(session_id = %child.id, parent = %self.id, "Subtask session created");
            }
            None => debug!(session_id = %child.id, parent = %self.id, "Subtask created without an agent"),
        }
        child
    }

    // --- Handler registration ---

    pub fn on_event(&self, handler: impl Fn(&SessionEvent) + Send + Sync + 'static) {
        self.event_handlers.push(Arc::new(handler));
    }

    pub fn on_tool_result(&self, handler: impl Fn(&ToolResultEnvelope) + Send + Sync + 'static) {
        self.tool_result_handlers.push(Arc::new(handler));
    }

    pub fn on_conversation(&self, handler: impl Fn(&ParsedLlmResponse) + Send + Sync + 'static) {
        self.conversation_handlers.push(Arc::new(handler));
    }

    pub fn on_exception(&self, handler: impl Fn(&ExceptionEvent) + Send + Sync + 'static) {
        self.exception_handlers.push(Arc::new(handler));
    }

    // --- Dispatch ---

    /// Route a classified event. If a tool is mapped to the instruction it
    /// runs with the response body as input and event handlers receive its
    /// result; otherwise they receive the classified response.
    pub async fn trigger_event_handlers(&self, parsed: ParsedLlmResponse) -> SessionEvent {
        let mapped = parsed
            .instruction
            .as_deref()
            .and_then(|instruction| self.instruction_tools.get(instruction));

        let event = match mapped {
            Some(tool_name) => {
                let input = tool_input(&parsed.content);
                let context = ToolContext::for_session(&self.id);
                debug!(session_id = %self.id, tool = %tool_name, instruction = ?parsed.instruction, "Running mapped tool");
                let result = self.tools.run(tool_name, input, &context).await;
                if let Err(e) = &result {
                    warn!(session_id = %self.id, tool = %tool_name, error = %e, "Mapped tool failed");
                }
                SessionEvent::ToolResult(ToolResultEnvelope::from_result(tool_name.clone(), None, &result))
            }
            None => SessionEvent::Classified(parsed),
        };

        self.event_handlers.dispatch(&event);
        event
    }

    /// Execute each requested tool call in order and fan a result envelope
    /// per call to tool-result handlers. Failures become failure envelopes.
    pub async fn trigger_tool_calls_handlers(&self, calls: &[ToolCall]) -> Vec<ToolResultEnvelope> {
        let mut envelopes = Vec::with_capacity(calls.len());

        for call in calls {
            let tool_name = call.function.name.as_str();
            let context = ToolContext::for_session(&self.id).with_call_id(&call.id);

            let result = match call.parsed_arguments() {
                Ok(input) => self.tools.run(tool_name, input, &context).await,
                Err(e) => Err(ToolError::Validation(ValidationError {
                    tool_name: tool_name.to_string(),
                    errors: vec![FieldError::new("", format!("arguments are not valid JSON: {e}"))],
                })),
            };
            if let Err(e) = &result {
                warn!(session_id = %self.id, tool = %tool_name, call_id = %call.id, error = %e, "Tool call failed");
            }

            let envelope = ToolResultEnvelope::from_result(tool_name, Some(call.id.clone()), &result);
            self.tool_result_handlers.dispatch(&envelope);
            envelopes.push(envelope);
        }

        envelopes
    }

    pub fn trigger_conversation_handlers(&self, parsed: &ParsedLlmResponse) -> usize {
        self.conversation_handlers.dispatch(parsed)
    }

    pub fn trigger_exception_handlers(&self, event: &ExceptionEvent) -> usize {
        self.exception_handlers.dispatch(event)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("description", &self.description)
            .field("parent_id", &self.parent_id)
            .finish()
    }
}

/// The response body without its classification tag.
fn tool_input(content: &Value) -> Value {
    match content {
        Value::Object(map) => {
            let mut map = map.clone();
            map.remove(MESSAGE_TYPE_FIELD);
            Value::Object(map)
        }
        other => other.clone(),
    }
}
