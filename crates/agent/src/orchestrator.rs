//! The orchestrator.
//!
//! One [`AgentCore`] owns a mailbox, a tool registry and a map of live
//! sessions. Its consumer takes one message at a time off the mailbox and
//! runs a full turn for it:
//!
//! 1. **Dequeue**: the owning session becomes `Active`
//! 2. **Load history** from the memory collaborator
//! 3. **Build the prompt**: system, optional assistant priming, history, user
//! 4. **Invoke the model**, streaming or not
//! 5. **Assemble** text and tool calls
//! 6. **Classify and route** through the session's handler chains
//! 7. **Remember** the turn
//!
//! A transport failure never aborts a turn: the transport error handler
//! produces text that is routed to conversation handlers instead.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use chrono::Utc;
use futures::FutureExt;
use serde_json::{Map, Value, json};
use switchboard_core::agent::{AgentConfig, AgentState};
use switchboard_core::chat::ChatMessage;
use switchboard_core::classification::{ClassificationTypeConfig, ParsedLlmResponse, ResponseType, ValidationResult};
use switchboard_core::error::{Error, ProviderError, Result};
use switchboard_core::event::{DomainEvent, EventBus};
use switchboard_core::memory::{META_ROLE, META_SESSION_ID, META_TOOL_CALL_ID, META_TOOL_CALLS, MemoryBackend, RecallQuery};
use switchboard_core::message::Message;
use switchboard_core::prompt::{DefaultPromptTemplate, DefaultTransportErrorHandler, PromptTemplate, TransportErrorHandler};
use switchboard_core::provider::{Provider, ProviderRequest};
use switchboard_core::session_state::SessionState;
use switchboard_core::tool::Tool;
use switchboard_memory::NoopMemory;
use switchboard_tools::ToolRegistry;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use crate::assembler::{AssembledResponse, StreamAssembler};
use crate::callbacks::{Completion, StreamCallbacks};
use crate::classifier::{BareClassifier, Classifier, Routed, SimpleClassifier};
use crate::mailbox::{Mailbox, panic_message};
use crate::session::{Session, SessionMap};

/// Finish reason reported to stream callbacks when the model could not be reached.
pub const FINISH_TRANSPORT_ERROR: &str = "error";

/// Builder for [`AgentCore`].
pub struct AgentCoreBuilder {
    config: AgentConfig,
    provider: Option<Arc<dyn Provider>>,
    memory: Option<Arc<dyn MemoryBackend>>,
    prompts: Option<Arc<dyn PromptTemplate>>,
    transport_errors: Option<Arc<dyn TransportErrorHandler>>,
    classifier: Option<Arc<dyn Classifier>>,
    classifications: Vec<ClassificationTypeConfig>,
    tools: Vec<Arc<dyn Tool>>,
    instruction_tools: Vec<(String, String)>,
    events: Option<Arc<EventBus>>,
}

impl AgentCoreBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            provider: None,
            memory: None,
            prompts: None,
            transport_errors: None,
            classifier: None,
            classifications: Vec::new(),
            tools: Vec::new(),
            instruction_tools: Vec::new(),
            events: None,
        }
    }

    /// The model transport. Required.
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Conversation log. Defaults to [`NoopMemory`].
    pub fn with_memory(mut self, memory: Arc<dyn MemoryBackend>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_prompt_template(mut self, prompts: Arc<dyn PromptTemplate>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    pub fn with_transport_error_handler(mut self, handler: Arc<dyn TransportErrorHandler>) -> Self {
        self.transport_errors = Some(handler);
        self
    }

    /// Use a custom classifier. Its own classifications are used for the prompt.
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Classifications for the default strategy. With none, a bare
    /// classifier answering every turn as conversation is used.
    pub fn with_classification(mut self, config: ClassificationTypeConfig) -> Self {
        self.classifications.push(config);
        self
    }

    pub fn with_classifications(mut self, configs: impl IntoIterator<Item = ClassificationTypeConfig>) -> Self {
        self.classifications.extend(configs);
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Run `tool` whenever a response classifies as `instruction`.
    /// The tool is then hidden from the free-form tool list.
    pub fn with_instruction_tool(mut self, instruction: impl Into<String>, tool: impl Into<String>) -> Self {
        self.instruction_tools.push((instruction.into(), tool.into()));
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Assemble the agent. Fails on construction-time misconfiguration:
    /// no provider, an instruction mapped twice, a mapping to an unknown
    /// tool, or two classifications with the same name.
    pub fn build(self) -> Result<Arc<AgentCore>> {
        let provider = self
            .provider
            .ok_or_else(|| Error::config("no LLM client configured"))?;

        let events = self.events.unwrap_or_default();

        let mut registry = ToolRegistry::new()
            .with_defaults(self.config.tool_defaults)
            .with_events(Arc::clone(&events));
        for tool in self.tools {
            registry.register(tool);
        }

        let mut instruction_tools: HashMap<String, String> = HashMap::new();
        let configured = self
            .config
            .instruction_tools
            .iter()
            .map(|(i, t)| (i.clone(), t.clone()));
        for (instruction, tool) in configured.chain(self.instruction_tools) {
            if instruction_tools.contains_key(&instruction) {
                return Err(Error::config(format!("instruction {instruction} is registered twice")));
            }
            if !registry.contains(&tool) {
                return Err(Error::config(format!(
                    "instruction {instruction} maps to unknown tool {tool}"
                )));
            }
            instruction_tools.insert(instruction, tool);
        }

        let classifier: Arc<dyn Classifier> = match self.classifier {
            Some(classifier) => classifier,
            None if self.classifications.is_empty() => Arc::new(BareClassifier::new(vec![
                ClassificationTypeConfig::new(
                    "ANSWER",
                    "A direct answer to the user",
                    json!({ "type": "object", "properties": {} }),
                )
                .with_kind(ResponseType::Conversation),
            ])),
            None => Arc::new(SimpleClassifier::new(self.classifications)),
        };

        {
            let mut names = HashSet::new();
            for config in classifier.classifications() {
                if !names.insert(config.name.as_str()) {
                    return Err(Error::config(format!("classification {} is registered twice", config.name)));
                }
            }
        }

        info!(
            agent_id = %self.config.agent_id,
            provider = provider.name(),
            classifier = classifier.name(),
            tools = registry.len(),
            mapped = instruction_tools.len(),
            stream = self.config.stream,
            "Agent assembled"
        );

        Ok(Arc::new(AgentCore {
            config: self.config,
            provider,
            memory: self.memory.unwrap_or_else(|| Arc::new(NoopMemory)),
            prompts: self.prompts.unwrap_or_else(|| Arc::new(DefaultPromptTemplate::default())),
            transport_errors: self
                .transport_errors
                .unwrap_or_else(|| Arc::new(DefaultTransportErrorHandler)),
            classifier,
            tools: Arc::new(registry),
            instruction_tools: Arc::new(instruction_tools),
            mailbox: Arc::new(Mailbox::new()),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events,
            callbacks: StreamCallbacks::new(),
            state: Mutex::new(AgentState::default()),
            consumer: Mutex::new(None),
        }))
    }
}

/// A model turn before routing.
enum Invocation {
    Answered(AssembledResponse),
    /// Transport failure, already rendered for the user
    Unreachable(String),
}

/// The agent runtime.
pub struct AgentCore {
    config: AgentConfig,
    provider: Arc<dyn Provider>,
    memory: Arc<dyn MemoryBackend>,
    prompts: Arc<dyn PromptTemplate>,
    transport_errors: Arc<dyn TransportErrorHandler>,
    classifier: Arc<dyn Classifier>,
    tools: Arc<ToolRegistry>,
    instruction_tools: Arc<HashMap<String, String>>,
    mailbox: Arc<Mailbox>,
    sessions: Arc<SessionMap>,
    events: Arc<EventBus>,
    callbacks: StreamCallbacks,
    state: Mutex<AgentState>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl AgentCore {
    pub fn builder(config: AgentConfig) -> AgentCoreBuilder {
        AgentCoreBuilder::new(config)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Where line-buffered streamed output is delivered.
    pub fn stream_callbacks(&self) -> &StreamCallbacks {
        &self.callbacks
    }

    /// Snapshot of the runtime counters.
    pub fn state(&self) -> AgentState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner).clone();
        state.active_sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner).len();
        state
    }

    // --- Sessions ---

    /// Open a new session owned by this agent.
    pub fn create_session(&self, description: impl Into<String>) -> Arc<Session> {
        let session = Arc::new(
            Session::new(
                self.config.agent_id.clone(),
                description,
                Arc::clone(&self.mailbox),
                Arc::clone(&self.tools),
                Arc::clone(&self.instruction_tools),
            )
            .attach(Arc::downgrade(&self.sessions), Arc::clone(&self.events)),
        );
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id().to_string(), Arc::clone(&session));
        info!(session_id = %session.id(), "Session created");
        session
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    /// Forget a session. Messages it still has queued are dropped when dequeued.
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().unwrap_or_else(PoisonError::into_inner).remove(id);
        if removed.is_some() {
            info!(session_id = %id, "Session removed");
        }
        removed
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    // --- Lifecycle ---

    /// Start the mailbox consumer.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let core: Weak<AgentCore> = Arc::downgrade(self);
        let handle = self.mailbox.init(self.config.poll_interval(), move |message| {
            let core = core.clone();
            async move {
                match core.upgrade() {
                    Some(core) => core.handle_message(message).await,
                    None => Ok(()),
                }
            }
        })?;
        *self.consumer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(agent_id = %self.config.agent_id, "Agent started");
        Ok(())
    }

    /// Stop the consumer, wait for an in-flight turn to finish and mark
    /// every session `Terminated`. Must not be called from a handler.
    pub async fn stop(&self) {
        self.mailbox.stop();
        let handle = self.consumer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Mailbox consumer ended abnormally");
            }
        }

        let sessions: Vec<Arc<Session>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for session in &sessions {
            session.context().await.set_state(SessionState::Terminated);
        }
        info!(agent_id = %self.config.agent_id, sessions = sessions.len(), "Agent stopped");
    }

    // --- Turn pipeline ---

    /// Run one turn for `message`. Called by the mailbox consumer.
    pub async fn handle_message(&self, message: Message) -> Result<()> {
        let Some(session) = self.session(message.session_id()) else {
            warn!(message_id = %message.id(), session_id = %message.session_id(), "Dropping message for unknown session");
            return Ok(());
        };

        self.state.lock().unwrap_or_else(PoisonError::into_inner).is_busy = true;
        let result = AssertUnwindSafe(self.run_turn(&session, &message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Error::Internal(format!("turn panicked: {}", panic_message(panic.as_ref())))));

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.is_busy = false;
        match result {
            Ok(Some(response_type)) => {
                state.turns_completed += 1;
                drop(state);
                self.events.publish(DomainEvent::TurnCompleted {
                    session_id: session.id().to_string(),
                    message_id: message.id().to_string(),
                    response_type,
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                state.turns_failed += 1;
                drop(state);
                self.events.publish(DomainEvent::TurnFailed {
                    session_id: session.id().to_string(),
                    message_id: message.id().to_string(),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                Err(e)
            }
        }
    }

    /// Returns `None` when the session no longer accepts turns.
    async fn run_turn(&self, session: &Session, message: &Message) -> Result<Option<ResponseType>> {
        {
            let mut context = session.context().await;
            if !context.state().is_open() {
                debug!(session_id = %session.id(), message_id = %message.id(), "Session closed, skipping turn");
                return Ok(None);
            }
            context.set_state(SessionState::Active);
            context.push_history(ChatMessage::user(message.input()));
        }
        info!(session_id = %session.id(), message_id = %message.id(), "Turn started");

        let history = self.load_history(session.id()).await;
        let request = self.build_request(history, message.input());

        let routed = match self.invoke(request, session.id()).await {
            Invocation::Answered(response) => {
                let routed = self
                    .classifier
                    .handle_llm_response(&response.text, session, &self.config.parse)
                    .await;
                self.remember_turn(session, message, &response, &routed).await?;
                routed.response_type
            }
            Invocation::Unreachable(text) => {
                session.trigger_conversation_handlers(&ParsedLlmResponse {
                    response_type: ResponseType::Conversation,
                    instruction: None,
                    content: Value::String(text.clone()),
                    answer: Some(text),
                    validation: ValidationResult::passed(self.config.parse.level),
                });
                self.remember(message.input(), "user", session.id(), Map::new(), vec![]).await?;
                ResponseType::Conversation
            }
        };

        info!(session_id = %session.id(), message_id = %message.id(), response_type = %routed, "Turn completed");
        Ok(Some(routed))
    }

    async fn load_history(&self, session_id: &str) -> Vec<ChatMessage> {
        let query = RecallQuery {
            limit: self.config.history_limit,
            session_id: Some(session_id.to_string()),
        };
        match self.memory.recall_recent_messages(query).await {
            Ok(history) => {
                debug!(session_id = %session_id, count = history.len(), "History loaded");
                history
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "History recall failed");
                Vec::new()
            }
        }
    }

    /// System prompt, optional assistant priming, history, then the user
    /// input. Tools mapped to an instruction are left out of the tool list.
    pub fn build_request(&self, history: Vec<ChatMessage>, input: &str) -> ProviderRequest {
        let classifications = self.classifier.prompt_classifications();

        let mut messages = Vec::with_capacity(history.len() + 3);
        messages.push(ChatMessage::system(self.prompts.system_prompt(classifications)));
        if let Some(priming) = self.prompts.assistant_prompt() {
            messages.push(ChatMessage::assistant(priming));
        }
        messages.extend(history);
        messages.push(ChatMessage::user(input));

        let hidden: HashSet<&str> = self.instruction_tools.values().map(String::as_str).collect();

        ProviderRequest {
            model: self.config.model.clone(),
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            tools: self.tools.definitions_excluding(&hidden),
            stream: self.config.stream,
        }
    }

    async fn invoke(&self, request: ProviderRequest, session_id: &str) -> Invocation {
        let result = if self.config.stream {
            self.invoke_streaming(request, session_id).await
        } else {
            self.provider
                .complete(request)
                .await
                .map(|response| AssembledResponse::from_message(response.message, response.finish_reason))
        };

        match result {
            Ok(response) => {
                debug!(
                    session_id = %session_id,
                    finish_reason = %response.finish_reason,
                    tool_calls = response.tool_calls.len(),
                    "Response assembled"
                );
                Invocation::Answered(response)
            }
            Err(e) => {
                warn!(session_id = %session_id, provider = self.provider.name(), error = %e, "Model call failed");
                let text = self.transport_errors.handle(&e);
                if self.config.stream {
                    let completion = Completion {
                        reason: FINISH_TRANSPORT_ERROR.into(),
                    };
                    self.callbacks.emit(&text, Some(&completion), Some(session_id));
                }
                Invocation::Unreachable(text)
            }
        }
    }

    async fn invoke_streaming(
        &self,
        request: ProviderRequest,
        session_id: &str,
    ) -> std::result::Result<AssembledResponse, ProviderError> {
        let mut chunks = self.provider.stream(request).await?;
        let mut assembler = StreamAssembler::new();

        while let Some(chunk) = chunks.recv().await {
            let chunk = chunk?;
            for line in assembler.push(&chunk) {
                self.callbacks.emit(&line, None, Some(session_id));
            }
        }

        let (remainder, response) = assembler.finish();
        let completion = Completion {
            reason: response.finish_reason.clone(),
        };
        self.callbacks
            .emit(remainder.as_deref().unwrap_or(""), Some(&completion), Some(session_id));
        Ok(response)
    }

    /// Persist the user input and what the turn produced.
    ///
    /// Tool-call turns store the assistant record with its calls followed by
    /// one `tool` record per result. Conversation and event turns store the
    /// template-extracted answer. Exceptions store nothing beyond the input.
    async fn remember_turn(&self, session: &Session, message: &Message, response: &AssembledResponse, routed: &Routed) -> Result<()> {
        let session_id = session.id();
        self.remember(message.input(), "user", session_id, Map::new(), vec![]).await?;

        match routed.response_type {
            ResponseType::ToolCall if !routed.tool_calls.is_empty() => {
                let mut extra = Map::new();
                extra.insert(META_TOOL_CALLS.into(), serde_json::to_value(&routed.tool_calls)?);
                self.remember(&response.text, "assistant", session_id, extra, vec!["tool_call".into()])
                    .await?;

                let mut context = session.context().await;
                context.push_history(ChatMessage::assistant_tool_calls(routed.tool_calls.clone()));
                for envelope in &routed.envelopes {
                    let Some(call_id) = &envelope.call_id else {
                        continue;
                    };
                    let text = envelope.to_prompt_text();
                    let mut extra = Map::new();
                    extra.insert(META_TOOL_CALL_ID.into(), Value::String(call_id.clone()));
                    self.remember(&text, "tool", session_id, extra, vec!["tool_result".into()])
                        .await?;
                    context.push_history(ChatMessage::tool_result(call_id.clone(), text));
                }
            }
            ResponseType::Exception => {
                debug!(session_id = %session_id, "Unclassified response not remembered");
            }
            _ => {
                let answer = self.prompts.extract_data_from_llm_response(&response.text);
                self.remember(&answer, "assistant", session_id, Map::new(), vec![]).await?;
                session.context().await.push_history(ChatMessage::assistant(answer));
            }
        }
        Ok(())
    }

    async fn remember(
        &self,
        content: &str,
        role: &str,
        session_id: &str,
        mut metadata: Map<String, Value>,
        tags: Vec<String>,
    ) -> Result<()> {
        metadata.insert(META_ROLE.into(), Value::String(role.into()));
        metadata.insert(META_SESSION_ID.into(), Value::String(session_id.into()));
        self.memory.remember(content.to_string(), tags, metadata).await?;
        Ok(())
    }
}

impl std::fmt::Debug for AgentCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCore")
            .field("agent_id", &self.config.agent_id)
            .field("provider", &self.provider.name())
            .field("classifier", &self.classifier.name())
            .field("tools", &self.tools.len())
            .finish()
    }
}
