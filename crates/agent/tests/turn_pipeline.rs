//! End-to-end tests of the agent turn pipeline.
//!
//! Each test wires an [`AgentCore`] to a scripted provider, sends messages
//! through a session and waits for the turn events on the event bus.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use switchboard_agent::{AgentCore, SessionEvent};
use switchboard_core::agent::AgentConfig;
use switchboard_core::chat::{ChatMessage, Role};
use switchboard_core::classification::{ClassificationTypeConfig, ResponseType};
use switchboard_core::error::{ProviderError, ToolError};
use switchboard_core::event::DomainEvent;
use switchboard_core::message::Priority;
use switchboard_core::provider::{
    ChunkReceiver, FINISH_STOP, FINISH_TOOL_CALLS, Provider, ProviderRequest, ProviderResponse, StreamChunk,
    ToolCallDelta,
};
use switchboard_core::session_state::SessionState;
use switchboard_core::tool::{Tool, ToolContext};
use switchboard_memory::InMemoryBackend;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

// ── Scripted provider ────────────────────────────────────────────────────

enum Script {
    Complete(String),
    Stream(Vec<StreamChunk>),
    Fail(ProviderError),
}

/// Replies with scripted turns in order and records every request.
struct ScriptedProvider {
    script: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next(&self, request: ProviderRequest) -> Script {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .expect("ScriptedProvider exhausted")
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let model = request.model.clone();
        match self.next(request) {
            Script::Complete(text) => Ok(ProviderResponse {
                message: ChatMessage::assistant(text),
                usage: None,
                model,
                finish_reason: Some(FINISH_STOP.into()),
            }),
            Script::Fail(e) => Err(e),
            Script::Stream(_) => panic!("streamed script used for a complete call"),
        }
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        match self.next(request) {
            Script::Stream(chunks) => {
                let (tx, rx) = tokio::sync::mpsc::channel(chunks.len() + 1);
                for chunk in chunks {
                    tx.send(Ok(chunk)).await.unwrap();
                }
                Ok(rx)
            }
            Script::Fail(e) => Err(e),
            Script::Complete(_) => panic!("complete script used for a streamed call"),
        }
    }
}

/// Answers every turn with a SMALL_TALK object echoing the user input.
struct EchoProvider {
    requests: Mutex<Vec<ProviderRequest>>,
}

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let input = request.messages.last().map(|m| m.text().to_string()).unwrap_or_default();
        self.requests.lock().unwrap().push(request.clone());
        Ok(ProviderResponse {
            message: ChatMessage::assistant(json!({ "messageType": "SMALL_TALK", "answer": input }).to_string()),
            usage: None,
            model: request.model,
            finish_reason: None,
        })
    }
}

// ── Tools ────────────────────────────────────────────────────────────────

struct FlightTool;

#[async_trait]
impl Tool for FlightTool {
    fn name(&self) -> &str {
        "FlightTool"
    }
    fn description(&self) -> &str {
        "Books a flight"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "destination": { "type": "string" } },
            "required": ["destination"]
        })
    }
    async fn execute(&self, input: Value, _context: &ToolContext, _cancel: CancellationToken) -> Result<Value, ToolError> {
        Ok(json!({ "booked": input["destination"] }))
    }
}

struct WeatherTool;

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "WeatherTool"
    }
    fn description(&self) -> &str {
        "Looks up the forecast"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "city": { "type": "string" } },
            "required": ["city"]
        })
    }
    async fn execute(&self, input: Value, _context: &ToolContext, _cancel: CancellationToken) -> Result<Value, ToolError> {
        Ok(json!({ "city": input["city"], "forecast": "sunny" }))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn config(stream: bool) -> AgentConfig {
    let mut config = AgentConfig::new("mock-model");
    config.poll_interval_ms = 10;
    config.stream = stream;
    config
}

fn small_talk() -> ClassificationTypeConfig {
    ClassificationTypeConfig::new(
        "SMALL_TALK",
        "Chit-chat with the user",
        json!({ "type": "object", "properties": { "answer": { "type": "string" } } }),
    )
    .with_kind(ResponseType::Conversation)
}

fn book_flight() -> ClassificationTypeConfig {
    ClassificationTypeConfig::new(
        "BOOK_FLIGHT",
        "Book a flight",
        json!({
            "type": "object",
            "properties": { "destination": { "type": "string" } },
            "required": ["destination"]
        }),
    )
}

/// Wait for `n` turns to finish, completed or failed.
async fn wait_for_turns(events: &mut broadcast::Receiver<Arc<DomainEvent>>, n: usize) -> Vec<Arc<DomainEvent>> {
    let mut turns = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), async {
        while turns.len() < n {
            let event = events.recv().await.expect("event bus closed");
            if matches!(*event, DomainEvent::TurnCompleted { .. } | DomainEvent::TurnFailed { .. }) {
                turns.push(event);
            }
        }
    })
    .await
    .expect("turns did not finish in time");
    turns
}

fn response_type(event: &DomainEvent) -> ResponseType {
    match event {
        DomainEvent::TurnCompleted { response_type, .. } => *response_type,
        other => panic!("expected a completed turn, got {other:?}"),
    }
}

// ── Ordering ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn turns_run_in_enqueue_order_with_history() {
    let provider = Arc::new(EchoProvider {
        requests: Mutex::new(Vec::new()),
    });
    let memory = Arc::new(InMemoryBackend::new());
    let core = AgentCore::builder(config(false))
        .with_provider(provider.clone())
        .with_memory(memory.clone())
        .with_classification(small_talk())
        .build()
        .unwrap();
    let mut events = core.events().subscribe();

    let session = core.create_session("ordering");
    let answers = Arc::new(Mutex::new(Vec::new()));
    {
        let answers = answers.clone();
        session.on_conversation(move |parsed| answers.lock().unwrap().push(parsed.answer.clone().unwrap_or_default()));
    }

    for text in ["one", "two", "three"] {
        session.chat(text);
    }
    core.start().unwrap();
    wait_for_turns(&mut events, 3).await;
    core.stop().await;

    assert_eq!(*answers.lock().unwrap(), vec!["one", "two", "three"]);

    // The third prompt carries the first two turns as history
    let requests = provider.requests.lock().unwrap();
    let third: Vec<(Role, &str)> = requests[2].messages[1..].iter().map(|m| (m.role, m.text())).collect();
    assert_eq!(
        third,
        vec![
            (Role::User, "one"),
            (Role::Assistant, "one"),
            (Role::User, "two"),
            (Role::Assistant, "two"),
            (Role::User, "three"),
        ]
    );
    assert_eq!(memory.count().await, 6);
    assert_eq!(core.state().turns_completed, 3);
}

#[tokio::test(start_paused = true)]
async fn high_priority_message_is_handled_first() {
    let provider = Arc::new(EchoProvider {
        requests: Mutex::new(Vec::new()),
    });
    let core = AgentCore::builder(config(false))
        .with_provider(provider)
        .with_classification(small_talk())
        .build()
        .unwrap();
    let mut events = core.events().subscribe();

    let session = core.create_session("priority");
    let answers = Arc::new(Mutex::new(Vec::new()));
    {
        let answers = answers.clone();
        session.on_conversation(move |parsed| answers.lock().unwrap().push(parsed.answer.clone().unwrap_or_default()));
    }

    session.chat_with_priority("later", Priority::Low);
    session.chat("normal");
    session.chat_with_priority("urgent", Priority::High);
    core.start().unwrap();
    wait_for_turns(&mut events, 3).await;
    core.stop().await;

    assert_eq!(*answers.lock().unwrap(), vec!["urgent", "normal", "later"]);
}

// ── Instruction-mapped tools ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn mapped_tool_is_hidden_and_runs_on_its_instruction() {
    let provider = ScriptedProvider::new(vec![Script::Complete(
        json!({ "messageType": "BOOK_FLIGHT", "destination": "Lisbon" }).to_string(),
    )]);
    let core = AgentCore::builder(config(false))
        .with_provider(provider.clone())
        .with_tool(Arc::new(FlightTool))
        .with_tool(Arc::new(WeatherTool))
        .with_instruction_tool("BOOK_FLIGHT", "FlightTool")
        .with_classifications([book_flight(), small_talk()])
        .build()
        .unwrap();
    let mut events = core.events().subscribe();

    let session = core.create_session("flights");
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        session.on_event(move |event| seen.lock().unwrap().push(event.clone()));
    }

    session.chat("Book me a flight to Lisbon");
    core.start().unwrap();
    let turns = wait_for_turns(&mut events, 1).await;
    core.stop().await;

    assert_eq!(response_type(&turns[0]), ResponseType::Event);

    let requests = provider.requests();
    let offered: Vec<&str> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(offered, vec!["WeatherTool"]);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    match &seen[0] {
        SessionEvent::ToolResult(envelope) => {
            assert_eq!(envelope.tool_name, "FlightTool");
            assert!(envelope.is_success());
            assert_eq!(serde_json::to_value(envelope).unwrap()["data"]["booked"], "Lisbon");
        }
        other => panic!("expected a tool result, got {other:?}"),
    }
    assert_eq!(session.context().await.current_instruction(), Some("BOOK_FLIGHT"));
}

// ── Streaming ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn streamed_lines_reach_callbacks_whole() {
    let provider = ScriptedProvider::new(vec![Script::Stream(vec![
        StreamChunk::text("a"),
        StreamChunk::text("b\nc"),
        StreamChunk::text("d\ne"),
        StreamChunk::text("f"),
        StreamChunk::finish(FINISH_STOP),
    ])]);
    let core = AgentCore::builder(config(true))
        .with_provider(provider)
        .build()
        .unwrap();
    let mut events = core.events().subscribe();

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    {
        let deliveries = deliveries.clone();
        core.stream_callbacks().register(move |delta, completion, session_id| {
            deliveries.lock().unwrap().push((
                delta.to_string(),
                completion.map(|c| c.reason.clone()),
                session_id.map(String::from),
            ));
        });
    }

    let session = core.create_session("stream");
    let answers = Arc::new(Mutex::new(Vec::new()));
    {
        let answers = answers.clone();
        session.on_conversation(move |parsed| answers.lock().unwrap().push(parsed.answer.clone()));
    }

    session.chat("spell it");
    core.start().unwrap();
    wait_for_turns(&mut events, 1).await;
    core.stop().await;

    let deliveries = deliveries.lock().unwrap();
    let texts: Vec<&str> = deliveries.iter().map(|(d, _, _)| d.as_str()).filter(|d| !d.is_empty()).collect();
    assert_eq!(texts, vec!["ab\n", "cd\n", "ef"]);

    let (_, completion, session_id) = deliveries.last().unwrap();
    assert_eq!(completion.as_deref(), Some(FINISH_STOP));
    assert_eq!(session_id.as_deref(), Some(session.id()));
    assert!(deliveries[..deliveries.len() - 1].iter().all(|(_, c, _)| c.is_none()));

    assert_eq!(*answers.lock().unwrap(), vec![Some("ab\ncd\nef".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn streamed_tool_calls_run_and_are_remembered() {
    let provider = ScriptedProvider::new(vec![
        Script::Stream(vec![
            StreamChunk::text("Checking both cities.\n"),
            StreamChunk {
                tool_calls: vec![ToolCallDelta::start(0, "call_a", "WeatherTool")],
                ..StreamChunk::default()
            },
            StreamChunk {
                tool_calls: vec![
                    ToolCallDelta::start(1, "call_b", "WeatherTool"),
                    ToolCallDelta::arguments(0, "{\"city\":"),
                ],
                ..StreamChunk::default()
            },
            StreamChunk {
                tool_calls: vec![ToolCallDelta::arguments(1, "{\"city\":\"Oslo\"}")],
                ..StreamChunk::default()
            },
            StreamChunk {
                tool_calls: vec![ToolCallDelta::arguments(0, "\"Rome\"}")],
                ..StreamChunk::default()
            },
            StreamChunk::finish(FINISH_TOOL_CALLS),
        ]),
        Script::Stream(vec![StreamChunk::text("Sunny in both."), StreamChunk::finish(FINISH_STOP)]),
    ]);
    let memory = Arc::new(InMemoryBackend::new());
    let core = AgentCore::builder(config(true))
        .with_provider(provider.clone())
        .with_memory(memory.clone())
        .with_tool(Arc::new(WeatherTool))
        .build()
        .unwrap();
    let mut events = core.events().subscribe();

    let session = core.create_session("weather");
    let results = Arc::new(Mutex::new(Vec::new()));
    {
        let results = results.clone();
        session.on_tool_result(move |envelope| results.lock().unwrap().push(envelope.clone()));
    }

    session.chat("Weather in Rome and Oslo?");
    session.chat("Thanks");
    core.start().unwrap();
    let turns = wait_for_turns(&mut events, 2).await;
    core.stop().await;

    assert_eq!(response_type(&turns[0]), ResponseType::ToolCall);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].call_id.as_deref(), Some("call_a"));
    assert_eq!(results[1].call_id.as_deref(), Some("call_b"));
    let cities: Vec<Value> = results
        .iter()
        .map(|r| serde_json::to_value(r).unwrap()["data"]["city"].clone())
        .collect();
    assert_eq!(cities, vec![json!("Rome"), json!("Oslo")]);

    // The follow-up prompt replays the tool exchange the provider way
    let requests = provider.requests();
    let history = &requests[1].messages;
    let assistant = history
        .iter()
        .find(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
        .expect("assistant tool call record");
    assert!(assistant.content.is_none());
    assert_eq!(assistant.tool_calls.len(), 2);
    assert_eq!(assistant.tool_calls[0].function.arguments, "{\"city\":\"Rome\"}");

    let tool_ids: Vec<&str> = history
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assert_eq!(tool_ids, vec!["call_a", "call_b"]);
    assert!(history.iter().all(|m| !m.text().contains("Checking both cities")));

    // user, assistant calls, 2 tool results, user, assistant answer
    assert_eq!(memory.count().await, 6);
}

// ── Failure paths ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn transport_failure_is_answered_as_plain_text() {
    let provider = ScriptedProvider::new(vec![Script::Fail(ProviderError::RateLimited { retry_after_secs: 3 })]);
    let memory = Arc::new(InMemoryBackend::new());
    let core = AgentCore::builder(config(false))
        .with_provider(provider)
        .with_memory(memory.clone())
        .with_classification(small_talk())
        .build()
        .unwrap();
    let mut events = core.events().subscribe();

    let session = core.create_session("offline");
    let answers = Arc::new(Mutex::new(Vec::new()));
    {
        let answers = answers.clone();
        session.on_conversation(move |parsed| answers.lock().unwrap().push(parsed.answer.clone().unwrap_or_default()));
    }

    session.chat("hello?");
    core.start().unwrap();
    let turns = wait_for_turns(&mut events, 1).await;
    core.stop().await;

    assert_eq!(response_type(&turns[0]), ResponseType::Conversation);
    let answers = answers.lock().unwrap();
    assert_eq!(answers.len(), 1);
    assert!(answers[0].contains('3'));
    assert_eq!(memory.count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn truncated_response_goes_to_exception_handlers() {
    let raw = r#"{"messageType":"FOO""#;
    let provider = ScriptedProvider::new(vec![
        Script::Complete(raw.into()),
        Script::Complete(json!({ "messageType": "SMALL_TALK", "answer": "better" }).to_string()),
    ]);
    let core = AgentCore::builder(config(false))
        .with_provider(provider)
        .with_classifications([book_flight(), small_talk()])
        .build()
        .unwrap();
    let mut events = core.events().subscribe();

    let session = core.create_session("broken");
    let exceptions = Arc::new(Mutex::new(Vec::new()));
    {
        let exceptions = exceptions.clone();
        session.on_exception(move |event| exceptions.lock().unwrap().push(event.clone()));
    }
    let mut states = Vec::new();

    session.chat("first");
    core.start().unwrap();
    let turns = wait_for_turns(&mut events, 1).await;
    states.push(session.state().await);

    // The loop keeps going after a bad turn
    session.chat("second");
    let turns_after = wait_for_turns(&mut events, 1).await;
    states.push(session.state().await);
    core.stop().await;

    assert_eq!(response_type(&turns[0]), ResponseType::Exception);
    assert_eq!(response_type(&turns_after[0]), ResponseType::Conversation);

    let exceptions = exceptions.lock().unwrap();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].instruction.as_deref(), Some("FOO"));
    assert_eq!(exceptions[0].raw_response, raw);
    assert!(exceptions[0].parsed.is_none());

    assert_eq!(states, vec![SessionState::ErrorRecovery, SessionState::Active]);
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_fails_the_turn_and_the_loop_continues() {
    let provider = Arc::new(EchoProvider {
        requests: Mutex::new(Vec::new()),
    });
    let core = AgentCore::builder(config(false))
        .with_provider(provider)
        .with_classification(small_talk())
        .build()
        .unwrap();
    let mut events = core.events().subscribe();

    let session = core.create_session("fragile");
    let answers = Arc::new(Mutex::new(Vec::new()));
    {
        let answers = answers.clone();
        session.on_conversation(move |parsed| {
            let answer = parsed.answer.clone().unwrap_or_default();
            if answer == "boom" {
                panic!("conversation handler exploded");
            }
            answers.lock().unwrap().push(answer);
        });
    }

    session.chat("boom");
    session.chat("after");
    core.start().unwrap();
    let turns = wait_for_turns(&mut events, 2).await;
    core.stop().await;

    match &*turns[0] {
        DomainEvent::TurnFailed { error_message, .. } => assert!(error_message.contains("conversation handler exploded")),
        other => panic!("expected a failed turn, got {other:?}"),
    }
    assert_eq!(response_type(&turns[1]), ResponseType::Conversation);
    assert_eq!(*answers.lock().unwrap(), vec!["after"]);

    let state = core.state();
    assert!(!state.is_busy);
    assert_eq!(state.turns_failed, 1);
    assert_eq!(state.turns_completed, 1);
}

// ── Lifecycle ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stop_terminates_sessions_and_later_turns_are_skipped() {
    let provider = ScriptedProvider::new(vec![]);
    let core = AgentCore::builder(config(false))
        .with_provider(provider.clone())
        .build()
        .unwrap();

    let session = core.create_session("short");
    core.start().unwrap();
    assert!(core.start().is_err());
    core.stop().await;

    assert_eq!(session.state().await, SessionState::Terminated);
    assert!(!core.mailbox().is_running());

    // A terminated session's messages are dropped without calling the model
    session.chat("anyone there?");
    core.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    core.stop().await;
    assert!(core.mailbox().is_empty());
    assert!(provider.requests().is_empty());
}
