//! Classification of finished model turns.
//!
//! A [`Classifier`] turns response text into a [`ParsedLlmResponse`] and then
//! routes it to the matching handler chain of a [`Session`]. When parsing
//! fails, the raw text is handed to the exception handlers together with a
//! best-effort `messageType` pulled out of it with a regex.

use std::sync::LazyLock;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use switchboard_core::chat::ToolCall;
use switchboard_core::classification::{
    ClassificationTypeConfig, MESSAGE_TYPE_FIELD, ParseOptions, ParsedLlmResponse, ResponseType, ValidationResult,
};
use switchboard_core::error::ClassificationError;
use switchboard_core::schema::{self, ValidationLevel};
use switchboard_core::session_state::SessionState;
use switchboard_core::tool::ToolResultEnvelope;
use tracing::{debug, warn};
use crate::session::{ExceptionEvent, Session};

/// Result of parsing one response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome {
    pub is_tool_call: bool,

    /// The requested calls when `is_tool_call` is set
    pub tool_calls: Vec<ToolCall>,

    pub parsed: ParsedLlmResponse,
}

/// What a classified turn was routed to.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub response_type: ResponseType,

    /// `None` when the response could not be parsed
    pub parsed: Option<ParsedLlmResponse>,

    pub tool_calls: Vec<ToolCall>,

    /// One envelope per executed tool call
    pub envelopes: Vec<ToolResultEnvelope>,
}

/// Parsing strategy plus the shared routing logic.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Strategy name, for logs.
    fn name(&self) -> &str;

    fn classifications(&self) -> &[ClassificationTypeConfig];

    /// Classifications described to the model in the system prompt.
    fn prompt_classifications(&self) -> &[ClassificationTypeConfig] {
        self.classifications()
    }

    fn parse_llm_response(&self, raw: &str, options: &ParseOptions) -> Result<ParseOutcome, ClassificationError>;

    /// Classify `raw` and fan it out to `session`'s handlers.
    ///
    /// Never fails: a response that does not parse goes to the exception
    /// handlers with its raw text and the session enters `ErrorRecovery`.
    async fn handle_llm_response(&self, raw: &str, session: &Session, options: &ParseOptions) -> Routed {
        let outcome = match self.parse_llm_response(raw, options) {
            Ok(outcome) => outcome,
            Err(e) => return fall_back(raw, e, session).await,
        };

        if outcome.is_tool_call {
            debug!(session_id = %session.id(), count = outcome.tool_calls.len(), "Routing tool calls");
            let envelopes = session.trigger_tool_calls_handlers(&outcome.tool_calls).await;
            return Routed {
                response_type: ResponseType::ToolCall,
                parsed: Some(outcome.parsed),
                tool_calls: outcome.tool_calls,
                envelopes,
            };
        }

        let parsed = outcome.parsed;
        session
            .context()
            .await
            .set_current_instruction(parsed.instruction.clone());
        debug!(
            session_id = %session.id(),
            classifier = self.name(),
            instruction = ?parsed.instruction,
            response_type = %parsed.response_type,
            "Response classified"
        );

        let mut envelopes = Vec::new();
        match parsed.response_type {
            ResponseType::Conversation => {
                session.trigger_conversation_handlers(&parsed);
            }
            ResponseType::Exception => {
                session.trigger_exception_handlers(&ExceptionEvent {
                    instruction: parsed.instruction.clone(),
                    error: "model reported an exception".into(),
                    raw_response: raw.to_string(),
                    parsed: Some(parsed.clone()),
                });
            }
            ResponseType::Event | ResponseType::Routing | ResponseType::ToolCall => {
                if let crate::session::SessionEvent::ToolResult(envelope) =
                    session.trigger_event_handlers(parsed.clone()).await
                {
                    envelopes.push(envelope);
                }
            }
        }

        Routed {
            response_type: parsed.response_type,
            parsed: Some(parsed),
            tool_calls: Vec::new(),
            envelopes,
        }
    }
}

async fn fall_back(raw: &str, error: ClassificationError, session: &Session) -> Routed {
    let instruction = extract_message_type(raw);
    warn!(
        session_id = %session.id(),
        error = %error,
        instruction = ?instruction,
        "Response could not be classified"
    );

    {
        let mut context = session.context().await;
        context.set_state(SessionState::ErrorRecovery);
        context.set_current_instruction(instruction.clone());
    }

    session.trigger_exception_handlers(&ExceptionEvent {
        instruction,
        error: error.to_string(),
        raw_response: raw.to_string(),
        parsed: None,
    });

    Routed {
        response_type: ResponseType::Exception,
        parsed: None,
        tool_calls: Vec::new(),
        envelopes: Vec::new(),
    }
}

static MESSAGE_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""messageType"\s*:\s*"([^"]*)""#).expect("messageType regex must compile")
});

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced json regex must compile")
});

/// Pull the `messageType` value out of text that may not be valid JSON.
pub fn extract_message_type(raw: &str) -> Option<String> {
    MESSAGE_TYPE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Recognize a serialized tool-call list: either a JSON array of calls or
/// an object with a `tool_calls` array.
pub fn detect_tool_calls(raw: &str) -> Option<Vec<ToolCall>> {
    let value: Value = serde_json::from_str(raw.trim()).ok()?;
    let list = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => map.remove("tool_calls")?,
        _ => return None,
    };
    let calls: Vec<ToolCall> = serde_json::from_value(list).ok()?;
    (!calls.is_empty()).then_some(calls)
}

fn tool_call_outcome(raw: &str, level: ValidationLevel) -> Option<ParseOutcome> {
    let tool_calls = detect_tool_calls(raw)?;
    let content = serde_json::to_value(&tool_calls).unwrap_or(Value::Null);
    Some(ParseOutcome {
        is_tool_call: true,
        tool_calls,
        parsed: ParsedLlmResponse {
            response_type: ResponseType::ToolCall,
            instruction: None,
            content,
            answer: None,
            validation: ValidationResult::passed(level),
        },
    })
}

/// Parse `raw` as a JSON object. With `allow_partial_match`, an object inside
/// a code fence or surrounded by prose is accepted too.
fn parse_object(raw: &str, allow_partial_match: bool) -> Result<serde_json::Map<String, Value>, ClassificationError> {
    let direct = serde_json::from_str::<Value>(raw.trim());
    let value = match direct {
        Ok(value) => value,
        Err(e) if allow_partial_match => embedded_json(raw)
            .and_then(|blob| serde_json::from_str::<Value>(blob).ok())
            .ok_or_else(|| ClassificationError::InvalidJson(e.to_string()))?,
        Err(e) => return Err(ClassificationError::InvalidJson(e.to_string())),
    };

    match value {
        Value::Object(map) => Ok(map),
        other => Err(ClassificationError::InvalidJson(format!(
            "expected a JSON object, got {}",
            match other {
                Value::Array(_) => "an array",
                Value::String(_) => "a string",
                Value::Number(_) => "a number",
                Value::Bool(_) => "a boolean",
                _ => "null",
            }
        ))),
    }
}

fn embedded_json(raw: &str) -> Option<&str> {
    if let Some(caps) = FENCED_JSON.captures(raw) {
        return caps.get(1).map(|m| m.as_str());
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}

fn answer_of(object: &serde_json::Map<String, Value>) -> Option<String> {
    ["answer", "response", "message"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(String::from)
}

/// Always resolves to the first configured classification and treats the
/// whole text as the answer.
#[derive(Debug, Clone)]
pub struct BareClassifier {
    classifications: Vec<ClassificationTypeConfig>,
}

impl BareClassifier {
    pub fn new(classifications: Vec<ClassificationTypeConfig>) -> Self {
        Self { classifications }
    }
}

#[async_trait]
impl Classifier for BareClassifier {
    fn name(&self) -> &str {
        "bare"
    }

    fn classifications(&self) -> &[ClassificationTypeConfig] {
        &self.classifications
    }

    /// Free text is expected, so no schema is shown.
    fn prompt_classifications(&self) -> &[ClassificationTypeConfig] {
        &[]
    }

    fn parse_llm_response(&self, raw: &str, options: &ParseOptions) -> Result<ParseOutcome, ClassificationError> {
        if let Some(outcome) = tool_call_outcome(raw, options.level) {
            return Ok(outcome);
        }
        let first = self.classifications.first().ok_or(ClassificationError::NoClassifications)?;
        Ok(ParseOutcome {
            is_tool_call: false,
            tool_calls: Vec::new(),
            parsed: ParsedLlmResponse {
                response_type: first.kind,
                instruction: Some(first.name.clone()),
                content: Value::String(raw.to_string()),
                answer: Some(raw.to_string()),
                validation: ValidationResult::passed(options.level),
            },
        })
    }
}

/// Requires a JSON object tagged with a configured `messageType` and checks
/// it against that classification's schema.
#[derive(Debug, Clone)]
pub struct SimpleClassifier {
    classifications: Vec<ClassificationTypeConfig>,
}

impl SimpleClassifier {
    pub fn new(classifications: Vec<ClassificationTypeConfig>) -> Self {
        Self { classifications }
    }

    fn resolve(&self, tag: Option<&str>, options: &ParseOptions) -> Result<&ClassificationTypeConfig, ClassificationError> {
        match tag {
            Some(tag) => self
                .classifications
                .iter()
                .find(|c| c.name == tag)
                .ok_or_else(|| ClassificationError::UnknownMessageType(tag.to_string())),
            None if options.require_message_type => Err(ClassificationError::MissingMessageType),
            None => self.classifications.first().ok_or(ClassificationError::NoClassifications),
        }
    }
}

#[async_trait]
impl Classifier for SimpleClassifier {
    fn name(&self) -> &str {
        "simple"
    }

    fn classifications(&self) -> &[ClassificationTypeConfig] {
        &self.classifications
    }

    fn parse_llm_response(&self, raw: &str, options: &ParseOptions) -> Result<ParseOutcome, ClassificationError> {
        if let Some(outcome) = tool_call_outcome(raw, options.level) {
            return Ok(outcome);
        }
        if self.classifications.is_empty() {
            return Err(ClassificationError::NoClassifications);
        }

        let mut object = parse_object(raw, options.allow_partial_match)?;
        let tag = object.get(MESSAGE_TYPE_FIELD).and_then(Value::as_str).map(String::from);
        let config = self.resolve(tag.as_deref(), options)?;
        if tag.is_none() {
            object.insert(MESSAGE_TYPE_FIELD.into(), Value::String(config.name.clone()));
        }

        let content = Value::Object(object);
        let validation = ValidationResult::from_errors(
            options.level,
            schema::validate(&content, &config.json_schema(), options.level),
        );
        if !validation.valid {
            return Err(ClassificationError::SchemaMismatch {
                message_type: config.name.clone(),
                errors: validation.errors,
            });
        }

        let answer = content.as_object().and_then(answer_of);
        Ok(ParseOutcome {
            is_tool_call: false,
            tool_calls: Vec::new(),
            parsed: ParsedLlmResponse {
                response_type: config.kind,
                instruction: Some(config.name.clone()),
                content,
                answer,
                validation,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use switchboard_tools::ToolRegistry;
    use crate::mailbox::Mailbox;

    fn configs() -> Vec<ClassificationTypeConfig> {
        vec![
            ClassificationTypeConfig::new(
                "BOOK_FLIGHT",
                "Book a flight",
                json!({
                    "type": "object",
                    "properties": { "destination": { "type": "string" } },
                    "required": ["destination"]
                }),
            ),
            ClassificationTypeConfig::new(
                "SMALL_TALK",
                "Chit-chat",
                json!({ "type": "object", "properties": { "answer": { "type": "string" } } }),
            )
            .with_kind(ResponseType::Conversation),
        ]
    }

    fn options(level: ValidationLevel) -> ParseOptions {
        ParseOptions {
            level,
            ..ParseOptions::default()
        }
    }

    fn session() -> Session {
        Session::new(
            "agent",
            "test",
            Arc::new(Mailbox::new()),
            Arc::new(ToolRegistry::new()),
            Arc::new(HashMap::new()),
        )
    }

    #[test]
    fn extracts_message_type_from_truncated_json() {
        assert_eq!(extract_message_type(r#"{"messageType":"FOO""#).as_deref(), Some("FOO"));
        assert_eq!(extract_message_type(r#"{ "messageType" : "BAR", "x": 1"#).as_deref(), Some("BAR"));
        assert_eq!(extract_message_type("no tag here"), None);
    }

    #[test]
    fn simple_resolves_tagged_object() {
        let classifier = SimpleClassifier::new(configs());
        let outcome = classifier
            .parse_llm_response(r#"{"messageType":"BOOK_FLIGHT","destination":"Rome"}"#, &options(ValidationLevel::Lenient))
            .unwrap();
        assert!(!outcome.is_tool_call);
        assert_eq!(outcome.parsed.instruction.as_deref(), Some("BOOK_FLIGHT"));
        assert_eq!(outcome.parsed.response_type, ResponseType::Event);
        assert!(outcome.parsed.validation.valid);
    }

    #[test]
    fn simple_rejects_missing_and_unknown_tags() {
        let classifier = SimpleClassifier::new(configs());
        let opts = options(ValidationLevel::Lenient);
        assert!(matches!(
            classifier.parse_llm_response(r#"{"destination":"Rome"}"#, &opts),
            Err(ClassificationError::MissingMessageType)
        ));
        assert!(matches!(
            classifier.parse_llm_response(r#"{"messageType":"DANCE"}"#, &opts),
            Err(ClassificationError::UnknownMessageType(t)) if t == "DANCE"
        ));
    }

    #[test]
    fn missing_tag_falls_to_first_when_not_required() {
        let classifier = SimpleClassifier::new(configs());
        let opts = ParseOptions {
            require_message_type: false,
            ..ParseOptions::default()
        };
        let outcome = classifier.parse_llm_response(r#"{"destination":"Rome"}"#, &opts).unwrap();
        assert_eq!(outcome.parsed.instruction.as_deref(), Some("BOOK_FLIGHT"));
        assert_eq!(outcome.parsed.content["messageType"], "BOOK_FLIGHT");

        assert!(classifier.parse_llm_response(r#"{"messageType":"DANCE"}"#, &opts).is_err());
    }

    #[test]
    fn validation_levels() {
        let classifier = SimpleClassifier::new(configs());
        let extra = r#"{"messageType":"BOOK_FLIGHT","destination":"Rome","seats":2}"#;
        let missing = r#"{"messageType":"BOOK_FLIGHT"}"#;

        let lenient = classifier.parse_llm_response(extra, &options(ValidationLevel::Lenient)).unwrap();
        assert_eq!(lenient.parsed.validation.level, ValidationLevel::Lenient);
        assert!(lenient.parsed.validation.valid);
        assert!(lenient.parsed.validation.errors.is_empty());

        match classifier.parse_llm_response(extra, &options(ValidationLevel::Strict)) {
            Err(ClassificationError::SchemaMismatch { message_type, errors }) => {
                assert_eq!(message_type, "BOOK_FLIGHT");
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].field, "seats");
            }
            other => panic!("expected a schema mismatch, got {other:?}"),
        }
        assert!(classifier.parse_llm_response(missing, &options(ValidationLevel::Lenient)).is_err());

        let unchecked = classifier.parse_llm_response(missing, &options(ValidationLevel::None)).unwrap();
        assert_eq!(unchecked.parsed.validation.level, ValidationLevel::None);
        assert!(unchecked.parsed.validation.valid);
    }

    #[test]
    fn partial_match_finds_object_in_prose_and_fences() {
        let classifier = SimpleClassifier::new(configs());
        let fenced = "Here you go:\n```json\n{\"messageType\":\"SMALL_TALK\",\"answer\":\"hi\"}\n```";
        let prose = "Sure! {\"messageType\":\"SMALL_TALK\",\"answer\":\"hello\"} Anything else?";

        let outcome = classifier.parse_llm_response(fenced, &ParseOptions::default()).unwrap();
        assert_eq!(outcome.parsed.answer.as_deref(), Some("hi"));
        let outcome = classifier.parse_llm_response(prose, &ParseOptions::default()).unwrap();
        assert_eq!(outcome.parsed.answer.as_deref(), Some("hello"));

        let strict = ParseOptions {
            allow_partial_match: false,
            ..ParseOptions::default()
        };
        assert!(matches!(
            classifier.parse_llm_response(prose, &strict),
            Err(ClassificationError::InvalidJson(_))
        ));
    }

    #[test]
    fn serialized_tool_calls_are_detected() {
        let calls = vec![ToolCall::new("call_1", "search", "{}")];
        let raw = serde_json::to_string(&calls).unwrap();
        let outcome = SimpleClassifier::new(configs())
            .parse_llm_response(&raw, &ParseOptions::default())
            .unwrap();
        assert!(outcome.is_tool_call);
        assert_eq!(outcome.tool_calls, calls);

        let wrapped = json!({ "tool_calls": calls }).to_string();
        assert_eq!(detect_tool_calls(&wrapped), Some(calls));
        assert_eq!(detect_tool_calls("[]"), None);
    }

    #[test]
    fn bare_answers_with_first_type() {
        let classifier = BareClassifier::new(configs());
        let outcome = classifier.parse_llm_response("Just some text", &ParseOptions::default()).unwrap();
        assert_eq!(outcome.parsed.instruction.as_deref(), Some("BOOK_FLIGHT"));
        assert_eq!(outcome.parsed.answer.as_deref(), Some("Just some text"));

        assert!(matches!(
            BareClassifier::new(vec![]).parse_llm_response("x", &ParseOptions::default()),
            Err(ClassificationError::NoClassifications)
        ));
    }

    #[tokio::test]
    async fn unparseable_response_reaches_exception_handlers() {
        let session = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.on_exception(move |e| sink.lock().unwrap().push(e.clone()));

        let raw = r#"{"messageType":"FOO""#;
        let routed = SimpleClassifier::new(configs())
            .handle_llm_response(raw, &session, &ParseOptions::default())
            .await;

        assert_eq!(routed.response_type, ResponseType::Exception);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].instruction.as_deref(), Some("FOO"));
        assert_eq!(seen[0].raw_response, raw);
        assert_eq!(session.state().await, SessionState::ErrorRecovery);
    }

    #[tokio::test]
    async fn conversation_kind_goes_to_conversation_handlers() {
        let session = session();
        let conversations = Arc::new(Mutex::new(0));
        let events = Arc::new(Mutex::new(0));
        {
            let c = conversations.clone();
            session.on_conversation(move |_| *c.lock().unwrap() += 1);
            let e = events.clone();
            session.on_event(move |_| *e.lock().unwrap() += 1);
        }

        let classifier = SimpleClassifier::new(configs());
        let routed = classifier
            .handle_llm_response(r#"{"messageType":"SMALL_TALK","answer":"hey"}"#, &session, &ParseOptions::default())
            .await;
        assert_eq!(routed.response_type, ResponseType::Conversation);

        classifier
            .handle_llm_response(r#"{"messageType":"BOOK_FLIGHT","destination":"Rome"}"#, &session, &ParseOptions::default())
            .await;

        assert_eq!(*conversations.lock().unwrap(), 1);
        assert_eq!(*events.lock().unwrap(), 1);
        assert_eq!(session.context().await.current_instruction(), Some("BOOK_FLIGHT"));
    }
}
