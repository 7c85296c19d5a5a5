//! # Switchboard Core
//!
//! Domain types, collaborator traits, and error definitions for the
//! Switchboard agent runtime. Every external collaborator the agent talks to
//! (model transport, memory, tools, prompt templates) is a trait here;
//! implementations live in their own crates or in the embedding application.
//!
//! ## Dependency order
//!
//! `message` → `session_state` → `tool` → `classification` → (agent crate)

pub mod error;
pub mod message;
pub mod chat;
pub mod provider;
pub mod tool;
pub mod memory;
pub mod agent;
pub mod event;
pub mod schema;
pub mod classification;
pub mod session_state;
pub mod prompt;

// Re-export key types at crate root for ergonomics
pub use error::{ClassificationError, Error, FieldError, ProviderError, Result, ToolError, ValidationError};
pub use message::{Message, MessageBuilder, Priority};
pub use chat::{ChatMessage, Role, ToolCall};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallDelta};
pub use tool::{Tool, ToolContext, ToolOptions, ToolOutcome, ToolResultEnvelope};
pub use memory::{MemoryBackend, MemoryEntry, RecallQuery};
pub use agent::{AgentConfig, AgentState};
pub use event::{DomainEvent, EventBus, ToolEvent};
pub use schema::ValidationLevel;
pub use classification::{ClassificationTypeConfig, ParseOptions, ParsedLlmResponse, ResponseType, ValidationResult};
pub use session_state::SessionState;
pub use prompt::{DefaultPromptTemplate, DefaultTransportErrorHandler, PromptTemplate, TransportErrorHandler};
