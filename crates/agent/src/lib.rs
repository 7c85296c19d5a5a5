//! The Switchboard agent runtime.
//!
//! Messages enter through a [`Session`], wait in the agent's priority
//! [`Mailbox`] and are consumed one at a time by [`AgentCore`]:
//!
//! 1. **Dequeue** a message and load the session's recent history
//! 2. **Prompt** the model with history, classifications and unmapped tools
//! 3. **Assemble** the streamed or complete response ([`StreamAssembler`])
//! 4. **Classify** it into a typed response ([`Classifier`])
//! 5. **Route** it to the session's event, tool-result, conversation or
//!    exception handlers, then remember the turn
//!
//! Only one turn per agent is in flight at a time, so a session's history
//! never interleaves.

pub mod assembler;
pub mod callbacks;
pub mod classifier;
pub mod handlers;
pub mod mailbox;
pub mod orchestrator;
pub mod session;

pub use assembler::{AssembledResponse, LineBuffer, StreamAssembler, ToolCallAccumulator};
pub use callbacks::{CallbackId, Completion, StreamCallbacks};
pub use classifier::{BareClassifier, Classifier, ParseOutcome, Routed, SimpleClassifier};
pub use handlers::HandlerList;
pub use mailbox::Mailbox;
pub use orchestrator::{AgentCore, AgentCoreBuilder};
pub use session::{ExceptionEvent, Session, SessionContext, SessionEvent};
