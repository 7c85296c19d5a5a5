//! Conversation state labels.
//!
//! The label is descriptive: callers set it and consult it, nothing here
//! rejects a transition.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Start,
    Active,
    /// Awaiting clarification from the user
    Waiting,
    Paused,
    Terminated,
    TopicIdentification,
    /// The last response could not be classified
    ErrorRecovery,
    Escalation,
}

impl SessionState {
    /// Whether new turns should still be processed for the session.
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Active => "active",
            Self::Waiting => "waiting",
            Self::Paused => "paused",
            Self::Terminated => "terminated",
            Self::TopicIdentification => "topic_identification",
            Self::ErrorRecovery => "error_recovery",
            Self::Escalation => "escalation",
        };
        f.write_str(s)
    }
}
