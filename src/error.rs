//! Failure taxonomy for command dispatch.

use thiserror::Error;

use crate::intent::IntentKind;

/// Ways a single dispatch can fall short of a provider answer.
///
/// None of these ever reach the client as an error frame; the dispatcher turns
/// each one into a plain-language reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The external collaborator for this intent failed or was unreachable.
    #[error("{intent} provider unavailable: {message}")]
    ProviderUnavailable { intent: IntentKind, message: String },

    /// Required parameters were missing; `usage` explains the expected form.
    #[error("{usage}")]
    MalformedCommand { usage: String },

    /// A named desktop file does not exist.
    #[error("resource not found: {name}")]
    ResourceNotFound { name: String },

    /// No keyword route matched; the command falls through to chat.
    #[error("command did not match any route")]
    Unclassified,
}

impl DispatchError {
    pub fn provider(intent: IntentKind, err: impl std::fmt::Display) -> Self {
        DispatchError::ProviderUnavailable {
            intent,
            message: err.to_string(),
        }
    }

    pub fn malformed(usage: impl Into<String>) -> Self {
        DispatchError::MalformedCommand {
            usage: usage.into(),
        }
    }
}
