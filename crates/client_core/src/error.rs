use shared::error::FieldError;
use thiserror::Error;

use crate::transport::TransportError;

/// Failure of a store operation, as seen by the caller.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("No recipient selected")]
    NoRecipient,
    #[error("Message must include text or an image")]
    EmptyMessage,
    #[error("Please fix the errors in the form")]
    InvalidSignup(Vec<FieldError>),
    #[error(transparent)]
    Api(#[from] TransportError),
}

impl ClientError {
    /// Text shown to the user: the server's own message when it sent one, the
    /// operation's fallback for any other transport failure, and the local
    /// description for precondition failures.
    pub fn notice_text(&self, fallback: &str) -> String {
        match self {
            ClientError::Api(TransportError::Server {
                message: Some(message),
                ..
            }) => message.clone(),
            ClientError::Api(_) => fallback.to_string(),
            local => local.to_string(),
        }
    }
}

/// Failures on the realtime channel. None of these reach the session state.
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    #[error("failed to connect realtime channel: {0}")]
    Connect(String),
    #[error("realtime receive failed: {0}")]
    Receive(String),
    #[error("invalid server event: {0}")]
    Malformed(String),
}
