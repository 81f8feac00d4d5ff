use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body the server attaches to non-2xx responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    /// Extracts the server message from a raw response body, if the body carries one.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        serde_json::from_slice::<ApiError>(body)
            .ok()
            .filter(|err| !err.message.trim().is_empty())
    }
}

/// Local validation failure on a sign-up form field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("Full name is required")]
    FullNameRequired,
    #[error("Email is required")]
    EmailRequired,
    #[error("Invalid email format")]
    InvalidEmail,
    #[error("Password is required")]
    PasswordRequired,
    #[error("Password must be at least 6 characters")]
    PasswordTooShort,
}
