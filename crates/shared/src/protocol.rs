use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Message, UserId},
    error::FieldError,
};

pub const MIN_PASSWORD_LEN: usize = 6;

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\S+@\S+\.\S+").expect("valid email pattern"));

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub full_name: String,
    pub email: String,
    pub password: String,
}

impl SignupRequest {
    /// Returns every field problem at once so a form can mark all of them.
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if self.full_name.trim().is_empty() {
            errors.push(FieldError::FullNameRequired);
        }
        if self.email.trim().is_empty() {
            errors.push(FieldError::EmailRequired);
        } else if !EMAIL.is_match(&self.email) {
            errors.push(FieldError::InvalidEmail);
        }
        if self.password.is_empty() {
            errors.push(FieldError::PasswordRequired);
        } else if self.password.encode_utf16().count() < MIN_PASSWORD_LEN {
            errors.push(FieldError::PasswordTooShort);
        }
        errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Partial identity update; only the fields being changed are sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_pic: Option<String>,
}

impl UpdateProfileRequest {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none() && self.profile_pic.is_none()
    }
}

/// Body of `POST /message/send/{id}`. `image` is bare base64, never a data URI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Frames pushed by the server over the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "getOnlineUsers")]
    OnlineUsers(Vec<UserId>),
    #[serde(rename = "newMessage")]
    NewMessage(Message),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::OnlineUsers(_) => EventKind::OnlineUsers,
            ServerEvent::NewMessage(_) => EventKind::NewMessage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OnlineUsers,
    NewMessage,
}
