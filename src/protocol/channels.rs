//! Broker channel naming and chat ID validation
//!
//! Every chat is published on a channel named `chat-{chat_id}`. Chat IDs are
//! restricted to ASCII alphanumerics plus `.`, `_` and `-` so the derived
//! channel name is always a valid broker channel.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use thiserror::Error;

pub const CHAT_CHANNEL_PREFIX: &str = "chat-";

pub fn validate_chat_id(chat_id: &str) -> Result<(), ValidationError> {
    if chat_id.is_empty() {
        return Err(ValidationError::EmptyChatId);
    }

    for ch in chat_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidChatIdChar(ch));
        }
    }

    Ok(())
}

/// Name of a broker channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    /// Accept any non-empty channel name without whitespace
    pub fn new(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ValidationError::EmptyChannel);
        }
        if let Some(ch) = raw.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(ValidationError::InvalidChannelChar(ch));
        }
        Ok(Self(raw))
    }

    /// Channel carrying the events of one chat
    pub fn for_chat(chat_id: &str) -> Result<Self, ValidationError> {
        validate_chat_id(chat_id)?;
        Ok(Self(format!("{CHAT_CHANNEL_PREFIX}{chat_id}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Chat ID for `chat-*` channels
    pub fn chat_id(&self) -> Option<&str> {
        self.0
            .strip_prefix(CHAT_CHANNEL_PREFIX)
            .filter(|id| !id.is_empty())
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ChannelName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ChannelName {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Validation errors for chat and channel identifiers
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Chat ID cannot be empty")]
    EmptyChatId,
    #[error("Chat ID contains invalid character: '{0}'")]
    InvalidChatIdChar(char),
    #[error("Channel name cannot be empty")]
    EmptyChannel,
    #[error("Channel name contains invalid character: {0:?}")]
    InvalidChannelChar(char),
}
