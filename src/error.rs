//! Error taxonomy for the realtime layer
//!
//! Link-level errors (`TokenFetch`, `LinkOpen`, `LinkDisconnected`) never reach
//! callers as failures; the connection manager absorbs them into its retry
//! state machine. `Subscription` errors are absorbed by the per-channel retry
//! supervisor. `DownstreamSend` is the only error returned to callers of the
//! send operations.

use crate::config::ConfigError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for realtime chat operations
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Token fetch failed: {message}")]
    TokenFetch { message: String },

    #[error("Failed to open broker link: {message}")]
    LinkOpen { message: String },

    #[error("Broker link disconnected: {reason}")]
    LinkDisconnected {
        reason: String,
        server_initiated: bool,
    },

    #[error("Subscription to {channel} failed: {message}")]
    Subscription { channel: String, message: String },

    #[error("Malformed event: {message}")]
    MalformedEvent { message: String },

    #[error("Send failed: {message}")]
    DownstreamSend {
        message: String,
        status: Option<u16>,
    },

    #[error("Realtime link is not ready")]
    NotReady,

    #[error("Realtime session is closed")]
    SessionClosed,

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ChatError {
    pub fn token_fetch<S: Into<String>>(message: S) -> Self {
        Self::TokenFetch {
            message: message.into(),
        }
    }

    pub fn link_open<S: Into<String>>(message: S) -> Self {
        Self::LinkOpen {
            message: message.into(),
        }
    }

    pub fn link_disconnected<S: Into<String>>(reason: S, server_initiated: bool) -> Self {
        Self::LinkDisconnected {
            reason: reason.into(),
            server_initiated,
        }
    }

    pub fn subscription<C: Into<String>, S: Into<String>>(channel: C, message: S) -> Self {
        Self::Subscription {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn malformed_event<S: Into<String>>(message: S) -> Self {
        Self::MalformedEvent {
            message: message.into(),
        }
    }

    pub fn downstream_send<S: Into<String>>(message: S, status: Option<u16>) -> Self {
        Self::DownstreamSend {
            message: message.into(),
            status,
        }
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Whether the connection manager should retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::TokenFetch { .. }
                | ChatError::LinkOpen { .. }
                | ChatError::LinkDisconnected { .. }
                | ChatError::Subscription { .. }
        )
    }

    /// Message safe to surface in a UI or log aggregator
    pub fn sanitized_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static BEARER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+\S+").expect("bearer pattern is valid"));

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credentials and bound the length of an error message
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();
    sanitized = BEARER_PATTERN
        .replace_all(&sanitized, "Bearer ***")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for realtime chat operations
pub type ChatResult<T> = Result<T, ChatError>;
