//! Wire types exchanged with the chat backend and the broker
//!
//! Inbound broker publications carry a `type` tag (`new_message`,
//! `typing_indicator`, `online_status`). Outbound request bodies mirror the
//! REST endpoints of the chat backend.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Kind of chat message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    System,
}

/// One stored chat message
///
/// # Examples
/// ```
/// use dtalks_realtime::protocol::{Message, MessageType};
///
/// let json = r#"{
///     "id": "665f1c",
///     "chat_id": "42",
///     "sender_id": "u1",
///     "sender_username": "ada",
///     "content": "hello",
///     "message_type": "text",
///     "created_at": "2024-06-04T10:15:00.123456"
/// }"#;
/// let message: Message = serde_json::from_str(json).unwrap();
/// assert_eq!(message.message_type, MessageType::Text);
/// assert_eq!(message.content.as_deref(), Some("hello"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Unique message identifier assigned by the backend
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_username: String,
    /// Text body, or the caption of a file message
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Message {
    pub fn is_file(&self) -> bool {
        matches!(self.message_type, MessageType::File | MessageType::Image)
    }
}

/// Accept RFC 3339 timestamps as well as the naive ISO-8601 form the
/// backend emits; naive values are taken as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp '{raw}': {e}"))
}

/// Decoded broker publication
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    NewMessage { message: Message },
    TypingIndicator(TypingEvent),
    OnlineStatus(PresenceEvent),
}

impl InboundEvent {
    /// Type tags this layer understands
    pub const KNOWN_TYPES: [&'static str; 3] = ["new_message", "typing_indicator", "online_status"];

    pub fn type_tag(&self) -> &'static str {
        match self {
            InboundEvent::NewMessage { .. } => "new_message",
            InboundEvent::TypingIndicator(_) => "typing_indicator",
            InboundEvent::OnlineStatus(_) => "online_status",
        }
    }
}

/// Someone started or stopped typing in a chat
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypingEvent {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    pub is_typing: bool,
}

/// Someone went online or offline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceEvent {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    pub is_online: bool,
}

/// Identity of the logged-in user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserIdentity {
    pub id: String,
    pub username: String,
}

/// Body of `POST /messages` for text messages
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutgoingMessage {
    pub chat_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub reply_to: Option<String>,
}

impl OutgoingMessage {
    pub fn text(chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            content: content.into(),
            message_type: MessageType::Text,
            reply_to: None,
        }
    }

    pub fn replying_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }
}

/// Body of `POST /typing`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TypingUpdate {
    pub chat_id: String,
    pub user_id: String,
    pub username: String,
    pub is_typing: bool,
}

/// Body of `POST /online-status`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PresenceUpdate {
    pub user_id: String,
    pub username: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

/// Response of `GET /centrifugo/token`
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}
