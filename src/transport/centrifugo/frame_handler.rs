//! Pure encoding and routing of Centrifugo JSON protocol frames
//!
//! Commands carry a numeric `id`; the broker answers with a reply holding the
//! same `id` and either a result object or an `error`. Asynchronous pushes
//! have no `id`. An empty object is a ping and must be answered with `{}`.
//! One WebSocket text frame may hold several newline-separated messages.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

/// Client name announced when none is configured
pub const DEFAULT_CLIENT_NAME: &str = "dtalks-rs";

/// Reply frame sent back for a ping
pub const PONG_FRAME: &str = "{}";

/// Routing decision for one inbound protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum FrameRoute {
    /// Server ping; answer with [`PONG_FRAME`]
    Ping,
    /// Reply to one of our commands
    Reply { id: u32, outcome: ReplyOutcome },
    /// Data published on a subscribed channel
    Publication { channel: String, data: Value },
    /// Broker ended one subscription
    Unsubscribed { channel: String, reason: String },
    /// Broker is closing the connection
    Disconnect { code: u32, reason: String },
    /// Valid but irrelevant to this client (join/leave pushes, etc.)
    Ignored(String),
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Ok(Value),
    Error { code: u32, message: String },
}

#[derive(Debug, Deserialize)]
struct ProtocolError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Publication {
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default, Deserialize)]
struct Reason {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct Push {
    #[serde(default)]
    channel: String,
    #[serde(rename = "pub")]
    publication: Option<Publication>,
    unsubscribe: Option<Reason>,
    disconnect: Option<Reason>,
}

pub struct FrameHandler;

impl FrameHandler {
    /// `connect` command; always the first frame on a new socket
    pub fn connect_command(id: u32, token: &str, name: &str) -> String {
        json!({"id": id, "connect": {"token": token, "name": name}}).to_string()
    }

    pub fn subscribe_command(id: u32, channel: &str) -> String {
        json!({"id": id, "subscribe": {"channel": channel}}).to_string()
    }

    pub fn unsubscribe_command(id: u32, channel: &str) -> String {
        json!({"id": id, "unsubscribe": {"channel": channel}}).to_string()
    }

    /// Split one WebSocket text frame into protocol messages
    pub fn split_frame(text: &str) -> impl Iterator<Item = &str> {
        let trimmed = text.trim();
        // A bare ping arrives as "{}" and must survive the blank-line filter
        trimmed
            .split('\n')
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }

    /// Route one protocol message
    pub fn route(line: &str) -> FrameRoute {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => return FrameRoute::Malformed(format!("invalid JSON frame: {e}")),
        };
        let Some(object) = value.as_object() else {
            return FrameRoute::Malformed("frame is not a JSON object".to_string());
        };

        if object.is_empty() {
            return FrameRoute::Ping;
        }

        if let Some(id) = object.get("id").and_then(Value::as_u64) {
            let Ok(id) = u32::try_from(id) else {
                return FrameRoute::Malformed(format!("reply id {id} out of range"));
            };
            return Self::route_reply(id, object);
        }

        match object.get("push") {
            Some(push) => Self::route_push(push),
            None => {
                debug!(frame = %line, "Ignoring frame without id or push");
                FrameRoute::Ignored("frame without id or push".to_string())
            }
        }
    }

    fn route_reply(id: u32, object: &serde_json::Map<String, Value>) -> FrameRoute {
        if let Some(error) = object.get("error") {
            return match ProtocolError::deserialize(error) {
                Ok(error) => FrameRoute::Reply {
                    id,
                    outcome: ReplyOutcome::Error {
                        code: error.code,
                        message: error.message,
                    },
                },
                Err(e) => FrameRoute::Malformed(format!("invalid error in reply {id}: {e}")),
            };
        }

        let result = object
            .iter()
            .find(|(key, _)| key.as_str() != "id")
            .map(|(_, value)| value.clone())
            .unwrap_or(Value::Null);
        FrameRoute::Reply {
            id,
            outcome: ReplyOutcome::Ok(result),
        }
    }

    fn route_push(push: &Value) -> FrameRoute {
        let push = match Push::deserialize(push) {
            Ok(push) => push,
            Err(e) => return FrameRoute::Malformed(format!("invalid push: {e}")),
        };

        if let Some(publication) = push.publication {
            if push.channel.is_empty() {
                return FrameRoute::Malformed("publication without channel".to_string());
            }
            return FrameRoute::Publication {
                channel: push.channel,
                data: publication.data,
            };
        }
        if let Some(unsubscribe) = push.unsubscribe {
            return FrameRoute::Unsubscribed {
                channel: push.channel,
                reason: Self::describe(&unsubscribe, "unsubscribed by server"),
            };
        }
        if let Some(disconnect) = push.disconnect {
            return FrameRoute::Disconnect {
                code: disconnect.code,
                reason: Self::describe(&disconnect, "disconnected by server"),
            };
        }

        FrameRoute::Ignored(format!("push on '{}'", push.channel))
    }

    fn describe(reason: &Reason, fallback: &str) -> String {
        if reason.reason.is_empty() {
            fallback.to_string()
        } else {
            reason.reason.clone()
        }
    }
}
