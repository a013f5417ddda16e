//! Inbound event routing
//!
//! Pure decision logic: a publication payload is classified by its `type`
//! tag into one of the three sinks, or into a drop reason. Nothing here can
//! fail; bad input becomes `Unknown` or `Malformed`.

use crate::protocol::{InboundEvent, Message, PresenceEvent, TypingEvent};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Where an inbound payload goes
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    NewMessage(Message),
    Typing(TypingEvent),
    Presence(PresenceEvent),
    /// Well-formed but with a type tag this layer does not handle
    Unknown(String),
    /// Not decodable; carries the reason
    Malformed(String),
}

impl From<InboundEvent> for EventRoute {
    fn from(event: InboundEvent) -> Self {
        match event {
            InboundEvent::NewMessage { message } => EventRoute::NewMessage(message),
            InboundEvent::TypingIndicator(typing) => EventRoute::Typing(typing),
            InboundEvent::OnlineStatus(presence) => EventRoute::Presence(presence),
        }
    }
}

pub struct EventRouter;

impl EventRouter {
    /// Classify one publication payload
    pub fn route(payload: &Value) -> EventRoute {
        let Some(tag) = payload.get("type").and_then(Value::as_str) else {
            return EventRoute::Malformed("missing string 'type' tag".to_string());
        };

        if !InboundEvent::KNOWN_TYPES.contains(&tag) {
            return EventRoute::Unknown(tag.to_string());
        }

        match InboundEvent::deserialize(payload) {
            Ok(event) => event.into(),
            Err(e) => EventRoute::Malformed(format!("invalid '{tag}' payload: {e}")),
        }
    }

    /// Log a dropped route; returns true if the route was dropped
    pub fn log_if_dropped(channel: &str, route: &EventRoute) -> bool {
        match route {
            EventRoute::Unknown(tag) => {
                warn!(channel, event_type = %tag, "Dropping event with unknown type");
                true
            }
            EventRoute::Malformed(reason) => {
                warn!(channel, reason = %reason, "Dropping malformed event");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_routes_new_message() {
        let payload = json!({
            "type": "new_message",
            "message": {
                "id": "m1",
                "chat_id": "c1",
                "sender_id": "u1",
                "sender_username": "ada",
                "content": "hi",
                "message_type": "text",
                "created_at": "2024-06-04T10:15:00"
            },
            "chat_id": "c1",
            "sender_id": "u1",
            "timestamp": "2024-06-04T10:15:00"
        });

        match EventRouter::route(&payload) {
            EventRoute::NewMessage(message) => assert_eq!(message.id, "m1"),
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn test_routes_typing_and_presence() {
        let typing = json!({"type": "typing_indicator", "user_id": "u2", "username": "g", "is_typing": false});
        let presence = json!({"type": "online_status", "user_id": "u2", "username": "g", "is_online": true});

        assert!(matches!(EventRouter::route(&typing), EventRoute::Typing(t) if !t.is_typing));
        assert!(matches!(EventRouter::route(&presence), EventRoute::Presence(p) if p.is_online));
    }

    #[test]
    fn test_unknown_type_is_not_malformed() {
        let payload = json!({"type": "message_read", "message_id": "m1"});
        assert_eq!(
            EventRouter::route(&payload),
            EventRoute::Unknown("message_read".to_string())
        );
    }

    #[test]
    fn test_malformed_payloads() {
        let cases = [
            json!("just a string"),
            json!({"no_type": true}),
            json!({"type": 42}),
            json!({"type": "typing_indicator", "user_id": "u1"}),
            json!({"type": "new_message", "message": {"id": "m1"}}),
            json!({"type": "online_status", "user_id": "u1", "is_online": "yes"}),
        ];

        for payload in cases {
            let route = EventRouter::route(&payload);
            assert!(
                matches!(route, EventRoute::Malformed(_)),
                "expected malformed for {payload}, got {route:?}"
            );
            assert!(EventRouter::log_if_dropped("chat-1", &route));
        }
    }

    #[test]
    fn test_valid_routes_are_not_dropped() {
        let route = EventRouter::route(&json!({"type": "online_status", "user_id": "u", "is_online": true}));
        assert!(!EventRouter::log_if_dropped("chat-1", &route));
    }
}
