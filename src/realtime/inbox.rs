//! Deduplicated, arrival-ordered message store

use crate::protocol::Message;
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct MessageInbox {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unless a message with the same id is already present
    pub fn append(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Merge a page of history, keeping existing entries; returns how many were new
    pub fn load_history(&mut self, history: impl IntoIterator<Item = Message>) -> usize {
        history
            .into_iter()
            .fold(0, |added, message| added + usize::from(self.append(message)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn messages_for(&self, chat_id: &str) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|message| message.chat_id == chat_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use chrono::Utc;

    fn message(id: &str, chat_id: &str, content: &str) -> Message {
        Message {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: "u1".to_string(),
            sender_username: "ada".to_string(),
            content: Some(content.to_string()),
            message_type: MessageType::Text,
            file_path: None,
            file_name: None,
            file_size: None,
            file_type: None,
            created_at: Utc::now(),
            reply_to: None,
        }
    }

    #[test]
    fn test_append_is_idempotent() {
        let mut inbox = MessageInbox::new();

        assert!(inbox.append(message("m1", "c1", "first")));
        assert!(!inbox.append(message("m1", "c1", "edited copy")));

        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox.messages()[0].content.as_deref(), Some("first"));
    }

    #[test]
    fn test_preserves_first_arrival_order() {
        let mut inbox = MessageInbox::new();
        for id in ["m3", "m1", "m2", "m1", "m3"] {
            inbox.append(message(id, "c1", id));
        }

        let ids: Vec<&str> = inbox.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m1", "m2"]);
    }

    #[test]
    fn test_load_history_merges() {
        let mut inbox = MessageInbox::new();
        inbox.append(message("m2", "c1", "live"));

        let added = inbox.load_history(vec![
            message("m1", "c1", "old"),
            message("m2", "c1", "old copy"),
            message("m1", "c1", "dup in page"),
        ]);

        assert_eq!(added, 1);
        assert_eq!(inbox.len(), 2);
        assert!(inbox.contains("m1"));
    }

    #[test]
    fn test_messages_for_chat() {
        let mut inbox = MessageInbox::new();
        inbox.append(message("m1", "c1", "a"));
        inbox.append(message("m2", "c2", "b"));
        inbox.append(message("m3", "c1", "c"));

        let c1: Vec<String> = inbox.messages_for("c1").into_iter().map(|m| m.id).collect();
        assert_eq!(c1, vec!["m1", "m3"]);

        inbox.clear();
        assert!(inbox.is_empty());
        assert!(!inbox.contains("m1"));
    }
}
