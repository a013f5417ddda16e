//! Typing indicators with expiry
//!
//! Every "started typing" event gets a fresh generation number. The expiry
//! timer for that event carries the generation, and [`TypingTracker::expire`]
//! only removes an entry whose generation still matches, so a timer armed
//! before a refresh can never remove the refreshed entry.

use crate::protocol::TypingEvent;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub user_id: String,
    pub username: String,
    /// Channel the event arrived on
    pub channel: String,
    pub expires_at: Instant,
    pub generation: u64,
}

/// Effect of applying one typing event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingChange {
    /// Entry inserted or refreshed; arm its expiry for `generation`
    Started { user_id: String, generation: u64 },
    /// Entry removed; cancel its expiry
    Stopped { user_id: String },
    /// Stop event for a user who was not typing
    Unchanged,
}

#[derive(Debug)]
pub struct TypingTracker {
    ttl: Duration,
    entries: HashMap<String, TypingEntry>,
    next_generation: u64,
}

impl TypingTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn apply(&mut self, event: &TypingEvent, channel: &str, now: Instant) -> TypingChange {
        if !event.is_typing {
            return match self.entries.remove(&event.user_id) {
                Some(_) => TypingChange::Stopped {
                    user_id: event.user_id.clone(),
                },
                None => TypingChange::Unchanged,
            };
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        self.entries.insert(
            event.user_id.clone(),
            TypingEntry {
                user_id: event.user_id.clone(),
                username: event.username.clone(),
                channel: channel.to_string(),
                expires_at: now + self.ttl,
                generation,
            },
        );
        TypingChange::Started {
            user_id: event.user_id.clone(),
            generation,
        }
    }

    /// Remove `user_id` if its entry is still the one `generation` refers to
    pub fn expire(&mut self, user_id: &str, generation: u64) -> Option<TypingEntry> {
        match self.entries.get(user_id) {
            Some(entry) if entry.generation == generation => self.entries.remove(user_id),
            _ => None,
        }
    }

    pub fn generation(&self, user_id: &str) -> Option<u64> {
        self.entries.get(user_id).map(|entry| entry.generation)
    }

    pub fn is_typing(&self, user_id: &str) -> bool {
        self.entries.contains_key(user_id)
    }

    /// Current entries, oldest start first
    pub fn entries(&self) -> Vec<TypingEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.generation);
        entries
    }

    /// Usernames typing on `channel`, oldest start first
    pub fn typing_on(&self, channel: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.channel == channel)
            .map(|entry| entry.username)
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
