//! Online user set

use crate::protocol::PresenceEvent;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: BTreeSet<String>,
    usernames: BTreeMap<String, String>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one presence event; returns true if the online set changed
    pub fn apply(&mut self, event: &PresenceEvent) -> bool {
        if !event.username.is_empty() {
            self.usernames
                .insert(event.user_id.clone(), event.username.clone());
        }

        if event.is_online {
            self.online.insert(event.user_id.clone())
        } else {
            self.online.remove(&event.user_id)
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    pub fn online_users(&self) -> Vec<String> {
        self.online.iter().cloned().collect()
    }

    pub fn username(&self, user_id: &str) -> Option<&str> {
        self.usernames.get(user_id).map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.online.clear();
        self.usernames.clear();
    }
}
