//! Channel subscription bookkeeping
//!
//! A channel is in exactly one of three places:
//!
//! - the pending set, waiting for a ready link (no entry exists)
//! - the entry map as `Pending` (subscribe sent), `Active` or `Error`
//! - nowhere (never requested, unsubscribed or torn down)
//!
//! Every method is synchronous; the caller runs each check-then-act inside
//! one turn of the session loop.

use crate::error::ChatError;
use crate::observability::LinkMetrics;
use crate::protocol::ChannelName;
use crate::transport::BrokerLink;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Subscribe command sent, confirmation outstanding
    Pending,
    Active,
    /// Subscription failed; the retry supervisor owns it now
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSubscription {
    pub channel: ChannelName,
    pub status: SubscriptionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// What `subscribe` did
#[derive(Debug)]
pub enum SubscribeOutcome {
    /// Channel already active; nothing sent
    AlreadyActive,
    /// Subscribe already sent and unanswered; nothing sent
    InFlight,
    /// Link not ready; channel parked in the pending set
    Queued,
    /// Subscribe command sent
    Requested,
    /// The link refused the command outright
    Failed(ChatError),
}

#[derive(Debug)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<ChannelName, ChannelSubscription>,
    pending: Vec<ChannelName>,
    metrics: Arc<LinkMetrics>,
}

impl SubscriptionRegistry {
    pub fn new(metrics: Arc<LinkMetrics>) -> Self {
        Self {
            entries: BTreeMap::new(),
            pending: Vec::new(),
            metrics,
        }
    }

    /// Request updates for `channel`
    ///
    /// `link` is the ready link, or `None` while the connection is not up.
    pub fn subscribe(
        &mut self,
        channel: &ChannelName,
        link: Option<&dyn BrokerLink>,
    ) -> SubscribeOutcome {
        match self.status(channel.as_str()) {
            Some(SubscriptionStatus::Active) => return SubscribeOutcome::AlreadyActive,
            Some(SubscriptionStatus::Pending) => return SubscribeOutcome::InFlight,
            Some(SubscriptionStatus::Error) | None => {}
        }

        let Some(link) = link else {
            self.entries.remove(channel);
            if !self.is_queued(channel.as_str()) {
                debug!(%channel, "Link not ready, queueing subscription");
                self.pending.push(channel.clone());
            }
            return SubscribeOutcome::Queued;
        };

        self.remove_pending(channel.as_str());
        self.metrics.subscribe_requested();
        match link.subscribe(channel.as_str()) {
            Ok(()) => {
                debug!(%channel, "Subscribe requested");
                self.entries.insert(
                    channel.clone(),
                    ChannelSubscription {
                        channel: channel.clone(),
                        status: SubscriptionStatus::Pending,
                        last_error: None,
                    },
                );
                SubscribeOutcome::Requested
            }
            Err(e) => {
                self.mark_error(channel, e.to_string());
                SubscribeOutcome::Failed(e)
            }
        }
    }

    /// Broker confirmed the subscription
    pub fn on_subscribed(&mut self, channel: &str) -> bool {
        let Some(entry) = self.entries.get_mut(channel) else {
            debug!(channel, "Confirmation for untracked channel");
            return false;
        };
        if entry.status == SubscriptionStatus::Active {
            return false;
        }
        entry.status = SubscriptionStatus::Active;
        entry.last_error = None;
        self.metrics.subscription_confirmed();
        info!(channel, "Subscription active");
        self.remove_pending(channel);
        true
    }

    /// Broker rejected or errored the subscription
    pub fn on_subscription_error(&mut self, channel: &str, message: &str) -> bool {
        let Some(entry) = self.entries.get(channel) else {
            debug!(channel, "Error for untracked channel");
            return false;
        };
        let channel = entry.channel.clone();
        self.mark_error(&channel, message.to_string());
        true
    }

    /// Broker dropped one subscription while the link stayed up
    ///
    /// The channel goes back to the pending set and waits for the next
    /// successful connect.
    pub fn on_subscription_lost(&mut self, channel: &str) -> bool {
        let Some(entry) = self.entries.remove(channel) else {
            return false;
        };
        warn!(%entry.channel, "Subscription dropped by broker, re-queued");
        self.queue(entry.channel);
        true
    }

    /// The link went away: every live or in-flight subscription is void
    ///
    /// `Error` entries stay with the retry supervisor.
    pub fn invalidate_all(&mut self) -> Vec<ChannelName> {
        let invalidated: Vec<ChannelName> = self
            .entries
            .values()
            .filter(|entry| entry.status != SubscriptionStatus::Error)
            .map(|entry| entry.channel.clone())
            .collect();

        for channel in &invalidated {
            self.entries.remove(channel);
            self.queue(channel.clone());
        }
        if !invalidated.is_empty() {
            info!(count = invalidated.len(), "Subscriptions invalidated by link loss");
        }
        invalidated
    }

    /// Subscribe every queued channel exactly once and clear the queue
    pub fn flush_pending(
        &mut self,
        link: &dyn BrokerLink,
    ) -> Vec<(ChannelName, SubscribeOutcome)> {
        let queued = std::mem::take(&mut self.pending);
        if !queued.is_empty() {
            info!(count = queued.len(), "Flushing pending subscriptions");
        }
        queued
            .into_iter()
            .map(|channel| {
                let outcome = self.subscribe(&channel, Some(link));
                (channel, outcome)
            })
            .collect()
    }

    /// Park a channel in the pending set, dropping any entry
    pub fn requeue(&mut self, channel: &ChannelName) {
        self.entries.remove(channel);
        self.queue(channel.clone());
    }

    /// Stop tracking `channel`; sends an unsubscribe if it was live
    pub fn unsubscribe(&mut self, channel: &str, link: Option<&dyn BrokerLink>) -> bool {
        let was_queued = self.remove_pending(channel);
        let entry = self.entries.remove(channel);

        if let (Some(entry), Some(link)) = (&entry, link) {
            if entry.status != SubscriptionStatus::Error {
                if let Err(e) = link.unsubscribe(channel) {
                    warn!(channel, error = %e, "Unsubscribe command failed");
                }
            }
        }

        let removed = was_queued || entry.is_some();
        if removed {
            info!(channel, "Unsubscribed");
        }
        removed
    }

    /// Unsubscribe everything and forget all channels
    pub fn teardown(&mut self, link: Option<&dyn BrokerLink>) {
        let channels: Vec<ChannelName> = self.entries.keys().cloned().collect();
        for channel in channels {
            self.unsubscribe(channel.as_str(), link);
        }
        self.pending.clear();
    }

    pub fn status(&self, channel: &str) -> Option<SubscriptionStatus> {
        self.entries.get(channel).map(|entry| entry.status)
    }

    pub fn is_queued(&self, channel: &str) -> bool {
        self.pending.iter().any(|c| c.as_str() == channel)
    }

    /// Whether inbound publications on `channel` should be routed
    pub fn accepts_events(&self, channel: &str) -> bool {
        matches!(
            self.status(channel),
            Some(SubscriptionStatus::Active | SubscriptionStatus::Pending)
        )
    }

    pub fn pending(&self) -> &[ChannelName] {
        &self.pending
    }

    pub fn subscriptions(&self) -> Vec<ChannelSubscription> {
        self.entries.values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.status == SubscriptionStatus::Active)
            .count()
    }

    fn mark_error(&mut self, channel: &ChannelName, message: String) {
        warn!(%channel, error = %message, "Subscription failed");
        self.metrics.subscription_failed();
        self.remove_pending(channel.as_str());
        self.entries.insert(
            channel.clone(),
            ChannelSubscription {
                channel: channel.clone(),
                status: SubscriptionStatus::Error,
                last_error: Some(message),
            },
        );
    }

    fn queue(&mut self, channel: ChannelName) {
        if !self.is_queued(channel.as_str()) {
            self.pending.push(channel);
        }
    }

    fn remove_pending(&mut self, channel: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|c| c.as_str() != channel);
        before != self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatResult;
    use proptest::prelude::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLink {
        subscribes: Mutex<Vec<String>>,
        unsubscribes: Mutex<Vec<String>>,
        refuse: bool,
    }

    impl RecordingLink {
        fn refusing() -> Self {
            Self {
                refuse: true,
                ..Default::default()
            }
        }

        fn subscribes(&self) -> Vec<String> {
            self.subscribes.lock().unwrap().clone()
        }
    }

    impl BrokerLink for RecordingLink {
        fn subscribe(&self, channel: &str) -> ChatResult<()> {
            if self.refuse {
                return Err(ChatError::subscription(channel, "link closed"));
            }
            self.subscribes.lock().unwrap().push(channel.to_string());
            Ok(())
        }

        fn unsubscribe(&self, channel: &str) -> ChatResult<()> {
            self.unsubscribes.lock().unwrap().push(channel.to_string());
            Ok(())
        }

        fn close(&self) {}
    }

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(Arc::new(LinkMetrics::new()))
    }

    fn chan(name: &str) -> ChannelName {
        ChannelName::new(name).unwrap()
    }

    #[test]
    fn test_subscribe_without_link_queues_once() {
        let mut registry = registry();

        assert!(matches!(registry.subscribe(&chan("chat-1"), None), SubscribeOutcome::Queued));
        assert!(matches!(registry.subscribe(&chan("chat-1"), None), SubscribeOutcome::Queued));

        assert_eq!(registry.pending(), &[chan("chat-1")]);
        assert_eq!(registry.status("chat-1"), None);
    }

    #[test]
    fn test_subscribe_with_link_then_confirm() {
        let mut registry = registry();
        let link = RecordingLink::default();

        assert!(matches!(
            registry.subscribe(&chan("chat-1"), Some(&link)),
            SubscribeOutcome::Requested
        ));
        assert_eq!(registry.status("chat-1"), Some(SubscriptionStatus::Pending));
        assert!(matches!(
            registry.subscribe(&chan("chat-1"), Some(&link)),
            SubscribeOutcome::InFlight
        ));

        assert!(registry.on_subscribed("chat-1"));
        assert_eq!(registry.status("chat-1"), Some(SubscriptionStatus::Active));
        assert!(matches!(
            registry.subscribe(&chan("chat-1"), Some(&link)),
            SubscribeOutcome::AlreadyActive
        ));
        assert_eq!(link.subscribes(), vec!["chat-1"]);
    }

    #[test]
    fn test_flush_pending_subscribes_each_once() {
        let mut registry = registry();
        let link = RecordingLink::default();
        registry.subscribe(&chan("chat-1"), None);
        registry.subscribe(&chan("chat-2"), None);
        registry.subscribe(&chan("chat-1"), None);

        let outcomes = registry.flush_pending(&link);

        assert_eq!(outcomes.len(), 2);
        assert!(registry.pending().is_empty());
        assert_eq!(link.subscribes(), vec!["chat-1", "chat-2"]);
    }

    #[test]
    fn test_refused_subscribe_marks_error() {
        let mut registry = registry();
        let link = RecordingLink::refusing();

        let outcome = registry.subscribe(&chan("chat-1"), Some(&link));

        assert!(matches!(outcome, SubscribeOutcome::Failed(ChatError::Subscription { .. })));
        assert_eq!(registry.status("chat-1"), Some(SubscriptionStatus::Error));
        assert!(registry.pending().is_empty());
    }

    #[test]
    fn test_async_error_then_retry_succeeds() {
        let mut registry = registry();
        let link = RecordingLink::default();
        registry.subscribe(&chan("chat-1"), Some(&link));

        assert!(registry.on_subscription_error("chat-1", "permission denied"));
        let entry = &registry.subscriptions()[0];
        assert_eq!(entry.status, SubscriptionStatus::Error);
        assert_eq!(entry.last_error.as_deref(), Some("permission denied"));

        assert!(matches!(
            registry.subscribe(&chan("chat-1"), Some(&link)),
            SubscribeOutcome::Requested
        ));
        assert!(registry.on_subscribed("chat-1"));
        assert_eq!(link.subscribes().len(), 2);
    }

    #[test]
    fn test_subscription_lost_requeues() {
        let mut registry = registry();
        let link = RecordingLink::default();
        registry.subscribe(&chan("chat-1"), Some(&link));
        registry.on_subscribed("chat-1");

        assert!(registry.on_subscription_lost("chat-1"));

        assert_eq!(registry.status("chat-1"), None);
        assert_eq!(registry.pending(), &[chan("chat-1")]);
    }

    #[test]
    fn test_invalidate_all_keeps_error_entries() {
        let mut registry = registry();
        let link = RecordingLink::default();
        for name in ["chat-1", "chat-2", "chat-3"] {
            registry.subscribe(&chan(name), Some(&link));
        }
        registry.on_subscribed("chat-1");
        registry.on_subscription_error("chat-3", "boom");

        let invalidated = registry.invalidate_all();

        assert_eq!(invalidated, vec![chan("chat-1"), chan("chat-2")]);
        assert_eq!(registry.pending(), &[chan("chat-1"), chan("chat-2")]);
        assert_eq!(registry.status("chat-3"), Some(SubscriptionStatus::Error));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_unsubscribe_active_sends_command() {
        let mut registry = registry();
        let link = RecordingLink::default();
        registry.subscribe(&chan("chat-1"), Some(&link));
        registry.on_subscribed("chat-1");

        assert!(registry.unsubscribe("chat-1", Some(&link)));
        assert!(!registry.unsubscribe("chat-1", Some(&link)));

        assert_eq!(*link.unsubscribes.lock().unwrap(), vec!["chat-1"]);
        assert!(!registry.accepts_events("chat-1"));
    }

    #[test]
    fn test_unsubscribe_queued_channel() {
        let mut registry = registry();
        registry.subscribe(&chan("chat-1"), None);

        assert!(registry.unsubscribe("chat-1", None));
        assert!(registry.pending().is_empty());
    }

    #[test]
    fn test_teardown_clears_everything() {
        let mut registry = registry();
        let link = RecordingLink::default();
        registry.subscribe(&chan("chat-1"), Some(&link));
        registry.on_subscribed("chat-1");
        registry.subscribe(&chan("chat-2"), None);

        registry.teardown(Some(&link));

        assert!(registry.subscriptions().is_empty());
        assert!(registry.pending().is_empty());
        assert_eq!(*link.unsubscribes.lock().unwrap(), vec!["chat-1"]);
    }

    #[test]
    fn test_confirmation_for_unknown_channel_is_ignored() {
        let mut registry = registry();
        assert!(!registry.on_subscribed("chat-9"));
        assert!(!registry.on_subscription_error("chat-9", "x"));
        assert!(!registry.on_subscription_lost("chat-9"));
    }

    proptest! {
        #[test]
        fn duplicate_subscribes_send_one_command(
            ops in proptest::collection::vec(0u8..3, 1..40)
        ) {
            let mut registry = registry();
            let link = RecordingLink::default();
            let channel = chan("chat-1");

            for op in ops {
                match op {
                    0 => { registry.subscribe(&channel, Some(&link)); }
                    1 => { registry.on_subscribed("chat-1"); }
                    _ => { registry.subscribe(&channel, None); }
                }
            }

            prop_assert!(link.subscribes().len() <= 1);
            let active = registry
                .subscriptions()
                .iter()
                .filter(|e| e.status == SubscriptionStatus::Active)
                .count();
            prop_assert!(active <= 1);
        }
    }
}
