//! Per-session link metrics
//!
//! Atomic counters shared between the session loop and anyone holding a
//! handle. Each session owns its own collector so parallel sessions (and
//! parallel tests) never observe each other's numbers.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Thread-safe counters for one realtime session
#[derive(Debug, Default)]
pub struct LinkMetrics {
    link_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    retries_exhausted: AtomicU64,
    last_connected_at: AtomicU64,

    subscribe_requests: AtomicU64,
    subscriptions_confirmed: AtomicU64,
    subscription_failures: AtomicU64,
    subscription_retries: AtomicU64,

    messages_received: AtomicU64,
    duplicate_messages: AtomicU64,
    typing_events: AtomicU64,
    presence_events: AtomicU64,
    unknown_events: AtomicU64,
    malformed_events: AtomicU64,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.link_connected.store(true, Ordering::Relaxed);
        self.last_connected_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.link_connected.store(false, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.link_connected.store(false, Ordering::Relaxed);
    }

    pub fn retries_exhausted(&self) {
        self.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn link_closed(&self) {
        self.link_connected.store(false, Ordering::Relaxed);
    }

    pub fn subscribe_requested(&self) {
        self.subscribe_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_confirmed(&self) {
        self.subscriptions_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_failed(&self) {
        self.subscription_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_retry(&self) {
        self.subscription_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_message(&self) {
        self.duplicate_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn typing_event(&self) {
        self.typing_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn presence_event(&self) {
        self.presence_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_event(&self) {
        self.unknown_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_event(&self) {
        self.malformed_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> LinkMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let last_connected_at = load(&self.last_connected_at);
        LinkMetricsSnapshot {
            timestamp: current_timestamp(),
            link_connected: self.link_connected.load(Ordering::Relaxed),
            connection_attempts: load(&self.connection_attempts),
            connections_established: load(&self.connections_established),
            connection_failures: load(&self.connection_failures),
            connections_lost: load(&self.connections_lost),
            retries_exhausted: load(&self.retries_exhausted),
            last_connected_at: (last_connected_at > 0).then_some(last_connected_at),
            subscribe_requests: load(&self.subscribe_requests),
            subscriptions_confirmed: load(&self.subscriptions_confirmed),
            subscription_failures: load(&self.subscription_failures),
            subscription_retries: load(&self.subscription_retries),
            messages_received: load(&self.messages_received),
            duplicate_messages: load(&self.duplicate_messages),
            typing_events: load(&self.typing_events),
            presence_events: load(&self.presence_events),
            unknown_events: load(&self.unknown_events),
            malformed_events: load(&self.malformed_events),
        }
    }
}

/// Serializable view of [`LinkMetrics`]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LinkMetricsSnapshot {
    /// Unix seconds when the snapshot was taken
    pub timestamp: u64,
    pub link_connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub retries_exhausted: u64,
    pub last_connected_at: Option<u64>,
    pub subscribe_requests: u64,
    pub subscriptions_confirmed: u64,
    pub subscription_failures: u64,
    pub subscription_retries: u64,
    pub messages_received: u64,
    pub duplicate_messages: u64,
    pub typing_events: u64,
    pub presence_events: u64,
    pub unknown_events: u64,
    pub malformed_events: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fresh_metrics_are_zero() {
        let snapshot = LinkMetrics::new().snapshot();

        assert!(!snapshot.link_connected);
        assert_eq!(snapshot.connection_attempts, 0);
        assert_eq!(snapshot.last_connected_at, None);
        assert_eq!(snapshot.malformed_events, 0);
    }

    #[test]
    fn test_connection_lifecycle_counters() {
        let metrics = LinkMetrics::new();

        metrics.connection_attempt();
        metrics.connection_failed();
        metrics.connection_attempt();
        metrics.connection_established();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connection_attempts, 2);
        assert_eq!(snapshot.connection_failures, 1);
        assert_eq!(snapshot.connections_established, 1);
        assert!(snapshot.link_connected);
        assert!(snapshot.last_connected_at.is_some());

        metrics.connection_lost();
        let snapshot = metrics.snapshot();
        assert!(!snapshot.link_connected);
        assert_eq!(snapshot.connections_lost, 1);
    }

    #[test]
    fn test_event_counters() {
        let metrics = LinkMetrics::new();

        metrics.message_received();
        metrics.duplicate_message();
        metrics.typing_event();
        metrics.presence_event();
        metrics.unknown_event();
        metrics.malformed_event();
        metrics.malformed_event();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.duplicate_messages, 1);
        assert_eq!(snapshot.typing_events, 1);
        assert_eq!(snapshot.presence_events, 1);
        assert_eq!(snapshot.unknown_events, 1);
        assert_eq!(snapshot.malformed_events, 2);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Arc::new(LinkMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.subscribe_requested();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.snapshot().subscribe_requests, 800);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = LinkMetrics::new();
        metrics.subscription_retry();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["subscription_retries"], 1);
        assert_eq!(json["last_connected_at"], serde_json::Value::Null);
    }
}
