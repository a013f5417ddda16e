//! Subscription queueing, deduplication and retry tests


use dtalks_realtime::protocol::ChannelName;
use dtalks_realtime::realtime::{LinkState, SessionEvent, SubscriptionStatus};
use dtalks_realtime::testing::{settle, MockConnector};
use std::time::Duration;
use test_helpers::{drain_events, message_payload, spawn_with};
use tokio::time::sleep;

fn channel(name: &str) -> ChannelName {
    ChannelName::new(name).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_while_connecting_waits_for_link() {
    let (session, connector) =
        spawn_with(MockConnector::new().with_open_delay(Duration::from_millis(500)));

    session.start().unwrap();
    settle().await;
    session.subscribe_chat("1").unwrap();
    settle().await;

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.link_state, LinkState::Connecting);
    assert!(snapshot.is_pending("chat-1"));
    assert!(connector.links().is_empty());

    session.wait_for_state(LinkState::Connected).await.unwrap();
    settle().await;

    let snapshot = session.snapshot().await.unwrap();
    assert!(snapshot.pending.is_empty());
    assert_eq!(
        snapshot.subscription_status("chat-1"),
        Some(SubscriptionStatus::Active)
    );
    assert_eq!(connector.subscribe_count("chat-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pending_channels_flush_once_each() {
    let (session, connector) = spawn_with(MockConnector::new());

    for chat in ["1", "2", "3", "2"] {
        session.subscribe_chat(chat).unwrap();
    }
    session.wait_for_state(LinkState::Connected).await.unwrap();
    settle().await;

    let link = connector.last_link().unwrap();
    assert_eq!(link.subscribe_calls(), vec!["chat-1", "chat-2", "chat-3"]);

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.subscriptions.len(), 3);
    assert!(snapshot.pending.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_subscribe_is_ignored() {
    let (session, connector) = spawn_with(MockConnector::new().without_auto_confirm());
    session.start().unwrap();
    session.wait_for_state(LinkState::Connected).await.unwrap();

    // Still pending confirmation
    session.subscribe_chat("1").unwrap();
    session.subscribe_chat("1").unwrap();
    settle().await;
    assert_eq!(
        session.snapshot().await.unwrap().subscription_status("chat-1"),
        Some(SubscriptionStatus::Pending)
    );

    let link = connector.last_link().unwrap();
    link.confirm("chat-1");
    settle().await;

    // Active
    session.subscribe_chat("1").unwrap();
    settle().await;

    assert_eq!(link.subscribe_count("chat-1"), 1);
    assert_eq!(
        session.snapshot().await.unwrap().subscription_status("chat-1"),
        Some(SubscriptionStatus::Active)
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejected_subscription_retries_then_gives_up() {
    let (session, connector) = spawn_with(MockConnector::new());
    connector.reject_subscriptions("chat-1", usize::MAX);
    let mut events = session.events();

    session.subscribe_chat("1").unwrap();
    session.subscribe_chat("2").unwrap();
    session.wait_for_state(LinkState::Connected).await.unwrap();
    sleep(Duration::from_secs(30)).await;

    let seen = drain_events(&mut events);
    let delays: Vec<u64> = seen
        .iter()
        .filter_map(|event| match event {
            SessionEvent::SubscriptionRetryScheduled { channel, delay, .. }
                if channel.as_str() == "chat-1" =>
            {
                Some(delay.as_millis() as u64)
            }
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![1000, 2000, 4000]);
    assert!(seen.contains(&SessionEvent::SubscriptionExhausted {
        channel: channel("chat-1")
    }));

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(connector.subscribe_count("chat-1"), 4);
    assert_eq!(
        snapshot.subscription_status("chat-1"),
        Some(SubscriptionStatus::Error)
    );
    assert_eq!(
        snapshot.subscription_status("chat-2"),
        Some(SubscriptionStatus::Active)
    );
    assert!(snapshot.subscription_retries.is_empty());
    assert_eq!(snapshot.link_state, LinkState::Connected);
    assert_eq!(snapshot.metrics.subscription_retries, 3);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_recovers_on_retry() {
    let (session, connector) = spawn_with(MockConnector::new());
    connector.reject_subscriptions("chat-1", 1);

    session.subscribe_chat("1").unwrap();
    session.wait_for_state(LinkState::Connected).await.unwrap();
    settle().await;

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(
        snapshot.subscription_status("chat-1"),
        Some(SubscriptionStatus::Error)
    );
    assert_eq!(snapshot.subscription_retries.len(), 1);
    assert_eq!(snapshot.subscription_retries[0].attempt, 1);

    sleep(Duration::from_millis(1000)).await;
    settle().await;

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(
        snapshot.subscription_status("chat-1"),
        Some(SubscriptionStatus::Active)
    );
    assert!(snapshot.subscription_retries.is_empty());
    assert_eq!(connector.subscribe_count("chat-1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_during_subscription_backoff() {
    let (session, connector) = spawn_with(MockConnector::new());
    connector.reject_subscriptions("chat-1", 1);

    session.subscribe_chat("1").unwrap();
    session.wait_for_state(LinkState::Connected).await.unwrap();
    settle().await;
    connector.last_link().unwrap().fail("network down");

    sleep(Duration::from_secs(5)).await;
    settle().await;

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.link_state, LinkState::Connected);
    assert_eq!(
        snapshot.subscription_status("chat-1"),
        Some(SubscriptionStatus::Active)
    );
    assert!(snapshot.subscription_retries.is_empty());
    assert!(snapshot.pending.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_broker_unsubscribe_requeues_channel() {
    let (session, connector) = spawn_with(MockConnector::new());
    session.subscribe_chat("1").unwrap();
    session.wait_for_state(LinkState::Connected).await.unwrap();
    settle().await;
    let link = connector.last_link().unwrap();

    link.drop_subscription("chat-1", "permission revoked");
    settle().await;

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.subscription_status("chat-1"), None);
    assert!(snapshot.is_pending("chat-1"));
    assert_eq!(link.subscribe_count("chat-1"), 1);

    // Picked up again on the next connect
    link.disconnect("restart", true);
    settle().await;

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(
        snapshot.subscription_status("chat-1"),
        Some(SubscriptionStatus::Active)
    );
    assert_eq!(connector.last_link().unwrap().subscribe_count("chat-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_stops_delivery() {
    let (session, connector) = spawn_with(MockConnector::new());
    session.subscribe_chat("1").unwrap();
    session.wait_for_state(LinkState::Connected).await.unwrap();
    settle().await;
    let link = connector.last_link().unwrap();

    session.unsubscribe(channel("chat-1")).unwrap();
    settle().await;
    link.publish("chat-1", message_payload("m1", "1", "too late"));
    settle().await;

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(link.unsubscribe_calls(), vec!["chat-1"]);
    assert_eq!(snapshot.subscription_status("chat-1"), None);
    assert!(snapshot.messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_pending_channel_never_subscribes() {
    let (session, connector) =
        spawn_with(MockConnector::new().with_open_delay(Duration::from_millis(200)));

    session.subscribe_chat("1").unwrap();
    session.unsubscribe(channel("chat-1")).unwrap();
    session.wait_for_state(LinkState::Connected).await.unwrap();
    settle().await;

    assert_eq!(connector.subscribe_count("chat-1"), 0);
    assert!(session.snapshot().await.unwrap().pending.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_chat_rejects_bad_ids() {
    let (session, _connector) = spawn_with(MockConnector::new());

    assert!(session.subscribe_chat("").is_err());
    assert!(session.subscribe_chat("1 OR 1=1").is_err());
    assert_eq!(session.subscribe_chat("42").unwrap().as_str(), "chat-42");
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_mid_resubscribe_resets_retry_budget() {
    let (session, connector) = spawn_with(MockConnector::new().without_auto_confirm());
    let mut events = session.events();
    session.subscribe_chat("1").unwrap();
    session.wait_for_state(LinkState::Connected).await.unwrap();
    settle().await;
    let first = connector.last_link().unwrap();

    first.reject("chat-1", "permission denied");
    settle().await;
    sleep(Duration::from_millis(1000)).await;
    settle().await;
    first.reject("chat-1", "permission denied");
    settle().await;
    sleep(Duration::from_millis(2000)).await;
    settle().await;

    // Third subscribe is in flight when the link goes away
    assert_eq!(first.subscribe_count("chat-1"), 3);
    first.disconnect("server shutdown", true);
    settle().await;

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.link_state, LinkState::Connected);
    assert_eq!(
        snapshot.subscription_status("chat-1"),
        Some(SubscriptionStatus::Pending)
    );
    assert!(snapshot.subscription_retries.is_empty());

    drain_events(&mut events);
    let second = connector.last_link().unwrap();
    second.reject("chat-1", "permission denied");
    settle().await;

    let retries: Vec<(u32, u64)> = drain_events(&mut events)
        .iter()
        .filter_map(|event| match event {
            SessionEvent::SubscriptionRetryScheduled { attempt, delay, .. } => {
                Some((*attempt, delay.as_millis() as u64))
            }
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![(1, 1000)]);
    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.subscription_retries[0].attempt, 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_after_connection_failed_reconnects() {
    let (session, connector) = spawn_with(MockConnector::new().with_failures(6));
    session.start().unwrap();
    session.wait_for_state(LinkState::Failed).await.unwrap();
    assert_eq!(connector.open_count(), 6);

    session.subscribe_chat("1").unwrap();
    session.wait_for_state(LinkState::Connected).await.unwrap();
    settle().await;

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(connector.open_count(), 7);
    assert_eq!(snapshot.retry.attempt, 0);
    assert!(snapshot.pending.is_empty());
    assert_eq!(
        snapshot.subscription_status("chat-1"),
        Some(SubscriptionStatus::Active)
    );
}
