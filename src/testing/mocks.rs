//! Mock broker collaborators
//!
//! `MockConnector` hands out `MockLink`s that record every command and let a
//! test inject link and subscription events. `MockTokenProvider` counts token
//! fetches and can be told to fail.

use crate::error::{ChatError, ChatResult};
use crate::transport::{
    BrokerConnector, BrokerLink, LinkEvent, LinkEventSink, LinkId, SubscriptionEvent,
    TokenProvider,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Token provider returning a fixed token
#[derive(Debug)]
pub struct MockTokenProvider {
    token: String,
    failures_left: AtomicUsize,
    fetches: AtomicUsize,
}

impl MockTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            failures_left: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Fail the first `count` fetches
    pub fn with_failures(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for MockTokenProvider {
    async fn fetch_token(&self) -> ChatResult<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChatError::token_fetch("mock token endpoint unavailable"));
        }
        Ok(self.token.clone())
    }
}

/// How new links answer subscribe commands
#[derive(Debug, Default)]
struct LinkBehaviour {
    /// Confirm subscriptions without test involvement
    auto_confirm: bool,
    /// Remaining rejections per channel
    rejections: Mutex<HashMap<String, usize>>,
}

/// Connector producing [`MockLink`]s
#[derive(Debug)]
pub struct MockConnector {
    failures_left: AtomicUsize,
    open_delay: Duration,
    behaviour: Arc<LinkBehaviour>,
    opens: Mutex<Vec<OpenRecord>>,
    links: Mutex<Vec<Arc<MockLink>>>,
}

/// One call to [`BrokerConnector::open`]
#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub at: Instant,
    pub endpoint: String,
    pub token: String,
    pub link_id: LinkId,
    pub succeeded: bool,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Connector whose links confirm every subscription
    pub fn new() -> Self {
        Self {
            failures_left: AtomicUsize::new(0),
            open_delay: Duration::ZERO,
            behaviour: Arc::new(LinkBehaviour {
                auto_confirm: true,
                rejections: Mutex::new(HashMap::new()),
            }),
            opens: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
        }
    }

    /// Fail the first `count` opens
    pub fn with_failures(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Sleep for `delay` inside every open
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Leave subscriptions unanswered until the test emits the reply
    pub fn without_auto_confirm(mut self) -> Self {
        self.behaviour = Arc::new(LinkBehaviour::default());
        self
    }

    /// Reject the next `count` subscribe commands for `channel`
    pub fn reject_subscriptions(&self, channel: &str, count: usize) {
        if let Ok(mut rejections) = self.behaviour.rejections.lock() {
            rejections.insert(channel.to_string(), count);
        }
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        self.opens.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn open_count(&self) -> usize {
        self.opens().len()
    }

    pub fn tokens_used(&self) -> Vec<String> {
        self.opens().into_iter().map(|o| o.token).collect()
    }

    pub fn links(&self) -> Vec<Arc<MockLink>> {
        self.links.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn last_link(&self) -> Option<Arc<MockLink>> {
        self.links().pop()
    }

    /// Subscribe commands for `channel` across every link
    pub fn subscribe_count(&self, channel: &str) -> usize {
        self.links()
            .iter()
            .map(|link| link.subscribe_count(channel))
            .sum()
    }
}

#[async_trait]
impl BrokerConnector for MockConnector {
    async fn open(
        &self,
        endpoint: &str,
        token: &str,
        sink: LinkEventSink,
    ) -> ChatResult<Box<dyn BrokerLink>> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();

        if let Ok(mut opens) = self.opens.lock() {
            opens.push(OpenRecord {
                at: Instant::now(),
                endpoint: endpoint.to_string(),
                token: token.to_string(),
                link_id: sink.link_id(),
                succeeded: !failing,
            });
        }

        if failing {
            return Err(ChatError::link_open("mock broker refused connection"));
        }

        let link = Arc::new(MockLink {
            sink,
            behaviour: Arc::clone(&self.behaviour),
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        if let Ok(mut links) = self.links.lock() {
            links.push(Arc::clone(&link));
        }
        Ok(Box::new(MockLinkHandle(link)))
    }
}

/// Recording broker link
#[derive(Debug)]
pub struct MockLink {
    sink: LinkEventSink,
    behaviour: Arc<LinkBehaviour>,
    subscribes: Mutex<Vec<String>>,
    unsubscribes: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MockLink {
    pub fn link_id(&self) -> LinkId {
        self.sink.link_id()
    }

    pub fn subscribe_calls(&self) -> Vec<String> {
        self.subscribes.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn subscribe_count(&self, channel: &str) -> usize {
        self.subscribe_calls()
            .iter()
            .filter(|c| c.as_str() == channel)
            .count()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        self.unsubscribes.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: LinkEvent) -> bool {
        self.sink.emit(event)
    }

    pub fn confirm(&self, channel: &str) -> bool {
        self.sink
            .emit_subscription(channel, SubscriptionEvent::Subscribed)
    }

    pub fn reject(&self, channel: &str, reason: &str) -> bool {
        self.sink
            .emit_subscription(channel, SubscriptionEvent::Error(reason.to_string()))
    }

    /// Publish a payload on `channel` as the broker would
    pub fn publish(&self, channel: &str, data: Value) -> bool {
        self.sink
            .emit_subscription(channel, SubscriptionEvent::Publication(data))
    }

    /// Broker-side unsubscribe of one channel
    pub fn drop_subscription(&self, channel: &str, reason: &str) -> bool {
        self.sink.emit_subscription(
            channel,
            SubscriptionEvent::Unsubscribed(reason.to_string()),
        )
    }

    pub fn disconnect(&self, reason: &str, server_initiated: bool) -> bool {
        self.sink.emit(LinkEvent::Disconnected {
            reason: reason.to_string(),
            server_initiated,
        })
    }

    pub fn fail(&self, reason: &str) -> bool {
        self.sink.emit(LinkEvent::Error(reason.to_string()))
    }

    fn take_rejection(&self, channel: &str) -> bool {
        let Ok(mut rejections) = self.behaviour.rejections.lock() else {
            return false;
        };
        match rejections.get_mut(channel) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

struct MockLinkHandle(Arc<MockLink>);

impl BrokerLink for MockLinkHandle {
    fn subscribe(&self, channel: &str) -> ChatResult<()> {
        let link = &self.0;
        if link.is_closed() {
            return Err(ChatError::subscription(channel, "link closed"));
        }
        if let Ok(mut subscribes) = link.subscribes.lock() {
            subscribes.push(channel.to_string());
        }
        link.sink
            .emit_subscription(channel, SubscriptionEvent::Subscribing);

        if link.take_rejection(channel) {
            link.reject(channel, "permission denied");
        } else if link.behaviour.auto_confirm {
            link.confirm(channel);
        }
        Ok(())
    }

    fn unsubscribe(&self, channel: &str) -> ChatResult<()> {
        if let Ok(mut unsubscribes) = self.0.unsubscribes.lock() {
            unsubscribes.push(channel.to_string());
        }
        Ok(())
    }

    fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}

/// Let spawned tasks drain their queues
///
/// Under paused time the clock only auto-advances once every task is idle,
/// so this returns after all ready work has run and 1ms has elapsed.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
