//! Broker boundary
//!
//! The realtime core talks to the push-messaging broker only through the
//! traits in this module, so the concrete link (Centrifugo over WebSocket)
//! can be swapped for mocks in tests.

use crate::error::ChatResult;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub mod centrifugo;

/// Monotonic identifier of one connection attempt and the link it produces
pub type LinkId = u64;

/// Per-subscription signals emitted by a broker link
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// Subscribe command written, reply not yet received
    Subscribing,
    /// Broker confirmed the subscription
    Subscribed,
    /// Data published on the channel
    Publication(Value),
    /// Broker rejected the subscription or reported an error for it
    Error(String),
    /// Broker dropped the subscription while the link stayed up
    Unsubscribed(String),
}

/// Lifecycle and subscription signals emitted by an open link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Link closed; `server_initiated` is true for a clean broker disconnect
    Disconnected {
        reason: String,
        server_initiated: bool,
    },
    /// Transport failure; the link is gone
    Error(String),
    Subscription {
        channel: String,
        event: SubscriptionEvent,
    },
}

type Deliver = dyn Fn(LinkId, LinkEvent) -> bool + Send + Sync;

/// Where a link delivers its events
///
/// Every sink is stamped with the id of the connection attempt that created
/// it so the receiver can discard events from superseded links.
#[derive(Clone)]
pub struct LinkEventSink {
    link_id: LinkId,
    deliver: Arc<Deliver>,
}

impl LinkEventSink {
    pub fn new<F>(link_id: LinkId, deliver: F) -> Self
    where
        F: Fn(LinkId, LinkEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            link_id,
            deliver: Arc::new(deliver),
        }
    }

    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    /// Deliver an event; returns false once the receiver is gone
    pub fn emit(&self, event: LinkEvent) -> bool {
        (self.deliver)(self.link_id, event)
    }

    pub fn emit_subscription(&self, channel: &str, event: SubscriptionEvent) -> bool {
        self.emit(LinkEvent::Subscription {
            channel: channel.to_string(),
            event,
        })
    }
}

impl fmt::Debug for LinkEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEventSink")
            .field("link_id", &self.link_id)
            .finish_non_exhaustive()
    }
}

/// An open broker link
///
/// Methods only enqueue commands; outcomes arrive later as [`LinkEvent`]s.
pub trait BrokerLink: Send + Sync {
    fn subscribe(&self, channel: &str) -> ChatResult<()>;

    fn unsubscribe(&self, channel: &str) -> ChatResult<()>;

    /// Close the link without emitting further events
    fn close(&self);
}

/// Opens broker links
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a link to `endpoint` authenticated with `token`
    ///
    /// Resolves once the broker accepted the connection. Later lifecycle and
    /// subscription signals go to `sink`.
    async fn open(
        &self,
        endpoint: &str,
        token: &str,
        sink: LinkEventSink,
    ) -> ChatResult<Box<dyn BrokerLink>>;
}

/// Issues short-lived broker connection tokens
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> ChatResult<String>;
}
