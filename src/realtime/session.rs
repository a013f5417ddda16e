//! Session event loop
//!
//! One tokio task owns every realtime component and processes one input at a
//! time: caller commands, connection attempt results, link events and timer
//! expiries. Every check-then-act therefore completes inside a single loop
//! turn with no suspension in between, and no component needs a lock.
//!
//! Internal producers (attempt tasks, timers) hold weak senders, so the loop
//! ends and tears everything down once the last [`SessionHandle`] is dropped.

use super::connection_manager::{ConnectionManager, ConnectionOutcome, LinkState};
use super::inbox::MessageInbox;
use super::presence::PresenceTracker;
use super::registry::{
    ChannelSubscription, SubscribeOutcome, SubscriptionRegistry, SubscriptionStatus,
};
use super::retry::{RetryPolicy, RetryState};
use super::router::{EventRoute, EventRouter};
use super::scheduler::{Scheduler, TimerFired, TimerKey};
use super::subscription_retry::{
    SubscriptionRetryOutcome, SubscriptionRetryState, SubscriptionRetrySupervisor,
};
use super::typing::{TypingChange, TypingEntry, TypingTracker};
use crate::channel_span;
use crate::config::ClientConfig;
use crate::error::{ChatError, ChatResult};
use crate::observability::{LinkMetrics, LinkMetricsSnapshot};
use crate::protocol::{ChannelName, Message, TypingEvent};
use crate::transport::{BrokerConnector, BrokerLink, LinkEvent, LinkId, SubscriptionEvent, TokenProvider};
use serde_json::Value;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Parameters of one realtime session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Broker WebSocket endpoint
    pub endpoint: String,
    pub connection_retry: RetryPolicy,
    pub subscription_retry: RetryPolicy,
    /// Lifetime of an inbound typing indicator
    pub typing_ttl: Duration,
    /// Buffer of the [`SessionEvent`] broadcast channel
    pub event_capacity: usize,
}

impl SessionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connection_retry: RetryPolicy::connection(),
            subscription_retry: RetryPolicy::subscription(),
            typing_ttl: Duration::from_millis(3000),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl From<&ClientConfig> for SessionConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            endpoint: config.broker.ws_url.clone(),
            connection_retry: config.retry.connection.into(),
            subscription_retry: config.retry.subscription.into(),
            typing_ttl: config.typing.ttl(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Notifications broadcast to every handle
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LinkStateChanged(LinkState),
    ConnectionRetryScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// Automatic reconnection gave up; call [`SessionHandle::retry`]
    ConnectionFailed {
        attempts: u32,
    },
    /// `None` means the channel is queued for the next connect or was removed
    SubscriptionChanged {
        channel: ChannelName,
        status: Option<SubscriptionStatus>,
    },
    SubscriptionRetryScheduled {
        channel: ChannelName,
        attempt: u32,
        delay: Duration,
    },
    /// Subscription retries used up; the channel stays in `Error`
    SubscriptionExhausted {
        channel: ChannelName,
    },
    MessageReceived {
        channel: String,
        message: Message,
    },
    TypingChanged {
        channel: String,
        user_id: String,
        username: String,
        is_typing: bool,
    },
    PresenceChanged {
        user_id: String,
        username: String,
        is_online: bool,
    },
}

/// Point-in-time view of the whole session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub link_state: LinkState,
    pub retry: RetryState,
    pub connecting: bool,
    pub pending: Vec<ChannelName>,
    pub subscriptions: Vec<ChannelSubscription>,
    pub subscription_retries: Vec<SubscriptionRetryState>,
    pub messages: Vec<Message>,
    pub typing: Vec<TypingEntry>,
    pub online_users: Vec<String>,
    pub scheduled_timers: usize,
    pub metrics: LinkMetricsSnapshot,
}

impl SessionSnapshot {
    pub fn subscription_status(&self, channel: &str) -> Option<SubscriptionStatus> {
        self.subscriptions
            .iter()
            .find(|entry| entry.channel.as_str() == channel)
            .map(|entry| entry.status)
    }

    pub fn is_pending(&self, channel: &str) -> bool {
        self.pending.iter().any(|c| c.as_str() == channel)
    }
}

pub(crate) enum Command {
    Start,
    Retry,
    Subscribe(ChannelName),
    Unsubscribe(ChannelName),
    MergeHistory(Vec<Message>, oneshot::Sender<usize>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Teardown(oneshot::Sender<()>),
}

pub(crate) enum SessionInput {
    Command(Command),
    AttemptFinished {
        link_id: LinkId,
        result: ChatResult<Box<dyn BrokerLink>>,
    },
    Link {
        link_id: LinkId,
        event: LinkEvent,
    },
    Timer(TimerFired),
}

/// Weak sender used by everything the session spawns
#[derive(Clone)]
pub(crate) struct InputSender(mpsc::WeakUnboundedSender<SessionInput>);

impl InputSender {
    pub(crate) fn new(sender: &mpsc::UnboundedSender<SessionInput>) -> Self {
        Self(sender.downgrade())
    }

    /// Returns false once the session has gone away
    pub(crate) fn send(&self, input: SessionInput) -> bool {
        match self.0.upgrade() {
            Some(sender) => sender.send(input).is_ok(),
            None => false,
        }
    }
}

pub struct Session {
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
    retries: SubscriptionRetrySupervisor,
    inbox: MessageInbox,
    presence: PresenceTracker,
    typing: TypingTracker,
    scheduler: Scheduler,
    events: broadcast::Sender<SessionEvent>,
    metrics: Arc<LinkMetrics>,
}

impl Session {
    /// Build the session and run its loop on the current tokio runtime
    ///
    /// Nothing connects until [`SessionHandle::start`] or a subscribe call.
    pub fn spawn(
        config: SessionConfig,
        tokens: Arc<dyn TokenProvider>,
        connector: Arc<dyn BrokerConnector>,
    ) -> SessionHandle {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(LinkMetrics::new());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let timer_inputs = InputSender::new(&tx);
        let scheduler = Scheduler::new(move |fired| {
            timer_inputs.send(SessionInput::Timer(fired));
        });
        let connection = ConnectionManager::new(
            config.endpoint,
            config.connection_retry,
            tokens,
            connector,
            InputSender::new(&tx),
            Arc::clone(&metrics),
        );
        let state = connection.watch_state();

        let session = Session {
            connection,
            registry: SubscriptionRegistry::new(Arc::clone(&metrics)),
            retries: SubscriptionRetrySupervisor::new(config.subscription_retry),
            inbox: MessageInbox::new(),
            presence: PresenceTracker::new(),
            typing: TypingTracker::new(config.typing_ttl),
            scheduler,
            events: events.clone(),
            metrics: Arc::clone(&metrics),
        };
        let span = tracing::info_span!("session", %session_id);
        tokio::spawn(session.run(rx).instrument(span));

        SessionHandle {
            session_id,
            inputs: tx,
            state,
            events,
            metrics,
        }
    }

    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<SessionInput>) {
        info!("Realtime session started");
        while let Some(input) = inputs.recv().await {
            if self.handle_input(input).is_break() {
                return;
            }
        }
        debug!("All session handles dropped");
        self.teardown();
    }

    fn handle_input(&mut self, input: SessionInput) -> ControlFlow<()> {
        let flow = match input {
            SessionInput::Command(command) => self.handle_command(command),
            SessionInput::AttemptFinished { link_id, result } => {
                self.on_attempt_finished(link_id, result);
                ControlFlow::Continue(())
            }
            SessionInput::Link { link_id, event } => {
                self.on_link_event(link_id, event);
                ControlFlow::Continue(())
            }
            SessionInput::Timer(fired) => {
                self.on_timer(fired);
                ControlFlow::Continue(())
            }
        };

        for state in self.connection.take_transitions() {
            self.publish(SessionEvent::LinkStateChanged(state));
        }
        flow
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Start => {
                self.connection.start();
            }
            Command::Retry => {
                self.connection.retry(&mut self.scheduler);
            }
            Command::Subscribe(channel) => {
                let outcome = self.registry.subscribe(&channel, self.connection.link());
                self.after_subscribe(&channel, outcome);
            }
            Command::Unsubscribe(channel) => {
                self.retries.discard(channel.as_str(), &mut self.scheduler);
                if self
                    .registry
                    .unsubscribe(channel.as_str(), self.connection.link())
                {
                    self.publish(SessionEvent::SubscriptionChanged {
                        channel,
                        status: None,
                    });
                }
            }
            Command::MergeHistory(messages, reply) => {
                let added = self.inbox.load_history(messages);
                debug!(added, "History merged into inbox");
                let _ = reply.send(added);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Teardown(reply) => {
                self.teardown();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn on_attempt_finished(&mut self, link_id: LinkId, result: ChatResult<Box<dyn BrokerLink>>) {
        let outcome = self
            .connection
            .on_attempt_finished(link_id, result, &mut self.scheduler);

        if outcome == ConnectionOutcome::Connected {
            self.flush_pending();
        } else {
            self.report_connection_outcome(outcome);
        }
    }

    fn report_connection_outcome(&mut self, outcome: ConnectionOutcome) {
        match outcome {
            ConnectionOutcome::RetryScheduled { attempt, delay } => {
                self.publish(SessionEvent::ConnectionRetryScheduled { attempt, delay });
            }
            ConnectionOutcome::Exhausted => {
                let attempts = self.connection.retry_state().attempt;
                self.publish(SessionEvent::ConnectionFailed { attempts });
            }
            ConnectionOutcome::Connected
            | ConnectionOutcome::Reconnecting
            | ConnectionOutcome::Stale => {}
        }
    }

    fn flush_pending(&mut self) {
        let Some(link) = self.connection.link() else {
            return;
        };
        let outcomes = self.registry.flush_pending(link);
        for (channel, outcome) in outcomes {
            self.after_subscribe(&channel, outcome);
        }
    }

    fn after_subscribe(&mut self, channel: &ChannelName, outcome: SubscribeOutcome) {
        match outcome {
            SubscribeOutcome::Requested => {
                self.publish(SessionEvent::SubscriptionChanged {
                    channel: channel.clone(),
                    status: Some(SubscriptionStatus::Pending),
                });
            }
            SubscribeOutcome::Queued => {
                self.publish(SessionEvent::SubscriptionChanged {
                    channel: channel.clone(),
                    status: None,
                });
                self.connection.start();
            }
            SubscribeOutcome::Failed(e) => {
                debug!(%channel, error = %e, "Subscribe command refused");
                self.handle_subscription_failure(channel);
            }
            SubscribeOutcome::AlreadyActive => {
                self.retries.discard(channel.as_str(), &mut self.scheduler);
            }
            SubscribeOutcome::InFlight => {}
        }
    }

    /// Subscription-level failures retry here while the link is up;
    /// otherwise the channel waits for connection-level recovery.
    fn handle_subscription_failure(&mut self, channel: &ChannelName) {
        if !self.connection.is_ready() {
            self.retries.discard(channel.as_str(), &mut self.scheduler);
            self.registry.requeue(channel);
            self.publish(SessionEvent::SubscriptionChanged {
                channel: channel.clone(),
                status: None,
            });
            return;
        }

        self.publish(SessionEvent::SubscriptionChanged {
            channel: channel.clone(),
            status: Some(SubscriptionStatus::Error),
        });
        match self.retries.schedule_retry(channel, &mut self.scheduler) {
            SubscriptionRetryOutcome::Scheduled { attempt, delay } => {
                self.metrics.subscription_retry();
                self.publish(SessionEvent::SubscriptionRetryScheduled {
                    channel: channel.clone(),
                    attempt,
                    delay,
                });
            }
            SubscriptionRetryOutcome::Exhausted { .. } => {
                self.publish(SessionEvent::SubscriptionExhausted {
                    channel: channel.clone(),
                });
            }
        }
    }

    fn on_link_event(&mut self, link_id: LinkId, event: LinkEvent) {
        if self.connection.current_link_id() != Some(link_id) {
            debug!(link_id, "Dropping event from superseded link");
            return;
        }

        match event {
            LinkEvent::Disconnected {
                reason,
                server_initiated,
            } => self.on_link_lost(link_id, &reason, server_initiated),
            LinkEvent::Error(reason) => self.on_link_lost(link_id, &reason, false),
            LinkEvent::Subscription { channel, event } => {
                self.on_subscription_event(&channel, event)
            }
        }
    }

    fn on_link_lost(&mut self, link_id: LinkId, reason: &str, server_initiated: bool) {
        for channel in self.registry.invalidate_all() {
            self.retries.discard(channel.as_str(), &mut self.scheduler);
            self.publish(SessionEvent::SubscriptionChanged {
                channel,
                status: None,
            });
        }
        let outcome =
            self.connection
                .on_link_lost(link_id, reason, server_initiated, &mut self.scheduler);
        self.report_connection_outcome(outcome);
    }

    fn on_subscription_event(&mut self, channel: &str, event: SubscriptionEvent) {
        let _span = channel_span!(channel).entered();
        match event {
            SubscriptionEvent::Subscribing => debug!(channel, "Subscribing"),
            SubscriptionEvent::Subscribed => {
                if self.registry.on_subscribed(channel) {
                    self.retries.discard(channel, &mut self.scheduler);
                    self.publish_status(channel, Some(SubscriptionStatus::Active));
                }
            }
            SubscriptionEvent::Publication(data) => {
                if self.registry.accepts_events(channel) {
                    self.dispatch(channel, &data);
                } else {
                    debug!(channel, "Dropping publication for untracked channel");
                }
            }
            SubscriptionEvent::Error(message) => {
                if self.registry.on_subscription_error(channel, &message) {
                    if let Ok(channel) = ChannelName::new(channel) {
                        self.handle_subscription_failure(&channel);
                    }
                }
            }
            SubscriptionEvent::Unsubscribed(reason) => {
                if self.registry.on_subscription_lost(channel) {
                    debug!(channel, reason = %reason, "Subscription re-queued");
                    self.retries.discard(channel, &mut self.scheduler);
                    self.publish_status(channel, None);
                }
            }
        }
    }

    /// Route one publication into the inbox, typing or presence tracker
    fn dispatch(&mut self, channel: &str, payload: &Value) {
        let route = EventRouter::route(payload);
        if EventRouter::log_if_dropped(channel, &route) {
            match route {
                EventRoute::Unknown(_) => self.metrics.unknown_event(),
                _ => self.metrics.malformed_event(),
            }
            return;
        }

        match route {
            EventRoute::NewMessage(message) => {
                if self.inbox.append(message.clone()) {
                    self.metrics.message_received();
                    debug!(channel, message_id = %message.id, "Message received");
                    self.publish(SessionEvent::MessageReceived {
                        channel: channel.to_string(),
                        message,
                    });
                } else {
                    self.metrics.duplicate_message();
                    debug!(channel, message_id = %message.id, "Duplicate message ignored");
                }
            }
            EventRoute::Typing(event) => {
                self.metrics.typing_event();
                self.apply_typing(channel, &event);
            }
            EventRoute::Presence(event) => {
                self.metrics.presence_event();
                if self.presence.apply(&event) {
                    self.publish(SessionEvent::PresenceChanged {
                        user_id: event.user_id,
                        username: event.username,
                        is_online: event.is_online,
                    });
                }
            }
            EventRoute::Unknown(_) | EventRoute::Malformed(_) => {}
        }
    }

    fn apply_typing(&mut self, channel: &str, event: &TypingEvent) {
        let previous = self.typing.generation(&event.user_id);
        if let Some(generation) = previous {
            self.scheduler.cancel(&TimerKey::TypingExpiry {
                user_id: event.user_id.clone(),
                generation,
            });
        }

        match self.typing.apply(event, channel, Instant::now()) {
            TypingChange::Started {
                user_id,
                generation,
            } => {
                self.scheduler.schedule(
                    TimerKey::TypingExpiry {
                        user_id,
                        generation,
                    },
                    self.typing.ttl(),
                );
                if previous.is_none() {
                    self.publish_typing(channel, event, true);
                }
            }
            TypingChange::Stopped { .. } => self.publish_typing(channel, event, false),
            TypingChange::Unchanged => {}
        }
    }

    fn on_timer(&mut self, fired: TimerFired) {
        let Some(key) = self.scheduler.fire(fired) else {
            return;
        };

        match key {
            TimerKey::Reconnect => self.connection.on_retry_timer(),
            TimerKey::Resubscribe(channel) => self.on_resubscribe_due(&channel),
            TimerKey::TypingExpiry {
                user_id,
                generation,
            } => {
                if let Some(entry) = self.typing.expire(&user_id, generation) {
                    debug!(user_id = %entry.user_id, "Typing indicator expired");
                    self.publish(SessionEvent::TypingChanged {
                        channel: entry.channel,
                        user_id: entry.user_id,
                        username: entry.username,
                        is_typing: false,
                    });
                }
            }
        }
    }

    fn on_resubscribe_due(&mut self, channel: &str) {
        if !self.retries.is_tracking(channel) {
            return;
        }
        let Ok(channel) = ChannelName::new(channel) else {
            return;
        };

        if !self.connection.is_ready() {
            info!(%channel, "Link down at retry time, handing channel to reconnect");
            self.retries.discard(channel.as_str(), &mut self.scheduler);
            self.registry.requeue(&channel);
            self.publish(SessionEvent::SubscriptionChanged {
                channel,
                status: None,
            });
            return;
        }

        let outcome = self.registry.subscribe(&channel, self.connection.link());
        self.after_subscribe(&channel, outcome);
    }

    fn teardown(&mut self) {
        self.retries.teardown(&mut self.scheduler);
        self.registry.teardown(self.connection.link());
        self.connection.teardown(&mut self.scheduler);
        self.scheduler.cancel_all();
        self.typing.clear();
        self.presence.clear();
        self.inbox.clear();
        for state in self.connection.take_transitions() {
            self.publish(SessionEvent::LinkStateChanged(state));
        }
        info!("Realtime session torn down");
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            link_state: self.connection.state(),
            retry: self.connection.retry_state(),
            connecting: self.connection.in_progress(),
            pending: self.registry.pending().to_vec(),
            subscriptions: self.registry.subscriptions(),
            subscription_retries: self.retries.states(),
            messages: self.inbox.messages().to_vec(),
            typing: self.typing.entries(),
            online_users: self.presence.online_users(),
            scheduled_timers: self.scheduler.len(),
            metrics: self.metrics.snapshot(),
        }
    }

    fn publish_status(&mut self, channel: &str, status: Option<SubscriptionStatus>) {
        if let Ok(channel) = ChannelName::new(channel) {
            self.publish(SessionEvent::SubscriptionChanged { channel, status });
        }
    }

    fn publish_typing(&mut self, channel: &str, event: &TypingEvent, is_typing: bool) {
        self.publish(SessionEvent::TypingChanged {
            channel: channel.to_string(),
            user_id: event.user_id.clone(),
            username: event.username.clone(),
            is_typing,
        });
    }

    fn publish(&self, event: SessionEvent) {
        // No receivers is normal; handles subscribe on demand.
        let _ = self.events.send(event);
    }
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    inputs: mpsc::UnboundedSender<SessionInput>,
    state: watch::Receiver<LinkState>,
    events: broadcast::Sender<SessionEvent>,
    metrics: Arc<LinkMetrics>,
}

impl SessionHandle {
    /// Correlation id carried by every log line of this session
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Begin connecting; no-op while connecting or connected
    pub fn start(&self) -> ChatResult<()> {
        self.send(Command::Start)
    }

    /// Manual retry after automatic reconnection gave up
    pub fn retry(&self) -> ChatResult<()> {
        self.send(Command::Retry)
    }

    /// Request live updates for `channel`; queues while the link is not ready
    pub fn subscribe(&self, channel: ChannelName) -> ChatResult<()> {
        self.send(Command::Subscribe(channel))
    }

    /// Subscribe to the channel of one chat
    pub fn subscribe_chat(&self, chat_id: &str) -> ChatResult<ChannelName> {
        let channel =
            ChannelName::for_chat(chat_id).map_err(|e| ChatError::invalid_input(e.to_string()))?;
        self.subscribe(channel.clone())?;
        Ok(channel)
    }

    pub fn unsubscribe(&self, channel: ChannelName) -> ChatResult<()> {
        self.send(Command::Unsubscribe(channel))
    }

    /// Merge fetched history into the inbox; returns how many were new
    pub async fn merge_history(&self, messages: Vec<Message>) -> ChatResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::MergeHistory(messages, reply))?;
        rx.await.map_err(|_| ChatError::SessionClosed)
    }

    pub async fn snapshot(&self) -> ChatResult<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply))?;
        rx.await.map_err(|_| ChatError::SessionClosed)
    }

    /// Cancel every timer, unsubscribe everything, close the link and stop
    /// the session
    pub async fn teardown(&self) -> ChatResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Teardown(reply))?;
        rx.await.map_err(|_| ChatError::SessionClosed)
    }

    pub fn link_state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn watch_link_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Wait until the link reaches `target`
    pub async fn wait_for_state(&self, target: LinkState) -> ChatResult<()> {
        let mut state = self.state.clone();
        loop {
            if *state.borrow_and_update() == target {
                return Ok(());
            }
            if state.changed().await.is_err() {
                return Err(ChatError::SessionClosed);
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    /// `Err(NotReady)` unless the link is connected
    pub fn ensure_ready(&self) -> ChatResult<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ChatError::NotReady)
        }
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> LinkMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.inputs.is_closed()
    }

    fn send(&self, command: Command) -> ChatResult<()> {
        self.inputs
            .send(SessionInput::Command(command))
            .map_err(|_| ChatError::SessionClosed)
    }
}
