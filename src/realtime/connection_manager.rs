//! Single broker link ownership and connection-level recovery
//!
//! State machine:
//!
//! ```text
//! Disconnected --start--> Connecting --success--> Connected
//! Connecting --failure, attempts left--> Connecting (after backoff)
//! Connecting --failure, attempts exhausted--> Failed (until manual retry)
//! Connected --clean server disconnect--> Disconnected --start--> Connecting
//! Connected --link error--> Disconnected --backoff--> Connecting
//! ```
//!
//! All methods are synchronous and run on the session loop. The only
//! asynchronous work (token fetch plus link open) happens in a spawned attempt
//! task that reports back through the session input channel.

use super::retry::{RetryDecision, RetryPolicy, RetryState};
use super::scheduler::{Scheduler, TimerKey};
use super::session::{InputSender, SessionInput};
use crate::error::ChatError;
use crate::link_span;
use crate::observability::LinkMetrics;
use crate::transport::{BrokerConnector, BrokerLink, LinkEventSink, LinkId, TokenProvider};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Automatic retries exhausted; only a manual retry leaves this state
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of feeding a finished attempt or a link loss into the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Link is up; pending subscriptions should be flushed
    Connected,
    /// A retry timer was armed
    RetryScheduled { attempt: u32, delay: Duration },
    /// A fresh attempt started immediately
    Reconnecting,
    /// Retries used up; state is now `Failed`
    Exhausted,
    /// Signal belonged to a superseded attempt or link
    Stale,
}

struct ActiveLink {
    link_id: LinkId,
    link: Box<dyn BrokerLink>,
    forwarder: AbortHandle,
}

pub struct ConnectionManager {
    endpoint: String,
    policy: RetryPolicy,
    tokens: Arc<dyn TokenProvider>,
    connector: Arc<dyn BrokerConnector>,
    inputs: InputSender,
    metrics: Arc<LinkMetrics>,
    state: watch::Sender<LinkState>,
    retry: RetryState,
    in_progress: bool,
    next_link_id: LinkId,
    attempt: Option<(LinkId, AbortHandle)>,
    active: Option<ActiveLink>,
    transitions: Vec<LinkState>,
}

impl ConnectionManager {
    pub(crate) fn new(
        endpoint: impl Into<String>,
        policy: RetryPolicy,
        tokens: Arc<dyn TokenProvider>,
        connector: Arc<dyn BrokerConnector>,
        inputs: InputSender,
        metrics: Arc<LinkMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            endpoint: endpoint.into(),
            retry: RetryState::new(&policy),
            policy,
            tokens,
            connector,
            inputs,
            metrics,
            state,
            in_progress: false,
            next_link_id: 0,
            attempt: None,
            active: None,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LinkState::Connected && self.active.is_some()
    }

    /// True from `start()` until the link is up or retries are exhausted
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry
    }

    pub fn link(&self) -> Option<&dyn BrokerLink> {
        self.active.as_ref().map(|active| active.link.as_ref())
    }

    pub fn current_link_id(&self) -> Option<LinkId> {
        self.active.as_ref().map(|active| active.link_id)
    }

    /// States entered since the last call, oldest first
    pub(crate) fn take_transitions(&mut self) -> Vec<LinkState> {
        std::mem::take(&mut self.transitions)
    }

    /// Begin establishing the link; no-op while in progress or connected
    pub fn start(&mut self) -> bool {
        if self.in_progress || self.active.is_some() {
            debug!(state = %self.state(), "Connection start ignored");
            return false;
        }

        self.in_progress = true;
        self.retry.reset();
        self.begin_attempt();
        true
    }

    /// Manual retry: reset the attempt counter and connect now
    ///
    /// Cancels a pending backoff timer. Ignored while an attempt is in flight
    /// or the link is up.
    pub fn retry(&mut self, scheduler: &mut Scheduler) -> bool {
        if self.attempt.is_some() || self.active.is_some() {
            debug!(state = %self.state(), "Manual retry ignored");
            return false;
        }

        info!(state = %self.state(), "Manual connection retry");
        scheduler.cancel(&TimerKey::Reconnect);
        self.in_progress = true;
        self.retry.reset();
        self.begin_attempt();
        true
    }

    /// Backoff timer elapsed
    pub fn on_retry_timer(&mut self) {
        if !self.in_progress || self.attempt.is_some() || self.active.is_some() {
            return;
        }
        self.begin_attempt();
    }

    pub(crate) fn on_attempt_finished(
        &mut self,
        link_id: LinkId,
        result: Result<Box<dyn BrokerLink>, ChatError>,
        scheduler: &mut Scheduler,
    ) -> ConnectionOutcome {
        let forwarder = match self.attempt.take() {
            Some((id, handle)) if id == link_id => handle,
            other => {
                self.attempt = other;
                if let Ok(link) = result {
                    debug!(link_id, "Closing link from superseded attempt");
                    link.close();
                }
                return ConnectionOutcome::Stale;
            }
        };

        match result {
            Ok(link) => {
                self.active = Some(ActiveLink {
                    link_id,
                    link,
                    forwarder,
                });
                self.in_progress = false;
                self.retry.reset();
                self.metrics.connection_established();
                self.transition(LinkState::Connected);
                ConnectionOutcome::Connected
            }
            Err(e) => {
                self.metrics.connection_failed();
                warn!(link_id, error = %e.sanitized_message(), "Connection attempt failed");
                self.schedule_retry(scheduler)
            }
        }
    }

    /// The active link reported a disconnect or transport error
    pub fn on_link_lost(
        &mut self,
        link_id: LinkId,
        reason: &str,
        server_initiated: bool,
        scheduler: &mut Scheduler,
    ) -> ConnectionOutcome {
        if self.current_link_id() != Some(link_id) {
            debug!(link_id, "Ignoring loss of superseded link");
            return ConnectionOutcome::Stale;
        }

        self.drop_active_link();
        self.metrics.connection_lost();
        self.transition(LinkState::Disconnected);

        if server_initiated {
            info!(reason, "Broker closed the link, reconnecting");
            self.start();
            ConnectionOutcome::Reconnecting
        } else {
            warn!(reason, "Broker link failed");
            self.in_progress = true;
            self.retry.reset();
            self.schedule_retry(scheduler)
        }
    }

    /// Cancel retries, abort any attempt and close the link
    pub fn teardown(&mut self, scheduler: &mut Scheduler) {
        scheduler.cancel(&TimerKey::Reconnect);
        if let Some((_, handle)) = self.attempt.take() {
            handle.abort();
        }
        self.drop_active_link();
        self.metrics.link_closed();
        self.in_progress = false;
        self.retry.reset();
        self.transition(LinkState::Disconnected);
    }

    fn schedule_retry(&mut self, scheduler: &mut Scheduler) -> ConnectionOutcome {
        match self.policy.next(self.retry.attempt) {
            RetryDecision::Proceed { attempt, delay } => {
                self.retry.record(attempt, delay);
                scheduler.schedule(TimerKey::Reconnect, delay);
                warn!(
                    attempt,
                    max_attempts = self.policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Connection retry scheduled"
                );
                ConnectionOutcome::RetryScheduled { attempt, delay }
            }
            RetryDecision::AbortMaxAttemptsExceeded => {
                error!(
                    attempts = self.retry.attempt,
                    "Connection retries exhausted, waiting for manual retry"
                );
                self.in_progress = false;
                self.metrics.retries_exhausted();
                self.transition(LinkState::Failed);
                ConnectionOutcome::Exhausted
            }
        }
    }

    fn begin_attempt(&mut self) {
        self.next_link_id += 1;
        let link_id = self.next_link_id;
        self.metrics.connection_attempt();
        self.transition(LinkState::Connecting);

        let tokens = Arc::clone(&self.tokens);
        let connector = Arc::clone(&self.connector);
        let endpoint = self.endpoint.clone();
        let inputs = self.inputs.clone();
        let span = link_span!(link_id, attempt = self.retry.attempt);

        let handle = tokio::spawn(
            async move {
                let (event_tx, mut event_rx) = mpsc::unbounded_channel();
                let sink = LinkEventSink::new(link_id, move |_, event| event_tx.send(event).is_ok());

                let result = async {
                    let token = tokens.fetch_token().await?;
                    debug!("Session token acquired");
                    connector.open(&endpoint, &token, sink).await
                }
                .await;

                let connected = result.is_ok();
                if !inputs.send(SessionInput::AttemptFinished { link_id, result }) || !connected {
                    return;
                }

                // Link events are forwarded only after the attempt result so
                // the session never sees events for a link it does not know.
                while let Some(event) = event_rx.recv().await {
                    if !inputs.send(SessionInput::Link { link_id, event }) {
                        break;
                    }
                }
            }
            .instrument(span),
        )
        .abort_handle();

        self.attempt = Some((link_id, handle));
    }

    fn drop_active_link(&mut self) {
        if let Some(active) = self.active.take() {
            active.link.close();
            active.forwarder.abort();
        }
    }

    fn transition(&mut self, next: LinkState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log_transition(previous, next);
            self.transitions.push(next);
        }
    }
}

fn log_transition(from: LinkState, to: LinkState) {
    match (from, to) {
        (LinkState::Connecting, LinkState::Connected) => {
            info!("Broker link established")
        }
        (LinkState::Connected, LinkState::Disconnected) => {
            warn!("Broker link lost")
        }
        (_, LinkState::Failed) => error!("Broker link failed permanently"),
        _ => info!(%from, %to, "Link state changed"),
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.attempt.take() {
            handle.abort();
        }
        self.drop_active_link();
    }
}
