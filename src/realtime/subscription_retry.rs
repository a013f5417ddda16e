//! Per-channel subscription retries
//!
//! Independent of connection-level recovery: a subscription that fails while
//! the link is up is retried here with its own, shorter backoff. When a retry
//! comes due and the link is down, the channel is handed back to the pending
//! set and connection recovery takes over.

use super::retry::{RetryDecision, RetryPolicy};
use super::scheduler::{Scheduler, TimerKey};
use crate::protocol::ChannelName;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRetryState {
    pub channel: ChannelName,
    pub attempt: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionRetryOutcome {
    Scheduled { attempt: u32, delay: Duration },
    /// No automatic retries left; the channel stays in `Error`
    Exhausted { attempts: u32 },
}

#[derive(Debug)]
pub struct SubscriptionRetrySupervisor {
    policy: RetryPolicy,
    states: HashMap<ChannelName, SubscriptionRetryState>,
}

impl SubscriptionRetrySupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            states: HashMap::new(),
        }
    }

    /// Schedule the next retry for `channel` after a failure
    pub fn schedule_retry(
        &mut self,
        channel: &ChannelName,
        scheduler: &mut Scheduler,
    ) -> SubscriptionRetryOutcome {
        let previous = self.attempt(channel.as_str()).unwrap_or(0);

        match self.policy.next(previous) {
            RetryDecision::Proceed { attempt, delay } => {
                self.states.insert(
                    channel.clone(),
                    SubscriptionRetryState {
                        channel: channel.clone(),
                        attempt,
                        max_attempts: self.policy.max_attempts(),
                    },
                );
                scheduler.schedule(TimerKey::Resubscribe(channel.to_string()), delay);
                warn!(
                    %channel,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Subscription retry scheduled"
                );
                SubscriptionRetryOutcome::Scheduled { attempt, delay }
            }
            RetryDecision::AbortMaxAttemptsExceeded => {
                self.discard(channel.as_str(), scheduler);
                error!(%channel, attempts = previous, "Subscription retries exhausted");
                SubscriptionRetryOutcome::Exhausted { attempts: previous }
            }
        }
    }

    /// Whether a retry for `channel` is still owned by the supervisor
    pub fn is_tracking(&self, channel: &str) -> bool {
        self.states.contains_key(channel)
    }

    pub fn attempt(&self, channel: &str) -> Option<u32> {
        self.states.get(channel).map(|state| state.attempt)
    }

    /// Forget `channel` and cancel its timer
    pub fn discard(&mut self, channel: &str, scheduler: &mut Scheduler) -> bool {
        scheduler.cancel(&TimerKey::Resubscribe(channel.to_string()));
        self.states.remove(channel).is_some()
    }

    pub fn teardown(&mut self, scheduler: &mut Scheduler) {
        for channel in self.states.keys() {
            scheduler.cancel(&TimerKey::Resubscribe(channel.to_string()));
        }
        self.states.clear();
    }

    pub fn states(&self) -> Vec<SubscriptionRetryState> {
        let mut states: Vec<_> = self.states.values().cloned().collect();
        states.sort_by(|a, b| a.channel.cmp(&b.channel));
        states
    }
}
