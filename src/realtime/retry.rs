//! Capped exponential backoff
//!
//! `delay(n) = min(base * 2^(n-1), cap)` for attempt `n >= 1`. The policy is
//! stateless; callers own the attempt counter and ask the policy whether the
//! next attempt may proceed.

use crate::config::RetryPolicyConfig;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

/// Outcome of asking the policy for the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run attempt number `attempt` after `delay`
    Proceed { attempt: u32, delay: Duration },
    /// Every allowed attempt has been used
    AbortMaxAttemptsExceeded,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// 1s doubling to a 30s cap, 5 attempts
    pub fn connection() -> Self {
        RetryPolicyConfig::connection().into()
    }

    /// 1s doubling to a 10s cap, 3 attempts
    pub fn subscription() -> Self {
        RetryPolicyConfig::subscription().into()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Decide on the attempt following `previous_attempts` completed ones
    pub fn next(&self, previous_attempts: u32) -> RetryDecision {
        let attempt = previous_attempts.saturating_add(1);
        if attempt > self.max_attempts {
            return RetryDecision::AbortMaxAttemptsExceeded;
        }
        RetryDecision::Proceed {
            attempt,
            delay: self.delay_for(attempt),
        }
    }

    /// Every delay the policy will ever produce, in order
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts).map(|n| self.delay_for(n)).collect()
    }
}

impl From<RetryPolicyConfig> for RetryPolicy {
    fn from(config: RetryPolicyConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }
}

/// Reconnection progress owned by the connection manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryState {
    /// Scheduled retries since the last successful connect
    pub attempt: u32,
    /// Delay of the most recently scheduled retry
    pub next_delay_ms: Option<u64>,
    pub max_attempts: u32,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            next_delay_ms: None,
            max_attempts: policy.max_attempts(),
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay_ms = None;
    }

    pub fn record(&mut self, attempt: u32, delay: Duration) {
        self.attempt = attempt;
        self.next_delay_ms = Some(delay.as_millis() as u64);
    }
}
