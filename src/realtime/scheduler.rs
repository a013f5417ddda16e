//! Cancellable, keyed timers
//!
//! Each timer is a spawned task that sleeps until its deadline and then
//! delivers a [`TimerFired`] back to the owner. Scheduling a key that is
//! already pending replaces the old timer. Every fire carries the id of the
//! timer that produced it, and [`Scheduler::fire`] only accepts the id that
//! is still current, so an expiry racing a reschedule is harmless.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::trace;

/// What a timer is for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Next connection-level retry
    Reconnect,
    /// Next subscription-level retry for a channel
    Resubscribe(String),
    /// Typing indicator TTL for one generation of a user's entry
    TypingExpiry { user_id: String, generation: u64 },
}

/// Delivered when a timer's deadline elapses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub key: TimerKey,
    pub id: u64,
}

struct ScheduledTimer {
    id: u64,
    deadline: Instant,
    handle: AbortHandle,
}

type Deliver = dyn Fn(TimerFired) + Send + Sync;

pub struct Scheduler {
    deliver: Arc<Deliver>,
    timers: HashMap<TimerKey, ScheduledTimer>,
    next_id: u64,
}

impl Scheduler {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(TimerFired) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
            timers: HashMap::new(),
            next_id: 0,
        }
    }

    /// Arm `key` to fire after `delay`, replacing any pending timer for it
    pub fn schedule(&mut self, key: TimerKey, delay: Duration) -> u64 {
        self.cancel(&key);

        self.next_id += 1;
        let id = self.next_id;
        let deadline = Instant::now() + delay;
        let fired = TimerFired {
            key: key.clone(),
            id,
        };
        let deliver = Arc::clone(&self.deliver);

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            deliver(fired);
        })
        .abort_handle();

        trace!(?key, id, delay_ms = delay.as_millis() as u64, "Timer scheduled");
        self.timers.insert(
            key,
            ScheduledTimer {
                id,
                deadline,
                handle,
            },
        );
        id
    }

    /// Accept a fired timer if it is still the current one for its key
    pub fn fire(&mut self, fired: TimerFired) -> Option<TimerKey> {
        match self.timers.get(&fired.key) {
            Some(timer) if timer.id == fired.id => {
                self.timers.remove(&fired.key);
                Some(fired.key)
            }
            _ => {
                trace!(key = ?fired.key, id = fired.id, "Ignoring stale timer");
                None
            }
        }
    }

    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.timers.remove(key) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }

    pub fn is_scheduled(&self, key: &TimerKey) -> bool {
        self.timers.contains_key(key)
    }

    pub fn deadline(&self, key: &TimerKey) -> Option<Instant> {
        self.timers.get(key).map(|timer| timer.deadline)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.timers.keys().collect::<Vec<_>>())
            .field("next_id", &self.next_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn scheduler() -> (Scheduler, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(move |fired| {
            let _ = tx.send(fired);
        });
        (scheduler, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (mut scheduler, mut rx) = scheduler();
        let start = Instant::now();

        let id = scheduler.schedule(TimerKey::Reconnect, Duration::from_millis(1500));
        let fired = rx.recv().await.unwrap();

        assert_eq!(fired.id, id);
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
        assert_eq!(scheduler.fire(fired), Some(TimerKey::Reconnect));
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending_timer() {
        let (mut scheduler, mut rx) = scheduler();
        let key = TimerKey::Resubscribe("chat-1".to_string());

        let first = scheduler.schedule(key.clone(), Duration::from_millis(100));
        let second = scheduler.schedule(key.clone(), Duration::from_millis(300));
        assert_ne!(first, second);
        assert_eq!(scheduler.len(), 1);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.id, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fire_is_ignored() {
        let (mut scheduler, _rx) = scheduler();
        let key = TimerKey::Resubscribe("chat-1".to_string());

        let stale = scheduler.schedule(key.clone(), Duration::from_millis(100));
        scheduler.schedule(key.clone(), Duration::from_millis(100));

        assert_eq!(scheduler.fire(TimerFired { key: key.clone(), id: stale }), None);
        assert!(scheduler.is_scheduled(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_prevents_delivery() {
        let (mut scheduler, mut rx) = scheduler();

        scheduler.schedule(TimerKey::Reconnect, Duration::from_millis(10));
        scheduler.schedule(
            TimerKey::TypingExpiry {
                user_id: "u1".to_string(),
                generation: 1,
            },
            Duration::from_millis(20),
        );
        scheduler.cancel_all();
        assert!(scheduler.is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_single_key() {
        let (mut scheduler, _rx) = scheduler();
        scheduler.schedule(TimerKey::Reconnect, Duration::from_secs(1));

        assert!(scheduler.deadline(&TimerKey::Reconnect).is_some());
        assert!(scheduler.cancel(&TimerKey::Reconnect));
        assert!(!scheduler.cancel(&TimerKey::Reconnect));
    }
}
