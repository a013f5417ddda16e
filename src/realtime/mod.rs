//! Connection and subscription resilience for the realtime channel
//!
//! The pieces split into pure state machines and one owner that drives them:
//!
//! - [`retry`] - Backoff policy shared by both recovery loops
//! - [`scheduler`] - Keyed, cancellable timers
//! - [`connection_manager`] - Link lifecycle and connection-level retries
//! - [`registry`] - Desired subscriptions and their status
//! - [`subscription_retry`] - Per-channel retries while the link stays up
//! - [`router`] - Classification of inbound publications
//! - [`inbox`], [`presence`], [`typing`] - Derived chat state
//! - [`session`] - The event loop owning all of the above

pub mod connection_manager;
pub mod inbox;
pub mod presence;
pub mod registry;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod subscription_retry;
pub mod typing;

pub use connection_manager::{ConnectionOutcome, LinkState};
pub use inbox::MessageInbox;
pub use presence::PresenceTracker;
pub use registry::{ChannelSubscription, SubscribeOutcome, SubscriptionRegistry, SubscriptionStatus};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use router::{EventRoute, EventRouter};
pub use scheduler::{Scheduler, TimerFired, TimerKey};
pub use session::{Session, SessionConfig, SessionEvent, SessionHandle, SessionSnapshot};
pub use subscription_retry::{SubscriptionRetryOutcome, SubscriptionRetryState, SubscriptionRetrySupervisor};
pub use typing::{TypingChange, TypingEntry, TypingTracker};
