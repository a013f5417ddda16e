//! DTalks realtime - resilient realtime channel layer for chat clients
//!
//! Keeps a logged-in client connected to the push-messaging broker and
//! subscribed to its chat channels across network failures, and turns the
//! publications it receives into inbox messages, typing indicators and
//! presence changes.
//!
//! # Overview
//!
//! - [`realtime`] - Retry policy, timers, connection manager, subscription
//!   registry and retry supervisor, event routing, and the session loop
//! - [`transport`] - Broker boundary traits and the Centrifugo WebSocket link
//! - [`api`] - REST collaborator for tokens, sends and history
//! - [`client`] - Facade wiring everything together for one user
//! - [`protocol`] - Wire types and channel naming
//!
//! # Quick Start
//!
//! ```rust
//! use dtalks_realtime::realtime::{LinkState, Session, SessionConfig};
//! use dtalks_realtime::testing::{MockConnector, MockTokenProvider};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let session = Session::spawn(
//!     SessionConfig::new("ws://localhost:9001/connection/websocket"),
//!     Arc::new(MockTokenProvider::new("jwt")),
//!     Arc::new(MockConnector::new()),
//! );
//!
//! // Subscribing before the link is up queues the channel and connects
//! let channel = session.subscribe_chat("42").unwrap();
//! session.wait_for_state(LinkState::Connected).await.unwrap();
//! assert_eq!(channel.as_str(), "chat-42");
//! # });
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod realtime;
pub mod testing;
pub mod transport;

pub use client::ChatClient;
pub use config::{ClientConfig, ConfigError};
pub use error::{ChatError, ChatResult};
pub use realtime::{LinkState, Session, SessionConfig, SessionEvent, SessionHandle};
