//! Centrifugo client protocol over WebSocket (JSON encoding)
//!
//! The module separates pure protocol handling from socket I/O:
//!
//! - [`frame_handler`] - Pure command encoding and frame routing
//! - [`link`] - Handshake, connector and the background link task
//!
//! # Usage
//!
//! ```rust,no_run
//! use dtalks_realtime::realtime::{Session, SessionConfig};
//! use dtalks_realtime::testing::MockTokenProvider;
//! use dtalks_realtime::transport::centrifugo::CentrifugoConnector;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let connector = CentrifugoConnector::new("desktop", Duration::from_secs(10));
//! let session = Session::spawn(
//!     SessionConfig::new("ws://localhost:9001/connection/websocket"),
//!     Arc::new(MockTokenProvider::new("jwt")),
//!     Arc::new(connector),
//! );
//! session.subscribe_chat("42")?;
//! # Ok::<(), dtalks_realtime::error::ChatError>(())
//! # });
//! ```

pub mod frame_handler;
pub mod link;

pub use frame_handler::{FrameHandler, FrameRoute, ReplyOutcome};
pub use link::{CentrifugoConnector, CentrifugoLink};
