//! Wire types and channel naming for the DTalks realtime layer
//!
//! Inbound event payloads, outbound REST bodies and the broker channel naming
//! convention.

pub mod channels;
pub mod messages;

pub use channels::*;
pub use messages::*;
