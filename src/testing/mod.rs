//! Test doubles for the broker boundary
//!
//! Lets the realtime core run without a broker or a token endpoint.

pub mod mocks;

pub use mocks::*;
