//! Observability for the realtime layer
//!
//! Structured logging through `tracing` and per-session link metrics.

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{LinkMetrics, LinkMetricsSnapshot};

pub use logging::{channel_span, link_span};
