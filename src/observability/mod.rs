//! Observability for the gateway
//!
//! Structured logging with span macros for the dispatch path, and an in-process
//! metrics collector exported over the `/metrics` endpoint.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, parse_level, LogFormat, LogSettings};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{adapter_span, dispatch_span, probe_span};
