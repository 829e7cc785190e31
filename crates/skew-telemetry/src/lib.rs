//! Prometheus metrics and structured logging for the skew engine.
//!
//! - Structured logging with tracing (JSON in production, pretty otherwise)
//! - Prometheus counters and gauges for reconciliation, fills and recovery
//! - `PrometheusSink`, the `MetricsSink` the bot hands to each engine

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::{Metrics, PrometheusSink};
