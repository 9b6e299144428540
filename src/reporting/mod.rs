//! # Reporting
//!
//! Metrics sinks injected into read and mutation paths.
//!
//! ## Modules
//!
//! - [`metrics`] - The [`MetricsSink`] trait and its stock implementations

pub mod metrics;

pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
