//! # Observability
//!
//! Prometheus metrics collection. Tracing is set up during runtime initialization.

pub mod metrics;
