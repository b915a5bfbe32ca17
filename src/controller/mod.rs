//! # Controller
//!
//! Core controller modules for the Service Manager operator.
//!
//! - `backoff`: Fibonacci error backoff and operation poll backoff
//! - `conditions`: status condition machinery shared by both kinds
//! - `credentials`: SM credential resolution from cluster secrets
//! - `duration`: Kubernetes-style duration parsing
//! - `materializer`: credentials secret shaping and templating
//! - `parameters`: SM parameter assembly from inline values and secrets
//! - `reconciler`: instance and binding reconciliation
//! - `secret_watch`: watch annotations on parameter secrets
//! - `server`: HTTP server for metrics and health checks

pub mod backoff;
pub mod conditions;
pub mod credentials;
pub mod duration;
pub mod materializer;
pub mod parameters;
pub mod reconciler;
pub mod secret_watch;
pub mod server;
