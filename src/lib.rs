//! SM Service Operator Library
//!
//! Core functionality of the Service Manager operator: CRD types, the instance
//! and binding reconcilers, the Service Manager client, admission webhooks and the
//! operator runtime.

pub mod admission;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod provider;
pub mod runtime;
