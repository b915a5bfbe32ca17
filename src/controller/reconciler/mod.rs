//! # Reconciler
//!
//! Reconciliation of `ServiceInstance` and `ServiceBinding` resources against the
//! Service Manager.
//!
//! Both reconcilers follow the same shape:
//! - a pure-ish engine (`drive_*`) that only talks to SM and mutates a status copy
//! - a shell (`reconcile_*`) that reads Kubernetes state, runs the engine, and
//!   writes status, finalizers, secrets and annotations
//!
//! ## Modules
//!
//! - `instance`: ServiceInstance state machine
//! - `binding`: ServiceBinding state machine and credentials secret
//! - `rotation`: two-phase credential rotation and stale binding helpers
//! - `outcome`: pass outcomes and shared error application
//! - `status`: status merge patches, finalizers, annotations
//! - `types`: reconciler context and error type

pub mod binding;
pub mod instance;
pub mod outcome;
pub mod rotation;
pub mod status;
pub mod types;

pub use binding::{drive_binding, drive_binding_deletion, reconcile_binding, BindingPass};
pub use instance::{drive_instance, drive_instance_deletion, reconcile_instance};
pub use outcome::{Next, PassContext};
pub use types::{BackoffState, Reconciler, ReconcilerError};
