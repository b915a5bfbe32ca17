//! # Custom Resource Definitions
//!
//! CRD types for the Service Manager operator.
//!
//! ## Module Structure
//!
//! - `instance.rs` - ServiceInstance spec and status
//! - `binding.rs` - ServiceBinding spec, status and rotation policy
//! - `common.rs` - Conditions, user info, parameter sources

mod binding;
mod common;
mod instance;

pub use binding::{CredentialsRotationPolicy, ServiceBinding, ServiceBindingSpec, ServiceBindingStatus};
pub use common::{
    preserve_unknown_fields, Condition, CredentialSecretRef, OperationType, ParametersFromSource,
    SecretKeyReference, UserInfo,
};
pub use instance::{ServiceInstance, ServiceInstanceSpec, ServiceInstanceStatus};
