//! # Pass Outcomes
//!
//! What a reconcile pass decided, and the error handling shared by both kinds.

use crate::constants::{
    ANNOTATION_IGNORE_NON_TRANSIENT_ERROR, ANNOTATION_IGNORE_NON_TRANSIENT_ERROR_TIMESTAMP,
};
use crate::controller::conditions::{self, ConditionedStatus};
use crate::controller::reconciler::types::ReconcilerError;
use crate::crd::{OperationType, ServiceBindingStatus, ServiceInstanceStatus};
use crate::provider::{Operation, ServiceManagerClient, SmError};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// How the controller should continue after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Nothing left to do until the resource changes
    Done,
    /// An SM operation is in flight
    Poll,
    /// Run again right away
    Immediate,
    /// Run again after a fixed delay
    After(Duration),
    /// Remote cleanup finished; the finalizer can go
    RemoveFinalizer,
}

/// Per-pass inputs that do not come from the resource
#[derive(Debug, Clone)]
pub struct PassContext {
    pub cluster_id: String,
    pub ignore_non_transient_timeout: Duration,
    pub max_secret_bytes: usize,
    pub now: DateTime<Utc>,
}

/// Status types that track an in-flight SM operation
pub trait OperationTracking: ConditionedStatus {
    fn operation_url(&self) -> Option<&str>;
    fn operation_type(&self) -> Option<OperationType>;
    fn start_operation(&mut self, url: String, operation: OperationType);
    fn clear_operation(&mut self);
}

macro_rules! impl_operation_tracking {
    ($status:ty) => {
        impl OperationTracking for $status {
            fn operation_url(&self) -> Option<&str> {
                self.operation_url.as_deref().filter(|url| !url.is_empty())
            }

            fn operation_type(&self) -> Option<OperationType> {
                self.operation_type
            }

            fn start_operation(&mut self, url: String, operation: OperationType) {
                self.operation_url = Some(url);
                self.operation_type = Some(operation);
            }

            fn clear_operation(&mut self) {
                self.operation_url = None;
            }
        }
    };
}

impl_operation_tracking!(ServiceInstanceStatus);
impl_operation_tracking!(ServiceBindingStatus);

/// Whether `ignore-non-transient-error` still downgrades failures
pub fn ignore_window_open(
    annotations: &BTreeMap<String, String>,
    timeout: Duration,
    now: DateTime<Utc>,
) -> bool {
    if !annotations.contains_key(ANNOTATION_IGNORE_NON_TRANSIENT_ERROR) {
        return false;
    }
    let Some(stamp) = annotations.get(ANNOTATION_IGNORE_NON_TRANSIENT_ERROR_TIMESTAMP) else {
        return false;
    };
    match DateTime::parse_from_rfc3339(stamp) {
        Ok(since) => {
            let elapsed = now.signed_duration_since(since.with_timezone(&Utc));
            elapsed.to_std().map(|e| e < timeout).unwrap_or(true)
        }
        Err(e) => {
            warn!(timestamp = %stamp, error = %e, "Ignoring malformed ignore-non-transient-error timestamp");
            false
        }
    }
}

/// Record a failed attempt on the status and decide how to continue
///
/// Rate limiting leaves conditions untouched. Transient errors, and any error while
/// the ignore window is open, keep the operation in progress and go to the error
/// policy. Everything else is terminal for this generation.
pub fn apply_error<S: OperationTracking>(
    status: &mut S,
    operation: OperationType,
    error: ReconcilerError,
    ignore_window: bool,
    generation: i64,
    now: DateTime<Utc>,
) -> Result<Next, ReconcilerError> {
    if error.is_rate_limited() {
        debug!(error = %error, "Service Manager rate limit hit");
        return Err(error);
    }

    if error.is_transient() || ignore_window {
        conditions::set_in_progress(status, operation, error.user_message(), now);
        return Err(error);
    }

    status.clear_operation();
    conditions::set_failure(status, operation, error.user_message(), generation, now);
    Ok(Next::Done)
}

/// Poll an operation, mapping 404 to `None`
pub async fn poll_operation(
    sm: &dyn ServiceManagerClient,
    operation_url: &str,
) -> Result<Option<Operation>, SmError> {
    match sm.status(operation_url).await {
        Ok(operation) => Ok(Some(operation)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// The `Succeeded` condition failed for this very generation and nothing is in flight
pub fn failed_for_generation<S: OperationTracking>(status: &S, generation: i64) -> bool {
    status.operation_url().is_none()
        && conditions::is_condition_true(status.conditions(), conditions::CONDITION_FAILED)
        && conditions::find_condition(status.conditions(), conditions::CONDITION_FAILED)
            .and_then(|c| c.observed_generation)
            == Some(generation)
}
