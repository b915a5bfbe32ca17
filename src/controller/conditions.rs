//! # Conditions
//!
//! Status condition machinery shared by instances and bindings.
//!
//! - `Succeeded` reflects the last terminal operation, or the one in flight
//! - `Failed` exists only while the last attempt is considered failed
//! - `Ready` reflects usability
//! - `Shared` and `CredRotationInProgress` are kind-specific overlays

use crate::crd::{Condition, OperationType, ServiceBindingStatus, ServiceInstanceStatus};
use chrono::{DateTime, SecondsFormat, Utc};

pub const CONDITION_SUCCEEDED: &str = "Succeeded";
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_FAILED: &str = "Failed";
pub const CONDITION_SHARED: &str = "Shared";
pub const CONDITION_CRED_ROTATION_IN_PROGRESS: &str = "CredRotationInProgress";

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";

pub const REASON_PROVISIONED: &str = "Provisioned";
pub const REASON_NOT_PROVISIONED: &str = "NotProvisioned";
pub const REASON_BLOCKED: &str = "Blocked";
pub const REASON_UNKNOWN: &str = "Unknown";
pub const REASON_FINISHED: &str = "Finished";
pub const REASON_SHARE_SUCCEEDED: &str = "ShareSucceeded";
pub const REASON_UNSHARE_SUCCEEDED: &str = "UnShareSucceeded";
pub const REASON_SHARE_FAILED: &str = "ShareFailed";
pub const REASON_UNSHARE_FAILED: &str = "UnShareFailed";
pub const REASON_SHARE_NOT_SUPPORTED: &str = "ShareNotSupported";
pub const REASON_ROTATION_PREPARING: &str = "Preparing";
pub const REASON_ROTATION_ROTATING: &str = "Rotating";

/// Progress of an operation, used to pick a condition reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    InProgress,
    Succeeded,
    Failed,
}

/// `Succeeded` reason for an operation in a given state
#[must_use]
pub fn reason_for(operation: OperationType, progress: Progress) -> &'static str {
    match (operation, progress) {
        (OperationType::Create, Progress::InProgress) => "CreateInProgress",
        (OperationType::Create, Progress::Succeeded) => "Created",
        (OperationType::Create, Progress::Failed) => "CreateFailed",
        (OperationType::Update, Progress::InProgress) => "UpdateInProgress",
        (OperationType::Update, Progress::Succeeded) => "Updated",
        (OperationType::Update, Progress::Failed) => "UpdateFailed",
        (OperationType::Delete, Progress::InProgress) => "DeleteInProgress",
        (OperationType::Delete, Progress::Succeeded) => "Deleted",
        (OperationType::Delete, Progress::Failed) => "DeleteFailed",
    }
}

/// True for the three `*InProgress` reasons
pub fn is_in_progress_reason(reason: &str) -> bool {
    matches!(reason, "CreateInProgress" | "UpdateInProgress" | "DeleteInProgress")
}

/// Status types that carry the common condition fields
pub trait ConditionedStatus {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn ready(&self) -> Option<&str>;
    fn set_ready(&mut self, ready: &str);
    fn observed_generation(&self) -> Option<i64>;
    fn set_observed_generation(&mut self, generation: i64);
}

macro_rules! impl_conditioned_status {
    ($status:ty) => {
        impl ConditionedStatus for $status {
            fn conditions(&self) -> &[Condition] {
                &self.conditions
            }
            fn conditions_mut(&mut self) -> &mut Vec<Condition> {
                &mut self.conditions
            }
            fn ready(&self) -> Option<&str> {
                self.ready.as_deref()
            }
            fn set_ready(&mut self, ready: &str) {
                self.ready = Some(ready.to_string());
            }
            fn observed_generation(&self) -> Option<i64> {
                self.observed_generation
            }
            fn set_observed_generation(&mut self, generation: i64) {
                self.observed_generation = Some(generation);
            }
        }
    };
}

impl_conditioned_status!(ServiceInstanceStatus);
impl_conditioned_status!(ServiceBindingStatus);

fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_condition(conditions, condition_type).is_some_and(|c| c.status == STATUS_TRUE)
}

/// Insert or replace a condition, keeping the transition time when the status is unchanged
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition, now: DateTime<Utc>) {
    match conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.clone()
            } else {
                Some(timestamp(now))
            };
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(timestamp(now));
            conditions.push(condition);
        }
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, condition_type: &str) {
    conditions.retain(|c| c.r#type != condition_type);
}

fn condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: impl Into<String>,
    generation: i64,
) -> Condition {
    Condition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        observed_generation: Some(generation),
        last_transition_time: None,
        reason: Some(reason.to_string()),
        message: Some(message.into()),
    }
}

/// Drop the `Failed` condition at the start of a new attempt
pub fn begin_attempt<S: ConditionedStatus>(status: &mut S) {
    remove_condition(status.conditions_mut(), CONDITION_FAILED);
}

/// An operation is running; observers keep seeing the last terminal generation
pub fn set_in_progress<S: ConditionedStatus>(
    status: &mut S,
    operation: OperationType,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    let generation = status.observed_generation().unwrap_or(0);
    let message = message.into();
    let conditions = status.conditions_mut();
    set_condition(
        conditions,
        condition(
            CONDITION_SUCCEEDED,
            STATUS_FALSE,
            reason_for(operation, Progress::InProgress),
            message.clone(),
            generation,
        ),
        now,
    );
    if !is_condition_true(conditions, CONDITION_READY) {
        set_condition(
            conditions,
            condition(CONDITION_READY, STATUS_FALSE, REASON_NOT_PROVISIONED, message, generation),
            now,
        );
        status.set_ready(STATUS_FALSE);
    }
}

/// The operation for `generation` finished successfully
pub fn set_success<S: ConditionedStatus>(
    status: &mut S,
    operation: OperationType,
    message: impl Into<String>,
    generation: i64,
    now: DateTime<Utc>,
) {
    let message = message.into();
    status.set_observed_generation(generation);
    let conditions = status.conditions_mut();
    remove_condition(conditions, CONDITION_FAILED);
    set_condition(
        conditions,
        condition(
            CONDITION_SUCCEEDED,
            STATUS_TRUE,
            reason_for(operation, Progress::Succeeded),
            message.clone(),
            generation,
        ),
        now,
    );
    if operation == OperationType::Delete {
        set_condition(
            conditions,
            condition(CONDITION_READY, STATUS_FALSE, REASON_NOT_PROVISIONED, message, generation),
            now,
        );
        status.set_ready(STATUS_FALSE);
    } else {
        set_condition(
            conditions,
            condition(CONDITION_READY, STATUS_TRUE, REASON_PROVISIONED, message, generation),
            now,
        );
        status.set_ready(STATUS_TRUE);
    }
}

/// Refresh the success conditions for `generation` when nothing needed doing
pub fn set_finished<S: ConditionedStatus>(status: &mut S, generation: i64, now: DateTime<Utc>) {
    let reason = find_condition(status.conditions(), CONDITION_SUCCEEDED)
        .filter(|c| c.status == STATUS_TRUE)
        .and_then(|c| c.reason.clone())
        .unwrap_or_else(|| REASON_FINISHED.to_string());
    let message = find_condition(status.conditions(), CONDITION_SUCCEEDED)
        .and_then(|c| c.message.clone())
        .unwrap_or_default();
    status.set_observed_generation(generation);
    let conditions = status.conditions_mut();
    remove_condition(conditions, CONDITION_FAILED);
    set_condition(
        conditions,
        condition(CONDITION_SUCCEEDED, STATUS_TRUE, &reason, message.clone(), generation),
        now,
    );
    set_condition(
        conditions,
        condition(CONDITION_READY, STATUS_TRUE, REASON_PROVISIONED, message, generation),
        now,
    );
    status.set_ready(STATUS_TRUE);
}

/// The operation for `generation` failed terminally
pub fn set_failure<S: ConditionedStatus>(
    status: &mut S,
    operation: OperationType,
    message: impl Into<String>,
    generation: i64,
    now: DateTime<Utc>,
) {
    let message = message.into();
    let reason = reason_for(operation, Progress::Failed);
    status.set_observed_generation(generation);
    let conditions = status.conditions_mut();
    set_condition(
        conditions,
        condition(CONDITION_SUCCEEDED, STATUS_FALSE, reason, message.clone(), generation),
        now,
    );
    set_condition(
        conditions,
        condition(CONDITION_FAILED, STATUS_TRUE, reason, message.clone(), generation),
        now,
    );
    if !is_condition_true(conditions, CONDITION_READY) {
        set_condition(
            conditions,
            condition(CONDITION_READY, STATUS_FALSE, REASON_NOT_PROVISIONED, message, generation),
            now,
        );
        status.set_ready(STATUS_FALSE);
    }
}

/// Waiting on something outside the resource (instance not ready, invalid credentials)
pub fn set_blocked<S: ConditionedStatus>(
    status: &mut S,
    message: impl Into<String>,
    generation: i64,
    now: DateTime<Utc>,
) {
    let message = message.into();
    status.set_observed_generation(generation);
    let conditions = status.conditions_mut();
    set_condition(
        conditions,
        condition(CONDITION_SUCCEEDED, STATUS_FALSE, REASON_BLOCKED, message.clone(), generation),
        now,
    );
    if !is_condition_true(conditions, CONDITION_READY) {
        set_condition(
            conditions,
            condition(CONDITION_READY, STATUS_FALSE, REASON_NOT_PROVISIONED, message, generation),
            now,
        );
        status.set_ready(STATUS_FALSE);
    }
}

/// Mark the resource unusable, leaving `Succeeded` as it is
pub fn set_not_ready<S: ConditionedStatus>(status: &mut S, message: impl Into<String>, now: DateTime<Utc>) {
    let generation = status.observed_generation().unwrap_or(0);
    set_condition(
        status.conditions_mut(),
        condition(CONDITION_READY, STATUS_FALSE, REASON_NOT_PROVISIONED, message, generation),
        now,
    );
    status.set_ready(STATUS_FALSE);
}

/// Record the remote sharing state
pub fn set_shared(
    conditions: &mut Vec<Condition>,
    shared: bool,
    reason: &str,
    message: impl Into<String>,
    generation: i64,
    now: DateTime<Utc>,
) {
    let status = if shared { STATUS_TRUE } else { STATUS_FALSE };
    set_condition(
        conditions,
        condition(CONDITION_SHARED, status, reason, message, generation),
        now,
    );
}

/// Current rotation phase recorded on a binding
pub fn rotation_phase(conditions: &[Condition]) -> Option<&str> {
    find_condition(conditions, CONDITION_CRED_ROTATION_IN_PROGRESS)
        .filter(|c| c.status == STATUS_TRUE)
        .and_then(|c| c.reason.as_deref())
}

pub fn set_rotation_phase(
    conditions: &mut Vec<Condition>,
    reason: &str,
    generation: i64,
    now: DateTime<Utc>,
) {
    set_condition(
        conditions,
        condition(
            CONDITION_CRED_ROTATION_IN_PROGRESS,
            STATUS_TRUE,
            reason,
            "",
            generation,
        ),
        now,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn succeeded(status: &ServiceInstanceStatus) -> &Condition {
        find_condition(&status.conditions, CONDITION_SUCCEEDED).unwrap()
    }

    #[test]
    fn test_in_progress_keeps_last_terminal_generation() {
        let mut status = ServiceInstanceStatus::default();
        set_success(&mut status, OperationType::Create, "created", 1, now());
        set_in_progress(&mut status, OperationType::Update, "updating", now());

        let cond = succeeded(&status);
        assert_eq!(cond.reason.as_deref(), Some("UpdateInProgress"));
        assert_eq!(cond.observed_generation, Some(1));
        // An update does not make a provisioned instance unusable
        assert_eq!(status.ready.as_deref(), Some("True"));
    }

    #[test]
    fn test_failure_then_new_attempt_clears_failed() {
        let mut status = ServiceInstanceStatus::default();
        set_failure(&mut status, OperationType::Create, "boom", 2, now());
        assert!(is_condition_true(&status.conditions, CONDITION_FAILED));
        assert_eq!(succeeded(&status).reason.as_deref(), Some("CreateFailed"));
        assert_eq!(status.ready.as_deref(), Some("False"));

        begin_attempt(&mut status);
        assert!(find_condition(&status.conditions, CONDITION_FAILED).is_none());
    }

    #[test]
    fn test_transition_time_only_moves_on_status_change() {
        let mut conditions = Vec::new();
        let later = now() + chrono::Duration::minutes(5);
        set_condition(&mut conditions, condition(CONDITION_READY, STATUS_FALSE, "A", "", 1), now());
        set_condition(&mut conditions, condition(CONDITION_READY, STATUS_FALSE, "B", "", 1), later);
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2025-01-01T00:00:00Z")
        );
        set_condition(&mut conditions, condition(CONDITION_READY, STATUS_TRUE, "C", "", 1), later);
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2025-01-01T00:05:00Z")
        );
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_delete_success_marks_not_ready() {
        let mut status = ServiceBindingStatus::default();
        set_success(&mut status, OperationType::Create, "", 1, now());
        set_success(&mut status, OperationType::Delete, "", 1, now());
        assert_eq!(status.ready.as_deref(), Some("False"));
        assert_eq!(
            find_condition(&status.conditions, CONDITION_SUCCEEDED)
                .and_then(|c| c.reason.as_deref()),
            Some("Deleted")
        );
    }

    #[test]
    fn test_rotation_phase_roundtrip() {
        let mut conditions = Vec::new();
        assert_eq!(rotation_phase(&conditions), None);
        set_rotation_phase(&mut conditions, REASON_ROTATION_PREPARING, 1, now());
        assert_eq!(rotation_phase(&conditions), Some(REASON_ROTATION_PREPARING));
        remove_condition(&mut conditions, CONDITION_CRED_ROTATION_IN_PROGRESS);
        assert_eq!(rotation_phase(&conditions), None);
    }
}
