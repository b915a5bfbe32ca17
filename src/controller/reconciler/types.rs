//! # Reconciler Types
//!
//! Shared context and error types for the instance and binding reconcilers.

use crate::config::SharedOperatorConfig;
use crate::constants::{DEFAULT_ERROR_BACKOFF_MAX_SECS, DEFAULT_ERROR_BACKOFF_MIN_SECS, MAX_POLL_INTERVAL_SECS};
use crate::controller::backoff::{FibonacciBackoff, PollBackoff};
use crate::controller::credentials::{CredentialsError, SecretSource};
use crate::controller::materializer::MaterializeError;
use crate::controller::parameters::ParametersError;
use crate::controller::reconciler::outcome::Next;
use crate::crd::OperationType;
use crate::provider::{ClientFactory, SmError};
use chrono::{DateTime, Utc};
use crate::observability::metrics;
use kube::runtime::controller::Action;
use kube::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error(transparent)]
    ServiceManager(#[from] SmError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Credentials(#[from] CredentialsError),

    #[error(transparent)]
    Parameters(#[from] ParametersError),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{operation} operation failed: {message}")]
    OperationFailed {
        operation: &'static str,
        message: String,
    },

    #[error("{0}")]
    Blocked(String),
}

impl ReconcilerError {
    pub fn operation_failed(operation: OperationType, message: impl Into<String>) -> Self {
        ReconcilerError::OperationFailed {
            operation: operation.as_str(),
            message: message.into(),
        }
    }

    /// Whether the same pass may succeed later without a spec change
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcilerError::ServiceManager(e) => e.is_transient(),
            ReconcilerError::Kube(_) | ReconcilerError::Blocked(_) => true,
            ReconcilerError::Credentials(e) => e.is_transient(),
            ReconcilerError::Parameters(e) => e.is_transient(),
            ReconcilerError::Materialize(_)
            | ReconcilerError::Serialization(_)
            | ReconcilerError::OperationFailed { .. } => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ReconcilerError::ServiceManager(e) if e.is_rate_limited())
    }

    /// Requeue delay requested by SM
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            ReconcilerError::ServiceManager(e) => e.retry_after(now),
            _ => None,
        }
    }

    /// Text written into status conditions
    pub fn user_message(&self) -> String {
        match self {
            ReconcilerError::ServiceManager(SmError::Api { description, .. }) if !description.is_empty() => {
                description.clone()
            }
            ReconcilerError::OperationFailed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Label value for the error metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcilerError::ServiceManager(_) => "service_manager",
            ReconcilerError::Kube(_) => "kubernetes",
            ReconcilerError::Credentials(_) => "credentials",
            ReconcilerError::Parameters(_) => "parameters",
            ReconcilerError::Materialize(_) => "materialize",
            ReconcilerError::Serialization(_) => "serialization",
            ReconcilerError::OperationFailed { .. } => "operation_failed",
            ReconcilerError::Blocked(_) => "blocked",
        }
    }
}

/// Backoff state for a specific resource
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self {
            backoff: FibonacciBackoff::new(DEFAULT_ERROR_BACKOFF_MIN_SECS, DEFAULT_ERROR_BACKOFF_MAX_SECS),
            error_count: 0,
        }
    }
}

impl BackoffState {
    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Poll progress of the operation a resource is waiting on
#[derive(Debug, Clone)]
struct PollState {
    operation_url: String,
    backoff: PollBackoff,
}

/// Shared reconciler context handed to both controllers
#[derive(Clone)]
pub struct Reconciler {
    pub client: Client,
    pub config: SharedOperatorConfig,
    pub clients: Arc<dyn ClientFactory>,
    pub secrets: Arc<dyn SecretSource>,
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
    poll_states: Arc<Mutex<HashMap<String, PollState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        client: Client,
        config: SharedOperatorConfig,
        clients: Arc<dyn ClientFactory>,
        secrets: Arc<dyn SecretSource>,
    ) -> Self {
        Self {
            client,
            config,
            clients,
            secrets,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
            poll_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Next error backoff for `key`, advancing its sequence
    pub fn next_error_backoff(&self, key: &str) -> (Duration, u32) {
        let Ok(mut states) = self.backoff_states.lock() else {
            return (Duration::from_secs(DEFAULT_ERROR_BACKOFF_MIN_SECS), 0);
        };
        let state = states.entry(key.to_string()).or_default();
        state.increment_error();
        (state.backoff.next_backoff(), state.error_count)
    }

    pub fn reset_error_backoff(&self, key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(key) {
                state.reset();
            }
        }
    }

    /// Delay before polling `operation_url` again
    pub fn next_poll_delay(&self, key: &str, operation_url: &str) -> Duration {
        let base = self.config.poll_interval;
        let max = Duration::from_secs(MAX_POLL_INTERVAL_SECS).max(base);
        let Ok(mut states) = self.poll_states.lock() else {
            return base;
        };
        let state = states.entry(key.to_string()).or_insert_with(|| PollState {
            operation_url: operation_url.to_string(),
            backoff: PollBackoff::new(base, max),
        });
        if state.operation_url != operation_url {
            *state = PollState {
                operation_url: operation_url.to_string(),
                backoff: PollBackoff::new(base, max),
            };
        }
        state.backoff.next_delay()
    }

    pub fn clear_poll(&self, key: &str) {
        if let Ok(mut states) = self.poll_states.lock() {
            states.remove(key);
        }
    }

    /// Controller action for the outcome of a pass
    pub fn action_for(&self, key: &str, operation_url: Option<&str>, next: Next) -> Action {
        match next {
            Next::Poll => {
                let delay = self.next_poll_delay(key, operation_url.unwrap_or_default());
                metrics::increment_requeues_total("operation-poll");
                Action::requeue(delay)
            }
            Next::Immediate => {
                self.clear_poll(key);
                Action::requeue(Duration::ZERO)
            }
            Next::After(delay) => {
                self.clear_poll(key);
                Action::requeue(delay)
            }
            Next::Done | Next::RemoveFinalizer => {
                self.reset_error_backoff(key);
                self.clear_poll(key);
                Action::await_change()
            }
        }
    }

    /// Drop all per-resource state once a resource is gone
    pub fn forget(&self, key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(key);
        }
        self.clear_poll(key);
    }
}

/// Key for per-resource state
pub fn resource_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{kind}/{namespace}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let rate_limited = ReconcilerError::from(SmError::api(429, "TooManyRequests", "slow down"));
        assert!(rate_limited.is_transient());
        assert!(rate_limited.is_rate_limited());

        let broker = ReconcilerError::operation_failed(OperationType::Create, "quota exceeded");
        assert!(!broker.is_transient());
        assert_eq!(broker.user_message(), "quota exceeded");
        assert_eq!(broker.to_string(), "CREATE operation failed: quota exceeded");

        let bad_request = ReconcilerError::from(SmError::api(400, "BadRequest", "plan not found"));
        assert!(!bad_request.is_transient());
        assert_eq!(bad_request.user_message(), "plan not found");

        let concurrent = ReconcilerError::from(SmError::api(
            422,
            crate::provider::error::CONCURRENT_OPERATION_IN_PROGRESS,
            "busy",
        ));
        assert!(concurrent.is_transient());
    }

    #[test]
    fn test_backoff_state_reset() {
        let mut state = BackoffState::default();
        state.increment_error();
        state.backoff.next_backoff_seconds();
        state.backoff.next_backoff_seconds();
        state.reset();
        assert_eq!(state.error_count, 0);
        assert_eq!(state.backoff.next_backoff_seconds(), 1);
    }
}
