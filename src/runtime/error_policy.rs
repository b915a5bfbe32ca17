//! # Error Policy
//!
//! Requeue decisions for failed reconciliations and logging of controller
//! stream errors.

use crate::controller::reconciler::types::resource_key;
use crate::controller::reconciler::{Reconciler, ReconcilerError};
use crate::observability::metrics;
use chrono::Utc;
use kube::runtime::controller::{self, Action};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Requeue a failed resource
///
/// Rate-limited SM responses honour `Retry-After`; everything else follows the
/// per-resource Fibonacci backoff, which resets after the next clean pass.
pub fn handle_reconciliation_error<K>(obj: Arc<K>, error: &ReconcilerError, ctx: Arc<Reconciler>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let kind = K::kind(&());
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.kind = %kind,
        resource.name = %name,
        resource.namespace = %namespace,
        error.kind = error.kind(),
    );
    let _error_guard = error_span.enter();

    metrics::increment_reconciliation_errors(&kind);

    if let Some(delay) = error.retry_after(Utc::now()) {
        warn!(retry_after_secs = delay.as_secs(), "Service Manager rate limited the request: {}", error);
        metrics::increment_requeues_total("rate-limited");
        return Action::requeue(delay);
    }

    let (delay, error_count) = ctx.next_error_backoff(&resource_key(&kind, &namespace, &name));
    error!("Reconciliation error for {}/{}: {}", namespace, name, error);
    info!(
        "Retrying with Fibonacci backoff: {}s (error count: {}, trigger source: error-backoff)",
        delay.as_secs(),
        error_count
    );

    metrics::increment_requeues_total("error-backoff");
    Action::requeue(delay)
}

/// Log an error surfaced by a controller stream
///
/// Reconciler errors were already handled by [`handle_reconciliation_error`];
/// watch errors are retried by the watcher's own backoff.
pub fn log_controller_error(kind: &str, error: &controller::Error<ReconcilerError, watcher::Error>) {
    match error {
        controller::Error::ReconcilerFailed(_, obj_ref) => {
            debug!(resource.kind = kind, object = %obj_ref, "reconciliation.failed");
        }
        controller::Error::ObjectNotFound(obj_ref) => {
            debug!(resource.kind = kind, object = %obj_ref, "Object vanished before reconciliation");
        }
        controller::Error::QueueError(e) => {
            warn!(resource.kind = kind, error = %e, "Watch stream error");
        }
        other => {
            error!(resource.kind = kind, error = %other, "Controller stream error");
        }
    }
}
