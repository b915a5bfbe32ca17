//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `sm_operator_reconciliations_total{kind}` - Total number of reconciliations
//! - `sm_operator_reconciliation_errors_total{kind}` - Total number of reconciliation errors
//! - `sm_operator_reconciliation_duration_seconds{kind}` - Duration of reconciliation passes
//! - `sm_operator_sm_operations_total{operation}` - Service Manager calls by operation
//! - `sm_operator_sm_operation_errors_total{operation}` - Failed Service Manager calls by operation
//! - `sm_operator_requeues_total{reason}` - Requeues by reason
//! - `sm_operator_credential_rotations_total` - Completed binding credential rotations
//! - `sm_operator_secrets_written_total` - Credential secrets created or updated

use anyhow::Result;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "sm_operator_reconciliations_total",
            "Total number of reconciliations",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "sm_operator_reconciliation_errors_total",
            "Total number of reconciliation errors",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "sm_operator_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static SM_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "sm_operator_sm_operations_total",
            "Total number of Service Manager operations by operation",
        ),
        &["operation"],
    )
    .expect("Failed to create SM_OPERATIONS_TOTAL metric - this should never happen")
});

static SM_OPERATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "sm_operator_sm_operation_errors_total",
            "Total number of failed Service Manager operations by operation",
        ),
        &["operation"],
    )
    .expect("Failed to create SM_OPERATION_ERRORS_TOTAL metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("sm_operator_requeues_total", "Total number of requeues by reason"),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static CREDENTIAL_ROTATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "sm_operator_credential_rotations_total",
        "Total number of completed binding credential rotations",
    )
    .expect("Failed to create CREDENTIAL_ROTATIONS_TOTAL metric - this should never happen")
});

static SECRETS_WRITTEN_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "sm_operator_secrets_written_total",
        "Total number of credential secrets created or updated",
    )
    .expect("Failed to create SECRETS_WRITTEN_TOTAL metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(SM_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SM_OPERATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CREDENTIAL_ROTATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SECRETS_WRITTEN_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_reconciliations(kind: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_reconciliation_errors(kind: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_reconciliation_duration(kind: &str, duration: f64) {
    RECONCILIATION_DURATION
        .with_label_values(&[kind])
        .observe(duration);
}

pub fn increment_sm_operations(operation: &str) {
    SM_OPERATIONS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn increment_sm_operation_errors(operation: &str) {
    SM_OPERATION_ERRORS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn increment_credential_rotations() {
    CREDENTIAL_ROTATIONS_TOTAL.inc();
}

pub fn increment_secrets_written() {
    SECRETS_WRITTEN_TOTAL.inc();
}
