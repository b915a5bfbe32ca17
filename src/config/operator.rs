//! # Operator Configuration
//!
//! Operator-level settings loaded from environment variables.

use crate::constants::*;
use crate::controller::duration::parse_kubernetes_duration;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Operator-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Loaded once at startup and shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace holding namespaced and cluster-default SM credential secrets
    pub management_namespace: String,
    /// Namespace the operator is deployed into
    pub release_namespace: String,
    /// Allow a `sap-btp-service-operator` secret in the resource namespace
    pub enable_namespace_secrets: bool,
    /// Only cache labelled secrets and read the rest directly
    pub enable_limited_cache: bool,
    /// Window during which `ignoreNonTransientError` downgrades failures
    pub ignore_non_transient_timeout: Duration,
    /// Base delay for polling async SM operations
    pub poll_interval: Duration,
    /// Byte budget for rendered credential secrets
    pub max_secret_bytes: usize,
    /// Value of the `_clusterid` correlation label
    pub cluster_id: String,
    /// Port serving `/metrics`, `/healthz` and `/readyz`
    pub metrics_port: u16,
    /// HTTPS port of the admission webhook
    pub webhook_port: u16,
    /// Directory holding the webhook `tls.crt` and `tls.key`
    pub webhook_cert_dir: PathBuf,
    /// Bounded worker pool per kind
    pub max_concurrent_reconciles: u16,
    /// Graceful shutdown budget
    pub shutdown_timeout: Duration,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            management_namespace: DEFAULT_RELEASE_NAMESPACE.to_string(),
            release_namespace: DEFAULT_RELEASE_NAMESPACE.to_string(),
            enable_namespace_secrets: false,
            enable_limited_cache: false,
            ignore_non_transient_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(5),
            max_secret_bytes: DEFAULT_MAX_SECRET_BYTES,
            cluster_id: String::new(),
            metrics_port: DEFAULT_METRICS_PORT,
            webhook_port: DEFAULT_WEBHOOK_PORT,
            webhook_cert_dir: PathBuf::from(DEFAULT_WEBHOOK_CERT_DIR),
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            log_format: "text".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let release_namespace = non_empty(lookup("RELEASE_NAMESPACE"))
            .or_else(|| non_empty(lookup("POD_NAMESPACE")))
            .unwrap_or(defaults.release_namespace);
        let management_namespace =
            non_empty(lookup("MANAGEMENT_NAMESPACE")).unwrap_or_else(|| release_namespace.clone());

        Self {
            management_namespace,
            release_namespace,
            enable_namespace_secrets: var_or_default_bool(
                &lookup,
                "ENABLE_NAMESPACE_SECRETS",
                defaults.enable_namespace_secrets,
            ),
            enable_limited_cache: var_or_default_bool(
                &lookup,
                "ENABLE_LIMITED_CACHE",
                defaults.enable_limited_cache,
            ),
            ignore_non_transient_timeout: var_or_default_duration(
                &lookup,
                "IGNORE_NON_TRANSIENT_TIMEOUT",
                defaults.ignore_non_transient_timeout,
            ),
            poll_interval: var_or_default_duration(&lookup, "POLL_INTERVAL", defaults.poll_interval),
            max_secret_bytes: var_or_default(&lookup, "MAX_SECRET_BYTES", defaults.max_secret_bytes),
            cluster_id: lookup("CLUSTER_ID").unwrap_or_default(),
            metrics_port: var_or_default(&lookup, "METRICS_PORT", defaults.metrics_port),
            webhook_port: var_or_default(&lookup, "WEBHOOK_PORT", defaults.webhook_port),
            webhook_cert_dir: non_empty(lookup("WEBHOOK_CERT_DIR"))
                .map(PathBuf::from)
                .unwrap_or(defaults.webhook_cert_dir),
            max_concurrent_reconciles: var_or_default(
                &lookup,
                "MAX_CONCURRENT_RECONCILES",
                defaults.max_concurrent_reconciles,
            ),
            shutdown_timeout: Duration::from_secs(var_or_default(
                &lookup,
                "SHUTDOWN_TIMEOUT_SECS",
                DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            )),
            log_format: non_empty(lookup("LOG_FORMAT")).unwrap_or(defaults.log_format),
        }
    }

    /// Namespaces searched for the cluster-default credential secret, in order
    pub fn default_secret_namespaces(&self) -> Vec<&str> {
        if self.release_namespace == self.management_namespace {
            vec![self.management_namespace.as_str()]
        } else {
            vec![
                self.management_namespace.as_str(),
                self.release_namespace.as_str(),
            ]
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Read variable or return default value
fn var_or_default<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Read variable as boolean or return default
fn var_or_default_bool<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| {
            let v_lower = v.trim().to_lowercase();
            v_lower == "true" || v_lower == "1" || v_lower == "yes" || v_lower == "on"
        })
        .unwrap_or(default)
}

/// Read variable as duration string or return default
fn var_or_default_duration<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup(key)) {
        Some(raw) => parse_kubernetes_duration(&raw).unwrap_or_else(|e| {
            warn!("Ignoring {}: {}, using default {:?}", key, e, default);
            default
        }),
        None => default,
    }
}
