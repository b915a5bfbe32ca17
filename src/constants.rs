//! # Constants
//!
//! Shared constants used throughout the operator.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Finalizer placed on every ServiceInstance and ServiceBinding until remote deletion succeeds
pub const FINALIZER: &str = "services.cloud.sap.com/sap-btp-finalizer";

/// Finalizer placed on secrets referenced by `parametersFrom` while watchers remain
pub const SECRET_WATCH_FINALIZER: &str = "services.cloud.sap.com/secret-watch-finalizer";

/// Field manager used for status and metadata patches
pub const FIELD_MANAGER: &str = "sm-service-operator";

// Annotations

/// Admission denies deletion while set to `true`
pub const ANNOTATION_PREVENT_DELETION: &str = "services.cloud.sap.com/preventDeletion";

/// Treat non-transient failures as transient while the companion timestamp is fresh
pub const ANNOTATION_IGNORE_NON_TRANSIENT_ERROR: &str =
    "services.cloud.sap.com/ignoreNonTransientError";

/// RFC3339 timestamp stamped by admission next to the ignore annotation
pub const ANNOTATION_IGNORE_NON_TRANSIENT_ERROR_TIMESTAMP: &str =
    "services.cloud.sap.com/ignoreNonTransientErrorTimestamp";

/// Rotate binding credentials on the next reconcile regardless of schedule
pub const ANNOTATION_FORCE_ROTATE: &str = "services.cloud.sap.com/forceRotate";

/// Expiry of a stale binding kept around after rotation
pub const ANNOTATION_VALID_UNTIL: &str = "services.cloud.sap.com/valid-until";

/// Prefix of the per-resource watch annotation placed on `parametersFrom` secrets
pub const WATCH_ANNOTATION_PREFIX: &str = "services.cloud.sap.com/watch-";

/// Prefix of the owner-trigger annotation placed on an instance by each of its bindings
pub const BINDING_ANNOTATION_PREFIX: &str = "services.cloud.sap.com/binding-";

// Labels

/// Marks a binding copy retained during rotation, value is the old SM binding ID
pub const LABEL_STALE_BINDING_ID: &str = "services.cloud.sap.com/stale-binding-id";

/// Name of the binding a stale copy was rotated out of
pub const LABEL_ROTATION_OF: &str = "services.cloud.sap.com/stale-binding-rotation-of";

/// Label that opts a secret into the limited credential cache
pub const LABEL_MANAGED_SECRET: &str = "services.cloud.sap.com/managed-by-sap-btp-operator";

// Service Manager correlation labels

/// SM label holding the namespace of the owning resource
pub const SM_LABEL_NAMESPACE: &str = "_namespace";

/// SM label holding the name of the owning resource
pub const SM_LABEL_K8S_NAME: &str = "_k8sname";

/// SM label holding the cluster ID
pub const SM_LABEL_CLUSTER_ID: &str = "_clusterid";

// Credential secrets

/// Name of the default / namespaced SM credential secret
pub const SM_SECRET_NAME: &str = "sap-btp-service-operator";

/// Name of the companion secret carrying a TLS certificate and key
pub const SM_TLS_SECRET_NAME: &str = "sap-btp-service-operator-tls";

/// Default namespace the operator is released into
pub const DEFAULT_RELEASE_NAMESPACE: &str = "sap-btp-operator";

// Timing

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default HTTPS port for the admission webhook
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;

/// Default directory holding `tls.crt` / `tls.key` for the webhook
pub const DEFAULT_WEBHOOK_CERT_DIR: &str = "/tmp/k8s-webhook-server/serving-certs";

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Upper bound of the polling delay
pub const MAX_POLL_INTERVAL_SECS: u64 = 300;

/// Default byte budget for a rendered credentials secret
pub const DEFAULT_MAX_SECRET_BYTES: usize = 1024 * 1024;

/// Default rotation frequency applied by admission
pub const DEFAULT_ROTATION_FREQUENCY: &str = "72h";

/// Default TTL of a stale binding applied by admission
pub const DEFAULT_ROTATED_BINDING_TTL: &str = "48h";

/// Minimum error backoff (seconds)
pub const DEFAULT_ERROR_BACKOFF_MIN_SECS: u64 = 1;

/// Maximum error backoff (seconds)
pub const DEFAULT_ERROR_BACKOFF_MAX_SECS: u64 = 300;

/// Requeue delay while a binding waits on its instance
pub const DEFAULT_BLOCKED_REQUEUE_SECS: u64 = 10;

/// Maximum optimistic-concurrency retries for a status write within one pass
pub const STATUS_CONFLICT_RETRIES: usize = 3;

/// Default maximum concurrent reconciliations per kind
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: u16 = 10;

/// Default graceful shutdown budget (seconds)
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default delay before restarting the controller stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;
