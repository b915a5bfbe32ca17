//! # Service Manager Provider
//!
//! The seam between the reconcilers and the remote Service Manager.
//!
//! - `ServiceManagerClient` is the typed RPC surface the reconcilers drive
//! - `ClientFactory` builds a client from resolved credentials
//! - `http` holds the reqwest implementation used in production

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub mod error;
pub mod http;

pub use error::SmError;

/// SM labels are multi-valued
pub type SmLabels = BTreeMap<String, Vec<String>>;

/// Everything needed to talk to one Service Manager tenant
#[derive(Clone, PartialEq, Eq)]
pub struct SmClientConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub sm_url: String,
    pub token_url: String,
    pub token_url_suffix: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub subaccount_id: Option<String>,
}

impl fmt::Debug for SmClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmClientConfig")
            .field("client_id", &self.client_id)
            .field("sm_url", &self.sm_url)
            .field("token_url", &self.token_url)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("tls", &self.tls_cert.is_some())
            .finish_non_exhaustive()
    }
}

/// Lifecycle state of an SM operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "pending")]
    Pending,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::Failed)
    }
}

/// An asynchronous SM operation as returned by the status endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    /// create, update or delete
    #[serde(rename = "type")]
    pub r#type: String,
    pub state: OperationState,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<serde_json::Value>,
    #[serde(default)]
    pub resource_id: String,
}

impl Operation {
    /// User-facing failure text, preferring the broker's error description
    pub fn failure_message(&self) -> String {
        let from_errors = self.errors.as_ref().and_then(|errors| {
            errors
                .get("description")
                .and_then(|d| d.as_str())
                .map(str::to_string)
        });
        match from_errors {
            Some(msg) if !msg.is_empty() => msg,
            _ if !self.description.is_empty() => self.description.clone(),
            _ => format!("{} operation failed", self.r#type),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionRequest {
    pub name: String,
    pub offering_name: String,
    pub plan_name: String,
    pub plan_id: Option<String>,
    pub data_center: Option<String>,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub labels: SmLabels,
    pub subaccount_id: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionResponse {
    pub instance_id: String,
    pub plan_id: Option<String>,
    pub subaccount_id: Option<String>,
    pub tags: Vec<String>,
    /// Set when SM accepted the request asynchronously
    pub operation_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateRequest {
    pub instance_id: String,
    pub name: String,
    pub offering_name: String,
    pub plan_name: String,
    pub plan_id: Option<String>,
    pub data_center: Option<String>,
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindRequest {
    pub name: String,
    pub instance_id: String,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub labels: SmLabels,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindResponse {
    pub binding_id: String,
    /// Broker credentials, present for synchronous binds
    pub credentials: Option<serde_json::Value>,
    pub operation_url: Option<String>,
}

/// Label query used for correlation lookups
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub labels: BTreeMap<String, String>,
}

impl ListQuery {
    /// Correlation query on `{_namespace, _k8sname, _clusterid}`
    pub fn correlation(namespace: &str, name: &str, cluster_id: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(crate::constants::SM_LABEL_NAMESPACE.to_string(), namespace.to_string());
        labels.insert(crate::constants::SM_LABEL_K8S_NAME.to_string(), name.to_string());
        if !cluster_id.is_empty() {
            labels.insert(crate::constants::SM_LABEL_CLUSTER_ID.to_string(), cluster_id.to_string());
        }
        Self { labels }
    }

    /// Rendered as an SM `labelQuery`
    pub fn label_query(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{k} eq '{v}'"))
            .collect::<Vec<_>>()
            .join(" and ")
    }

    pub fn matches(&self, labels: &SmLabels) -> bool {
        self.labels.iter().all(|(k, v)| {
            labels
                .get(k)
                .is_some_and(|values| values.iter().any(|candidate| candidate == v))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstanceRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub service_plan_id: String,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub labels: SmLabels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<Operation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceBindingRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub service_instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<serde_json::Value>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub labels: SmLabels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<Operation>,
}

/// Typed surface of the Service Manager API
///
/// Mutating calls return `Some(operation_url)` when SM accepted them asynchronously.
#[async_trait]
pub trait ServiceManagerClient: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionResponse, SmError>;

    async fn update(&self, request: &UpdateRequest) -> Result<Option<String>, SmError>;

    async fn deprovision(&self, instance_id: &str) -> Result<Option<String>, SmError>;

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, SmError>;

    async fn unbind(&self, binding_id: &str) -> Result<Option<String>, SmError>;

    /// Poll an operation by the URL returned from a mutating call
    async fn status(&self, operation_url: &str) -> Result<Operation, SmError>;

    async fn list_instances(&self, query: &ListQuery) -> Result<Vec<ServiceInstanceRecord>, SmError>;

    async fn list_bindings(&self, query: &ListQuery) -> Result<Vec<ServiceBindingRecord>, SmError>;

    /// Fetch a binding including its credentials
    async fn get_binding(&self, binding_id: &str) -> Result<ServiceBindingRecord, SmError>;

    async fn share(&self, instance_id: &str) -> Result<(), SmError>;

    async fn unshare(&self, instance_id: &str) -> Result<(), SmError>;
}

/// Builds clients from resolved credentials
pub trait ClientFactory: Send + Sync {
    fn client(&self, config: &SmClientConfig) -> Result<Arc<dyn ServiceManagerClient>, SmError>;
}

/// Correlation labels attached to every provision and bind
pub fn correlation_labels(namespace: &str, name: &str, cluster_id: &str) -> SmLabels {
    ListQuery::correlation(namespace, name, cluster_id)
        .labels
        .into_iter()
        .map(|(k, v)| (k, vec![v]))
        .collect()
}

/// Operation URL for an operation discovered through a list call
pub fn operation_url(resource: &str, resource_id: &str, operation_id: &str) -> String {
    format!("/v1/{resource}/{resource_id}/operations/{operation_id}")
}
