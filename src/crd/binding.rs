//! # ServiceBinding
//!
//! Credentials bound to a ServiceInstance, materialized into a secret.
//!
//! # Example
//!
//! ```yaml
//! apiVersion: services.cloud.sap.com/v1
//! kind: ServiceBinding
//! metadata:
//!   name: my-queue-binding
//!   namespace: default
//! spec:
//!   serviceInstanceName: my-queue
//!   credRotationPolicy:
//!     enabled: true
//!     rotationFrequency: 72h
//!     rotatedBindingTTL: 48h
//! ```

use crate::constants::{ANNOTATION_FORCE_ROTATE, LABEL_STALE_BINDING_ID};
use crate::crd::common::{
    preserve_unknown_fields, Condition, OperationType, ParametersFromSource, UserInfo,
};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, Default, PartialEq, schemars::JsonSchema)]
#[kube(
    kind = "ServiceBinding",
    group = "services.cloud.sap.com",
    version = "v1",
    namespaced,
    status = "ServiceBindingStatus",
    shortname = "sb",
    printcolumn = r#"{"name":"Instance", "type":"string", "jsonPath":".spec.serviceInstanceName"}, {"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Succeeded\")].reason"}, {"name":"Ready", "type":"string", "jsonPath":".status.ready"}, {"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}, {"name":"ID", "type":"string", "priority":1, "jsonPath":".status.bindingID"}, {"name":"Message", "type":"string", "priority":1, "jsonPath":".status.conditions[?(@.type==\"Succeeded\")].message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// ServiceInstance in the same namespace to bind to
    pub service_instance_name: String,
    /// Name of the binding in SM, defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_name: Option<String>,
    /// Name of the credentials secret, defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    /// Place the whole credentials payload under this single key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Place credentials and instance info as one JSON object under this key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_root_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_parameters_from_changes: Option<bool>,
    /// Template producing the credentials Secret manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cred_rotation_policy: Option<CredentialsRotationPolicy>,
    /// Set by admission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsRotationPolicy {
    pub enabled: bool,
    /// Duration between rotations, e.g. `72h`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_frequency: Option<String>,
    /// How long the previous credentials stay valid, e.g. `48h`
    #[serde(default, rename = "rotatedBindingTTL", skip_serializing_if = "Option::is_none")]
    pub rotated_binding_ttl: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    #[serde(default, rename = "instanceID", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, rename = "bindingID", skip_serializing_if = "Option::is_none")]
    pub binding_id: Option<String>,
    #[serde(default, rename = "operationURL", skip_serializing_if = "Option::is_none")]
    pub operation_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<OperationType>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<String>,
    /// md5 of the spec fields that are immutable once bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_hash: Option<String>,
    /// RFC3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_credentials_rotation_time: Option<String>,
}

impl ServiceBinding {
    pub fn external_name(&self) -> String {
        match self.spec.external_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.name_any(),
        }
    }

    /// Name of the owned credentials secret
    pub fn secret_name(&self) -> String {
        match self.spec.secret_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.name_any(),
        }
    }

    pub fn binding_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.binding_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Stale copies are retained during rotation and swept once expired
    pub fn is_stale(&self) -> bool {
        self.labels().contains_key(LABEL_STALE_BINDING_ID)
    }

    pub fn force_rotate_requested(&self) -> bool {
        self.annotations()
            .get(ANNOTATION_FORCE_ROTATE)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn watches_parameters(&self) -> bool {
        self.spec.watch_parameters_from_changes.unwrap_or(false)
    }
}
