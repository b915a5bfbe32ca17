//! # ServiceInstance
//!
//! A provisioned SM service instance.
//!
//! # Example
//!
//! ```yaml
//! apiVersion: services.cloud.sap.com/v1
//! kind: ServiceInstance
//! metadata:
//!   name: my-queue
//!   namespace: default
//! spec:
//!   serviceOfferingName: message-queue
//!   servicePlanName: standard
//!   parameters:
//!     size: small
//! ```

use crate::crd::common::{
    preserve_unknown_fields, Condition, CredentialSecretRef, OperationType, ParametersFromSource,
    UserInfo,
};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, Default, PartialEq, schemars::JsonSchema)]
#[kube(
    kind = "ServiceInstance",
    group = "services.cloud.sap.com",
    version = "v1",
    namespaced,
    status = "ServiceInstanceStatus",
    shortname = "si",
    printcolumn = r#"{"name":"Offering", "type":"string", "jsonPath":".spec.serviceOfferingName"}, {"name":"Plan", "type":"string", "jsonPath":".spec.servicePlanName"}, {"name":"Shared", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Shared\")].status"}, {"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Succeeded\")].reason"}, {"name":"Ready", "type":"string", "jsonPath":".status.ready"}, {"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}, {"name":"ID", "type":"string", "priority":1, "jsonPath":".status.instanceID"}, {"name":"Message", "type":"string", "priority":1, "jsonPath":".status.conditions[?(@.type==\"Succeeded\")].message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    /// Name of the SM service offering
    pub service_offering_name: String,
    /// Name of the SM service plan
    pub service_plan_name: String,
    /// Plan ID, overrides plan resolution by name when set
    #[serde(default, rename = "servicePlanID", skip_serializing_if = "Option::is_none")]
    pub service_plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_center: Option<String>,
    /// Name of the instance in SM, defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_name: Option<String>,
    /// Tri-state sharing flag; unset leaves sharing alone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,
    /// Provisioning parameters passed to the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,
    /// Additional parameters sourced from secrets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,
    /// Issue an update when a `parametersFrom` secret changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_parameters_from_changes: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_tags: Vec<String>,
    /// Set by admission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
    /// Credential secret in the management namespace to use for this instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub btp_access_credentials_secret: Option<String>,
    /// Immutable once set
    #[serde(default, rename = "subaccountID", skip_serializing_if = "Option::is_none")]
    pub subaccount_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    #[serde(default, rename = "instanceID", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Witness of the single outstanding SM operation
    #[serde(default, rename = "operationURL", skip_serializing_if = "Option::is_none")]
    pub operation_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<OperationType>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// "True", "False" or empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<String>,
    /// md5 of the spec without `shared`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_spec: Option<String>,
    /// md5 of the data read through `parametersFrom`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_hash: Option<String>,
    #[serde(default, rename = "subaccountID", skip_serializing_if = "Option::is_none")]
    pub subaccount_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<CredentialSecretRef>,
}

impl ServiceInstance {
    /// Name the instance carries in SM
    pub fn external_name(&self) -> String {
        match self.spec.external_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.name_any(),
        }
    }

    /// SM instance ID, if one has been assigned
    pub fn instance_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.instance_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// True once the instance is provisioned and its last operation succeeded
    pub fn is_ready(&self) -> bool {
        self.instance_id().is_some()
            && self
                .status
                .as_ref()
                .and_then(|s| s.ready.as_deref())
                .is_some_and(|r| r == "True")
    }

    pub fn watches_parameters(&self) -> bool {
        self.spec.watch_parameters_from_changes.unwrap_or(false)
    }
}
