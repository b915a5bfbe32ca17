//! # Secret Materializer
//!
//! Turns the credentials SM returned for a binding into the binding's Secret.
//!
//! Shaping depends on the binding spec:
//!
//! - `secretKey`: the whole payload as JSON under that key
//! - `secretRootKey`: payload and instance info merged into one JSON object under that key
//! - neither: one entry per credential field plus instance info and a `metadata` entry
//!
//! A `secretTemplate`, when set, is rendered on top of that and may replace the data
//! and add labels and annotations.

mod limited_writer;
mod normalize;
mod template;

pub use normalize::{
    normalize_credentials, normalize_key, normalize_value, restore_credentials,
    NormalizedCredentials, PropertyFormat, SecretMetadata, SecretMetadataProperty, METADATA_KEY,
};
pub use template::{render_secret_template, validate_template, RenderedSecret};

use crate::constants::LABEL_MANAGED_SECRET;
use crate::crd::{ServiceBinding, ServiceInstance};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("the rendered secret exceeds the limit of {limit} bytes")]
    TooLarge { limit: usize },

    #[error("failed to render secret template: {0}")]
    Template(String),

    #[error("secret template did not produce a valid Secret manifest: {0}")]
    InvalidManifest(String),

    #[error("secret template produced a {0}, expected a Secret")]
    WrongKind(String),

    #[error("service binding credentials are not a JSON object")]
    InvalidCredentials,

    #[error("failed to encode credentials: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Instance fields exposed to secrets and templates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub instance_name: String,
    pub instance_guid: String,
    pub instance_external_name: String,
    pub plan: String,
    pub label: String,
    #[serde(rename = "type")]
    pub r#type: String,
    pub tags: Vec<String>,
}

impl InstanceInfo {
    pub fn from_instance(instance: &ServiceInstance) -> Self {
        let mut tags = instance.spec.custom_tags.clone();
        if let Some(status) = instance.status.as_ref() {
            for tag in &status.tags {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
        }
        Self {
            instance_name: instance.name_any(),
            instance_guid: instance.instance_id().unwrap_or_default().to_string(),
            instance_external_name: instance.external_name(),
            plan: instance.spec.service_plan_name.clone(),
            label: instance.spec.service_offering_name.clone(),
            r#type: instance.spec.service_offering_name.clone(),
            tags,
        }
    }

    /// Secret entries, skipping the GUID until SM assigned one
    fn entries(&self) -> Result<Vec<(String, Vec<u8>, PropertyFormat)>, MaterializeError> {
        let mut entries = vec![
            ("instance_name".to_string(), self.instance_name.clone().into_bytes(), PropertyFormat::Text),
            (
                "instance_external_name".to_string(),
                self.instance_external_name.clone().into_bytes(),
                PropertyFormat::Text,
            ),
            ("plan".to_string(), self.plan.clone().into_bytes(), PropertyFormat::Text),
            ("label".to_string(), self.label.clone().into_bytes(), PropertyFormat::Text),
            ("type".to_string(), self.r#type.clone().into_bytes(), PropertyFormat::Text),
            ("tags".to_string(), serde_json::to_vec(&self.tags)?, PropertyFormat::Json),
        ];
        if !self.instance_guid.is_empty() {
            entries.push((
                "instance_guid".to_string(),
                self.instance_guid.clone().into_bytes(),
                PropertyFormat::Text,
            ));
        }
        Ok(entries)
    }
}

/// Desired content of a binding secret
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretContent {
    pub data: BTreeMap<String, Vec<u8>>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

fn credentials_object(credentials: &Value) -> Result<Map<String, Value>, MaterializeError> {
    match credentials {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        _ => Err(MaterializeError::InvalidCredentials),
    }
}

/// Shape credentials without a template
pub fn shape_credentials(
    binding: &ServiceBinding,
    credentials: &Value,
    info: &InstanceInfo,
) -> Result<BTreeMap<String, Vec<u8>>, MaterializeError> {
    let payload = credentials_object(credentials)?;

    if let Some(root_key) = binding.spec.secret_root_key.as_deref().filter(|k| !k.is_empty()) {
        let mut root = payload;
        if let Value::Object(instance) = serde_json::to_value(info)? {
            for (key, value) in instance {
                if key == "instance_guid" && info.instance_guid.is_empty() {
                    continue;
                }
                root.insert(key, value);
            }
        }
        let mut data = BTreeMap::new();
        data.insert(root_key.to_string(), serde_json::to_vec(&root)?);
        return Ok(data);
    }

    let mut data = BTreeMap::new();
    let credential_properties = match binding.spec.secret_key.as_deref().filter(|k| !k.is_empty()) {
        Some(secret_key) => {
            data.insert(secret_key.to_string(), serde_json::to_vec(&payload)?);
            vec![SecretMetadataProperty {
                name: secret_key.to_string(),
                format: PropertyFormat::Json,
                container: Some(true),
            }]
        }
        None => {
            let normalized = normalize_credentials(&payload)?;
            data.extend(normalized.entries);
            normalized.properties
        }
    };

    let mut meta_data_properties = Vec::new();
    for (name, bytes, format) in info.entries()? {
        data.insert(name.clone(), bytes);
        meta_data_properties.push(SecretMetadataProperty {
            name,
            format,
            container: None,
        });
    }

    let metadata = SecretMetadata {
        credential_properties,
        meta_data_properties,
    };
    data.insert(METADATA_KEY.to_string(), serde_json::to_vec(&metadata)?);
    Ok(data)
}

/// Full secret content for a binding: shaping plus the optional template
pub fn materialize(
    binding: &ServiceBinding,
    instance: &ServiceInstance,
    credentials: &Value,
    max_bytes: usize,
) -> Result<SecretContent, MaterializeError> {
    let info = InstanceInfo::from_instance(instance);
    let shaped = shape_credentials(binding, credentials, &info)?;

    let Some(source) = binding.spec.secret_template.as_deref().filter(|t| !t.trim().is_empty()) else {
        return Ok(SecretContent {
            data: shaped,
            ..SecretContent::default()
        });
    };

    let rendered = render_secret_template(source, credentials, &info, max_bytes)?;
    Ok(SecretContent {
        data: if rendered.data.is_empty() { shaped } else { rendered.data },
        labels: rendered.labels,
        annotations: rendered.annotations,
    })
}

/// The Secret object for `content`, owned by the binding
pub fn build_secret(binding: &ServiceBinding, content: SecretContent) -> Secret {
    let mut labels = content.labels;
    labels.insert(LABEL_MANAGED_SECRET.to_string(), "true".to_string());

    Secret {
        metadata: ObjectMeta {
            name: Some(binding.secret_name()),
            namespace: binding.namespace(),
            labels: Some(labels),
            annotations: (!content.annotations.is_empty()).then_some(content.annotations),
            owner_references: binding.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..ObjectMeta::default()
        },
        data: Some(
            content
                .data
                .into_iter()
                .map(|(k, v)| (k, ByteString(v)))
                .collect(),
        ),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    }
}

/// Whether writing `desired` would change `existing`
pub fn secret_differs(existing: &Secret, desired: &Secret) -> bool {
    let existing_data = existing.data.clone().unwrap_or_default();
    let desired_data = desired.data.clone().unwrap_or_default();
    if existing_data != desired_data {
        return true;
    }

    let subset = |want: &Option<BTreeMap<String, String>>, have: &Option<BTreeMap<String, String>>| {
        let have = have.clone().unwrap_or_default();
        want.iter()
            .flatten()
            .all(|(k, v)| have.get(k) == Some(v))
    };
    !subset(&desired.metadata.labels, &existing.metadata.labels)
        || !subset(&desired.metadata.annotations, &existing.metadata.annotations)
}
