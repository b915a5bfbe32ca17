//! # Status and Metadata Writes
//!
//! Status is written with a JSON merge patch computed against the status the pass
//! started from, so cleared fields are removed on the server. Writes carry the
//! resource version; on conflict the object is re-read and the patch rebuilt.

use crate::constants::{FIELD_MANAGER, STATUS_CONFLICT_RETRIES};
use crate::controller::reconciler::types::ReconcilerError;
use crate::crd::{ServiceBinding, ServiceBindingStatus, ServiceInstance, ServiceInstanceStatus};
use kube::api::{Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt::Debug;
use tracing::{debug, warn};

/// Custom resources with a status subresource
pub trait StatusResource:
    Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static
{
    type Status: Serialize + Clone + Default + PartialEq + Debug + Send + Sync;

    fn current_status(&self) -> Option<&Self::Status>;
}

impl StatusResource for ServiceInstance {
    type Status = ServiceInstanceStatus;

    fn current_status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

impl StatusResource for ServiceBinding {
    type Status = ServiceBindingStatus;

    fn current_status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

/// Merge patch turning `old` into `new`; removed top-level fields become `null`
pub fn status_merge_patch(old: &Value, new: &Value) -> Value {
    let empty = Map::new();
    let old = old.as_object().unwrap_or(&empty);
    let new = new.as_object().unwrap_or(&empty);

    let mut patch = Map::new();
    for (key, value) in new {
        if old.get(key) != Some(value) {
            patch.insert(key.clone(), value.clone());
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    Value::Object(patch)
}

/// Write `desired` as the status of `obj` if it differs from what is stored,
/// returning the object as stored afterwards
pub async fn write_status<K: StatusResource>(
    api: &Api<K>,
    obj: &K,
    desired: &K::Status,
) -> Result<K, ReconcilerError> {
    let name = obj.name_any();
    let mut current = obj.clone();

    for attempt in 1..=STATUS_CONFLICT_RETRIES {
        let stored = current.current_status().cloned().unwrap_or_default();
        if &stored == desired {
            debug!(resource.name = %name, "Skipping status update - status unchanged");
            return Ok(current);
        }

        let patch = json!({
            "metadata": { "resourceVersion": current.resource_version() },
            "status": status_merge_patch(&serde_json::to_value(&stored)?, &serde_json::to_value(desired)?),
        });

        match api
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(response)) if response.code == 409 && attempt < STATUS_CONFLICT_RETRIES => {
                warn!(
                    resource.name = %name,
                    attempt,
                    "Status update conflicted, re-reading resource"
                );
                current = api.get(&name).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(current)
}

/// Add `finalizer`, returning the object as stored afterwards
pub async fn add_finalizer<K: StatusResource>(
    api: &Api<K>,
    obj: &K,
    finalizer: &str,
) -> Result<K, ReconcilerError> {
    if obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(obj.clone());
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    Ok(patch_finalizers(api, obj, finalizers)
        .await?
        .unwrap_or_else(|| obj.clone()))
}

pub async fn remove_finalizer<K: StatusResource>(
    api: &Api<K>,
    obj: &K,
    finalizer: &str,
) -> Result<(), ReconcilerError> {
    if !obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    patch_finalizers(api, obj, finalizers).await.map(|_| ())
}

async fn patch_finalizers<K: StatusResource>(
    api: &Api<K>,
    obj: &K,
    finalizers: Vec<String>,
) -> Result<Option<K>, ReconcilerError> {
    let patch = json!({
        "metadata": {
            "resourceVersion": obj.resource_version(),
            "finalizers": finalizers,
        }
    });
    match api
        .patch(&obj.name_any(), &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        Ok(updated) => Ok(Some(updated)),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Set (`Some`) or remove (`None`) one annotation
pub async fn patch_annotation<K>(
    api: &Api<K>,
    name: &str,
    key: &str,
    value: Option<&str>,
) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut annotations = Map::new();
    annotations.insert(key.to_string(), value.map_or(Value::Null, |v| Value::String(v.to_string())));
    let patch = json!({ "metadata": { "annotations": annotations } });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_patch_nulls_cleared_fields() {
        let old = json!({"instanceID": "i-1", "operationURL": "/op/1", "ready": "False"});
        let new = json!({"instanceID": "i-1", "ready": "True"});
        assert_eq!(
            status_merge_patch(&old, &new),
            json!({"operationURL": null, "ready": "True"})
        );
    }

    #[test]
    fn test_merge_patch_of_identical_status_is_empty() {
        let status = ServiceInstanceStatus {
            instance_id: Some("i-1".to_string()),
            ..ServiceInstanceStatus::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(status_merge_patch(&value, &value), json!({}));
    }
}
