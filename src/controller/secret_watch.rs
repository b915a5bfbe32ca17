//! # Parameter Secret Watches
//!
//! Resources that set `watchParametersFromChanges` register on every secret they read
//! parameters from. Each watcher adds `services.cloud.sap.com/watch-<uid>=true`; the
//! first one also adds a finalizer, and the last one to leave removes it.
//!
//! Registrations follow the spec on every pass: a secret dropped from
//! `parametersFrom`, or every secret once watching is switched off, is released.

use crate::constants::{FIELD_MANAGER, SECRET_WATCH_FINALIZER, WATCH_ANNOTATION_PREFIX};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{ListParams, ObjectMeta, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub fn watch_annotation_key(uid: &str) -> String {
    format!("{WATCH_ANNOTATION_PREFIX}{uid}")
}

/// UIDs of the resources watching a secret
pub fn watcher_uids(meta: &ObjectMeta) -> Vec<String> {
    meta.annotations
        .iter()
        .flatten()
        .filter_map(|(key, _)| key.strip_prefix(WATCH_ANNOTATION_PREFIX))
        .map(str::to_string)
        .collect()
}

/// Metadata patch adding `uid` as a watcher, `None` when already registered
pub fn watch_patch(meta: &ObjectMeta, uid: &str) -> Option<Value> {
    let key = watch_annotation_key(uid);
    let annotated = meta
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(&key));
    let finalizers = meta.finalizers.clone().unwrap_or_default();
    let finalized = finalizers.iter().any(|f| f == SECRET_WATCH_FINALIZER);
    if annotated && finalized {
        return None;
    }

    let mut finalizers = finalizers;
    if !finalized {
        finalizers.push(SECRET_WATCH_FINALIZER.to_string());
    }
    let mut annotations = Map::new();
    annotations.insert(key, Value::String("true".to_string()));
    Some(json!({
        "metadata": {
            "resourceVersion": meta.resource_version,
            "annotations": annotations,
            "finalizers": finalizers,
        }
    }))
}

/// Metadata patch removing `uid` as a watcher, `None` when it was not registered
pub fn unwatch_patch(meta: &ObjectMeta, uid: &str) -> Option<Value> {
    let key = watch_annotation_key(uid);
    let annotations: BTreeMap<String, String> = meta.annotations.clone().unwrap_or_default();
    if !annotations.contains_key(&key) {
        return None;
    }

    let others = annotations
        .keys()
        .filter(|k| k.starts_with(WATCH_ANNOTATION_PREFIX) && **k != key)
        .count();
    let mut metadata = Map::new();
    metadata.insert("resourceVersion".to_string(), json!(meta.resource_version));
    let mut removed = Map::new();
    removed.insert(key, Value::Null);
    metadata.insert("annotations".to_string(), Value::Object(removed));
    if others == 0 {
        let finalizers: Vec<String> = meta
            .finalizers
            .iter()
            .flatten()
            .filter(|f| f.as_str() != SECRET_WATCH_FINALIZER)
            .cloned()
            .collect();
        metadata.insert("finalizers".to_string(), json!(finalizers));
    }
    Some(json!({ "metadata": metadata }))
}

/// Register `uid` on each named secret that exists
pub async fn watch_secrets(
    client: &Client,
    namespace: &str,
    names: &[String],
    uid: &str,
) -> Result<(), kube::Error> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    for name in names {
        let Some(secret) = api.get_opt(name).await? else {
            continue;
        };
        let patch = if secret.metadata.deletion_timestamp.is_some() {
            unwatch_patch(&secret.metadata, uid)
        } else {
            watch_patch(&secret.metadata, uid)
        };
        if let Some(patch) = patch {
            debug!(namespace, secret = %name, uid, "Updating parameter secret watch");
            api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await?;
        }
    }
    Ok(())
}

/// Patch releasing `uid` from a secret it should no longer watch
pub fn release_patch(meta: &ObjectMeta, wanted: &[String], uid: &str) -> Option<Value> {
    let name = meta.name.as_deref().unwrap_or_default();
    if wanted.iter().any(|w| w == name) {
        return None;
    }
    unwatch_patch(meta, uid)
}

/// Remove `uid` from every secret in the namespace outside `wanted`
pub async fn release_watches(
    client: &Client,
    namespace: &str,
    wanted: &[String],
    uid: &str,
) -> Result<(), kube::Error> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secrets = api.list_metadata(&ListParams::default()).await?;
    for secret in secrets.items {
        if let Some(patch) = release_patch(&secret.metadata, wanted, uid) {
            let name = secret.name_any();
            info!(namespace, secret = %name, uid, "Removing parameter secret watch");
            match api
                .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(response)) if response.code == 404 => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

/// Make `uid` watch exactly the `wanted` secrets of its namespace
pub async fn sync_secret_watches(
    client: &Client,
    namespace: &str,
    wanted: &[String],
    uid: &str,
) -> Result<(), kube::Error> {
    watch_secrets(client, namespace, wanted, uid).await?;
    release_watches(client, namespace, wanted, uid).await
}

/// Remove `uid` from every secret in the namespace it watches
pub async fn unwatch_secrets(client: &Client, namespace: &str, uid: &str) -> Result<(), kube::Error> {
    release_watches(client, namespace, &[], uid).await
}
