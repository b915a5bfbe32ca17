//! # Admission Webhooks
//!
//! Defaulting and validation for `ServiceInstance` and `ServiceBinding`.
//!
//! Mutating handlers compute the defaulted object and answer with a JSON patch
//! (`json_patch::diff` of the incoming and defaulted object). Validating handlers
//! allow or deny with a user-readable reason; denials are never retried.
//!
//! Routes:
//! - `POST /mutate-services-cloud-sap-com-v1-serviceinstance`
//! - `POST /validate-services-cloud-sap-com-v1-serviceinstance`
//! - `POST /mutate-services-cloud-sap-com-v1-servicebinding`
//! - `POST /validate-services-cloud-sap-com-v1-servicebinding`

pub mod binding;
pub mod instance;

use crate::crd::UserInfo;
use axum::{routing::post, Json, Router};
use chrono::Utc;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const MUTATE_INSTANCE_PATH: &str = "/mutate-services-cloud-sap-com-v1-serviceinstance";
pub const VALIDATE_INSTANCE_PATH: &str = "/validate-services-cloud-sap-com-v1-serviceinstance";
pub const MUTATE_BINDING_PATH: &str = "/mutate-services-cloud-sap-com-v1-servicebinding";
pub const VALIDATE_BINDING_PATH: &str = "/validate-services-cloud-sap-com-v1-servicebinding";

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// The object in the request does not decode as the expected kind
    #[error("failed to decode {kind}: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Decode the object carried by the request
pub(crate) fn typed<K: DeserializeOwned>(
    kind: &'static str,
    object: Option<&DynamicObject>,
) -> Result<Option<K>, AdmissionError> {
    object
        .map(|obj| {
            serde_json::to_value(obj)
                .and_then(serde_json::from_value)
                .map_err(|source| AdmissionError::Decode { kind, source })
        })
        .transpose()
}

/// Answer with the patch turning `original` into `defaulted`
pub(crate) fn patch_response<K: Serialize>(
    request: &AdmissionRequest<DynamicObject>,
    original: &K,
    defaulted: &K,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    let patch = match (serde_json::to_value(original), serde_json::to_value(defaulted)) {
        (Ok(before), Ok(after)) => json_patch::diff(&before, &after),
        (Err(e), _) | (_, Err(e)) => {
            error!(uid = %request.uid, error = %e, "Failed to serialize object for patch");
            return response.deny(format!("patch serialization error: {e}"));
        }
    };
    if patch.0.is_empty() {
        return response;
    }
    match response.with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %request.uid, error = %e, "Failed to serialize patch");
            AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
        }
    }
}

/// Requester identity as recorded on the spec
pub(crate) fn requester(request: &AdmissionRequest<DynamicObject>) -> UserInfo {
    let user = &request.user_info;
    UserInfo {
        username: user.username.clone(),
        uid: user.uid.clone(),
        groups: user.groups.clone().unwrap_or_default(),
        extra: user.extra.clone().unwrap_or_default(),
    }
}

type Handler = fn(&AdmissionRequest<DynamicObject>) -> AdmissionResponse;

fn review(body: AdmissionReview<DynamicObject>, handler: Handler) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(handler(&request).into_review())
}

async fn mutate_instance(Json(body): Json<AdmissionReview<DynamicObject>>) -> Json<AdmissionReview<DynamicObject>> {
    review(body, |request| instance::mutate(request, Utc::now()))
}

async fn validate_instance(Json(body): Json<AdmissionReview<DynamicObject>>) -> Json<AdmissionReview<DynamicObject>> {
    review(body, instance::validate)
}

async fn mutate_binding(Json(body): Json<AdmissionReview<DynamicObject>>) -> Json<AdmissionReview<DynamicObject>> {
    review(body, binding::mutate)
}

async fn validate_binding(Json(body): Json<AdmissionReview<DynamicObject>>) -> Json<AdmissionReview<DynamicObject>> {
    review(body, binding::validate)
}

/// Create the webhook router with all admission endpoints
pub fn webhook_router() -> Router {
    Router::new()
        .route(MUTATE_INSTANCE_PATH, post(mutate_instance))
        .route(VALIDATE_INSTANCE_PATH, post(validate_instance))
        .route(MUTATE_BINDING_PATH, post(mutate_binding))
        .route(VALIDATE_BINDING_PATH, post(validate_binding))
        .layer(TraceLayer::new_for_http())
}

/// Serve the webhooks, over TLS when `tls.crt`/`tls.key` exist in `cert_dir`
pub async fn start_webhook_server(port: u16, cert_dir: &Path) -> Result<(), anyhow::Error> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let cert = cert_dir.join("tls.crt");
    let key = cert_dir.join("tls.key");

    if cert.exists() && key.exists() {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert, &key).await?;
        info!(%addr, cert_dir = %cert_dir.display(), "Admission webhook server listening (TLS)");
        axum_server::bind_rustls(addr, tls)
            .serve(webhook_router().into_make_service())
            .await?;
    } else {
        warn!(
            cert_dir = %cert_dir.display(),
            "Webhook certificates not found, serving admission webhooks over plain HTTP"
        );
        axum_server::bind(addr)
            .serve(webhook_router().into_make_service())
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use serde_json::{json, Value};

    fn admission_review(kind: &str, operation: &str, object: Value, old_object: Value) -> AdmissionReview<DynamicObject> {
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "req-1",
                "kind": {"group": "services.cloud.sap.com", "version": "v1", "kind": kind},
                "resource": {
                    "group": "services.cloud.sap.com",
                    "version": "v1",
                    "resource": format!("{}s", kind.to_lowercase())
                },
                "name": "queue",
                "namespace": "apps",
                "operation": operation,
                "userInfo": {"username": "alice", "groups": ["devs"]},
                "object": object,
                "oldObject": old_object,
                "dryRun": false
            }
        }))
        .unwrap()
    }

    fn instance_object(subaccount: &str) -> Value {
        json!({
            "apiVersion": "services.cloud.sap.com/v1",
            "kind": "ServiceInstance",
            "metadata": {"name": "queue", "namespace": "apps"},
            "spec": {
                "serviceOfferingName": "message-queue",
                "servicePlanName": "standard",
                "subaccountID": subaccount
            }
        })
    }

    // The patch is sent base64 encoded; accept a raw byte array as well
    fn patch_bytes(patch: &Value) -> Vec<u8> {
        match patch {
            Value::String(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .unwrap(),
            Value::Array(bytes) => bytes.iter().map(|b| b.as_u64().unwrap() as u8).collect(),
            other => panic!("unexpected patch encoding: {other}"),
        }
    }

    fn response(review: AdmissionReview<DynamicObject>) -> Value {
        serde_json::to_value(review).unwrap()["response"].clone()
    }

    #[test]
    fn mutate_create_returns_defaulting_patch() {
        let body = admission_review("ServiceInstance", "CREATE", instance_object("sa-1"), Value::Null);
        let Json(out) = review(body, |request| instance::mutate(request, Utc::now()));
        let response = response(out);

        assert_eq!(response["uid"], "req-1");
        assert_eq!(response["allowed"], true);
        let patch: Value = serde_json::from_slice(&patch_bytes(&response["patch"])).unwrap();
        let paths: Vec<&str> = patch
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|op| op["path"].as_str())
            .collect();
        assert!(paths.contains(&"/spec/externalName"));
        assert!(paths.contains(&"/spec/userInfo"));
    }

    #[test]
    fn validate_update_denies_subaccount_change() {
        let body = admission_review(
            "ServiceInstance",
            "UPDATE",
            instance_object("sa-2"),
            instance_object("sa-1"),
        );
        let Json(out) = review(body, instance::validate);
        let response = response(out);

        assert_eq!(response["allowed"], false);
        let message = response["status"]["message"]
            .as_str()
            .or(response["result"]["message"].as_str())
            .unwrap_or_default();
        assert!(message.contains("subaccount"));
    }

    #[test]
    fn validate_update_allows_unchanged_subaccount() {
        let body = admission_review(
            "ServiceInstance",
            "UPDATE",
            instance_object("sa-1"),
            instance_object("sa-1"),
        );
        let Json(out) = review(body, instance::validate);
        assert_eq!(response(out)["allowed"], true);
    }
}
