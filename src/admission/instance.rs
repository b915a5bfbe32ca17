//! ServiceInstance defaulting and validation

use super::{patch_response, requester, typed};
use crate::constants::{
    ANNOTATION_IGNORE_NON_TRANSIENT_ERROR, ANNOTATION_IGNORE_NON_TRANSIENT_ERROR_TIMESTAMP,
    ANNOTATION_PREVENT_DELETION,
};
use crate::crd::ServiceInstance;
use chrono::{DateTime, SecondsFormat, Utc};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use kube::ResourceExt;
use tracing::{debug, warn};

const KIND: &str = "ServiceInstance";

/// Apply defaults to an incoming instance and return the defaulted copy
pub fn default_instance(
    operation: &Operation,
    incoming: &ServiceInstance,
    old: Option<&ServiceInstance>,
    requester: crate::crd::UserInfo,
    now: DateTime<Utc>,
) -> ServiceInstance {
    let mut instance = incoming.clone();

    if instance.spec.external_name.as_deref().is_none_or(str::is_empty) {
        instance.spec.external_name = Some(instance.name_any());
    }

    let spec_changed = match (operation, old) {
        (Operation::Update, Some(old)) => {
            let mut before = old.spec.clone();
            let mut after = instance.spec.clone();
            before.user_info = None;
            after.user_info = None;
            before != after
        }
        _ => true,
    };
    if spec_changed {
        instance.spec.user_info = Some(requester);
    }

    let annotations = instance.annotations_mut();
    if annotations.contains_key(ANNOTATION_IGNORE_NON_TRANSIENT_ERROR)
        && !annotations.contains_key(ANNOTATION_IGNORE_NON_TRANSIENT_ERROR_TIMESTAMP)
    {
        annotations.insert(
            ANNOTATION_IGNORE_NON_TRANSIENT_ERROR_TIMESTAMP.to_string(),
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }

    instance
}

/// Reasons an instance change is refused, `None` when allowed
pub fn validate_instance(
    operation: &Operation,
    incoming: Option<&ServiceInstance>,
    old: Option<&ServiceInstance>,
) -> Option<String> {
    match operation {
        Operation::Update => {
            let (Some(new), Some(old)) = (incoming, old) else {
                return None;
            };
            let before = old.spec.subaccount_id.as_deref().unwrap_or_default();
            let after = new.spec.subaccount_id.as_deref().unwrap_or_default();
            if before != after {
                return Some(format!(
                    "changing the subaccountID for an existing instance is not allowed (was {before:?}, requested {after:?})"
                ));
            }
            None
        }
        Operation::Delete => {
            let old = old?;
            let prevented = old
                .annotations()
                .get(ANNOTATION_PREVENT_DELETION)
                .is_some_and(|v| v.eq_ignore_ascii_case("true"));
            prevented.then(|| {
                format!(
                    "service instance {} is marked with \"prevent deletion\" annotation and cannot be deleted",
                    old.name_any()
                )
            })
        }
        _ => None,
    }
}

pub(super) fn mutate(request: &AdmissionRequest<DynamicObject>, now: DateTime<Utc>) -> AdmissionResponse {
    let decoded = typed::<ServiceInstance>(KIND, request.object.as_ref()).and_then(|new| {
        typed::<ServiceInstance>(KIND, request.old_object.as_ref()).map(|old| (new, old))
    });
    let (incoming, old) = match decoded {
        Ok((Some(incoming), old)) => (incoming, old),
        Ok((None, _)) => return AdmissionResponse::from(request),
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "Rejecting undecodable ServiceInstance");
            return AdmissionResponse::from(request).deny(e.to_string());
        }
    };

    let defaulted = default_instance(
        &request.operation,
        &incoming,
        old.as_ref(),
        requester(request),
        now,
    );
    debug!(
        uid = %request.uid,
        resource.name = %incoming.name_any(),
        "Defaulted ServiceInstance"
    );
    patch_response(request, &incoming, &defaulted)
}

pub(super) fn validate(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let decoded = typed::<ServiceInstance>(KIND, request.object.as_ref()).and_then(|new| {
        typed::<ServiceInstance>(KIND, request.old_object.as_ref()).map(|old| (new, old))
    });
    let (incoming, old) = match decoded {
        Ok(pair) => pair,
        Err(e) => return AdmissionResponse::from(request).deny(e.to_string()),
    };

    match validate_instance(&request.operation, incoming.as_ref(), old.as_ref()) {
        Some(reason) => {
            warn!(uid = %request.uid, name = %request.name, %reason, "Denied ServiceInstance change");
            AdmissionResponse::from(request).deny(reason)
        }
        None => AdmissionResponse::from(request),
    }
}
