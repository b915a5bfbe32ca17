//! ServiceBinding defaulting and validation
//!
//! Once a binding has an SM binding ID (or is a stale rotation copy) its spec is
//! frozen, apart from `credRotationPolicy`, `secretTemplate` and `userInfo`.

use super::{patch_response, requester, typed};
use crate::constants::{DEFAULT_ROTATED_BINDING_TTL, DEFAULT_ROTATION_FREQUENCY, LABEL_STALE_BINDING_ID};
use crate::controller::duration::parse_kubernetes_duration;
use crate::controller::materializer::validate_template;
use crate::controller::reconciler::binding::IMMUTABLE_SPEC_MESSAGE;
use crate::crd::{ServiceBinding, ServiceBindingSpec, UserInfo};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use kube::ResourceExt;
use tracing::{debug, warn};

const KIND: &str = "ServiceBinding";

fn without_user_info(spec: &ServiceBindingSpec) -> ServiceBindingSpec {
    ServiceBindingSpec {
        user_info: None,
        ..spec.clone()
    }
}

fn frozen_fields(spec: &ServiceBindingSpec) -> ServiceBindingSpec {
    ServiceBindingSpec {
        cred_rotation_policy: None,
        secret_template: None,
        ..without_user_info(spec)
    }
}

/// Apply defaults to an incoming binding and return the defaulted copy
pub fn default_binding(
    operation: &Operation,
    incoming: &ServiceBinding,
    old: Option<&ServiceBinding>,
    requester: UserInfo,
) -> ServiceBinding {
    let mut binding = incoming.clone();
    let name = binding.name_any();

    if binding.spec.external_name.as_deref().is_none_or(str::is_empty) {
        binding.spec.external_name = Some(name.clone());
    }
    if binding.spec.secret_name.as_deref().is_none_or(str::is_empty) {
        binding.spec.secret_name = Some(name);
    }

    if let Some(policy) = binding.spec.cred_rotation_policy.as_mut() {
        if policy.enabled {
            if policy.rotation_frequency.as_deref().is_none_or(str::is_empty) {
                policy.rotation_frequency = Some(DEFAULT_ROTATION_FREQUENCY.to_string());
            }
            if policy.rotated_binding_ttl.as_deref().is_none_or(str::is_empty) {
                policy.rotated_binding_ttl = Some(DEFAULT_ROTATED_BINDING_TTL.to_string());
            }
        }
    }

    let spec_changed = match (operation, old) {
        (Operation::Update, Some(old)) => without_user_info(&old.spec) != without_user_info(&binding.spec),
        _ => true,
    };
    if spec_changed {
        binding.spec.user_info = Some(requester);
    }

    binding
}

fn validate_rotation_policy(spec: &ServiceBindingSpec) -> Option<String> {
    let policy = spec.cred_rotation_policy.as_ref()?;
    [
        ("rotationFrequency", policy.rotation_frequency.as_deref()),
        ("rotatedBindingTTL", policy.rotated_binding_ttl.as_deref()),
    ]
    .into_iter()
    .find_map(|(field, value)| {
        let value = value.filter(|v| !v.is_empty())?;
        parse_kubernetes_duration(value)
            .err()
            .map(|e| format!("credRotationPolicy.{field}: {e}"))
    })
}

/// Reasons a binding change is refused, `None` when allowed
pub fn validate_binding(
    operation: &Operation,
    incoming: Option<&ServiceBinding>,
    old: Option<&ServiceBinding>,
) -> Option<String> {
    let new = match operation {
        Operation::Create | Operation::Update => incoming?,
        _ => return None,
    };

    if let Some(reason) = validate_rotation_policy(&new.spec) {
        return Some(reason);
    }
    if let Some(source) = new.spec.secret_template.as_deref() {
        if let Err(e) = validate_template(source) {
            return Some(format!("secretTemplate is invalid: {e}"));
        }
    }

    let (Operation::Update, Some(old)) = (operation, old) else {
        return None;
    };

    // Defaulting stamps the requester whenever the rest of the spec changed, so
    // only a userInfo rewrite on an otherwise unchanged spec is a user edit
    let new_user = new.spec.user_info.as_ref().filter(|u| !u.is_empty());
    if new_user.is_some()
        && new.spec.user_info != old.spec.user_info
        && without_user_info(&old.spec) == without_user_info(&new.spec)
    {
        return Some("modifying spec.userInfo is not allowed".to_string());
    }

    let frozen = old.binding_id().is_some() || old.labels().contains_key(LABEL_STALE_BINDING_ID);
    if frozen && frozen_fields(&old.spec) != frozen_fields(&new.spec) {
        return Some(IMMUTABLE_SPEC_MESSAGE.to_string());
    }
    None
}

pub(super) fn mutate(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let decoded = typed::<ServiceBinding>(KIND, request.object.as_ref()).and_then(|new| {
        typed::<ServiceBinding>(KIND, request.old_object.as_ref()).map(|old| (new, old))
    });
    let (incoming, old) = match decoded {
        Ok((Some(incoming), old)) => (incoming, old),
        Ok((None, _)) => return AdmissionResponse::from(request),
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "Rejecting undecodable ServiceBinding");
            return AdmissionResponse::from(request).deny(e.to_string());
        }
    };

    let defaulted = default_binding(&request.operation, &incoming, old.as_ref(), requester(request));
    debug!(uid = %request.uid, resource.name = %incoming.name_any(), "Defaulted ServiceBinding");
    patch_response(request, &incoming, &defaulted)
}

pub(super) fn validate(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let decoded = typed::<ServiceBinding>(KIND, request.object.as_ref()).and_then(|new| {
        typed::<ServiceBinding>(KIND, request.old_object.as_ref()).map(|old| (new, old))
    });
    let (incoming, old) = match decoded {
        Ok(pair) => pair,
        Err(e) => return AdmissionResponse::from(request).deny(e.to_string()),
    };

    match validate_binding(&request.operation, incoming.as_ref(), old.as_ref()) {
        Some(reason) => {
            warn!(uid = %request.uid, name = %request.name, %reason, "Denied ServiceBinding change");
            AdmissionResponse::from(request).deny(reason)
        }
        None => AdmissionResponse::from(request),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CredentialsRotationPolicy, ServiceBindingStatus};

    fn binding(name: &str) -> ServiceBinding {
        ServiceBinding::new(
            name,
            ServiceBindingSpec {
                service_instance_name: "q".into(),
                ..Default::default()
            },
        )
    }

    fn bound(name: &str) -> ServiceBinding {
        let mut b = binding(name);
        b.status = Some(ServiceBindingStatus {
            binding_id: Some("b-1".into()),
            ..Default::default()
        });
        b
    }

    #[test]
    fn defaults_names_and_rotation_durations() {
        let mut b = binding("creds");
        b.spec.cred_rotation_policy = Some(CredentialsRotationPolicy {
            enabled: true,
            ..Default::default()
        });
        let out = default_binding(&Operation::Create, &b, None, UserInfo::default());
        assert_eq!(out.spec.external_name.as_deref(), Some("creds"));
        assert_eq!(out.spec.secret_name.as_deref(), Some("creds"));
        let policy = out.spec.cred_rotation_policy.unwrap();
        assert_eq!(policy.rotation_frequency.as_deref(), Some("72h"));
        assert_eq!(policy.rotated_binding_ttl.as_deref(), Some("48h"));
    }

    #[test]
    fn bound_spec_change_is_denied() {
        let old = bound("creds");
        let mut new = old.clone();
        new.spec.secret_key = Some("payload".into());
        assert_eq!(
            validate_binding(&Operation::Update, Some(&new), Some(&old)).as_deref(),
            Some(IMMUTABLE_SPEC_MESSAGE)
        );
    }

    #[test]
    fn bound_rotation_policy_and_template_may_change() {
        let old = bound("creds");
        let mut new = old.clone();
        new.spec.cred_rotation_policy = Some(CredentialsRotationPolicy {
            enabled: true,
            rotation_frequency: Some("1h".into()),
            rotated_binding_ttl: Some("30m".into()),
        });
        new.spec.secret_template = Some("apiVersion: v1\nkind: Secret\n".into());
        assert!(validate_binding(&Operation::Update, Some(&new), Some(&old)).is_none());
    }

    #[test]
    fn unbound_spec_may_change() {
        let old = binding("creds");
        let mut new = old.clone();
        new.spec.secret_key = Some("payload".into());
        assert!(validate_binding(&Operation::Update, Some(&new), Some(&old)).is_none());
    }

    #[test]
    fn stale_copy_is_frozen() {
        let mut old = binding("creds-1a2b3c4d");
        old.labels_mut()
            .insert(LABEL_STALE_BINDING_ID.into(), "b-0".into());
        let mut new = old.clone();
        new.spec.parameters = Some(serde_json::json!({"x": 1}));
        assert!(validate_binding(&Operation::Update, Some(&new), Some(&old)).is_some());
    }

    #[test]
    fn invalid_duration_is_denied() {
        let mut b = binding("creds");
        b.spec.cred_rotation_policy = Some(CredentialsRotationPolicy {
            enabled: true,
            rotation_frequency: Some("often".into()),
            rotated_binding_ttl: None,
        });
        let reason = validate_binding(&Operation::Create, Some(&b), None).unwrap();
        assert!(reason.contains("rotationFrequency"));
    }

    #[test]
    fn user_info_rewrite_is_denied_but_clearing_is_allowed() {
        let mut old = binding("creds");
        old.spec.user_info = Some(UserInfo {
            username: Some("alice".into()),
            ..Default::default()
        });
        let mut new = old.clone();
        new.spec.user_info = Some(UserInfo {
            username: Some("mallory".into()),
            ..Default::default()
        });
        assert!(validate_binding(&Operation::Update, Some(&new), Some(&old)).is_some());

        new.spec.user_info = None;
        assert!(validate_binding(&Operation::Update, Some(&new), Some(&old)).is_none());
    }

    #[test]
    fn spec_edit_by_another_user_passes_after_defaulting() {
        let mut old = bound("creds");
        old.spec.user_info = Some(UserInfo {
            username: Some("alice".into()),
            ..Default::default()
        });
        let mut edited = old.clone();
        edited.spec.secret_template = Some("apiVersion: v1\nkind: Secret\n".into());
        let bob = UserInfo {
            username: Some("bob".into()),
            ..Default::default()
        };

        let defaulted = default_binding(&Operation::Update, &edited, Some(&old), bob.clone());
        assert_eq!(defaulted.spec.user_info, Some(bob));
        assert!(validate_binding(&Operation::Update, Some(&defaulted), Some(&old)).is_none());
    }
}
