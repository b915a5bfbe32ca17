//! # Credential Rotation
//!
//! Rotation runs in two phases recorded on the `CredRotationInProgress` condition:
//!
//! - **Preparing**: the current SM binding is handed to a stale copy of the resource
//!   (`<name>-<short>`, labelled with the old binding ID and a `valid-until`
//!   annotation) together with a copy of its secret.
//! - **Rotating**: the primary resource forgets its binding ID and binds again; the
//!   fresh credentials replace the primary secret.
//!
//! Stale copies are deleted once `valid-until` has passed, which unbinds the old
//! credentials through the normal deletion path.

use crate::constants::{
    ANNOTATION_VALID_UNTIL, DEFAULT_ROTATED_BINDING_TTL, DEFAULT_ROTATION_FREQUENCY, FINALIZER,
    LABEL_MANAGED_SECRET, LABEL_ROTATION_OF, LABEL_STALE_BINDING_ID,
};
use crate::controller::conditions::{
    find_condition, remove_condition, rotation_phase, CONDITION_CRED_ROTATION_IN_PROGRESS,
    REASON_ROTATION_PREPARING, REASON_ROTATION_ROTATING,
};
use crate::controller::duration::parse_kubernetes_duration;
use crate::controller::reconciler::status::write_status;
use crate::controller::reconciler::types::ReconcilerError;
use crate::crd::{ServiceBinding, ServiceBindingSpec, ServiceBindingStatus};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Phase of an ongoing rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    Preparing,
    Rotating,
}

impl RotationPhase {
    pub fn of(status: &ServiceBindingStatus) -> Option<Self> {
        match rotation_phase(&status.conditions) {
            Some(REASON_ROTATION_PREPARING) => Some(RotationPhase::Preparing),
            Some(REASON_ROTATION_ROTATING) => Some(RotationPhase::Rotating),
            _ => None,
        }
    }
}

fn policy_duration(value: Option<&str>, default: &str) -> Duration {
    value
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| match parse_kubernetes_duration(v) {
            Ok(duration) => Some(duration),
            Err(e) => {
                warn!(value = %v, error = %e, "Invalid rotation duration, using default");
                None
            }
        })
        .or_else(|| parse_kubernetes_duration(default).ok())
        .unwrap_or_default()
}

pub fn rotation_frequency(binding: &ServiceBinding) -> Duration {
    let policy = binding.spec.cred_rotation_policy.as_ref();
    policy_duration(
        policy.and_then(|p| p.rotation_frequency.as_deref()),
        DEFAULT_ROTATION_FREQUENCY,
    )
}

pub fn rotated_binding_ttl(binding: &ServiceBinding) -> Duration {
    let policy = binding.spec.cred_rotation_policy.as_ref();
    policy_duration(
        policy.and_then(|p| p.rotated_binding_ttl.as_deref()),
        DEFAULT_ROTATED_BINDING_TTL,
    )
}

/// Whether a bound, idle binding should start rotating now
///
/// Rotation is due when forced through the annotation, or when the policy is
/// enabled and the frequency has elapsed since the last rotation (or creation).
pub fn rotation_due(binding: &ServiceBinding, status: &ServiceBindingStatus, now: DateTime<Utc>) -> bool {
    if binding.is_stale() || status.binding_id.as_deref().unwrap_or_default().is_empty() {
        return false;
    }
    if binding.force_rotate_requested() {
        return true;
    }
    let enabled = binding
        .spec
        .cred_rotation_policy
        .as_ref()
        .is_some_and(|p| p.enabled);
    if !enabled {
        return false;
    }

    let last = status
        .last_credentials_rotation_time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .or_else(|| binding.metadata.creation_timestamp.as_ref().map(|t| t.0));
    let Some(last) = last else {
        return false;
    };
    now.signed_duration_since(last)
        .to_std()
        .is_ok_and(|elapsed| elapsed > rotation_frequency(binding))
}

/// Short, stable suffix derived from a binding ID
pub fn short_id(binding_id: &str) -> String {
    format!("{:x}", md5::compute(binding_id.as_bytes()))
        .chars()
        .take(8)
        .collect()
}

/// SM name of the binding a rotation creates
///
/// Derived from when the rotation started, which is persisted in `Preparing`
/// before anything is bound, so a pass resumed after a crash looks for the same
/// name instead of binding under a new one.
pub fn rotation_binding_name(binding: &ServiceBinding, status: &ServiceBindingStatus) -> String {
    let started = find_condition(&status.conditions, CONDITION_CRED_ROTATION_IN_PROGRESS)
        .and_then(|c| c.last_transition_time.as_deref())
        .unwrap_or_default();
    format!("{}-{}", binding.external_name(), short_id(started))
}

/// `valid-until` of a stale binding
pub fn valid_until(binding: &ServiceBinding) -> Option<DateTime<Utc>> {
    binding
        .annotations()
        .get(ANNOTATION_VALID_UNTIL)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// The stale copy that keeps the current SM binding alive for its TTL
pub fn stale_binding(
    binding: &ServiceBinding,
    binding_id: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> ServiceBinding {
    let short = short_id(binding_id);
    let name = binding.name_any();
    let valid_until = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_STALE_BINDING_ID.to_string(), binding_id.to_string());
    labels.insert(LABEL_ROTATION_OF.to_string(), name.clone());
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_VALID_UNTIL.to_string(), valid_until.to_rfc3339());

    let spec = ServiceBindingSpec {
        secret_name: Some(format!("{}-{short}", binding.secret_name())),
        cred_rotation_policy: None,
        watch_parameters_from_changes: None,
        ..binding.spec.clone()
    };

    let mut stale = ServiceBinding::new(&format!("{name}-{short}"), spec);
    stale.metadata = ObjectMeta {
        name: Some(format!("{name}-{short}")),
        namespace: binding.namespace(),
        labels: Some(labels),
        annotations: Some(annotations),
        finalizers: Some(vec![FINALIZER.to_string()]),
        ..ObjectMeta::default()
    };
    stale
}

/// Status handed to the stale copy: the old binding, already bound
pub fn stale_status(status: &ServiceBindingStatus) -> ServiceBindingStatus {
    let mut stale = status.clone();
    stale.operation_url = None;
    stale.last_credentials_rotation_time = None;
    remove_condition(&mut stale.conditions, CONDITION_CRED_ROTATION_IN_PROGRESS);
    stale
}

/// Copy of the primary secret, owned by the stale binding
pub fn stale_secret(primary: &Secret, stale: &ServiceBinding) -> Secret {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_SECRET.to_string(), "true".to_string());
    Secret {
        metadata: ObjectMeta {
            name: Some(stale.secret_name()),
            namespace: stale.namespace(),
            labels: Some(labels),
            owner_references: stale.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..ObjectMeta::default()
        },
        data: primary.data.clone(),
        type_: primary.type_.clone(),
        ..Secret::default()
    }
}

/// Hand the current SM binding and its secret to a stale copy
///
/// Every step tolerates having run before, so a crash anywhere in between resumes
/// from `Preparing`.
pub async fn prepare_rotation(
    client: &kube::Client,
    binding: &ServiceBinding,
    status: &ServiceBindingStatus,
    now: DateTime<Utc>,
) -> Result<(), ReconcilerError> {
    let Some(binding_id) = status.binding_id.as_deref().filter(|id| !id.is_empty()) else {
        return Ok(());
    };
    let namespace = binding.namespace().unwrap_or_default();
    let bindings: Api<ServiceBinding> = Api::namespaced(client.clone(), &namespace);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);

    let desired = stale_binding(binding, binding_id, now, rotated_binding_ttl(binding));
    let stale_name = desired.name_any();
    let stale = match bindings.create(&PostParams::default(), &desired).await {
        Ok(created) => {
            info!(stale = %stale_name, binding.id = %binding_id, "Created stale binding for rotation");
            created
        }
        Err(kube::Error::Api(response)) if response.code == 409 => bindings.get(&stale_name).await?,
        Err(e) => return Err(e.into()),
    };
    write_status(&bindings, &stale, &stale_status(status)).await?;

    if let Some(primary) = secrets.get_opt(&binding.secret_name()).await? {
        let copy = stale_secret(&primary, &stale);
        match secrets.create(&PostParams::default(), &copy).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 409 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CredentialsRotationPolicy;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    fn binding(policy: Option<CredentialsRotationPolicy>) -> ServiceBinding {
        let mut binding = ServiceBinding::new(
            "creds",
            ServiceBindingSpec {
                service_instance_name: "queue".to_string(),
                cred_rotation_policy: policy,
                ..ServiceBindingSpec::default()
            },
        );
        binding.metadata.namespace = Some("default".to_string());
        binding.metadata.uid = Some("uid-1".to_string());
        binding.metadata.creation_timestamp = Some(Time(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        binding
    }

    fn bound() -> ServiceBindingStatus {
        ServiceBindingStatus {
            binding_id: Some("b-1".to_string()),
            ..ServiceBindingStatus::default()
        }
    }

    fn policy(frequency: &str) -> Option<CredentialsRotationPolicy> {
        Some(CredentialsRotationPolicy {
            enabled: true,
            rotation_frequency: Some(frequency.to_string()),
            rotated_binding_ttl: Some("1h".to_string()),
        })
    }

    #[test]
    fn test_rotation_due_after_frequency() {
        assert!(rotation_due(&binding(policy("1h")), &bound(), now()));
        assert!(!rotation_due(&binding(policy("24h")), &bound(), now()));
        assert!(!rotation_due(&binding(None), &bound(), now()));
        assert!(!rotation_due(&binding(policy("1h")), &ServiceBindingStatus::default(), now()));
    }

    #[test]
    fn test_rotation_due_uses_last_rotation_time() {
        let mut status = bound();
        status.last_credentials_rotation_time = Some("2025-01-01T11:30:00Z".to_string());
        assert!(!rotation_due(&binding(policy("1h")), &status, now()));
    }

    #[test]
    fn test_force_rotate_ignores_schedule() {
        let mut binding = binding(None);
        binding
            .annotations_mut()
            .insert(crate::constants::ANNOTATION_FORCE_ROTATE.to_string(), "true".to_string());
        assert!(rotation_due(&binding, &bound(), now()));
    }

    #[test]
    fn test_stale_binding_shape() {
        let binding = binding(policy("1h"));
        let stale = stale_binding(&binding, "b-1", now(), Duration::from_secs(3600));
        let short = short_id("b-1");
        assert_eq!(short.len(), 8);
        assert_eq!(stale.name_any(), format!("creds-{short}"));
        assert_eq!(stale.secret_name(), format!("creds-{short}"));
        assert!(stale.is_stale());
        assert_eq!(stale.labels().get(LABEL_ROTATION_OF).map(String::as_str), Some("creds"));
        assert_eq!(valid_until(&stale), Some(now() + chrono::Duration::hours(1)));
        assert!(stale.spec.cred_rotation_policy.is_none());
        assert!(!rotation_due(&stale, &bound(), now()));
    }

    #[test]
    fn test_stale_status_drops_rotation_state() {
        let mut status = bound();
        status.operation_url = Some("/op".to_string());
        crate::controller::conditions::set_rotation_phase(
            &mut status.conditions,
            REASON_ROTATION_PREPARING,
            1,
            now(),
        );
        assert_eq!(RotationPhase::of(&status), Some(RotationPhase::Preparing));
        let stale = stale_status(&status);
        assert_eq!(stale.binding_id.as_deref(), Some("b-1"));
        assert!(stale.operation_url.is_none());
        assert_eq!(RotationPhase::of(&stale), None);
    }
}
