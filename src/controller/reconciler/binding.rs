//! # ServiceBinding Reconciler
//!
//! A binding waits for its instance to be ready, binds once, and keeps the owned
//! credentials secret in line with the SM binding. The bound spec is immutable
//! apart from the rotation policy and the secret template. Rotation rebinds under
//! the same resource after handing the old binding to a stale copy (see
//! [`rotation`](super::rotation)).

use crate::constants::{ANNOTATION_FORCE_ROTATE, DEFAULT_BLOCKED_REQUEUE_SECS, FINALIZER, LABEL_STALE_BINDING_ID};
use crate::controller::conditions::{
    self, find_condition, is_condition_true, remove_condition, set_rotation_phase,
    CONDITION_CRED_ROTATION_IN_PROGRESS, CONDITION_SUCCEEDED, REASON_ROTATION_PREPARING,
    REASON_ROTATION_ROTATING,
};
use crate::controller::credentials::{resolve_credentials, CredentialsLookup};
use crate::controller::materializer::{build_secret, materialize, secret_differs, SecretContent};
use crate::controller::parameters::{parameter_secret_names, resolve_parameters, ResolvedParameters};
use crate::controller::reconciler::instance::{register_binding, unregister_binding};
use crate::controller::reconciler::outcome::{
    apply_error, failed_for_generation, ignore_window_open, poll_operation, Next, OperationTracking,
    PassContext,
};
use crate::controller::reconciler::rotation::{
    prepare_rotation, rotation_binding_name, rotation_due, valid_until, RotationPhase,
};
use crate::controller::reconciler::status::{add_finalizer, patch_annotation, remove_finalizer, write_status};
use crate::controller::reconciler::types::{resource_key, Reconciler, ReconcilerError};
use crate::controller::secret_watch::{sync_secret_watches, unwatch_secrets};
use crate::crd::{OperationType, ServiceBinding, ServiceBindingSpec, ServiceBindingStatus, ServiceInstance};
use crate::observability::metrics;
use crate::provider::{
    correlation_labels, operation_url, BindRequest, ListQuery, OperationState, ServiceManagerClient,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

pub const KIND: &str = "ServiceBinding";

/// Reported when a bound binding's spec changed outside the mutable fields
pub const IMMUTABLE_SPEC_MESSAGE: &str = "updating service bindings is not supported";

/// md5 of the spec fields that are immutable once bound
pub fn binding_spec_hash(spec: &ServiceBindingSpec) -> Result<String, serde_json::Error> {
    let mut hashed = spec.clone();
    hashed.cred_rotation_policy = None;
    hashed.secret_template = None;
    hashed.user_info = None;
    let bytes = serde_json::to_vec(&hashed)?;
    Ok(format!("{:x}", md5::compute(bytes)))
}

/// Outcome of a binding pass: how to continue, and secret content to write
#[derive(Debug, Clone, PartialEq)]
pub struct BindingPass {
    pub next: Next,
    pub secret: Option<SecretContent>,
}

impl From<Next> for BindingPass {
    fn from(next: Next) -> Self {
        BindingPass { next, secret: None }
    }
}

fn binding_id(status: &ServiceBindingStatus) -> Option<String> {
    status
        .binding_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// SM binding name a rotation binds under; the previous binding keeps the same
/// correlation labels, so recovery during a rotation only adopts this name
fn rotation_target(binding: &ServiceBinding, status: &ServiceBindingStatus) -> Option<String> {
    (RotationPhase::of(status) == Some(RotationPhase::Rotating))
        .then(|| rotation_binding_name(binding, status))
}

/// Name of the SM binding; rebinding during rotation needs a fresh one
fn sm_binding_name(binding: &ServiceBinding, status: &ServiceBindingStatus) -> String {
    rotation_target(binding, status).unwrap_or_else(|| binding.external_name())
}

/// Whether credentials have to be fetched and written again
fn credentials_stale(status: &ServiceBindingStatus, generation: i64, secret_present: bool) -> bool {
    if !secret_present || !is_condition_true(&status.conditions, CONDITION_SUCCEEDED) {
        return true;
    }
    find_condition(&status.conditions, CONDITION_SUCCEEDED).and_then(|c| c.observed_generation)
        != Some(generation)
}

/// Fetch credentials if needed, shape them and mark the binding bound
#[allow(clippy::too_many_arguments)]
async fn complete_bind(
    binding: &ServiceBinding,
    instance: &ServiceInstance,
    status: &mut ServiceBindingStatus,
    sm: &dyn ServiceManagerClient,
    ctx: &PassContext,
    ignore_window: bool,
    spec_hash: String,
    credentials: Option<Value>,
) -> Result<BindingPass, ReconcilerError> {
    let generation = binding.metadata.generation.unwrap_or(0);
    let Some(id) = binding_id(status) else {
        return Ok(Next::Immediate.into());
    };

    let credentials = match credentials {
        Some(credentials) => credentials,
        None => match sm.get_binding(&id).await {
            Ok(record) => record.credentials.unwrap_or(Value::Null),
            Err(e) if e.is_not_found() || e.is_gone() => {
                warn!(binding.id = %id, "ServiceBinding is gone from Service Manager, binding again");
                status.binding_id = None;
                status.hashed_spec = None;
                return Ok(Next::Immediate.into());
            }
            Err(e) => {
                return apply_error(status, OperationType::Create, e.into(), ignore_window, generation, ctx.now)
                    .map(BindingPass::from)
            }
        },
    };

    let content = match materialize(binding, instance, &credentials, ctx.max_secret_bytes) {
        Ok(content) => content,
        Err(e) => {
            return apply_error(status, OperationType::Create, e.into(), ignore_window, generation, ctx.now)
                .map(BindingPass::from)
        }
    };

    status.hashed_spec = Some(spec_hash);
    status.operation_type = Some(OperationType::Create);
    conditions::set_success(
        status,
        OperationType::Create,
        "ServiceBinding provisioned successfully",
        generation,
        ctx.now,
    );
    if RotationPhase::of(status) == Some(RotationPhase::Rotating) {
        status.last_credentials_rotation_time = Some(ctx.now.to_rfc3339());
        remove_condition(&mut status.conditions, CONDITION_CRED_ROTATION_IN_PROGRESS);
    }
    Ok(BindingPass {
        next: Next::Done,
        secret: Some(content),
    })
}

/// Take back the bound outcome of a pass whose credentials secret was not written
///
/// Conditions and the rotation stamp return to their state before the pass and
/// `Ready` turns false, so the next pass fetches and writes the credentials again.
pub fn secret_write_failed(
    status: &mut ServiceBindingStatus,
    before: &ServiceBindingStatus,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    let message = message.into();
    status.conditions = before.conditions.clone();
    status.observed_generation = before.observed_generation;
    status.last_credentials_rotation_time = before.last_credentials_rotation_time.clone();
    conditions::set_in_progress(status, OperationType::Create, message.clone(), now);
    conditions::set_not_ready(status, message, now);
}

/// Adopt the SM binding carrying this resource's correlation labels
///
/// While rotating only the binding named after the rotation qualifies.
async fn recover(
    binding: &ServiceBinding,
    status: &mut ServiceBindingStatus,
    sm: &dyn ServiceManagerClient,
    ctx: &PassContext,
) -> Result<Option<Option<Value>>, ReconcilerError> {
    let query = ListQuery::correlation(
        &binding.namespace().unwrap_or_default(),
        &binding.name_any(),
        &ctx.cluster_id,
    );
    let target = rotation_target(binding, status);
    for record in sm.list_bindings(&query).await? {
        if !query.matches(&record.labels) {
            continue;
        }
        if target.as_deref().is_some_and(|name| record.name != name) {
            continue;
        }
        match record.last_operation.as_ref() {
            Some(op) if op.state == OperationState::Failed => {
                warn!(binding.id = %record.id, "Removing failed ServiceBinding found in Service Manager");
                if let Err(e) = sm.unbind(&record.id).await {
                    warn!(binding.id = %record.id, error = %e, "Failed to remove failed ServiceBinding");
                }
                continue;
            }
            Some(op) if !op.state.is_terminal() => {
                info!(binding.id = %record.id, "Recovered in-flight ServiceBinding from Service Manager");
                status.binding_id = Some(record.id.clone());
                status.start_operation(
                    operation_url("service_bindings", &record.id, &op.id),
                    OperationType::Create,
                );
                conditions::set_in_progress(status, OperationType::Create, "recovered in-flight operation", ctx.now);
                return Ok(Some(None));
            }
            _ => {
                info!(binding.id = %record.id, "Recovered ServiceBinding from Service Manager");
                status.binding_id = Some(record.id.clone());
                return Ok(Some(record.credentials));
            }
        }
    }
    Ok(None)
}

/// Run one pass for a live, non-stale binding whose instance exists
pub async fn drive_binding(
    binding: &ServiceBinding,
    instance: &ServiceInstance,
    status: &mut ServiceBindingStatus,
    parameters: &ResolvedParameters,
    secret_present: bool,
    sm: &dyn ServiceManagerClient,
    ctx: &PassContext,
) -> Result<BindingPass, ReconcilerError> {
    let generation = binding.metadata.generation.unwrap_or(0);
    let ignore_window = ignore_window_open(binding.annotations(), ctx.ignore_non_transient_timeout, ctx.now);
    let spec_hash = binding_spec_hash(&binding.spec)?;

    if failed_for_generation(status, generation) {
        debug!("Last attempt for this generation failed, waiting for a change");
        return Ok(Next::Done.into());
    }

    conditions::begin_attempt(status);

    if let Some(url) = status.operation_url().map(str::to_string) {
        let operation_type = status.operation_type.unwrap_or(OperationType::Create);
        let operation = match poll_operation(sm, &url).await {
            Ok(operation) => operation,
            Err(e) => {
                return apply_error(status, operation_type, e.into(), ignore_window, generation, ctx.now)
                    .map(BindingPass::from)
            }
        };
        let Some(operation) = operation else {
            warn!(operation.url = %url, "Operation no longer known to Service Manager");
            status.clear_operation();
            return Ok(Next::Immediate.into());
        };
        match operation.state {
            OperationState::InProgress | OperationState::Pending => {
                let message = format!("{} is in progress", operation_type.as_str());
                conditions::set_in_progress(status, operation_type, message, ctx.now);
                return Ok(Next::Poll.into());
            }
            OperationState::Succeeded => {
                status.clear_operation();
                if operation_type == OperationType::Create {
                    if binding_id(status).is_none() && !operation.resource_id.is_empty() {
                        status.binding_id = Some(operation.resource_id.clone());
                    }
                    return complete_bind(binding, instance, status, sm, ctx, ignore_window, spec_hash, None)
                        .await;
                }
            }
            OperationState::Failed => {
                status.clear_operation();
                if operation_type == OperationType::Create {
                    status.binding_id = None;
                    status.hashed_spec = None;
                }
                let error = ReconcilerError::operation_failed(operation_type, operation.failure_message());
                return apply_error(status, operation_type, error, ignore_window, generation, ctx.now)
                    .map(BindingPass::from);
            }
        }
    }

    if binding_id(status).is_some()
        && status.hashed_spec.as_deref().is_some_and(|hash| hash != spec_hash)
    {
        warn!("Bound ServiceBinding spec changed");
        conditions::set_blocked(status, IMMUTABLE_SPEC_MESSAGE, generation, ctx.now);
        return Ok(Next::Done.into());
    }

    if binding_id(status).is_none() {
        match recover(binding, status, sm, ctx).await {
            Ok(Some(_)) if status.operation_url().is_some() => return Ok(Next::Poll.into()),
            Ok(Some(credentials)) => {
                return complete_bind(binding, instance, status, sm, ctx, ignore_window, spec_hash, credentials)
                    .await
            }
            Ok(None) => {}
            Err(e) => {
                return apply_error(status, OperationType::Create, e, ignore_window, generation, ctx.now)
                    .map(BindingPass::from)
            }
        }
    }

    if binding_id(status).is_none() {
        let Some(instance_id) = instance.instance_id() else {
            conditions::set_blocked(status, "service instance is not provisioned", generation, ctx.now);
            return Ok(Next::After(Duration::from_secs(DEFAULT_BLOCKED_REQUEUE_SECS)).into());
        };
        let request = BindRequest {
            name: sm_binding_name(binding, status),
            instance_id: instance_id.to_string(),
            parameters: parameters.values.clone(),
            labels: correlation_labels(
                &binding.namespace().unwrap_or_default(),
                &binding.name_any(),
                &ctx.cluster_id,
            ),
        };
        info!(instance.id = %instance_id, binding.name = %request.name, "Binding to ServiceInstance");

        let response = match sm.bind(&request).await {
            Ok(response) => response,
            Err(e) => {
                return apply_error(status, OperationType::Create, e.into(), ignore_window, generation, ctx.now)
                    .map(BindingPass::from)
            }
        };
        if !response.binding_id.is_empty() {
            status.binding_id = Some(response.binding_id.clone());
        }
        status.instance_id = Some(instance_id.to_string());
        status.parameters_hash = parameters.from_hash.clone();

        if let Some(url) = response.operation_url {
            status.hashed_spec = Some(spec_hash);
            status.start_operation(url, OperationType::Create);
            conditions::set_in_progress(status, OperationType::Create, "Binding is in progress", ctx.now);
            return Ok(Next::Poll.into());
        }
        return complete_bind(binding, instance, status, sm, ctx, ignore_window, spec_hash, response.credentials)
            .await;
    }

    if credentials_stale(status, generation, secret_present) {
        debug!("Refreshing binding credentials");
        return complete_bind(binding, instance, status, sm, ctx, ignore_window, spec_hash, None).await;
    }

    conditions::set_finished(status, generation, ctx.now);
    Ok(Next::Done.into())
}

/// SM binding to remove on deletion; stale copies carry it in a label
fn deletion_binding_id(binding: &ServiceBinding, status: &ServiceBindingStatus) -> Option<String> {
    binding_id(status).or_else(|| {
        binding
            .labels()
            .get(LABEL_STALE_BINDING_ID)
            .filter(|id| !id.is_empty())
            .cloned()
    })
}

/// Run one pass for a binding being deleted
pub async fn drive_binding_deletion(
    binding: &ServiceBinding,
    status: &mut ServiceBindingStatus,
    sm: &dyn ServiceManagerClient,
    ctx: &PassContext,
) -> Result<Next, ReconcilerError> {
    let generation = binding.metadata.generation.unwrap_or(0);
    let ignore_window = ignore_window_open(binding.annotations(), ctx.ignore_non_transient_timeout, ctx.now);

    conditions::begin_attempt(status);

    if let Some(url) = status.operation_url().map(str::to_string) {
        let operation_type = status.operation_type.unwrap_or(OperationType::Create);
        match poll_operation(sm, &url).await {
            Ok(Some(op)) if !op.state.is_terminal() => {
                debug!(operation.url = %url, "Waiting for running operation");
                if operation_type == OperationType::Delete {
                    conditions::set_in_progress(status, OperationType::Delete, "Unbinding is in progress", ctx.now);
                }
                return Ok(Next::Poll);
            }
            Ok(Some(op)) if operation_type == OperationType::Delete => {
                status.clear_operation();
                if op.state == OperationState::Succeeded {
                    return Ok(Next::RemoveFinalizer);
                }
                let error = ReconcilerError::operation_failed(OperationType::Delete, op.failure_message());
                return apply_error(status, OperationType::Delete, error, ignore_window, generation, ctx.now);
            }
            Ok(_) => status.clear_operation(),
            Err(e) => {
                return apply_error(status, OperationType::Delete, e.into(), ignore_window, generation, ctx.now)
            }
        }
    }

    let id = match deletion_binding_id(binding, status) {
        Some(id) => id,
        None if binding.is_stale() => return Ok(Next::RemoveFinalizer),
        None => match recover(binding, status, sm, ctx).await {
            Ok(Some(_)) if status.operation_url().is_some() => return Ok(Next::Poll),
            Ok(Some(_)) => match binding_id(status) {
                Some(id) => id,
                None => return Ok(Next::RemoveFinalizer),
            },
            Ok(None) => return Ok(Next::RemoveFinalizer),
            Err(e) => {
                return apply_error(status, OperationType::Delete, e, ignore_window, generation, ctx.now)
            }
        },
    };

    info!(binding.id = %id, "Unbinding ServiceBinding");
    match sm.unbind(&id).await {
        Ok(Some(url)) => {
            status.start_operation(url, OperationType::Delete);
            conditions::set_in_progress(status, OperationType::Delete, "Unbinding is in progress", ctx.now);
            Ok(Next::Poll)
        }
        Ok(None) => {
            conditions::set_success(status, OperationType::Delete, "ServiceBinding deleted", generation, ctx.now);
            Ok(Next::RemoveFinalizer)
        }
        Err(e) if e.is_not_found() || e.is_gone() => {
            debug!(binding.id = %id, "ServiceBinding already gone from Service Manager");
            Ok(Next::RemoveFinalizer)
        }
        Err(e) => apply_error(status, OperationType::Delete, e.into(), ignore_window, generation, ctx.now),
    }
}

/// Whether `secret` is the credentials secret of `binding`
fn owned_by(secret: &Secret, binding: &ServiceBinding) -> bool {
    let Some(uid) = binding.uid() else {
        return false;
    };
    secret
        .owner_references()
        .iter()
        .any(|owner| owner.uid == uid)
}

async fn write_secret(
    api: &Api<Secret>,
    binding: &ServiceBinding,
    existing: Option<&Secret>,
    content: SecretContent,
) -> Result<(), kube::Error> {
    let mut desired = build_secret(binding, content);
    match existing {
        Some(existing) if !secret_differs(existing, &desired) => {
            debug!(secret = %desired.name_any(), "Credentials secret is up to date");
            return Ok(());
        }
        Some(existing) => {
            let mut labels = existing.labels().clone();
            labels.extend(desired.labels().clone());
            let mut annotations = existing.annotations().clone();
            annotations.extend(desired.annotations().clone());
            desired.metadata.labels = Some(labels);
            desired.metadata.annotations = Some(annotations);
            desired.metadata.resource_version = existing.resource_version();
            api.replace(&desired.name_any(), &PostParams::default(), &desired)
                .await?;
        }
        None => {
            api.create(&PostParams::default(), &desired).await?;
        }
    }
    info!(secret = %desired.name_any(), "Wrote credentials secret");
    metrics::increment_secrets_written();
    Ok(())
}

/// Delete the credentials secret if this binding owns it
async fn delete_secret(api: &Api<Secret>, binding: &ServiceBinding) -> Result<(), kube::Error> {
    let name = binding.secret_name();
    let Some(secret) = api.get_opt(&name).await? else {
        return Ok(());
    };
    if !owned_by(&secret, binding) {
        return Ok(());
    }
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(e) => Err(e),
    }
}

/// Bindings use the SM credentials of their instance
fn credentials_lookup<'a>(namespace: &'a str, instance: Option<&'a ServiceInstance>) -> CredentialsLookup<'a> {
    CredentialsLookup {
        namespace,
        pinned: instance
            .and_then(|i| i.status.as_ref())
            .and_then(|s| s.secret_ref.as_ref()),
        btp_access_secret: instance.and_then(|i| i.spec.btp_access_credentials_secret.as_deref()),
    }
}

/// Controller entry point for ServiceBinding
pub async fn reconcile_binding(
    binding: Arc<ServiceBinding>,
    reconciler: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let start = Instant::now();
    metrics::increment_reconciliations(KIND);
    let span = info_span!(
        "reconcile",
        resource.kind = KIND,
        resource.namespace = %binding.namespace().unwrap_or_default(),
        resource.name = %binding.name_any(),
        resource.generation = binding.metadata.generation.unwrap_or(0),
    );
    let result = reconcile_binding_inner(&binding, &reconciler)
        .instrument(span)
        .await;
    metrics::observe_reconciliation_duration(KIND, start.elapsed().as_secs_f64());
    result
}

async fn reconcile_binding_inner(
    binding: &ServiceBinding,
    reconciler: &Reconciler,
) -> Result<Action, ReconcilerError> {
    let namespace = binding.namespace().unwrap_or_default();
    let name = binding.name_any();
    let key = resource_key(KIND, &namespace, &name);
    let api: Api<ServiceBinding> = Api::namespaced(reconciler.client.clone(), &namespace);
    let instances: Api<ServiceInstance> = Api::namespaced(reconciler.client.clone(), &namespace);
    let secrets: Api<Secret> = Api::namespaced(reconciler.client.clone(), &namespace);
    let config = &reconciler.config;
    let ctx = PassContext {
        cluster_id: config.cluster_id.clone(),
        ignore_non_transient_timeout: config.ignore_non_transient_timeout,
        max_secret_bytes: config.max_secret_bytes,
        now: Utc::now(),
    };
    let generation = binding.metadata.generation.unwrap_or(0);
    let mut status = binding.status.clone().unwrap_or_default();
    let blocked_requeue = Action::requeue(Duration::from_secs(DEFAULT_BLOCKED_REQUEUE_SECS));

    let instance = instances.get_opt(&binding.spec.service_instance_name).await?;

    if binding.metadata.deletion_timestamp.is_some() {
        if !binding.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(Action::await_change());
        }

        let lookup = credentials_lookup(&namespace, instance.as_ref());
        let next = match resolve_credentials(reconciler.secrets.as_ref(), config, lookup).await {
            Ok(resolved) => {
                let sm = reconciler.clients.client(&resolved.config)?;
                drive_binding_deletion(binding, &mut status, sm.as_ref(), &ctx).await
            }
            Err(e) if deletion_binding_id(binding, &status).is_none() && status.operation_url().is_none() => {
                warn!(error = %e, "No credentials to clean up a binding that was never bound");
                Ok(Next::RemoveFinalizer)
            }
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                conditions::set_blocked(&mut status, e.to_string(), generation, ctx.now);
                write_status(&api, binding, &status).await?;
                return Ok(blocked_requeue);
            }
        };

        if matches!(next, Ok(Next::RemoveFinalizer)) {
            delete_secret(&secrets, binding).await?;
            if let Some(uid) = binding.uid() {
                unwatch_secrets(&reconciler.client, &namespace, &uid).await?;
            }
            if !binding.is_stale() {
                unregister_binding(&instances, &binding.spec.service_instance_name, &name).await?;
            }
            remove_finalizer(&api, binding, FINALIZER).await?;
            reconciler.forget(&key);
            info!("ServiceBinding deleted");
            return Ok(Action::await_change());
        }
        write_status(&api, binding, &status).await?;
        return next.map(|next| reconciler.action_for(&key, status.operation_url(), next));
    }

    let binding = &add_finalizer(&api, binding, FINALIZER).await?;

    if binding.is_stale() {
        return sweep_stale(&api, binding, &ctx).await;
    }

    let instance = match instance {
        Some(instance) if instance.metadata.deletion_timestamp.is_some() => {
            Err(format!("service instance {} is being deleted", instance.name_any()))
        }
        Some(instance) if !instance.is_ready() && status.operation_url().is_none() => {
            Err(format!("service instance {} is not ready", instance.name_any()))
        }
        Some(instance) => Ok(instance),
        None => Err(format!(
            "service instance {} not found",
            binding.spec.service_instance_name
        )),
    };
    let instance = match instance {
        Ok(instance) => instance,
        Err(message) => {
            info!(reason = %message, "ServiceBinding waits for its instance");
            conditions::set_blocked(&mut status, message, generation, ctx.now);
            write_status(&api, binding, &status).await?;
            metrics::increment_requeues_total("instance-not-ready");
            return Ok(blocked_requeue);
        }
    };

    let lookup = credentials_lookup(&namespace, Some(&instance));
    let resolved = match resolve_credentials(reconciler.secrets.as_ref(), config, lookup).await {
        Ok(resolved) => resolved,
        Err(e) if e.is_transient() => return Err(e.into()),
        Err(e) => {
            warn!(error = %e, "Service Manager credentials unavailable");
            conditions::set_blocked(&mut status, e.to_string(), generation, ctx.now);
            write_status(&api, binding, &status).await?;
            return Ok(blocked_requeue);
        }
    };

    let existing_secret = secrets.get_opt(&binding.secret_name()).await?;
    if let Some(existing) = existing_secret.as_ref().filter(|s| !owned_by(s, binding)) {
        let message = format!(
            "secret {} already exists and does not belong to this binding",
            existing.name_any()
        );
        conditions::set_blocked(&mut status, message, generation, ctx.now);
        write_status(&api, binding, &status).await?;
        return Ok(blocked_requeue);
    }

    if let Some(uid) = binding.uid() {
        let watched = if binding.watches_parameters() {
            parameter_secret_names(&binding.spec.parameters_from)
        } else {
            Vec::new()
        };
        sync_secret_watches(&reconciler.client, &namespace, &watched, &uid).await?;
    }

    let ignore_window = ignore_window_open(binding.annotations(), ctx.ignore_non_transient_timeout, ctx.now);
    let parameters = match resolve_parameters(
        reconciler.secrets.as_ref(),
        &namespace,
        binding.spec.parameters.as_ref(),
        &binding.spec.parameters_from,
    )
    .await
    {
        Ok(parameters) => parameters,
        Err(e) => {
            let next = apply_error(&mut status, OperationType::Create, e.into(), ignore_window, generation, ctx.now);
            write_status(&api, binding, &status).await?;
            return next.map(|next| reconciler.action_for(&key, status.operation_url(), next));
        }
    };

    let mut binding = binding.clone();
    let parameters_changed = binding.watches_parameters()
        && binding_id(&status).is_some()
        && parameters.from_hash != status.parameters_hash;
    if RotationPhase::of(&status).is_none()
        && status.operation_url().is_none()
        && (rotation_due(&binding, &status, ctx.now) || parameters_changed)
    {
        info!(forced = binding.force_rotate_requested(), parameters_changed, "Starting credential rotation");
        set_rotation_phase(&mut status.conditions, REASON_ROTATION_PREPARING, generation, ctx.now);
        binding = write_status(&api, &binding, &status).await?;
    }
    if RotationPhase::of(&status) == Some(RotationPhase::Preparing) {
        prepare_rotation(&reconciler.client, &binding, &status, ctx.now).await?;
        status.binding_id = None;
        status.clear_operation();
        set_rotation_phase(&mut status.conditions, REASON_ROTATION_ROTATING, generation, ctx.now);
    }
    let rotating = RotationPhase::of(&status) == Some(RotationPhase::Rotating);

    let sm = reconciler.clients.client(&resolved.config)?;
    let before_pass = status.clone();
    let pass = drive_binding(
        &binding,
        &instance,
        &mut status,
        &parameters,
        existing_secret.is_some(),
        sm.as_ref(),
        &ctx,
    )
    .await;

    let (next, secret_result) = match pass {
        Ok(BindingPass { next, secret: Some(content) }) => {
            let written = write_secret(&secrets, &binding, existing_secret.as_ref(), content).await;
            if let Err(e) = written.as_ref() {
                warn!(error = %e, "Failed to write credentials secret");
                secret_write_failed(&mut status, &before_pass, e.to_string(), ctx.now);
            }
            (Ok(next), written)
        }
        Ok(BindingPass { next, secret: None }) => (Ok(next), Ok(())),
        Err(e) => (Err(e), Ok(())),
    };

    write_status(&api, &binding, &status).await?;
    secret_result?;

    if binding_id(&status).is_some() {
        register_binding(&instances, &instance, &name).await?;
    }
    if rotating && RotationPhase::of(&status).is_none() {
        info!("Credential rotation finished");
        metrics::increment_credential_rotations();
        if binding.annotations().contains_key(ANNOTATION_FORCE_ROTATE) {
            patch_annotation(&api, &name, ANNOTATION_FORCE_ROTATE, None).await?;
        }
    }

    next.map(|next| reconciler.action_for(&key, status.operation_url(), next))
}

/// Delete an expired stale binding, or wait until it expires
async fn sweep_stale(
    api: &Api<ServiceBinding>,
    binding: &ServiceBinding,
    ctx: &PassContext,
) -> Result<Action, ReconcilerError> {
    let remaining = valid_until(binding)
        .map(|until| until.signed_duration_since(ctx.now))
        .and_then(|left| left.to_std().ok())
        .filter(|left| !left.is_zero());

    match remaining {
        Some(left) => {
            debug!(remaining_secs = left.as_secs(), "Stale binding still valid");
            Ok(Action::requeue(left))
        }
        None => {
            info!("Stale binding expired, deleting");
            match api.delete(&binding.name_any(), &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(response)) if response.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
            Ok(Action::await_change())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CredentialsRotationPolicy;

    #[test]
    fn test_spec_hash_ignores_mutable_fields() {
        let spec = ServiceBindingSpec {
            service_instance_name: "queue".to_string(),
            ..ServiceBindingSpec::default()
        };
        let base = binding_spec_hash(&spec).unwrap();

        let mutable = ServiceBindingSpec {
            secret_template: Some("kind: Secret".to_string()),
            cred_rotation_policy: Some(CredentialsRotationPolicy {
                enabled: true,
                ..Default::default()
            }),
            ..spec.clone()
        };
        assert_eq!(binding_spec_hash(&mutable).unwrap(), base);

        let renamed = ServiceBindingSpec {
            secret_name: Some("other".to_string()),
            ..spec
        };
        assert_ne!(binding_spec_hash(&renamed).unwrap(), base);
    }

    #[test]
    fn test_credentials_stale() {
        let mut status = ServiceBindingStatus::default();
        assert!(credentials_stale(&status, 1, true));

        conditions::set_success(&mut status, OperationType::Create, "bound", 1, Utc::now());
        assert!(!credentials_stale(&status, 1, true));
        assert!(credentials_stale(&status, 1, false));
        assert!(credentials_stale(&status, 2, true));
    }

    #[test]
    fn test_stale_copy_unbinds_labelled_id() {
        let mut binding = ServiceBinding::new("creds-1a2b3c4d", ServiceBindingSpec::default());
        binding
            .labels_mut()
            .insert(LABEL_STALE_BINDING_ID.to_string(), "b-old".to_string());
        assert_eq!(
            deletion_binding_id(&binding, &ServiceBindingStatus::default()).as_deref(),
            Some("b-old")
        );
    }
}
