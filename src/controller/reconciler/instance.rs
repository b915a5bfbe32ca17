//! # ServiceInstance Reconciler
//!
//! One pass drives an instance a single step towards its spec:
//!
//! 1. poll the in-flight operation, if any
//! 2. recover the SM instance by correlation labels when the ID was lost
//! 3. provision, or update when the spec hash (or watched parameter hash) changed
//! 4. otherwise align sharing with `spec.shared`
//!
//! Only one SM mutation is issued per pass. [`drive_instance`] and
//! [`drive_instance_deletion`] hold the decisions and only talk to SM;
//! [`reconcile_instance`] wraps them with Kubernetes reads and writes.

use crate::constants::{BINDING_ANNOTATION_PREFIX, DEFAULT_BLOCKED_REQUEUE_SECS, FINALIZER};
use crate::controller::conditions::{
    self, find_condition, is_condition_true, CONDITION_SHARED, REASON_SHARE_FAILED,
    REASON_SHARE_NOT_SUPPORTED, REASON_SHARE_SUCCEEDED, REASON_UNSHARE_FAILED,
    REASON_UNSHARE_SUCCEEDED,
};
use crate::controller::credentials::{resolve_credentials, CredentialsLookup};
use crate::controller::parameters::{parameter_secret_names, resolve_parameters, ResolvedParameters};
use crate::controller::reconciler::outcome::{
    apply_error, failed_for_generation, ignore_window_open, poll_operation, Next, OperationTracking,
    PassContext,
};
use crate::controller::reconciler::status::{add_finalizer, patch_annotation, remove_finalizer, write_status};
use crate::controller::reconciler::types::{resource_key, Reconciler, ReconcilerError};
use crate::controller::secret_watch::{sync_secret_watches, unwatch_secrets};
use crate::crd::{OperationType, ServiceBinding, ServiceInstance, ServiceInstanceSpec, ServiceInstanceStatus};
use crate::observability::metrics;
use crate::provider::{
    correlation_labels, operation_url, ListQuery, OperationState, ProvisionRequest,
    ServiceManagerClient, UpdateRequest,
};
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

pub const KIND: &str = "ServiceInstance";

/// md5 of the spec fields SM cares about; `shared` and `userInfo` are excluded
pub fn instance_spec_hash(spec: &ServiceInstanceSpec) -> Result<String, serde_json::Error> {
    let mut hashed = spec.clone();
    hashed.shared = None;
    hashed.user_info = None;
    let bytes = serde_json::to_vec(&hashed)?;
    Ok(format!("{:x}", md5::compute(bytes)))
}

fn provision_request(
    instance: &ServiceInstance,
    parameters: &ResolvedParameters,
    cluster_id: &str,
) -> ProvisionRequest {
    let spec = &instance.spec;
    ProvisionRequest {
        name: instance.external_name(),
        offering_name: spec.service_offering_name.clone(),
        plan_name: spec.service_plan_name.clone(),
        plan_id: spec.service_plan_id.clone(),
        data_center: spec.data_center.clone(),
        parameters: parameters.values.clone(),
        labels: correlation_labels(
            &instance.namespace().unwrap_or_default(),
            &instance.name_any(),
            cluster_id,
        ),
        subaccount_id: spec.subaccount_id.clone(),
        tags: spec.custom_tags.clone(),
    }
}

fn update_request(instance: &ServiceInstance, instance_id: &str, parameters: &ResolvedParameters) -> UpdateRequest {
    let spec = &instance.spec;
    UpdateRequest {
        instance_id: instance_id.to_string(),
        name: instance.external_name(),
        offering_name: spec.service_offering_name.clone(),
        plan_name: spec.service_plan_name.clone(),
        plan_id: spec.service_plan_id.clone(),
        data_center: spec.data_center.clone(),
        parameters: parameters.values.clone(),
    }
}

/// Outcome of looking at the in-flight operation
enum PollResult {
    /// Nothing in flight, or it finished successfully; keep going
    Continue,
    /// The pass ends here
    Stop(Result<Next, ReconcilerError>),
}

async fn poll_in_flight(
    instance: &ServiceInstance,
    status: &mut ServiceInstanceStatus,
    sm: &dyn ServiceManagerClient,
    ctx: &PassContext,
    ignore_window: bool,
) -> PollResult {
    let Some(url) = status.operation_url().map(str::to_string) else {
        return PollResult::Continue;
    };
    let operation_type = status.operation_type.unwrap_or(OperationType::Create);
    let generation = instance.metadata.generation.unwrap_or(0);

    let operation = match poll_operation(sm, &url).await {
        Ok(Some(operation)) => operation,
        Ok(None) => {
            warn!(operation.url = %url, "Operation no longer known to Service Manager");
            status.clear_operation();
            return PollResult::Stop(Ok(Next::Immediate));
        }
        Err(e) => {
            return PollResult::Stop(apply_error(
                status,
                operation_type,
                e.into(),
                ignore_window,
                generation,
                ctx.now,
            ))
        }
    };

    match operation.state {
        OperationState::InProgress | OperationState::Pending => {
            debug!(operation.url = %url, state = ?operation.state, "Operation still running");
            let message = format!("{} is in progress", operation_type.as_str());
            conditions::set_in_progress(status, operation_type, message, ctx.now);
            PollResult::Stop(Ok(Next::Poll))
        }
        OperationState::Succeeded => {
            status.clear_operation();
            match operation_type {
                OperationType::Delete => PollResult::Stop(Ok(Next::RemoveFinalizer)),
                OperationType::Create | OperationType::Update => {
                    if status.instance_id.as_deref().unwrap_or_default().is_empty()
                        && !operation.resource_id.is_empty()
                    {
                        status.instance_id = Some(operation.resource_id.clone());
                    }
                    let message = match operation_type {
                        OperationType::Create => "ServiceInstance provisioned successfully",
                        _ => "ServiceInstance updated successfully",
                    };
                    conditions::set_success(status, operation_type, message, generation, ctx.now);
                    PollResult::Continue
                }
            }
        }
        OperationState::Failed => {
            status.clear_operation();
            if operation_type != OperationType::Delete {
                status.hashed_spec = None;
            }
            let error = ReconcilerError::operation_failed(operation_type, operation.failure_message());
            PollResult::Stop(apply_error(
                status,
                operation_type,
                error,
                ignore_window,
                generation,
                ctx.now,
            ))
        }
    }
}

/// Adopt the SM instance carrying this resource's correlation labels
async fn recover(
    instance: &ServiceInstance,
    status: &mut ServiceInstanceStatus,
    sm: &dyn ServiceManagerClient,
    ctx: &PassContext,
) -> Result<bool, ReconcilerError> {
    let query = ListQuery::correlation(
        &instance.namespace().unwrap_or_default(),
        &instance.name_any(),
        &ctx.cluster_id,
    );
    let records = sm.list_instances(&query).await?;
    let Some(record) = records.into_iter().find(|r| query.matches(&r.labels)) else {
        return Ok(false);
    };

    info!(instance.id = %record.id, "Recovered ServiceInstance from Service Manager");
    status.instance_id = Some(record.id.clone());
    let generation = instance.metadata.generation.unwrap_or(0);

    if let Some(last) = record.last_operation.as_ref() {
        let operation_type = match last.r#type.as_str() {
            "update" => OperationType::Update,
            "delete" => OperationType::Delete,
            _ => OperationType::Create,
        };
        match last.state {
            OperationState::InProgress | OperationState::Pending => {
                status.start_operation(
                    operation_url("service_instances", &record.id, &last.id),
                    operation_type,
                );
                conditions::set_in_progress(status, operation_type, "recovered in-flight operation", ctx.now);
                return Ok(true);
            }
            OperationState::Failed => {
                conditions::set_failure(status, operation_type, last.failure_message(), generation, ctx.now);
                return Ok(true);
            }
            OperationState::Succeeded => {}
        }
    }

    status.hashed_spec = Some(instance_spec_hash(&instance.spec)?);
    conditions::set_success(
        status,
        OperationType::Create,
        "ServiceInstance recovered from Service Manager",
        generation,
        ctx.now,
    );
    let reason = if record.shared {
        REASON_SHARE_SUCCEEDED
    } else {
        REASON_UNSHARE_SUCCEEDED
    };
    conditions::set_shared(&mut status.conditions, record.shared, reason, "", generation, ctx.now);
    Ok(true)
}

/// Run one pass for a live instance
pub async fn drive_instance(
    instance: &ServiceInstance,
    status: &mut ServiceInstanceStatus,
    parameters: &ResolvedParameters,
    sm: &dyn ServiceManagerClient,
    ctx: &PassContext,
) -> Result<Next, ReconcilerError> {
    let generation = instance.metadata.generation.unwrap_or(0);
    let ignore_window = ignore_window_open(instance.annotations(), ctx.ignore_non_transient_timeout, ctx.now);
    let spec_hash = instance_spec_hash(&instance.spec)?;
    let parameters_changed =
        instance.watches_parameters() && parameters.from_hash != status.parameters_hash;

    if failed_for_generation(status, generation) && !parameters_changed {
        debug!("Last attempt for this generation failed, waiting for a change");
        return Ok(Next::Done);
    }

    conditions::begin_attempt(status);

    if let PollResult::Stop(result) = poll_in_flight(instance, status, sm, ctx, ignore_window).await {
        return result;
    }

    let had_id = instance_id(status).is_some();
    if !had_id {
        match recover(instance, status, sm, ctx).await {
            Ok(true) if status.operation_url().is_some() => return Ok(Next::Poll),
            Ok(true) if failed_for_generation(status, generation) => return Ok(Next::Done),
            Ok(_) => {}
            Err(e) => {
                return apply_error(status, OperationType::Create, e, ignore_window, generation, ctx.now)
            }
        }
    }

    let Some(id) = instance_id(status) else {
        return provision(instance, status, parameters, sm, ctx, ignore_window, spec_hash).await;
    };

    if status.hashed_spec.as_deref() != Some(spec_hash.as_str()) || parameters_changed {
        return update(instance, status, &id, parameters, sm, ctx, ignore_window, spec_hash).await;
    }

    if let Some(next) = align_sharing(instance, status, &id, sm, ctx).await? {
        return Ok(next);
    }

    conditions::set_finished(status, generation, ctx.now);
    Ok(Next::Done)
}

fn instance_id(status: &ServiceInstanceStatus) -> Option<String> {
    status
        .instance_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn sharing_pending(instance: &ServiceInstance, status: &ServiceInstanceStatus) -> bool {
    match instance.spec.shared {
        Some(true) => !is_condition_true(&status.conditions, CONDITION_SHARED),
        Some(false) => is_condition_true(&status.conditions, CONDITION_SHARED),
        None => false,
    }
}

async fn provision(
    instance: &ServiceInstance,
    status: &mut ServiceInstanceStatus,
    parameters: &ResolvedParameters,
    sm: &dyn ServiceManagerClient,
    ctx: &PassContext,
    ignore_window: bool,
    spec_hash: String,
) -> Result<Next, ReconcilerError> {
    let generation = instance.metadata.generation.unwrap_or(0);
    info!(
        offering = %instance.spec.service_offering_name,
        plan = %instance.spec.service_plan_name,
        "Provisioning ServiceInstance"
    );

    let response = match sm
        .provision(&provision_request(instance, parameters, &ctx.cluster_id))
        .await
    {
        Ok(response) => response,
        Err(e) => {
            return apply_error(status, OperationType::Create, e.into(), ignore_window, generation, ctx.now)
        }
    };

    if !response.instance_id.is_empty() {
        status.instance_id = Some(response.instance_id.clone());
    }
    if response.subaccount_id.is_some() {
        status.subaccount_id = response.subaccount_id.clone();
    }
    status.tags = response.tags.clone();
    status.hashed_spec = Some(spec_hash);
    status.parameters_hash = parameters.from_hash.clone();

    if let Some(url) = response.operation_url {
        status.start_operation(url, OperationType::Create);
        conditions::set_in_progress(status, OperationType::Create, "Provisioning is in progress", ctx.now);
        return Ok(Next::Poll);
    }

    status.operation_type = Some(OperationType::Create);
    conditions::set_success(
        status,
        OperationType::Create,
        "ServiceInstance provisioned successfully",
        generation,
        ctx.now,
    );
    Ok(if sharing_pending(instance, status) {
        Next::Immediate
    } else {
        Next::Done
    })
}

#[allow(clippy::too_many_arguments)]
async fn update(
    instance: &ServiceInstance,
    status: &mut ServiceInstanceStatus,
    id: &str,
    parameters: &ResolvedParameters,
    sm: &dyn ServiceManagerClient,
    ctx: &PassContext,
    ignore_window: bool,
    spec_hash: String,
) -> Result<Next, ReconcilerError> {
    let generation = instance.metadata.generation.unwrap_or(0);
    info!(instance.id = %id, "Updating ServiceInstance");

    match sm.update(&update_request(instance, id, parameters)).await {
        Ok(operation) => {
            status.hashed_spec = Some(spec_hash);
            status.parameters_hash = parameters.from_hash.clone();
            if let Some(url) = operation {
                status.start_operation(url, OperationType::Update);
                conditions::set_in_progress(status, OperationType::Update, "Update is in progress", ctx.now);
                return Ok(Next::Poll);
            }
            status.operation_type = Some(OperationType::Update);
            conditions::set_success(
                status,
                OperationType::Update,
                "ServiceInstance updated successfully",
                generation,
                ctx.now,
            );
            Ok(if sharing_pending(instance, status) {
                Next::Immediate
            } else {
                Next::Done
            })
        }
        Err(e) if e.is_gone() => {
            warn!(instance.id = %id, "ServiceInstance is gone from Service Manager, recreating");
            status.instance_id = None;
            status.hashed_spec = None;
            Ok(Next::Immediate)
        }
        Err(e) => apply_error(status, OperationType::Update, e.into(), ignore_window, generation, ctx.now),
    }
}

/// Share or unshare when `spec.shared` differs from the recorded remote state
async fn align_sharing(
    instance: &ServiceInstance,
    status: &mut ServiceInstanceStatus,
    id: &str,
    sm: &dyn ServiceManagerClient,
    ctx: &PassContext,
) -> Result<Option<Next>, ReconcilerError> {
    if !sharing_pending(instance, status) {
        return Ok(None);
    }
    let generation = instance.metadata.generation.unwrap_or(0);
    let share = instance.spec.shared == Some(true);

    let settled_failure = find_condition(&status.conditions, CONDITION_SHARED).is_some_and(|c| {
        c.observed_generation == Some(generation)
            && matches!(
                c.reason.as_deref(),
                Some(REASON_SHARE_FAILED | REASON_UNSHARE_FAILED | REASON_SHARE_NOT_SUPPORTED)
            )
    });
    if settled_failure {
        return Ok(None);
    }

    let result = if share {
        sm.share(id).await
    } else {
        sm.unshare(id).await
    };

    match result {
        Ok(()) => {
            let (reason, message) = if share {
                (REASON_SHARE_SUCCEEDED, "instance shared successfully")
            } else {
                (REASON_UNSHARE_SUCCEEDED, "instance unshared successfully")
            };
            conditions::set_shared(&mut status.conditions, share, reason, message, generation, ctx.now);
            conditions::set_finished(status, generation, ctx.now);
            Ok(Some(Next::Done))
        }
        Err(e) if e.is_transient() => Err(e.into()),
        Err(e) => {
            let reason = match (share, e.status_code()) {
                (true, Some(400)) => REASON_SHARE_NOT_SUPPORTED,
                (true, _) => REASON_SHARE_FAILED,
                (false, _) => REASON_UNSHARE_FAILED,
            };
            let message = ReconcilerError::from(e).user_message();
            conditions::set_shared(&mut status.conditions, !share, reason, message, generation, ctx.now);
            conditions::set_finished(status, generation, ctx.now);
            Ok(Some(Next::Done))
        }
    }
}

/// Run one pass for an instance being deleted
pub async fn drive_instance_deletion(
    instance: &ServiceInstance,
    status: &mut ServiceInstanceStatus,
    sm: &dyn ServiceManagerClient,
    ctx: &PassContext,
) -> Result<Next, ReconcilerError> {
    let generation = instance.metadata.generation.unwrap_or(0);
    let ignore_window = ignore_window_open(instance.annotations(), ctx.ignore_non_transient_timeout, ctx.now);

    conditions::begin_attempt(status);

    if let Some(url) = status.operation_url().map(str::to_string) {
        if status.operation_type == Some(OperationType::Delete) {
            if let PollResult::Stop(result) = poll_in_flight(instance, status, sm, ctx, ignore_window).await {
                return result;
            }
        } else {
            match poll_operation(sm, &url).await {
                Ok(Some(op)) if !op.state.is_terminal() => {
                    debug!(operation.url = %url, "Waiting for running operation before deleting");
                    return Ok(Next::Poll);
                }
                Ok(_) => status.clear_operation(),
                Err(e) => {
                    return apply_error(status, OperationType::Delete, e.into(), ignore_window, generation, ctx.now)
                }
            }
        }
    }

    if instance_id(status).is_none() {
        match recover(instance, status, sm, ctx).await {
            Ok(true) if status.operation_url().is_some() => return Ok(Next::Poll),
            Ok(true) => {}
            Ok(false) => return Ok(Next::RemoveFinalizer),
            Err(e) => {
                return apply_error(status, OperationType::Delete, e, ignore_window, generation, ctx.now)
            }
        }
    }
    let Some(id) = instance_id(status) else {
        return Ok(Next::RemoveFinalizer);
    };

    info!(instance.id = %id, "Deprovisioning ServiceInstance");
    match sm.deprovision(&id).await {
        Ok(Some(url)) => {
            status.start_operation(url, OperationType::Delete);
            conditions::set_in_progress(status, OperationType::Delete, "Deprovisioning is in progress", ctx.now);
            Ok(Next::Poll)
        }
        Ok(None) => {
            conditions::set_success(status, OperationType::Delete, "ServiceInstance deleted", generation, ctx.now);
            Ok(Next::RemoveFinalizer)
        }
        Err(e) if e.is_not_found() || e.is_gone() => {
            debug!(instance.id = %id, "ServiceInstance already gone from Service Manager");
            Ok(Next::RemoveFinalizer)
        }
        Err(e) => apply_error(status, OperationType::Delete, e.into(), ignore_window, generation, ctx.now),
    }
}

/// Bindings still registered on the instance through `binding-<name>` annotations
async fn live_bindings(api: &Api<ServiceBinding>, instance: &ServiceInstance) -> Result<Vec<String>, kube::Error> {
    let mut live = Vec::new();
    for name in instance
        .annotations()
        .keys()
        .filter_map(|key| key.strip_prefix(BINDING_ANNOTATION_PREFIX))
    {
        if let Some(binding) = api.get_opt(name).await? {
            if binding.spec.service_instance_name == instance.name_any() {
                live.push(name.to_string());
            }
        }
    }
    Ok(live)
}

/// Controller entry point for ServiceInstance
pub async fn reconcile_instance(
    instance: Arc<ServiceInstance>,
    reconciler: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let start = Instant::now();
    metrics::increment_reconciliations(KIND);
    let span = info_span!(
        "reconcile",
        resource.kind = KIND,
        resource.namespace = %instance.namespace().unwrap_or_default(),
        resource.name = %instance.name_any(),
        resource.generation = instance.metadata.generation.unwrap_or(0),
    );
    let result = reconcile_instance_inner(&instance, &reconciler)
        .instrument(span)
        .await;
    metrics::observe_reconciliation_duration(KIND, start.elapsed().as_secs_f64());
    result
}

async fn reconcile_instance_inner(
    instance: &ServiceInstance,
    reconciler: &Reconciler,
) -> Result<Action, ReconcilerError> {
    let namespace = instance.namespace().unwrap_or_default();
    let name = instance.name_any();
    let key = resource_key(KIND, &namespace, &name);
    let api: Api<ServiceInstance> = Api::namespaced(reconciler.client.clone(), &namespace);
    let config = &reconciler.config;
    let ctx = PassContext {
        cluster_id: config.cluster_id.clone(),
        ignore_non_transient_timeout: config.ignore_non_transient_timeout,
        max_secret_bytes: config.max_secret_bytes,
        now: Utc::now(),
    };
    let generation = instance.metadata.generation.unwrap_or(0);
    let mut status = instance.status.clone().unwrap_or_default();

    if instance.metadata.deletion_timestamp.is_some() {
        if !instance.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(Action::await_change());
        }

        let bindings: Api<ServiceBinding> = Api::namespaced(reconciler.client.clone(), &namespace);
        let live = live_bindings(&bindings, instance).await?;
        if !live.is_empty() {
            info!(bindings = ?live, "Deletion waits for ServiceBindings");
            conditions::set_blocked(
                &mut status,
                format!("waiting for bindings to be deleted: {}", live.join(", ")),
                generation,
                ctx.now,
            );
            write_status(&api, instance, &status).await?;
            metrics::increment_requeues_total("bindings-exist");
            return Ok(Action::requeue(Duration::from_secs(DEFAULT_BLOCKED_REQUEUE_SECS)));
        }

        let resolved = resolve_credentials(
            reconciler.secrets.as_ref(),
            config,
            CredentialsLookup {
                namespace: &namespace,
                pinned: status.secret_ref.as_ref(),
                btp_access_secret: instance.spec.btp_access_credentials_secret.as_deref(),
            },
        )
        .await;
        let next = match resolved {
            Ok(resolved) => {
                let sm = reconciler.clients.client(&resolved.config)?;
                drive_instance_deletion(instance, &mut status, sm.as_ref(), &ctx).await
            }
            Err(e) if instance_id(&status).is_none() && status.operation_url().is_none() => {
                warn!(error = %e, "No credentials to clean up an instance that was never provisioned");
                Ok(Next::RemoveFinalizer)
            }
            Err(e) => Err(e.into()),
        };

        if matches!(next, Ok(Next::RemoveFinalizer)) {
            if let Some(uid) = instance.uid() {
                unwatch_secrets(&reconciler.client, &namespace, &uid).await?;
            }
            remove_finalizer(&api, instance, FINALIZER).await?;
            reconciler.forget(&key);
            info!("ServiceInstance deleted");
            return Ok(Action::await_change());
        }
        write_status(&api, instance, &status).await?;
        return next.map(|next| reconciler.action_for(&key, status.operation_url(), next));
    }

    let instance = &add_finalizer(&api, instance, FINALIZER).await?;

    let resolved = match resolve_credentials(
        reconciler.secrets.as_ref(),
        config,
        CredentialsLookup {
            namespace: &namespace,
            pinned: status.secret_ref.as_ref(),
            btp_access_secret: instance.spec.btp_access_credentials_secret.as_deref(),
        },
    )
    .await
    {
        Ok(resolved) => resolved,
        Err(e) if e.is_transient() => return Err(e.into()),
        Err(e) => {
            warn!(error = %e, "Service Manager credentials unavailable");
            conditions::set_blocked(&mut status, e.to_string(), generation, ctx.now);
            write_status(&api, instance, &status).await?;
            return Ok(Action::requeue(Duration::from_secs(DEFAULT_BLOCKED_REQUEUE_SECS)));
        }
    };
    status.secret_ref = Some(resolved.secret_ref.clone());
    if status.subaccount_id.is_none() {
        status.subaccount_id = resolved.config.subaccount_id.clone();
    }

    if let Some(uid) = instance.uid() {
        let watched = if instance.watches_parameters() {
            parameter_secret_names(&instance.spec.parameters_from)
        } else {
            Vec::new()
        };
        sync_secret_watches(&reconciler.client, &namespace, &watched, &uid).await?;
    }

    let operation = if instance_id(&status).is_some() {
        OperationType::Update
    } else {
        OperationType::Create
    };
    let ignore_window = ignore_window_open(instance.annotations(), ctx.ignore_non_transient_timeout, ctx.now);

    let next = match resolve_parameters(
        reconciler.secrets.as_ref(),
        &namespace,
        instance.spec.parameters.as_ref(),
        &instance.spec.parameters_from,
    )
    .await
    {
        Ok(parameters) => match reconciler.clients.client(&resolved.config) {
            Ok(sm) => drive_instance(instance, &mut status, &parameters, sm.as_ref(), &ctx).await,
            Err(e) => apply_error(&mut status, operation, e.into(), ignore_window, generation, ctx.now),
        },
        Err(e) => apply_error(&mut status, operation, e.into(), ignore_window, generation, ctx.now),
    };

    write_status(&api, instance, &status).await?;
    next.map(|next| reconciler.action_for(&key, status.operation_url(), next))
}

/// Record the binding on its instance so instance events reach it
pub async fn register_binding(
    api: &Api<ServiceInstance>,
    instance: &ServiceInstance,
    binding_name: &str,
) -> Result<(), kube::Error> {
    let key = format!("{BINDING_ANNOTATION_PREFIX}{binding_name}");
    if instance.annotations().contains_key(&key) {
        return Ok(());
    }
    patch_annotation(api, &instance.name_any(), &key, Some("true")).await
}

/// Drop the binding's registration from its instance
pub async fn unregister_binding(
    api: &Api<ServiceInstance>,
    instance_name: &str,
    binding_name: &str,
) -> Result<(), kube::Error> {
    let key = format!("{BINDING_ANNOTATION_PREFIX}{binding_name}");
    match patch_annotation(api, instance_name, &key, None).await {
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_hash_ignores_shared_and_user_info() {
        let spec = ServiceInstanceSpec {
            service_offering_name: "svc".to_string(),
            service_plan_name: "std".to_string(),
            ..ServiceInstanceSpec::default()
        };
        let base = instance_spec_hash(&spec).unwrap();

        let shared = ServiceInstanceSpec {
            shared: Some(true),
            user_info: Some(crate::crd::UserInfo {
                username: Some("alice".to_string()),
                ..Default::default()
            }),
            ..spec.clone()
        };
        assert_eq!(instance_spec_hash(&shared).unwrap(), base);

        let other_plan = ServiceInstanceSpec {
            service_plan_name: "large".to_string(),
            ..spec
        };
        assert_ne!(instance_spec_hash(&other_plan).unwrap(), base);
    }
}
