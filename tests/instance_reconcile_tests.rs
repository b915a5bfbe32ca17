//! ServiceInstance pass tests against a scripted Service Manager

mod common;

use common::{instance, operation, pass_context, FakeServiceManager};
use sm_service_operator::controller::conditions::{
    find_condition, is_condition_true, CONDITION_FAILED, CONDITION_READY, CONDITION_SHARED,
    CONDITION_SUCCEEDED,
};
use sm_service_operator::controller::parameters::ResolvedParameters;
use sm_service_operator::controller::reconciler::instance::instance_spec_hash;
use sm_service_operator::controller::reconciler::{drive_instance, drive_instance_deletion, Next};
use sm_service_operator::crd::{OperationType, ServiceInstanceStatus};
use sm_service_operator::provider::{
    correlation_labels, OperationState, ProvisionResponse, ServiceInstanceRecord, SmError,
};

fn reason(status: &ServiceInstanceStatus, condition: &str) -> Option<String> {
    find_condition(&status.conditions, condition).and_then(|c| c.reason.clone())
}

fn provisioned(inst: &sm_service_operator::crd::ServiceInstance) -> ServiceInstanceStatus {
    ServiceInstanceStatus {
        instance_id: Some("i-1".to_string()),
        hashed_spec: Some(instance_spec_hash(&inst.spec).unwrap()),
        ready: Some("True".to_string()),
        observed_generation: Some(1),
        ..ServiceInstanceStatus::default()
    }
}

#[tokio::test]
async fn test_synchronous_provision_marks_instance_ready() {
    let inst = instance("queue");
    let sm = FakeServiceManager::new().on_provision(Ok(ProvisionResponse {
        instance_id: "i-42".to_string(),
        tags: vec!["mq".to_string()],
        ..ProvisionResponse::default()
    }));
    let mut status = ServiceInstanceStatus::default();

    let next = drive_instance(&inst, &mut status, &ResolvedParameters::default(), &sm, &pass_context())
        .await
        .unwrap();

    assert_eq!(next, Next::Done);
    assert_eq!(status.instance_id.as_deref(), Some("i-42"));
    assert_eq!(status.ready.as_deref(), Some("True"));
    assert_eq!(status.tags, vec!["mq".to_string()]);
    assert_eq!(reason(&status, CONDITION_SUCCEEDED).as_deref(), Some("Created"));
    assert!(is_condition_true(&status.conditions, CONDITION_READY));
    assert_eq!(sm.calls(), vec!["list_instances", "provision"]);

    let request = sm.provision_requests.lock().unwrap()[0].clone();
    assert_eq!(request.name, "queue");
    assert_eq!(request.labels, correlation_labels("apps", "queue", "cluster-a"));
}

#[tokio::test]
async fn test_asynchronous_provision_polls_until_done() {
    let inst = instance("queue");
    let sm = FakeServiceManager::new()
        .on_provision(Ok(ProvisionResponse {
            instance_id: "i-1".to_string(),
            operation_url: Some("/v1/service_instances/i-1/operations/op-1".to_string()),
            ..ProvisionResponse::default()
        }))
        .on_status(Ok(operation(OperationState::InProgress, "create", "i-1")))
        .on_status(Ok(operation(OperationState::Succeeded, "create", "i-1")));
    let params = ResolvedParameters::default();
    let ctx = pass_context();
    let mut status = ServiceInstanceStatus::default();

    let next = drive_instance(&inst, &mut status, &params, &sm, &ctx).await.unwrap();
    assert_eq!(next, Next::Poll);
    assert_eq!(status.operation_type, Some(OperationType::Create));
    assert!(status.operation_url.is_some());
    assert_eq!(reason(&status, CONDITION_SUCCEEDED).as_deref(), Some("CreateInProgress"));
    assert_eq!(status.ready.as_deref(), Some("False"));

    let next = drive_instance(&inst, &mut status, &params, &sm, &ctx).await.unwrap();
    assert_eq!(next, Next::Poll);

    let next = drive_instance(&inst, &mut status, &params, &sm, &ctx).await.unwrap();
    assert_eq!(next, Next::Done);
    assert!(status.operation_url.is_none());
    assert_eq!(status.ready.as_deref(), Some("True"));
    assert_eq!(reason(&status, CONDITION_SUCCEEDED).as_deref(), Some("Created"));
    assert_eq!(sm.calls().iter().filter(|c| *c == "provision").count(), 1);
}

#[tokio::test]
async fn test_rate_limited_provision_leaves_conditions_alone() {
    let inst = instance("queue");
    let sm = FakeServiceManager::new().on_provision(Err(SmError::api(
        429,
        "TooManyRequests",
        "request quota exhausted",
    )));
    let mut status = ServiceInstanceStatus::default();

    let error = drive_instance(&inst, &mut status, &ResolvedParameters::default(), &sm, &pass_context())
        .await
        .unwrap_err();

    assert!(error.is_rate_limited());
    assert!(status.conditions.is_empty());
    assert!(status.instance_id.is_none());
}

#[tokio::test]
async fn test_failed_operation_is_terminal_for_the_generation() {
    let inst = instance("queue");
    let mut failed = operation(OperationState::Failed, "create", "i-1");
    failed.errors = Some(serde_json::json!({"description": "quota exceeded"}));
    let sm = FakeServiceManager::new().on_status(Ok(failed));
    let mut status = ServiceInstanceStatus {
        instance_id: Some("i-1".to_string()),
        operation_url: Some("/v1/service_instances/i-1/operations/op-1".to_string()),
        operation_type: Some(OperationType::Create),
        ..ServiceInstanceStatus::default()
    };
    let params = ResolvedParameters::default();
    let ctx = pass_context();

    let next = drive_instance(&inst, &mut status, &params, &sm, &ctx).await.unwrap();
    assert_eq!(next, Next::Done);
    assert!(status.operation_url.is_none());
    assert!(is_condition_true(&status.conditions, CONDITION_FAILED));
    assert_eq!(reason(&status, CONDITION_SUCCEEDED).as_deref(), Some("CreateFailed"));
    let message = find_condition(&status.conditions, CONDITION_SUCCEEDED)
        .and_then(|c| c.message.clone())
        .unwrap();
    assert!(message.contains("quota exceeded"));

    sm.clear_calls();
    let next = drive_instance(&inst, &mut status, &params, &sm, &ctx).await.unwrap();
    assert_eq!(next, Next::Done);
    assert!(sm.calls().is_empty());
}

#[tokio::test]
async fn test_lost_instance_id_is_recovered_by_labels() {
    let inst = instance("queue");
    let sm = FakeServiceManager::new().with_instance(ServiceInstanceRecord {
        id: "i-7".to_string(),
        name: "queue".to_string(),
        ready: true,
        labels: correlation_labels("apps", "queue", "cluster-a"),
        ..ServiceInstanceRecord::default()
    });
    let mut status = ServiceInstanceStatus::default();

    let next = drive_instance(&inst, &mut status, &ResolvedParameters::default(), &sm, &pass_context())
        .await
        .unwrap();

    assert_eq!(next, Next::Done);
    assert_eq!(status.instance_id.as_deref(), Some("i-7"));
    assert!(!sm.calls().contains(&"provision".to_string()));
    assert_eq!(status.ready.as_deref(), Some("True"));
}

#[tokio::test]
async fn test_spec_change_issues_update() {
    let mut inst = instance("queue");
    let mut status = provisioned(&inst);
    inst.spec.service_plan_name = "premium".to_string();
    inst.metadata.generation = Some(2);
    let sm = FakeServiceManager::new().on_update(Ok(None));

    let next = drive_instance(&inst, &mut status, &ResolvedParameters::default(), &sm, &pass_context())
        .await
        .unwrap();

    assert_eq!(next, Next::Done);
    assert_eq!(sm.calls(), vec!["update"]);
    assert_eq!(reason(&status, CONDITION_SUCCEEDED).as_deref(), Some("Updated"));
    assert_eq!(status.observed_generation, Some(2));
    assert_eq!(status.hashed_spec, Some(instance_spec_hash(&inst.spec).unwrap()));
}

#[tokio::test]
async fn test_sharing_follows_spec() {
    let mut inst = instance("queue");
    let mut status = provisioned(&inst);
    inst.spec.shared = Some(true);
    let sm = FakeServiceManager::new().on_share(Ok(()));

    let next = drive_instance(&inst, &mut status, &ResolvedParameters::default(), &sm, &pass_context())
        .await
        .unwrap();

    assert_eq!(next, Next::Done);
    assert_eq!(sm.calls(), vec!["share"]);
    assert!(is_condition_true(&status.conditions, CONDITION_SHARED));
    assert_eq!(reason(&status, CONDITION_SHARED).as_deref(), Some("ShareSucceeded"));
}

#[tokio::test]
async fn test_unsupported_share_is_reported_once() {
    let mut inst = instance("queue");
    let mut status = provisioned(&inst);
    inst.spec.shared = Some(true);
    let sm = FakeServiceManager::new().on_share(Err(SmError::api(
        400,
        "BadRequest",
        "plan does not support instance sharing",
    )));
    let params = ResolvedParameters::default();
    let ctx = pass_context();

    drive_instance(&inst, &mut status, &params, &sm, &ctx).await.unwrap();
    assert!(!is_condition_true(&status.conditions, CONDITION_SHARED));
    assert_eq!(reason(&status, CONDITION_SHARED).as_deref(), Some("ShareNotSupported"));

    sm.clear_calls();
    drive_instance(&inst, &mut status, &params, &sm, &ctx).await.unwrap();
    assert!(!sm.calls().contains(&"share".to_string()));
}

#[tokio::test]
async fn test_async_deprovision_removes_finalizer_when_done() {
    let inst = instance("queue");
    let mut status = provisioned(&inst);
    let sm = FakeServiceManager::new()
        .on_deprovision(Ok(Some("/v1/service_instances/i-1/operations/op-9".to_string())))
        .on_status(Ok(operation(OperationState::Succeeded, "delete", "i-1")));
    let ctx = pass_context();

    let next = drive_instance_deletion(&inst, &mut status, &sm, &ctx).await.unwrap();
    assert_eq!(next, Next::Poll);
    assert_eq!(status.operation_type, Some(OperationType::Delete));
    assert_eq!(reason(&status, CONDITION_SUCCEEDED).as_deref(), Some("DeleteInProgress"));

    let next = drive_instance_deletion(&inst, &mut status, &sm, &ctx).await.unwrap();
    assert_eq!(next, Next::RemoveFinalizer);
}

#[tokio::test]
async fn test_deprovision_of_missing_instance_counts_as_deleted() {
    let inst = instance("queue");
    let mut status = provisioned(&inst);
    let sm = FakeServiceManager::new().on_deprovision(Err(SmError::api(404, "NotFound", "no such instance")));

    let next = drive_instance_deletion(&inst, &mut status, &sm, &pass_context()).await.unwrap();
    assert_eq!(next, Next::RemoveFinalizer);
}

#[tokio::test]
async fn test_deletion_without_remote_instance_skips_sm_delete() {
    let inst = instance("queue");
    let mut status = ServiceInstanceStatus::default();
    let sm = FakeServiceManager::new();

    let next = drive_instance_deletion(&inst, &mut status, &sm, &pass_context()).await.unwrap();
    assert_eq!(next, Next::RemoveFinalizer);
    assert_eq!(sm.calls(), vec!["list_instances"]);
}
