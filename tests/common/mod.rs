//! Common test utilities
//!
//! - rustls crypto provider setup for tests that go through reqwest
//! - `FakeServiceManager`, a scripted in-memory Service Manager
//! - fixtures for instances, bindings and pass contexts

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sm_service_operator::controller::reconciler::PassContext;
use sm_service_operator::crd::{
    ServiceBinding, ServiceBindingSpec, ServiceInstance, ServiceInstanceSpec,
};
use sm_service_operator::provider::{
    BindRequest, BindResponse, ListQuery, Operation, OperationState, ProvisionRequest,
    ProvisionResponse, ServiceBindingRecord, ServiceInstanceRecord, ServiceManagerClient, SmError,
    UpdateRequest,
};
use std::collections::VecDeque;
use std::sync::{Mutex, Once};
use std::time::Duration;

static RUSTLS_INIT: Once = Once::new();

/// Initialize rustls crypto provider for tests
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install rustls crypto provider");
    });
}

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub fn pass_context() -> PassContext {
    PassContext {
        cluster_id: "cluster-a".to_string(),
        ignore_non_transient_timeout: Duration::from_secs(3600),
        max_secret_bytes: 1024 * 1024,
        now: now(),
    }
}

pub fn instance(name: &str) -> ServiceInstance {
    let mut instance = ServiceInstance::new(
        name,
        ServiceInstanceSpec {
            service_offering_name: "message-queue".to_string(),
            service_plan_name: "standard".to_string(),
            ..ServiceInstanceSpec::default()
        },
    );
    instance.metadata.namespace = Some("apps".to_string());
    instance.metadata.uid = Some(format!("uid-{name}"));
    instance.metadata.generation = Some(1);
    instance
}

pub fn binding(name: &str, instance_name: &str) -> ServiceBinding {
    let mut binding = ServiceBinding::new(
        name,
        ServiceBindingSpec {
            service_instance_name: instance_name.to_string(),
            ..ServiceBindingSpec::default()
        },
    );
    binding.metadata.namespace = Some("apps".to_string());
    binding.metadata.uid = Some(format!("uid-{name}"));
    binding.metadata.generation = Some(1);
    binding
}

pub fn operation(state: OperationState, r#type: &str, resource_id: &str) -> Operation {
    Operation {
        id: "op-1".to_string(),
        r#type: r#type.to_string(),
        state,
        description: String::new(),
        errors: None,
        resource_id: resource_id.to_string(),
    }
}

/// Scripted Service Manager
///
/// Each mutating call pops the next scripted response; an empty script answers
/// with a synchronous success. Every call is recorded by name.
#[derive(Default)]
pub struct FakeServiceManager {
    calls: Mutex<Vec<String>>,
    provision: Mutex<VecDeque<Result<ProvisionResponse, SmError>>>,
    update: Mutex<VecDeque<Result<Option<String>, SmError>>>,
    deprovision: Mutex<VecDeque<Result<Option<String>, SmError>>>,
    bind: Mutex<VecDeque<Result<BindResponse, SmError>>>,
    unbind: Mutex<VecDeque<Result<Option<String>, SmError>>>,
    status: Mutex<VecDeque<Result<Operation, SmError>>>,
    share: Mutex<VecDeque<Result<(), SmError>>>,
    instances: Mutex<Vec<ServiceInstanceRecord>>,
    bindings: Mutex<Vec<ServiceBindingRecord>>,
    pub provision_requests: Mutex<Vec<ProvisionRequest>>,
    pub bind_requests: Mutex<Vec<BindRequest>>,
}

impl FakeServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_provision(self, response: Result<ProvisionResponse, SmError>) -> Self {
        self.provision.lock().unwrap().push_back(response);
        self
    }

    pub fn on_update(self, response: Result<Option<String>, SmError>) -> Self {
        self.update.lock().unwrap().push_back(response);
        self
    }

    pub fn on_deprovision(self, response: Result<Option<String>, SmError>) -> Self {
        self.deprovision.lock().unwrap().push_back(response);
        self
    }

    pub fn on_bind(self, response: Result<BindResponse, SmError>) -> Self {
        self.bind.lock().unwrap().push_back(response);
        self
    }

    pub fn on_unbind(self, response: Result<Option<String>, SmError>) -> Self {
        self.unbind.lock().unwrap().push_back(response);
        self
    }

    pub fn on_status(self, response: Result<Operation, SmError>) -> Self {
        self.status.lock().unwrap().push_back(response);
        self
    }

    pub fn on_share(self, response: Result<(), SmError>) -> Self {
        self.share.lock().unwrap().push_back(response);
        self
    }

    pub fn with_instance(self, record: ServiceInstanceRecord) -> Self {
        self.instances.lock().unwrap().push(record);
        self
    }

    pub fn with_binding(self, record: ServiceBindingRecord) -> Self {
        self.bindings.lock().unwrap().push(record);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

fn pop<T>(queue: &Mutex<VecDeque<Result<T, SmError>>>, fallback: impl FnOnce() -> T) -> Result<T, SmError> {
    queue.lock().unwrap().pop_front().unwrap_or_else(|| Ok(fallback()))
}

#[async_trait]
impl ServiceManagerClient for FakeServiceManager {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionResponse, SmError> {
        self.record("provision");
        self.provision_requests.lock().unwrap().push(request.clone());
        pop(&self.provision, || ProvisionResponse {
            instance_id: "i-1".to_string(),
            ..ProvisionResponse::default()
        })
    }

    async fn update(&self, _request: &UpdateRequest) -> Result<Option<String>, SmError> {
        self.record("update");
        pop(&self.update, || None)
    }

    async fn deprovision(&self, _instance_id: &str) -> Result<Option<String>, SmError> {
        self.record("deprovision");
        pop(&self.deprovision, || None)
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, SmError> {
        self.record("bind");
        self.bind_requests.lock().unwrap().push(request.clone());
        pop(&self.bind, || BindResponse {
            binding_id: "b-1".to_string(),
            credentials: Some(serde_json::json!({})),
            operation_url: None,
        })
    }

    async fn unbind(&self, _binding_id: &str) -> Result<Option<String>, SmError> {
        self.record("unbind");
        pop(&self.unbind, || None)
    }

    async fn status(&self, _operation_url: &str) -> Result<Operation, SmError> {
        self.record("status");
        self.status
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SmError::api(404, "NotFound", "operation not found")))
    }

    async fn list_instances(&self, query: &ListQuery) -> Result<Vec<ServiceInstanceRecord>, SmError> {
        self.record("list_instances");
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .filter(|r| query.matches(&r.labels))
            .cloned()
            .collect())
    }

    async fn list_bindings(&self, query: &ListQuery) -> Result<Vec<ServiceBindingRecord>, SmError> {
        self.record("list_bindings");
        Ok(self
            .bindings
            .lock()
            .unwrap()
            .iter()
            .filter(|r| query.matches(&r.labels))
            .cloned()
            .collect())
    }

    async fn get_binding(&self, binding_id: &str) -> Result<ServiceBindingRecord, SmError> {
        self.record("get_binding");
        self.bindings
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == binding_id)
            .cloned()
            .ok_or_else(|| SmError::api(404, "NotFound", "binding not found"))
    }

    async fn share(&self, _instance_id: &str) -> Result<(), SmError> {
        self.record("share");
        pop(&self.share, || ())
    }

    async fn unshare(&self, _instance_id: &str) -> Result<(), SmError> {
        self.record("unshare");
        pop(&self.share, || ())
    }
}
