//! # Watch Loop
//!
//! Runs the ServiceInstance and ServiceBinding controllers side by side.
//!
//! Besides their own objects the controllers react to:
//! - secrets carrying a watch annotation, mapped back to the instances and
//!   bindings that read them through `parametersFrom`
//! - instances, mapped to the bindings that reference them (through the
//!   `binding-<name>` annotations and a scan of the binding cache)

use crate::config::SharedOperatorConfig;
use crate::constants::{BINDING_ANNOTATION_PREFIX, DEFAULT_WATCH_RESTART_DELAY_SECS};
use crate::controller::reconciler::{reconcile_binding, reconcile_instance, Reconciler};
use crate::controller::secret_watch::watcher_uids;
use crate::controller::server::ServerState;
use crate::crd::{ServiceBinding, ServiceInstance};
use crate::runtime::error_policy::{handle_reconciliation_error, log_controller_error};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, Controller};
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

/// Resolves once shutdown has begun; clones resolve together
pub type ShutdownTrigger = Shared<BoxFuture<'static, ()>>;

/// Objects in `store` whose UID is listed in the secret's watch annotations
fn watchers_of<K>(store: &Store<K>, secret: &Secret) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    let uids: BTreeSet<String> = watcher_uids(&secret.metadata).into_iter().collect();
    if uids.is_empty() {
        return Vec::new();
    }
    let namespace = secret.namespace();
    store
        .state()
        .iter()
        .filter(|obj| obj.namespace() == namespace)
        .filter(|obj| obj.uid().is_some_and(|uid| uids.contains(&uid)))
        .map(|obj| ObjectRef::from_obj(obj.as_ref()))
        .collect()
}

/// Bindings affected by a change to `instance`
pub fn bindings_of(store: &Store<ServiceBinding>, instance: &ServiceInstance) -> Vec<ObjectRef<ServiceBinding>> {
    let Some(namespace) = instance.namespace() else {
        return Vec::new();
    };
    let instance_name = instance.name_any();

    let mut names: BTreeSet<String> = instance
        .annotations()
        .keys()
        .filter_map(|key| key.strip_prefix(BINDING_ANNOTATION_PREFIX))
        .map(str::to_string)
        .collect();
    names.extend(
        store
            .state()
            .iter()
            .filter(|b| b.namespace().as_deref() == Some(namespace.as_str()))
            .filter(|b| b.spec.service_instance_name == instance_name)
            .map(|b| b.name_any()),
    );

    names
        .into_iter()
        .map(|name| ObjectRef::new(&name).within(&namespace))
        .collect()
}

async fn run_instance_controller(
    client: Client,
    reconciler: Arc<Reconciler>,
    config: ControllerConfig,
    shutdown: ShutdownTrigger,
) {
    let controller = Controller::new(
        Api::<ServiceInstance>::all(client.clone()),
        watcher::Config::default().any_semantic(),
    )
    .with_config(config);
    let instances = controller.store();

    controller
        .watches(
            Api::<Secret>::all(client),
            watcher::Config::default(),
            move |secret| watchers_of(&instances, &secret),
        )
        .graceful_shutdown_on(shutdown)
        .run(reconcile_instance, handle_reconciliation_error, reconciler)
        .for_each(|result| async move {
            match result {
                Ok((obj_ref, _)) => debug!(object = %obj_ref, "watch.event.success"),
                Err(e) => log_controller_error("ServiceInstance", &e),
            }
        })
        .await;
}

async fn run_binding_controller(
    client: Client,
    reconciler: Arc<Reconciler>,
    config: ControllerConfig,
    shutdown: ShutdownTrigger,
) {
    let controller = Controller::new(
        Api::<ServiceBinding>::all(client.clone()),
        watcher::Config::default().any_semantic(),
    )
    .with_config(config);
    let bindings = controller.store();
    let by_secret = bindings.clone();

    controller
        .watches(
            Api::<ServiceInstance>::all(client.clone()),
            watcher::Config::default(),
            move |instance| bindings_of(&bindings, &instance),
        )
        .watches(
            Api::<Secret>::all(client),
            watcher::Config::default(),
            move |secret| watchers_of(&by_secret, &secret),
        )
        .graceful_shutdown_on(shutdown)
        .run(reconcile_binding, handle_reconciliation_error, reconciler)
        .for_each(|result| async move {
            match result {
                Ok((obj_ref, _)) => debug!(object = %obj_ref, "watch.event.success"),
                Err(e) => log_controller_error("ServiceBinding", &e),
            }
        })
        .await;
}

/// Wait for SIGINT or SIGTERM
async fn termination_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only SIGINT triggers shutdown");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, initiating graceful shutdown..."),
        () = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}

/// Drop readiness as soon as `signal` fires, then release every waiter
///
/// Readiness is false before any controller starts draining, so a stream that
/// ends afterwards is never mistaken for a watch failure.
pub fn shutdown_trigger<F>(signal: F, server_state: Arc<ServerState>) -> ShutdownTrigger
where
    F: Future<Output = ()> + Send + 'static,
{
    async move {
        signal.await;
        server_state.set_ready(false);
        info!("Marked server as not ready, waiting for in-flight reconciliations to complete...");
    }
    .boxed()
    .shared()
}

/// Run both controllers until shutdown
///
/// On SIGINT or SIGTERM readiness drops to false, the controllers stop taking
/// new work, and in-flight passes get `shutdown_timeout` to finish before the
/// loop returns anyway.
pub async fn run_watch_loop(
    client: Client,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
    config: SharedOperatorConfig,
) -> Result<(), anyhow::Error> {
    let shutdown = shutdown_trigger(termination_signal(), server_state.clone());
    let controller_config = ControllerConfig::default().concurrency(config.max_concurrent_reconciles);

    loop {
        if !server_state.ready() {
            break;
        }

        info!(
            max_concurrent_reconciles = config.max_concurrent_reconciles,
            "Starting ServiceInstance and ServiceBinding controllers..."
        );

        let controllers = async {
            tokio::join!(
                run_instance_controller(
                    client.clone(),
                    reconciler.clone(),
                    controller_config.clone(),
                    shutdown.clone()
                ),
                run_binding_controller(
                    client.clone(),
                    reconciler.clone(),
                    controller_config.clone(),
                    shutdown.clone()
                ),
            )
        };
        let deadline = async {
            shutdown.clone().await;
            tokio::time::sleep(config.shutdown_timeout).await;
        };

        tokio::select! {
            _ = controllers => {}
            () = deadline => {
                warn!(
                    timeout_secs = config.shutdown_timeout.as_secs(),
                    "Shutdown timeout elapsed with reconciliations still running"
                );
                break;
            }
        }

        if !server_state.ready() {
            break;
        }

        warn!(
            "Controller watch streams ended, restarting in {} seconds...",
            DEFAULT_WATCH_RESTART_DELAY_SECS
        );
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(DEFAULT_WATCH_RESTART_DELAY_SECS)) => {}
            () = shutdown.clone() => break,
        }
    }

    info!("Controller stopped gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ServiceBindingSpec, ServiceInstanceSpec};
    use kube::runtime::reflector::store;
    use kube::runtime::watcher::Event;

    fn binding(name: &str, instance: &str) -> ServiceBinding {
        let mut b = ServiceBinding::new(
            name,
            ServiceBindingSpec {
                service_instance_name: instance.into(),
                ..Default::default()
            },
        );
        b.metadata.namespace = Some("apps".into());
        b
    }

    #[test]
    fn instance_events_reach_annotated_and_referencing_bindings() {
        let (reader, mut writer) = store::<ServiceBinding>();
        writer.apply_watcher_event(&Event::Apply(binding("by-spec", "queue")));
        writer.apply_watcher_event(&Event::Apply(binding("other", "cache")));

        let mut instance = ServiceInstance::new("queue", ServiceInstanceSpec::default());
        instance.metadata.namespace = Some("apps".into());
        instance
            .annotations_mut()
            .insert(format!("{BINDING_ANNOTATION_PREFIX}by-annotation"), "true".into());

        let names: Vec<String> = bindings_of(&reader, &instance)
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["by-annotation".to_string(), "by-spec".to_string()]);
    }

    #[tokio::test]
    async fn shutdown_drops_readiness_before_waiters_resume() {
        let state = Arc::new(ServerState::default());
        state.set_ready(true);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let trigger = shutdown_trigger(
            async move {
                let _ = rx.await;
            },
            state.clone(),
        );

        let first = tokio::spawn(trigger.clone());
        let second = tokio::spawn(trigger.clone());
        tokio::task::yield_now().await;
        assert!(state.ready());
        assert!(!first.is_finished());

        tx.send(()).unwrap();
        first.await.unwrap();
        assert!(!state.ready());
        second.await.unwrap();

        // An already fired trigger resolves immediately for late waiters
        tokio::time::timeout(Duration::from_millis(100), trigger)
            .await
            .expect("fired trigger should resolve");
    }
}
