//! # SM Service Operator
//!
//! Kubernetes operator that provisions Service Manager instances and bindings
//! declared as `ServiceInstance` and `ServiceBinding` resources, and materializes
//! binding credentials into secrets.
//!
//! Configuration is read from environment variables, see
//! [`sm_service_operator::config::OperatorConfig`].

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sm_service_operator::runtime::run().await
}
