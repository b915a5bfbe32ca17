//! # Runtime
//!
//! Start-up, the controller watch loop and the error policy.

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;

pub use initialization::{initialize, InitializationResult};
pub use watch_loop::run_watch_loop;

/// Initialize the operator and run it until shutdown
pub async fn run() -> Result<(), anyhow::Error> {
    let InitializationResult {
        client,
        reconciler,
        server_state,
        config,
    } = initialize().await?;
    run_watch_loop(client, reconciler, server_state, config).await
}
