//! # Configuration
//!
//! Operator configuration loaded from the environment at startup.

mod operator;

pub use operator::OperatorConfig;

use std::sync::Arc;

/// Configuration shared between controllers, webhook and server
pub type SharedOperatorConfig = Arc<OperatorConfig>;
