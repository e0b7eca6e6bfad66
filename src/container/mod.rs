//! Container engine access for stage builds

pub mod cli_runtime;
pub mod retry;
pub mod runtime;

#[cfg(test)]
pub(crate) mod fake;

pub use cli_runtime::CliRuntime;
pub use retry::RetryPolicy;
pub use runtime::{ContainerRuntime, ImageInspect, RunSpec};

use crate::config::schema::ContainerConfig;
use std::sync::Arc;

/// Create the runtime selected by configuration
pub fn create_runtime(config: &ContainerConfig) -> Arc<dyn ContainerRuntime> {
    Arc::new(CliRuntime::new(config.binary.clone()))
}
