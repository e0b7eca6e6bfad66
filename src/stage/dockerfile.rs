//! Dockerfile-driven stage images

use crate::container::ContainerRuntime;
use crate::error::{StrataError, StrataResult};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

/// Builds a stage from a Dockerfile instead of a build container
#[derive(Debug, Clone)]
pub struct DockerfileImageBuilder {
    context: PathBuf,
    dockerfile: PathBuf,
    build_args: BTreeMap<String, String>,
    target: Option<String>,
    built_id: Option<String>,
}

impl DockerfileImageBuilder {
    pub fn new(context: impl Into<PathBuf>, dockerfile: impl Into<PathBuf>) -> Self {
        Self {
            context: context.into(),
            dockerfile: dockerfile.into(),
            build_args: BTreeMap::new(),
            target: None,
            built_id: None,
        }
    }

    pub fn build_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.build_args.insert(key.into(), value.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub async fn build(&mut self, runtime: &dyn ContainerRuntime) -> StrataResult<String> {
        info!(
            "Building {} in {}",
            self.dockerfile.display(),
            self.context.display()
        );
        let id = runtime
            .build_dockerfile(
                &self.context,
                &self.dockerfile,
                &self.build_args,
                self.target.as_deref(),
            )
            .await?;
        self.built_id = Some(id.clone());
        Ok(id)
    }

    pub fn built_id(&self) -> StrataResult<&str> {
        self.built_id
            .as_deref()
            .ok_or_else(|| StrataError::NotBuilt(self.dockerfile.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::FakeRuntime;

    #[tokio::test]
    async fn built_id_is_available_after_build() {
        let runtime = FakeRuntime::new();
        let mut builder = DockerfileImageBuilder::new("/ctx", "/ctx/Dockerfile")
            .build_arg("VERSION", "1")
            .target("runtime");

        assert!(matches!(builder.built_id(), Err(StrataError::NotBuilt(_))));
        let id = builder.build(&runtime).await.unwrap();
        assert_eq!(builder.built_id().unwrap(), id);
        assert_eq!(runtime.ops(), vec!["build_dockerfile"]);
    }
}
