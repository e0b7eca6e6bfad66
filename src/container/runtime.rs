//! Container engine abstraction
//!
//! Stage builds talk to the engine only through `ContainerRuntime`, so the
//! docker/podman CLI can be swapped for a recording fake in tests.

use crate::error::StrataResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Everything needed to start one build container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpec {
    /// Container name, unique per stage
    pub name: String,
    pub image: String,
    pub workdir: Option<String>,
    /// Volume mounts (host:container format)
    pub volumes: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub entrypoint: Option<String>,
    pub command: Vec<String>,
}

impl RunSpec {
    /// Engine arguments after `run`, without detach or interactive flags
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["--name".to_string(), self.name.clone()];

        if let Some(workdir) = &self.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        for v in &self.volumes {
            args.push("-v".to_string());
            args.push(v.clone());
        }

        for (k, v) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }

        if let Some(entrypoint) = &self.entrypoint {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.clone());
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Subset of `image inspect` output the build engine records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInspect {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub architecture: Option<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run a container to completion, attached
    ///
    /// A non-zero exit yields `ContainerRun` with the exit code; the
    /// container is left in place for the caller to commit or remove.
    async fn run(&self, spec: &RunSpec) -> StrataResult<()>;

    /// Start an interactive throwaway session described by `spec`,
    /// returning the session's exit code
    async fn introspect(&self, spec: &RunSpec) -> StrataResult<i32>;

    /// Commit a container into a new image and return its id
    async fn commit(&self, container: &str) -> StrataResult<String>;

    /// Remove a container; a missing container is not an error
    async fn remove(&self, container: &str) -> StrataResult<()>;

    async fn tag(&self, image: &str, tag: &str) -> StrataResult<()>;

    async fn remove_image(&self, image: &str) -> StrataResult<()>;

    async fn pull(&self, image: &str) -> StrataResult<()>;

    async fn push(&self, image: &str) -> StrataResult<()>;

    /// Inspect a local image, `None` when it does not exist
    async fn inspect_image(&self, image: &str) -> StrataResult<Option<ImageInspect>>;

    /// Build `dockerfile` in `context` and return the image id
    async fn build_dockerfile(
        &self,
        context: &Path,
        dockerfile: &Path,
        build_args: &BTreeMap<String, String>,
        target: Option<&str>,
    ) -> StrataResult<String>;

    /// Human-readable engine name for display
    fn runtime_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_order() {
        let mut env = BTreeMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());
        let spec = RunSpec {
            name: "strata-build-1".to_string(),
            image: "alpine:3.20".to_string(),
            workdir: Some("/app".to_string()),
            volumes: vec!["/tmp/x:/x:ro".to_string()],
            env,
            entrypoint: Some("/bin/sh".to_string()),
            command: vec!["-ec".to_string(), "true".to_string()],
        };

        assert_eq!(
            spec.args(),
            vec![
                "--name", "strata-build-1", "-w", "/app", "-v", "/tmp/x:/x:ro", "-e", "A=1", "-e",
                "B=2", "--entrypoint", "/bin/sh", "alpine:3.20", "-ec", "true"
            ]
        );
    }

    #[test]
    fn inspect_parses_engine_json() {
        let json = r#"{"Id":"sha256:abc","RepoTags":["app:1"],"Size":1024,"Extra":true}"#;
        let inspect: ImageInspect = serde_json::from_str(json).unwrap();
        assert_eq!(inspect.id, "sha256:abc");
        assert_eq!(inspect.repo_tags, Some(vec!["app:1".to_string()]));
        assert_eq!(inspect.size, Some(1024));
        assert!(inspect.created.is_none());
    }
}
