//! Build container owned by a stage image

use crate::container::RunSpec;
use crate::error::{StrataError, StrataResult};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

const CONTAINER_PREFIX: &str = "strata-build-";

/// Name of the named lock serializing builds of a container
pub fn container_lock_name(container: &str) -> String {
    format!("container.{}", container)
}

/// Container a stage runs its commands in
///
/// The name is derived from the stage image name, so two builds of the
/// same image always contend for the same container and lock.
#[derive(Debug, Clone)]
pub struct StageImageContainer {
    name: String,
    from: Option<String>,
    workdir: Option<String>,
    volumes: Vec<String>,
    env: BTreeMap<String, String>,
    service_commands: Vec<String>,
    commands: Vec<String>,
    committed: bool,
}

impl StageImageContainer {
    pub fn new(image_name: &str, from: Option<String>) -> Self {
        let digest = hex::encode(Sha256::digest(image_name.as_bytes()));
        Self {
            name: format!("{}{}", CONTAINER_PREFIX, &digest[..16]),
            from,
            workdir: None,
            volumes: Vec::new(),
            env: BTreeMap::new(),
            service_commands: Vec::new(),
            commands: Vec::new(),
            committed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_name(&self) -> String {
        container_lock_name(&self.name)
    }

    pub fn from(&self) -> Option<&str> {
        self.from.as_deref()
    }

    pub fn set_workdir(&mut self, workdir: impl Into<String>) {
        self.workdir = Some(workdir.into());
    }

    pub fn add_volume(&mut self, volume: impl Into<String>) {
        self.volumes.push(volume.into());
    }

    pub fn add_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Commands run before the user commands (imports, patches)
    pub fn add_service_command(&mut self, command: impl Into<String>) {
        self.service_commands.push(command.into());
    }

    pub fn add_command(&mut self, command: impl Into<String>) {
        self.commands.push(command.into());
    }

    /// Service commands followed by user commands, in run order
    pub fn all_run_commands(&self) -> Vec<String> {
        self.service_commands
            .iter()
            .chain(self.commands.iter())
            .cloned()
            .collect()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub(crate) fn mark_committed(&mut self) -> StrataResult<()> {
        if self.committed {
            return Err(StrataError::AlreadyCommitted(self.name.clone()));
        }
        self.committed = true;
        Ok(())
    }

    /// Start of a new build: a fresh container instance
    pub(crate) fn reset(&mut self) {
        self.committed = false;
    }

    /// Spec of the build run: all commands chained with `&&` under `shell -ec`
    pub fn run_spec(&self, shell: &str) -> StrataResult<RunSpec> {
        let image = self.base_image()?;
        let commands = self.all_run_commands();
        let command = if commands.is_empty() {
            vec!["-ec".to_string(), "true".to_string()]
        } else {
            vec!["-ec".to_string(), commands.join(" && ")]
        };
        Ok(self.spec(self.name.clone(), image, shell, command))
    }

    /// Interactive session on the base image with the build environment
    pub fn introspect_before_spec(&self, shell: &str) -> StrataResult<RunSpec> {
        let image = self.base_image()?;
        Ok(self.spec(self.introspect_name(), image, shell, Vec::new()))
    }

    /// Interactive session on `image`
    pub fn introspect_spec(&self, image: &str, shell: &str) -> RunSpec {
        self.spec(self.introspect_name(), image.to_string(), shell, Vec::new())
    }

    fn introspect_name(&self) -> String {
        let session = Uuid::new_v4().simple().to_string();
        format!("{}-introspect-{}", self.name, &session[..8])
    }

    fn base_image(&self) -> StrataResult<String> {
        self.from
            .clone()
            .ok_or_else(|| StrataError::User(format!("container {} has no base image", self.name)))
    }

    fn spec(&self, name: String, image: String, shell: &str, command: Vec<String>) -> RunSpec {
        RunSpec {
            name,
            image,
            workdir: self.workdir.clone(),
            volumes: self.volumes.clone(),
            env: self.env.clone(),
            entrypoint: Some(shell.to_string()),
            command,
        }
    }
}
