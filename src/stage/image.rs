//! Stage image lifecycle
//!
//! A stage image is built either by running commands in a build container
//! on top of a base image and committing the result, or by delegating to a
//! Dockerfile build. Once built it can be tagged, pushed, exported under
//! another name or replaced by an imported image.

use crate::config::Config;
use crate::container::{ContainerRuntime, ImageInspect, RetryPolicy};
use crate::error::{StrataError, StrataResult};
use crate::lock::{LockGuard, LockManager};
use crate::stage::container::StageImageContainer;
use crate::stage::dockerfile::DockerfileImageBuilder;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Environment switch printing the full run command of each build
pub const DEBUG_RUN_COMMAND_ENV: &str = "STRATA_DEBUG_RUN_COMMAND";

/// Where a stage image is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Unbuilt,
    Built,
    Distributed,
}

/// What to do when the build container exits non-zero
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Open a shell on the base image with the build environment
    pub introspect_before_error: bool,
    /// Commit the failed container and open a shell in the result
    pub introspect_after_error: bool,
}

/// Settings shared by all stage images of a build
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub introspect_shell: String,
    pub debug_run_command: bool,
    pub retry: RetryPolicy,
}

impl StageSettings {
    pub fn from_config(config: &Config) -> Self {
        let from_env = std::env::var(DEBUG_RUN_COMMAND_ENV)
            .map(|v| v == "1")
            .unwrap_or(false);
        Self {
            introspect_shell: config.container.introspect_shell.clone(),
            debug_run_command: config.container.debug_run_command || from_env,
            retry: RetryPolicy::from_config(&config.distribution),
        }
    }
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            introspect_shell: "/bin/sh".to_string(),
            debug_run_command: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Removes the build container if a build is abandoned mid-flight.
///
/// Holds the container lock until that removal has finished, so the next
/// build of the same stage never sees the abandoned container.
struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    lock: Option<LockGuard>,
    armed: bool,
}

impl ContainerGuard {
    fn new(runtime: Arc<dyn ContainerRuntime>, name: &str, lock: LockGuard) -> Self {
        Self {
            runtime,
            name: name.to_string(),
            lock: Some(lock),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Build container {} left behind", self.name);
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        let name = std::mem::take(&mut self.name);
        let lock = self.lock.take();
        handle.spawn(async move {
            if let Err(e) = runtime.remove(&name).await {
                warn!("Failed to remove build container {}: {}", name, e);
            }
            drop(lock);
        });
    }
}

/// One image in a stage chain
pub struct StageImage {
    name: String,
    from: Option<String>,
    runtime: Arc<dyn ContainerRuntime>,
    locks: Arc<LockManager>,
    settings: StageSettings,
    container: StageImageContainer,
    built_id: Option<String>,
    inspect: Option<ImageInspect>,
    dockerfile_builder: Option<DockerfileImageBuilder>,
    distributed: bool,
}

impl StageImage {
    /// Stage image `name` built on top of the image `from`
    pub fn new(
        name: impl Into<String>,
        from: Option<String>,
        runtime: Arc<dyn ContainerRuntime>,
        locks: Arc<LockManager>,
        settings: StageSettings,
    ) -> Self {
        let name = name.into();
        let container = StageImageContainer::new(&name, from.clone());
        Self {
            name,
            from,
            runtime,
            locks,
            settings,
            container,
            built_id: None,
            inspect: None,
            dockerfile_builder: None,
            distributed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn from(&self) -> Option<&str> {
        self.from.as_deref()
    }

    pub fn container(&self) -> &StageImageContainer {
        &self.container
    }

    pub fn container_mut(&mut self) -> &mut StageImageContainer {
        &mut self.container
    }

    /// Build through a Dockerfile instead of the build container
    pub fn set_dockerfile_builder(&mut self, builder: DockerfileImageBuilder) {
        self.dockerfile_builder = Some(builder);
    }

    pub fn dockerfile_builder(&self) -> Option<&DockerfileImageBuilder> {
        self.dockerfile_builder.as_ref()
    }

    pub fn state(&self) -> StageState {
        if self.distributed {
            StageState::Distributed
        } else if self.built_id.is_some() {
            StageState::Built
        } else {
            StageState::Unbuilt
        }
    }

    /// Cached inspection of the image, if one was taken
    pub fn inspect(&self) -> Option<&ImageInspect> {
        self.inspect.as_ref()
    }

    /// Drop the cached inspection so the next lookup asks the engine
    pub fn reset_inspect(&mut self) {
        self.inspect = None;
    }

    /// Build the image
    ///
    /// Builds of the same image are serialized by the container lock, so
    /// they never share a build container; a container left over from a
    /// crashed or cancelled build is removed first. On a failed run the optional
    /// introspection session runs before the container is removed; the
    /// run error is returned unless removal fails too.
    pub async fn build(&mut self, options: &BuildOptions) -> StrataResult<()> {
        if let Some(builder) = self.dockerfile_builder.as_mut() {
            let id = builder.build(self.runtime.as_ref()).await?;
            self.inspect = self.runtime.inspect_image(&id).await?;
            self.built_id = Some(id);
            return Ok(());
        }

        let lock = self.locks.acquire(&self.container.lock_name()).await?;
        self.container.reset();

        let spec = self.container.run_spec(&self.settings.introspect_shell)?;
        if self.settings.debug_run_command {
            info!(
                "{} run {}",
                self.runtime.runtime_name().to_lowercase(),
                spec.args().join(" ")
            );
            info!("Decoded command: {}", self.container.all_run_commands().join(" && "));
        }

        // A crashed or abandoned build may have left the container behind
        if let Err(e) = self.runtime.remove(&spec.name).await {
            warn!("Failed to clear stale build container {}: {}", spec.name, e);
        }

        let mut guard = ContainerGuard::new(Arc::clone(&self.runtime), &spec.name, lock);

        if let Err(run_err) = self.runtime.run(&spec).await {
            if matches!(run_err, StrataError::ContainerRun { .. }) {
                info!(
                    "Launched command: {}",
                    self.container.all_run_commands().join(" && ")
                );
                self.introspect_failure(options).await;
            }
            guard.disarm();
            return Err(match self.runtime.remove(&spec.name).await {
                Ok(()) => run_err,
                Err(cleanup) => run_err.with_cleanup_failure(cleanup),
            });
        }

        let committed = self.commit_container().await;
        guard.disarm();
        let removed = self.runtime.remove(&spec.name).await;

        let id = match (committed, removed) {
            (Ok(id), Ok(())) => id,
            (Ok(id), Err(e)) => {
                warn!("Failed to remove build container {}: {}", spec.name, e);
                id
            }
            (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(cleanup)) => return Err(e.with_cleanup_failure(cleanup)),
        };

        let inspect = self
            .runtime
            .inspect_image(&id)
            .await?
            .ok_or_else(|| StrataError::ImageNotFound(id.clone()))?;
        self.inspect = Some(inspect);
        self.built_id = Some(id.clone());
        info!("Built {} as {}", self.name, id);
        Ok(())
    }

    async fn introspect_failure(&mut self, options: &BuildOptions) {
        if options.introspect_before_error {
            info!("Opening shell on {} before the failed commands", self.name);
            if let Err(e) = self.introspect_before().await {
                error!("Introspection failed: {}", e);
            }
        } else if options.introspect_after_error {
            info!("Opening shell in the failed build of {}", self.name);
            if let Err(e) = self.introspect_after().await {
                error!("Introspection failed: {}", e);
            }
        }
    }

    async fn introspect_before(&self) -> StrataResult<()> {
        let spec = self
            .container
            .introspect_before_spec(&self.settings.introspect_shell)?;
        let code = self.runtime.introspect(&spec).await?;
        debug!("Introspection session exited with {}", code);
        Ok(())
    }

    /// Snapshot the failed container without recording it as built
    async fn introspect_after(&mut self) -> StrataResult<()> {
        self.container.mark_committed()?;
        let image = self.runtime.commit(self.container.name()).await?;
        let spec = self
            .container
            .introspect_spec(&image, &self.settings.introspect_shell);
        let session = self.runtime.introspect(&spec).await;
        if let Err(e) = self.runtime.remove_image(&image).await {
            warn!("Failed to remove introspection image {}: {}", image, e);
        }
        debug!("Introspection session exited with {}", session?);
        Ok(())
    }

    /// Commit the build container into the built image
    pub async fn commit(&mut self) -> StrataResult<String> {
        let id = self.commit_container().await?;
        self.built_id = Some(id.clone());
        Ok(id)
    }

    async fn commit_container(&mut self) -> StrataResult<String> {
        self.container.mark_committed()?;
        self.runtime.commit(self.container.name()).await
    }

    /// Open a shell in the built image
    pub async fn introspect(&self) -> StrataResult<()> {
        let image = self.get_built_id()?;
        let spec = self
            .container
            .introspect_spec(&image, &self.settings.introspect_shell);
        let code = self.runtime.introspect(&spec).await?;
        debug!("Introspection session exited with {}", code);
        Ok(())
    }

    /// Id of the built image
    pub fn get_built_id(&self) -> StrataResult<String> {
        if let Some(builder) = &self.dockerfile_builder {
            return builder.built_id().map(str::to_string);
        }
        self.built_id
            .clone()
            .ok_or_else(|| StrataError::NotBuilt(self.name.clone()))
    }

    /// Resolved id of this image: the built id, else the id the name points to
    pub async fn get_id(&mut self) -> StrataResult<String> {
        if let Ok(id) = self.get_built_id() {
            return Ok(id);
        }
        if let Some(inspect) = &self.inspect {
            return Ok(inspect.id.clone());
        }
        let inspect = self
            .runtime
            .inspect_image(&self.name)
            .await?
            .ok_or_else(|| StrataError::ImageNotFound(self.name.clone()))?;
        let id = inspect.id.clone();
        self.inspect = Some(inspect);
        Ok(id)
    }

    /// Point `name` at this image
    pub async fn tag(&mut self, name: &str) -> StrataResult<()> {
        let id = self.get_id().await?;
        self.runtime.tag(&id, name).await
    }

    /// Point `name` at the built image specifically
    pub async fn tag_built_image(&self, name: &str) -> StrataResult<()> {
        let id = self.get_built_id()?;
        self.runtime.tag(&id, name).await
    }

    pub async fn pull(&mut self) -> StrataResult<()> {
        let runtime = &self.runtime;
        let name = &self.name;
        self.settings
            .retry
            .run("pull", || runtime.pull(name))
            .await?;
        self.inspect = None;
        Ok(())
    }

    pub async fn push(&mut self) -> StrataResult<()> {
        let runtime = &self.runtime;
        let name = &self.name;
        self.settings
            .retry
            .run("push", || runtime.push(name))
            .await?;
        self.distributed = true;
        Ok(())
    }

    /// Replace this image with the image published as `name`
    ///
    /// The intermediate `name` tag is removed afterwards whether or not
    /// tagging succeeded; failing to remove it is only logged.
    pub async fn import(&mut self, name: &str) -> StrataResult<()> {
        let runtime = &self.runtime;
        self.settings
            .retry
            .run("pull", || runtime.pull(name))
            .await?;

        let imported = self.tag_imported(name).await;

        if let Err(e) = self.runtime.remove_image(name).await {
            warn!("Failed to remove imported tag {}: {}", name, e);
        }

        imported?;
        self.inspect = None;
        self.distributed = true;
        Ok(())
    }

    async fn tag_imported(&self, name: &str) -> StrataResult<()> {
        let inspect = self
            .runtime
            .inspect_image(name)
            .await?
            .ok_or_else(|| StrataError::ImageNotFound(name.to_string()))?;
        self.runtime.tag(&inspect.id, &self.name).await
    }

    /// Publish this image as `name`
    ///
    /// The temporary `name` tag is always removed after the push attempt;
    /// the push result decides the outcome.
    pub async fn export(&mut self, name: &str) -> StrataResult<()> {
        self.tag(name).await?;

        let runtime = &self.runtime;
        let pushed = self
            .settings
            .retry
            .run("push", || runtime.push(name))
            .await;

        if let Err(e) = self.runtime.remove_image(name).await {
            warn!("Failed to remove exported tag {}: {}", name, e);
        }

        pushed?;
        self.distributed = true;
        Ok(())
    }
}
