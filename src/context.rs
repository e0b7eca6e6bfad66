//! Per-invocation engine wiring
//!
//! Everything shared between repositories and stages hangs off one
//! `EngineContext` built from the loaded configuration.

use crate::config::{Config, ConfigManager};
use crate::container::{create_runtime, ContainerRuntime};
use crate::error::StrataResult;
use crate::git::cli::GitCli;
use crate::git::{GitContentCache, GitContentProvider, LocalRepo, RemoteRepo, WorktreeManager};
use crate::lock::LockManager;
use crate::stage::{StageImage, StageSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub struct EngineContext {
    cache_root: PathBuf,
    locks: Arc<LockManager>,
    provider: Arc<GitContentProvider>,
    runtime: Arc<dyn ContainerRuntime>,
    git: GitCli,
    stage_settings: StageSettings,
}

impl EngineContext {
    /// Context using the container engine named in `config`
    pub fn new(config: &Config) -> Self {
        Self::with_runtime(config, create_runtime(&config.container))
    }

    pub fn with_runtime(config: &Config, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::with_parts(config, runtime, GitCli::new())
    }

    pub(crate) fn with_parts(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        git: GitCli,
    ) -> Self {
        let cache_root = ConfigManager::cache_root(config);
        debug!("Using cache root {}", cache_root.display());

        let locks = Arc::new(LockManager::new(cache_root.join("locks"), &config.lock));
        let cache = Arc::new(GitContentCache::new(
            cache_root.join("git_data"),
            Arc::clone(&locks),
        ));
        let worktrees = WorktreeManager::new(Arc::clone(&locks), git.clone());
        let provider = Arc::new(GitContentProvider::new(
            cache,
            worktrees,
            cache_root.join("worktrees"),
        ));

        Self {
            cache_root,
            locks,
            provider,
            runtime,
            git,
            stage_settings: StageSettings::from_config(config),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn provider(&self) -> &Arc<GitContentProvider> {
        &self.provider
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Repository containing `path`
    pub fn local_repo(&self, name: &str, path: &Path) -> StrataResult<LocalRepo> {
        LocalRepo::open(name, path, Arc::clone(&self.provider))
    }

    /// Cached clone of `url`; call `fetch()` before use
    pub fn remote_repo(&self, name: &str, url: &str) -> RemoteRepo {
        RemoteRepo::new(
            name,
            url,
            &self.cache_root.join("remotes"),
            Arc::clone(&self.provider),
            Arc::clone(&self.locks),
            self.git.clone(),
        )
    }

    /// Stage image `name` on top of `from`
    pub fn stage_image(&self, name: &str, from: Option<String>) -> StageImage {
        StageImage::new(
            name,
            from,
            Arc::clone(&self.runtime),
            Arc::clone(&self.locks),
            self.stage_settings.clone(),
        )
    }
}
