//! Git content provider
//!
//! Resolves references and produces patches, archives and checksums for
//! on-disk repositories. Object-level work goes through libgit2 on the
//! blocking pool; worktree checkout and fetching shell out to `git`.

pub mod archive;
pub mod cache;
pub mod cli;
pub mod commit;
pub mod ls_tree;
pub mod matcher;
pub mod options;
pub mod patch;
pub mod provider;
pub mod repo;
pub mod worktree;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{Archive, ArchiveDescriptor, GitContentCache, Patch, PatchDescriptor};
pub use commit::CommitId;
pub use matcher::PathMatcher;
pub use options::{ArchiveOptions, ChecksumOptions, PatchOptions, PathFilter};
pub use provider::GitContentProvider;
pub use repo::{GitRepo, LocalRepo, RemoteRepo};
pub use worktree::WorktreeManager;

use crate::error::{StrataError, StrataResult};
use git2::Repository;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// On-disk repository: work path plus git directory
///
/// Holds paths only; every operation opens the repository afresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoHandle {
    work_path: PathBuf,
    git_dir: PathBuf,
}

impl RepoHandle {
    pub fn new(work_path: impl Into<PathBuf>, git_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_path: work_path.into(),
            git_dir: git_dir.into(),
        }
    }

    /// Find the repository containing `path`
    pub fn discover(path: &Path) -> StrataResult<Self> {
        let repo = Repository::discover(path).map_err(|e| StrataError::RepositoryOpen {
            path: path.to_path_buf(),
            reason: e.message().to_string(),
        })?;
        let git_dir = repo.path().to_path_buf();
        let work_path = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| git_dir.clone());
        Ok(Self { work_path, git_dir })
    }

    pub fn work_path(&self) -> &Path {
        &self.work_path
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Open the repository; linked worktrees resolve to the shared object store
    pub fn open(&self) -> StrataResult<Repository> {
        Repository::open(&self.git_dir).map_err(|e| StrataError::RepositoryOpen {
            path: self.git_dir.clone(),
            reason: e.message().to_string(),
        })
    }

    /// Canonical common git directory, identical for all linked worktrees
    pub fn identity(&self) -> StrataResult<String> {
        let repo = self.open()?;
        let git_dir = repo.path();
        // Linked worktrees point at the shared directory through `commondir`
        let common = match std::fs::read_to_string(git_dir.join("commondir")) {
            Ok(body) => git_dir.join(body.trim()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => git_dir.to_path_buf(),
            Err(e) => return Err(StrataError::io(format!("reading {}", git_dir.display()), e)),
        };
        let canonical = common
            .canonicalize()
            .map_err(|e| StrataError::io(format!("resolving {}", common.display()), e))?;
        Ok(canonical.to_string_lossy().into_owned())
    }
}

/// Digest over the listings of configured paths at one commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checksum {
    pub digest: String,
    /// Configured paths that matched nothing in the tree
    pub no_match_paths: Vec<String>,
}

/// Run libgit2 work on the blocking pool
pub(crate) async fn blocking<F, T>(f: F) -> StrataResult<T>
where
    F: FnOnce() -> StrataResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StrataError::Internal(format!("git task failed: {}", e)))?
}
