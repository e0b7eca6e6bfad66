//! Scoped worktree checkouts
//!
//! Each cache directory holds at most one checkout at a time, at
//! `<cache_dir>/worktree`, guarded by the `worktree.<cache_dir>` lock. The
//! checkout is removed and pruned from the repository after the body
//! finishes, fails, panics or is cancelled.

use crate::error::{StrataError, StrataResult};
use crate::git::cli::GitCli;
use crate::git::commit::CommitId;
use crate::lock::LockManager;
use std::ffi::OsStr;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct WorktreeManager {
    locks: Arc<LockManager>,
    git: GitCli,
}

impl WorktreeManager {
    pub fn new(locks: Arc<LockManager>, git: GitCli) -> Self {
        Self { locks, git }
    }

    /// Check out `commit` under `cache_dir` and run `body` on the checkout
    pub async fn with_worktree<F, Fut, T>(
        &self,
        git_dir: &Path,
        cache_dir: &Path,
        commit: &CommitId,
        has_submodules: bool,
        body: F,
    ) -> StrataResult<T>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = StrataResult<T>>,
    {
        self.with_checkouts(git_dir, cache_dir, &[commit], has_submodules, body)
            .await
    }

    /// Like [`with_worktree`](Self::with_worktree), but check out `base`
    /// with its submodules first.
    ///
    /// The checkout then also holds the submodule repositories of `base`,
    /// including those `commit` no longer has.
    pub async fn with_worktree_over<F, Fut, T>(
        &self,
        git_dir: &Path,
        cache_dir: &Path,
        base: &CommitId,
        commit: &CommitId,
        body: F,
    ) -> StrataResult<T>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = StrataResult<T>>,
    {
        self.with_checkouts(git_dir, cache_dir, &[base, commit], true, body)
            .await
    }

    async fn with_checkouts<F, Fut, T>(
        &self,
        git_dir: &Path,
        cache_dir: &Path,
        commits: &[&CommitId],
        has_submodules: bool,
        body: F,
    ) -> StrataResult<T>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = StrataResult<T>>,
    {
        let _lock = self
            .locks
            .acquire(&format!("worktree.{}", cache_dir.display()))
            .await?;

        tokio::fs::create_dir_all(cache_dir)
            .await
            .map_err(|e| StrataError::io(format!("creating {}", cache_dir.display()), e))?;
        let worktree_dir = cache_dir.join("worktree");

        // Left behind by a crashed run
        if worktree_dir.exists() {
            debug!("Removing stale worktree {}", worktree_dir.display());
            self.remove(git_dir, &worktree_dir).await?;
        }

        let mut cleanup = WorktreeCleanup {
            git: self.git.clone(),
            git_dir: git_dir.to_path_buf(),
            worktree_dir: worktree_dir.clone(),
            armed: true,
        };

        let prepared = self
            .checkout(git_dir, &worktree_dir, commits, has_submodules)
            .await;
        let result = match prepared {
            Ok(()) => body(worktree_dir.clone()).await,
            Err(e) => Err(e),
        };

        cleanup.armed = false;
        if let Err(e) = self.remove(git_dir, &worktree_dir).await {
            warn!(
                "Failed to clean up worktree {}: {}",
                worktree_dir.display(),
                e
            );
        }

        result
    }

    /// Check out each of `commits` in turn; the last one stays
    async fn checkout(
        &self,
        git_dir: &Path,
        worktree_dir: &Path,
        commits: &[&CommitId],
        has_submodules: bool,
    ) -> StrataResult<()> {
        for (i, commit) in commits.iter().enumerate() {
            debug!(
                "Checking out {} into {}",
                commit.short(),
                worktree_dir.display()
            );
            if i == 0 {
                self.git
                    .run(
                        None,
                        [
                            OsStr::new("--git-dir"),
                            git_dir.as_os_str(),
                            OsStr::new("worktree"),
                            OsStr::new("add"),
                            OsStr::new("--detach"),
                            OsStr::new("--force"),
                            worktree_dir.as_os_str(),
                            OsStr::new(commit.as_str()),
                        ],
                    )
                    .await?;
            } else {
                self.git
                    .run(
                        Some(worktree_dir),
                        ["checkout", "-q", "--detach", "--force", commit.as_str()],
                    )
                    .await?;
            }

            if has_submodules {
                self.git
                    .run(
                        Some(worktree_dir),
                        ["submodule", "update", "--init", "--recursive", "--force"],
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn remove(&self, git_dir: &Path, worktree_dir: &Path) -> StrataResult<()> {
        match tokio::fs::remove_dir_all(worktree_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StrataError::io(
                    format!("removing {}", worktree_dir.display()),
                    e,
                ))
            }
        }
        self.git
            .run(
                None,
                [
                    OsStr::new("--git-dir"),
                    git_dir.as_os_str(),
                    OsStr::new("worktree"),
                    OsStr::new("prune"),
                ],
            )
            .await?;
        Ok(())
    }
}

/// Blocking cleanup for when the body never returns normally
struct WorktreeCleanup {
    git: GitCli,
    git_dir: PathBuf,
    worktree_dir: PathBuf,
    armed: bool,
}

impl Drop for WorktreeCleanup {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            "Worktree {} abandoned; cleaning up",
            self.worktree_dir.display()
        );
        if let Err(e) = std::fs::remove_dir_all(&self.worktree_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.worktree_dir.display(), e);
            }
        }
        let git_dir = self.git_dir.as_os_str();
        if let Err(e) = self.git.run_blocking(
            None,
            [
                OsStr::new("--git-dir"),
                git_dir,
                OsStr::new("worktree"),
                OsStr::new("prune"),
            ],
        ) {
            warn!("Failed to prune worktrees of {}: {}", self.git_dir.display(), e);
        }
    }
}
