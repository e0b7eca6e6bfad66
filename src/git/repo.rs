//! Repository kinds
//!
//! `GitRepo` is the capability set the stage planner works against. A
//! `LocalRepo` is a working copy whose references are resolved directly; a
//! `RemoteRepo` is a bare clone kept under the cache root whose branches
//! are resolved through the fetched `origin` remote-tracking refs.

use crate::error::{StrataError, StrataResult};
use crate::git::cache::{Archive, Patch};
use crate::git::cli::GitCli;
use crate::git::commit::CommitId;
use crate::git::options::{ArchiveOptions, ChecksumOptions, PatchOptions};
use crate::git::provider::GitContentProvider;
use crate::git::{Checksum, RepoHandle};
use crate::lock::LockManager;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait GitRepo: Send + Sync {
    /// Name used in logs and stage metadata
    fn name(&self) -> &str;

    fn handle(&self) -> &RepoHandle;

    /// Stable identity used in cache keys
    fn identity(&self) -> &str;

    fn provider(&self) -> &GitContentProvider;

    async fn head_commit(&self) -> StrataResult<CommitId>;

    async fn latest_branch_commit(&self, branch: &str) -> StrataResult<CommitId>;

    async fn tag_commit(&self, tag: &str) -> StrataResult<CommitId>;

    fn worktree_cache_dir(&self) -> PathBuf {
        self.provider().worktree_cache_dir(self.identity())
    }

    async fn create_patch(&self, opts: &PatchOptions) -> StrataResult<Patch> {
        self.provider()
            .create_patch(self.handle(), self.identity(), &self.worktree_cache_dir(), opts)
            .await
    }

    async fn create_archive(&self, opts: &ArchiveOptions) -> StrataResult<Archive> {
        self.provider()
            .create_archive(self.handle(), self.identity(), &self.worktree_cache_dir(), opts)
            .await
    }

    async fn checksum(&self, opts: &ChecksumOptions) -> StrataResult<Checksum> {
        self.provider()
            .checksum_with_ls_tree(self.handle(), &self.worktree_cache_dir(), opts)
            .await
    }

    async fn is_empty(&self) -> StrataResult<bool> {
        self.provider().is_empty(self.handle()).await
    }

    async fn is_commit_exists(&self, commit: &str) -> StrataResult<bool> {
        self.provider().is_commit_exists(self.handle(), commit).await
    }

    async fn remote_origin_url(&self) -> StrataResult<String> {
        self.provider().remote_origin_url(self.handle()).await
    }

    async fn tags_list(&self) -> StrataResult<Vec<String>> {
        self.provider().tags_list(self.handle()).await
    }

    async fn remote_branches_list(&self) -> StrataResult<Vec<String>> {
        self.provider().remote_branches_list(self.handle()).await
    }

    async fn create_detached_merge_commit(&self, from: &str, to: &str) -> StrataResult<CommitId> {
        self.provider()
            .create_detached_merge_commit(self.handle(), from, to)
            .await
    }

    async fn merge_commit_parents(&self, commit: &str) -> StrataResult<Vec<CommitId>> {
        self.provider()
            .merge_commit_parents(self.handle(), commit)
            .await
    }
}

/// Working copy on the local filesystem
pub struct LocalRepo {
    name: String,
    handle: RepoHandle,
    identity: String,
    provider: Arc<GitContentProvider>,
}

impl LocalRepo {
    /// Open the repository containing `path`
    pub fn open(
        name: impl Into<String>,
        path: &Path,
        provider: Arc<GitContentProvider>,
    ) -> StrataResult<Self> {
        let handle = RepoHandle::discover(path)?;
        let identity = handle.identity()?;
        Ok(Self {
            name: name.into(),
            handle,
            identity,
            provider,
        })
    }
}

#[async_trait]
impl GitRepo for LocalRepo {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self) -> &RepoHandle {
        &self.handle
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn provider(&self) -> &GitContentProvider {
        &self.provider
    }

    async fn head_commit(&self) -> StrataResult<CommitId> {
        self.provider.head_commit(&self.handle).await
    }

    async fn latest_branch_commit(&self, branch: &str) -> StrataResult<CommitId> {
        self.provider
            .resolve_reference(&self.handle, &format!("refs/heads/{}", branch))
            .await
    }

    async fn tag_commit(&self, tag: &str) -> StrataResult<CommitId> {
        self.provider
            .resolve_reference(&self.handle, &format!("refs/tags/{}", tag))
            .await
    }
}

/// Bare clone of a remote repository under the cache root
pub struct RemoteRepo {
    name: String,
    url: String,
    handle: RepoHandle,
    provider: Arc<GitContentProvider>,
    locks: Arc<LockManager>,
    git: GitCli,
}

impl RemoteRepo {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        clones_root: &Path,
        provider: Arc<GitContentProvider>,
        locks: Arc<LockManager>,
        git: GitCli,
    ) -> Self {
        let url = url.into();
        let digest = hex::encode(Sha256::digest(url.as_bytes()));
        let clone_dir = clones_root.join(&digest[..12]);
        Self {
            name: name.into(),
            url,
            handle: RepoHandle::new(clone_dir.clone(), clone_dir),
            provider,
            locks,
            git,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Create the clone if needed and fetch all branches and tags
    pub async fn fetch(&self) -> StrataResult<()> {
        let clone_dir = self.handle.git_dir();
        let _lock = self
            .locks
            .acquire(&format!("remote.{}", clone_dir.display()))
            .await?;

        if !clone_dir.join("HEAD").exists() {
            info!("Cloning {} into {}", self.url, clone_dir.display());
            tokio::fs::create_dir_all(clone_dir)
                .await
                .map_err(|e| StrataError::io(format!("creating {}", clone_dir.display()), e))?;
            self.git
                .run(Some(clone_dir), ["init", "--bare", "-q", "."])
                .await?;
            self.git_in_clone(&["remote", "add", "origin", &self.url])
                .await?;
        }

        info!("Fetching {}", self.url);
        self.git_in_clone(&[
            "fetch",
            "--prune",
            "--tags",
            "origin",
            "+refs/heads/*:refs/remotes/origin/*",
        ])
        .await?;

        if let Err(e) = self
            .git_in_clone(&["remote", "set-head", "origin", "--auto"])
            .await
        {
            warn!("Unable to resolve default branch of {}: {}", self.url, e);
        }
        Ok(())
    }

    async fn git_in_clone(&self, args: &[&str]) -> StrataResult<String> {
        let mut full = vec![OsStr::new("--git-dir"), self.handle.git_dir().as_os_str()];
        full.extend(args.iter().map(OsStr::new));
        self.git.run(None, full).await
    }
}

#[async_trait]
impl GitRepo for RemoteRepo {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self) -> &RepoHandle {
        &self.handle
    }

    fn identity(&self) -> &str {
        &self.url
    }

    fn provider(&self) -> &GitContentProvider {
        &self.provider
    }

    async fn head_commit(&self) -> StrataResult<CommitId> {
        let mut last_err = None;
        for reference in [
            "refs/remotes/origin/HEAD",
            "refs/remotes/origin/main",
            "refs/remotes/origin/master",
        ] {
            match self.provider.resolve_reference(&self.handle, reference).await {
                Ok(commit) => return Ok(commit),
                Err(e @ StrataError::ReferenceNotFound { .. }) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| StrataError::ReferenceNotFound {
            reference: "HEAD".to_string(),
            reason: format!("no default branch fetched from {}", self.url),
        }))
    }

    async fn latest_branch_commit(&self, branch: &str) -> StrataResult<CommitId> {
        self.provider
            .resolve_reference(&self.handle, &format!("refs/remotes/origin/{}", branch))
            .await
    }

    async fn tag_commit(&self, tag: &str) -> StrataResult<CommitId> {
        self.provider
            .resolve_reference(&self.handle, &format!("refs/tags/{}", tag))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::LockConfig;
    use crate::git::cache::GitContentCache;
    use crate::git::options::PathFilter;
    use crate::git::test_support::{git_cli, TestRepo};
    use crate::git::worktree::WorktreeManager;
    use tempfile::TempDir;

    fn provider(temp: &TempDir) -> (Arc<GitContentProvider>, Arc<LockManager>) {
        let locks = Arc::new(LockManager::new(temp.path().join("locks"), &LockConfig::default()));
        let cache = Arc::new(GitContentCache::new(temp.path().join("git_data"), locks.clone()));
        let provider = GitContentProvider::new(
            cache,
            WorktreeManager::new(locks.clone(), git_cli()),
            temp.path().join("worktrees"),
        );
        (Arc::new(provider), locks)
    }

    #[tokio::test]
    async fn local_repo_resolves_references() {
        let repo = TestRepo::new();
        repo.write("a.txt", "one");
        let first = repo.commit("first");
        repo.git(&["tag", "v1"]);
        repo.git(&["branch", "stable"]);
        repo.write("a.txt", "two");
        let second = repo.commit("second");

        let temp = TempDir::new().unwrap();
        let (provider, _) = provider(&temp);
        let local = LocalRepo::open("app", repo.path(), provider).unwrap();

        assert_eq!(local.name(), "app");
        assert_eq!(local.head_commit().await.unwrap().as_str(), second);
        assert_eq!(local.latest_branch_commit("stable").await.unwrap().as_str(), first);
        assert_eq!(local.tag_commit("v1").await.unwrap().as_str(), first);
        assert!(matches!(
            local.tag_commit("v9").await.unwrap_err(),
            StrataError::ReferenceNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn local_repo_delegates_content_operations() {
        let repo = TestRepo::new();
        repo.write("app/a.txt", "one\n");
        let from = repo.commit("first");
        repo.write("app/a.txt", "two\n");
        let to = repo.commit("second");

        let temp = TempDir::new().unwrap();
        let (provider, _) = provider(&temp);
        let local = LocalRepo::open("app", repo.path(), provider).unwrap();

        let patch = local
            .create_patch(&PatchOptions::new(PathFilter::new("app"), from, to.clone()))
            .await
            .unwrap();
        assert!(!patch.is_empty());

        let checksum = local
            .checksum(&ChecksumOptions {
                filter: PathFilter::new("app"),
                paths: vec!["a.txt".to_string()],
                commit: to,
            })
            .await
            .unwrap();
        assert!(checksum.no_match_paths.is_empty());
        assert!(local.worktree_cache_dir().starts_with(temp.path().join("worktrees")));
    }

    #[tokio::test]
    async fn remote_repo_fetches_and_resolves() {
        let upstream = TestRepo::new();
        upstream.write("a.txt", "one");
        let first = upstream.commit("first");
        upstream.git(&["tag", "-a", "v1", "-m", "release"]);
        upstream.git(&["branch", "feature"]);
        upstream.write("a.txt", "two");
        let second = upstream.commit("second");

        let temp = TempDir::new().unwrap();
        let (provider, locks) = provider(&temp);
        let url = upstream.path().to_string_lossy().into_owned();
        let remote = RemoteRepo::new(
            "upstream",
            url.clone(),
            &temp.path().join("remotes"),
            provider,
            locks,
            git_cli(),
        );

        remote.fetch().await.unwrap();
        assert_eq!(remote.identity(), url);
        assert_eq!(remote.head_commit().await.unwrap().as_str(), second);
        assert_eq!(remote.latest_branch_commit("feature").await.unwrap().as_str(), first);
        assert_eq!(remote.tag_commit("v1").await.unwrap().as_str(), first);

        let mut branches = remote.remote_branches_list().await.unwrap();
        branches.sort();
        assert_eq!(branches, vec!["feature", "main"]);
        assert_eq!(remote.remote_origin_url().await.unwrap(), url);

        // Second fetch reuses the clone
        upstream.write("a.txt", "three");
        let third = upstream.commit("third");
        remote.fetch().await.unwrap();
        assert_eq!(remote.head_commit().await.unwrap().as_str(), third);
    }
}
