//! Repository operations backed by the content cache
//!
//! Patches and archives follow the same flow: cache lookup, commit
//! validation, submodule detection, then computation into a temporary file
//! under the entry lock and publication into the cache.

use crate::error::{StrataError, StrataResult};
use crate::git::archive::write_archive;
use crate::git::cache::{Archive, ArchiveDescriptor, GitContentCache, Patch, PatchDescriptor};
use crate::git::commit::CommitId;
use crate::git::ls_tree::{ls_tree, Repos};
use crate::git::matcher::PathMatcher;
use crate::git::options::{ArchiveOptions, ChecksumOptions, PatchOptions};
use crate::git::patch::{write_patch, PatchOutcome, PatchSettings};
use crate::git::worktree::WorktreeManager;
use crate::git::{blocking, Checksum, RepoHandle};
use chrono::Utc;
use git2::{Commit, ErrorCode, Repository, Signature};
use sha2::{Digest, Sha256};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Committer recorded on synthesized merge commits
const MERGE_SIGNATURE_NAME: &str = "strata";
const MERGE_SIGNATURE_EMAIL: &str = "strata@localhost";

pub struct GitContentProvider {
    cache: Arc<GitContentCache>,
    worktrees: WorktreeManager,
    worktrees_root: PathBuf,
}

impl GitContentProvider {
    pub fn new(
        cache: Arc<GitContentCache>,
        worktrees: WorktreeManager,
        worktrees_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            worktrees,
            worktrees_root: worktrees_root.into(),
        }
    }

    pub fn cache(&self) -> &GitContentCache {
        &self.cache
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    /// Dedicated worktree cache directory for a repository identity
    pub fn worktree_cache_dir(&self, identity: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(identity.as_bytes()));
        self.worktrees_root.join(&digest[..12])
    }

    /// Resolve a reference (`HEAD`, `refs/heads/main`, ...) to a commit
    pub async fn resolve_reference(
        &self,
        repo: &RepoHandle,
        reference: &str,
    ) -> StrataResult<CommitId> {
        let repo = repo.clone();
        let reference = reference.to_string();
        blocking(move || {
            let git = repo.open()?;
            let not_found = |e: git2::Error| StrataError::ReferenceNotFound {
                reference: reference.clone(),
                reason: e.message().to_string(),
            };
            let commit = git
                .find_reference(&reference)
                .and_then(|r| r.peel_to_commit())
                .map_err(not_found)?;
            Ok(CommitId::from(commit.id()))
        })
        .await
    }

    pub async fn head_commit(&self, repo: &RepoHandle) -> StrataResult<CommitId> {
        self.resolve_reference(repo, "HEAD").await
    }

    /// URL of the `origin` remote, empty when there is none
    pub async fn remote_origin_url(&self, repo: &RepoHandle) -> StrataResult<String> {
        let repo = repo.clone();
        blocking(move || {
            let git = repo.open()?;
            let url = match git.find_remote("origin") {
                Ok(remote) => remote.url().unwrap_or_default().to_string(),
                Err(e) if e.code() == ErrorCode::NotFound => String::new(),
                Err(e) if e.class() == git2::ErrorClass::Config => String::new(),
                Err(e) => return Err(e.into()),
            };
            Ok(url)
        })
        .await
    }

    /// True when no reference leads to a commit
    pub async fn is_empty(&self, repo: &RepoHandle) -> StrataResult<bool> {
        let repo = repo.clone();
        blocking(move || {
            let git = repo.open()?;
            for reference in git.references()? {
                if reference?.peel_to_commit().is_ok() {
                    return Ok(false);
                }
            }
            Ok(true)
        })
        .await
    }

    pub async fn is_commit_exists(&self, repo: &RepoHandle, commit: &str) -> StrataResult<bool> {
        let commit = CommitId::parse(commit)?;
        let repo = repo.clone();
        blocking(move || {
            let git = repo.open()?;
            let exists = match git.find_commit(commit.oid()) {
                Ok(_) => Ok(true),
                Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            };
            exists
        })
        .await
    }

    /// Tag names; annotated tags report the name stored in the tag object
    pub async fn tags_list(&self, repo: &RepoHandle) -> StrataResult<Vec<String>> {
        let repo = repo.clone();
        blocking(move || {
            let git = repo.open()?;
            let mut tags = Vec::new();
            for reference in git.references_glob("refs/tags/*")? {
                let reference = reference?;
                let Some(name) = reference.name() else {
                    continue;
                };
                let short = name.trim_start_matches("refs/tags/");
                // Lightweight tags point straight at a non-tag object
                let annotated = match reference.target().map(|oid| git.find_tag(oid)) {
                    Some(Ok(tag)) => Some(tag),
                    Some(Err(e)) if e.code() == ErrorCode::NotFound => None,
                    Some(Err(e)) => return Err(e.into()),
                    None => None,
                };
                let tag = match annotated {
                    Some(tag) => tag.name().unwrap_or(short).to_string(),
                    None => short.to_string(),
                };
                tags.push(tag);
            }
            Ok(tags)
        })
        .await
    }

    /// Branch names of the `origin` remote, without `HEAD`
    pub async fn remote_branches_list(&self, repo: &RepoHandle) -> StrataResult<Vec<String>> {
        let repo = repo.clone();
        blocking(move || {
            let git = repo.open()?;
            let mut branches = Vec::new();
            for reference in git.references_glob("refs/remotes/origin/*")? {
                let reference = reference?;
                let Some(name) = reference.name() else {
                    continue;
                };
                let branch = name.trim_start_matches("refs/remotes/origin/");
                if branch != "HEAD" {
                    branches.push(branch.to_string());
                }
            }
            Ok(branches)
        })
        .await
    }

    /// Parents of `commit`, first parent first
    pub async fn merge_commit_parents(
        &self,
        repo: &RepoHandle,
        commit: &str,
    ) -> StrataResult<Vec<CommitId>> {
        let commit = CommitId::parse(commit)?;
        let repo = repo.clone();
        blocking(move || {
            let git = repo.open()?;
            let commit = find_commit(&git, "commit", &commit)?;
            Ok(commit.parent_ids().map(CommitId::from).collect())
        })
        .await
    }

    /// Merge `from` into `to` in memory and write the result as a commit
    /// that no reference points to
    ///
    /// Submodule gitlinks merge like any other tree entry, so diverging
    /// submodule commits conflict. Author and committer time come from
    /// `to`, making the commit id a function of the pair.
    pub async fn create_detached_merge_commit(
        &self,
        repo: &RepoHandle,
        from: &str,
        to: &str,
    ) -> StrataResult<CommitId> {
        let from = CommitId::parse_as("from", from)?;
        let to = CommitId::parse_as("to", to)?;
        let repo = repo.clone();
        blocking(move || {
            let git = repo.open()?;
            let from_commit = find_commit(&git, "from", &from)?;
            let to_commit = find_commit(&git, "to", &to)?;

            let mut index = git.merge_commits(&to_commit, &from_commit, None)?;
            if index.has_conflicts() {
                let paths: Vec<String> = index
                    .conflicts()?
                    .filter_map(|c| c.ok())
                    .filter_map(|c| c.our.or(c.their).or(c.ancestor))
                    .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
                    .collect();
                return Err(StrataError::MergeConflict {
                    from: from.to_string(),
                    to: to.to_string(),
                    reason: format!("conflicting paths: {}", paths.join(", ")),
                });
            }

            let tree = git.find_tree(index.write_tree_to(&git)?)?;
            let signature =
                Signature::new(MERGE_SIGNATURE_NAME, MERGE_SIGNATURE_EMAIL, &to_commit.time())?;
            let message = format!("Merge {} into {}\n", from, to);
            let merge = git.commit(
                None,
                &signature,
                &signature,
                &message,
                &tree,
                &[&to_commit, &from_commit],
            )?;
            debug!("Detached merge of {} into {}: {}", from.short(), to.short(), merge);
            Ok(CommitId::from(merge))
        })
        .await
    }

    /// Patch between two commits, computed once per repository and options
    pub async fn create_patch(
        &self,
        repo: &RepoHandle,
        repo_id: &str,
        worktree_cache_dir: &Path,
        opts: &PatchOptions,
    ) -> StrataResult<Patch> {
        if let Some(patch) = self.cache.get_patch(repo_id, opts).await? {
            return Ok(patch);
        }

        let from = CommitId::parse_as("from", &opts.from_commit)?;
        let to = CommitId::parse_as("to", &opts.to_commit)?;
        // Submodules removed by `to` still need their old contents deleted
        let (from_has_submodules, to_has_submodules) = {
            let (repo, from, to) = (repo.clone(), from.clone(), to.clone());
            blocking(move || {
                let git = repo.open()?;
                let from = find_commit(&git, "from", &from)?;
                let to = find_commit(&git, "to", &to)?;
                Ok((has_submodules(&from)?, has_submodules(&to)?))
            })
            .await?
        };
        let has_submodules = from_has_submodules || to_has_submodules;

        let key = self.cache.patch_key(repo_id, opts)?;
        let _lock = self.cache.lock_entry(&key).await?;
        if let Some(patch) = self.cache.get_patch_by_key(&key).await? {
            return Ok(patch);
        }

        let job = PatchJob {
            repo: repo.clone(),
            from: from.clone(),
            to: to.clone(),
            matcher: opts.filter.matcher(false)?,
            with_entire_file_context: opts.with_entire_file_context,
            with_binary: opts.with_binary,
        };
        let tmp = self.cache.new_tmp_file()?;

        info!(
            "Creating patch {}..{} ({})",
            from.short(),
            to.short(),
            job.matcher
        );
        let (tmp, outcome) = if from_has_submodules {
            self.worktrees
                .with_worktree_over(repo.git_dir(), worktree_cache_dir, &from, &to, |dir| {
                    job.run(tmp, Some(dir))
                })
                .await?
        } else if to_has_submodules {
            self.worktrees
                .with_worktree(repo.git_dir(), worktree_cache_dir, &to, true, |dir| {
                    job.run(tmp, Some(dir))
                })
                .await?
        } else {
            job.run(tmp, None).await?
        };

        let descriptor = PatchDescriptor {
            from_commit: from.to_string(),
            to_commit: to.to_string(),
            paths: outcome.paths.into_iter().collect(),
            binary_paths: outcome.binary_paths.into_iter().collect(),
            has_submodules,
            size: 0,
            created_at: Utc::now(),
        };
        self.cache.publish_patch(&key, tmp, descriptor).await
    }

    /// Tar archive of one commit, computed once per repository and options
    pub async fn create_archive(
        &self,
        repo: &RepoHandle,
        repo_id: &str,
        worktree_cache_dir: &Path,
        opts: &ArchiveOptions,
    ) -> StrataResult<Archive> {
        if let Some(archive) = self.cache.get_archive(repo_id, opts).await? {
            return Ok(archive);
        }

        let commit = CommitId::parse_as("commit", &opts.commit)?;
        let has_submodules = {
            let (repo, commit) = (repo.clone(), commit.clone());
            blocking(move || {
                let git = repo.open()?;
                let commit = find_commit(&git, "commit", &commit)?;
                has_submodules(&commit)
            })
            .await?
        };

        let key = self.cache.archive_key(repo_id, opts)?;
        let _lock = self.cache.lock_entry(&key).await?;
        if let Some(archive) = self.cache.get_archive_by_key(&key).await? {
            return Ok(archive);
        }

        let job = ArchiveJob {
            repo: repo.clone(),
            commit: commit.clone(),
            matcher: opts.filter.matcher(true)?,
        };
        let tmp = self.cache.new_tmp_file()?;

        info!("Creating archive {} ({})", commit.short(), job.matcher);
        let (tmp, file_count) = if has_submodules {
            self.worktrees
                .with_worktree(repo.git_dir(), worktree_cache_dir, &commit, true, |dir| {
                    job.run(tmp, Some(dir))
                })
                .await?
        } else {
            job.run(tmp, None).await?
        };

        let descriptor = ArchiveDescriptor {
            commit: commit.to_string(),
            file_count,
            has_submodules,
            size: 0,
            created_at: Utc::now(),
        };
        self.cache.publish_archive(&key, tmp, descriptor).await
    }

    /// Checksum of the configured paths at `opts.commit`
    ///
    /// Each extra path is looked up in the main listing; a non-empty
    /// sub-listing contributes its checksum to the digest, an empty one is
    /// reported in `no_match_paths` and contributes nothing.
    pub async fn checksum_with_ls_tree(
        &self,
        repo: &RepoHandle,
        worktree_cache_dir: &Path,
        opts: &ChecksumOptions,
    ) -> StrataResult<Checksum> {
        let commit = CommitId::parse_as("commit", &opts.commit)?;
        let has_submodules = {
            let (repo, commit) = (repo.clone(), commit.clone());
            blocking(move || {
                let git = repo.open()?;
                let commit = find_commit(&git, "commit", &commit)?;
                has_submodules(&commit)
            })
            .await?
        };

        let git_dir = repo.git_dir().to_path_buf();
        let opts = opts.clone();
        let target = commit.clone();
        self.worktrees
            .with_worktree(
                repo.git_dir(),
                worktree_cache_dir,
                &commit,
                has_submodules,
                move |dir| blocking(move || checksum_in_worktree(&git_dir, &dir, &target, &opts)),
            )
            .await
    }
}

fn find_commit<'r>(
    git: &'r Repository,
    role: &'static str,
    commit: &CommitId,
) -> StrataResult<Commit<'r>> {
    git.find_commit(commit.oid())
        .map_err(|e| StrataError::BadCommit {
            role,
            commit: commit.to_string(),
            reason: e.message().to_string(),
        })
}

fn has_submodules(commit: &Commit<'_>) -> StrataResult<bool> {
    Ok(commit.tree()?.get_name(".gitmodules").is_some())
}

fn checksum_in_worktree(
    git_dir: &Path,
    worktree: &Path,
    commit: &CommitId,
    opts: &ChecksumOptions,
) -> StrataResult<Checksum> {
    let mut repos = Repos::new();
    let matcher = opts.filter.matcher(false)?;
    let main = ls_tree(&mut repos, git_dir, commit.oid(), &matcher, Some(worktree))?;

    let mut hasher = Sha256::new();
    let mut no_match_paths = Vec::new();
    for path in &opts.paths {
        let path_matcher = PathMatcher::simple(&opts.filter.base_path, std::slice::from_ref(path))?;
        let listing = main.filter(&mut repos, &path_matcher)?;
        if listing.is_empty() {
            debug!("ls-tree ({}): no match", path_matcher);
            no_match_paths.push(path.clone());
            continue;
        }
        let checksum = listing.checksum();
        debug!("ls-tree ({}): {}", path_matcher, checksum);
        hasher.update(checksum.as_bytes());
    }

    Ok(Checksum {
        digest: hex::encode(hasher.finalize()),
        no_match_paths,
    })
}

struct PatchJob {
    repo: RepoHandle,
    from: CommitId,
    to: CommitId,
    matcher: PathMatcher,
    with_entire_file_context: bool,
    with_binary: bool,
}

impl PatchJob {
    async fn run(
        self,
        mut tmp: NamedTempFile,
        worktree: Option<PathBuf>,
    ) -> StrataResult<(NamedTempFile, PatchOutcome)> {
        blocking(move || {
            let git = self.repo.open()?;
            let settings = PatchSettings {
                from: self.from.oid(),
                to: self.to.oid(),
                matcher: &self.matcher,
                with_entire_file_context: self.with_entire_file_context,
                with_binary: self.with_binary,
            };
            let mut out = BufWriter::new(tmp.as_file_mut());
            let outcome = write_patch(&mut out, &git, &settings, worktree.as_deref())?;
            out.flush()
                .map_err(|e| StrataError::io("writing patch", e))?;
            drop(out);
            Ok((tmp, outcome))
        })
        .await
    }
}

struct ArchiveJob {
    repo: RepoHandle,
    commit: CommitId,
    matcher: PathMatcher,
}

impl ArchiveJob {
    async fn run(
        self,
        mut tmp: NamedTempFile,
        worktree: Option<PathBuf>,
    ) -> StrataResult<(NamedTempFile, usize)> {
        blocking(move || {
            let git = self.repo.open()?;
            let mtime = find_commit(&git, "commit", &self.commit)?
                .time()
                .seconds()
                .max(0) as u64;

            let mut repos = Repos::new();
            repos.insert(self.repo.git_dir(), git);
            let listing = ls_tree(
                &mut repos,
                self.repo.git_dir(),
                self.commit.oid(),
                &self.matcher,
                worktree.as_deref(),
            )?;
            let count = write_archive(
                BufWriter::new(tmp.as_file_mut()),
                &mut repos,
                &listing,
                mtime,
            )?;
            Ok((tmp, count))
        })
        .await
    }
}
