//! Filtered tree listings
//!
//! A listing walks a commit tree and keeps what the matcher selects. A
//! directory or submodule that is selected as a whole stays a single entry
//! (its tree or commit id covers the contents); anything partially selected
//! is expanded. Submodules are expanded only when a checked-out worktree is
//! available to open them from.

use crate::error::{StrataError, StrataResult};
use crate::git::matcher::PathMatcher;
use git2::{ObjectType, Oid, Repository};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Gitlink mode used for submodule entries
pub const MODE_SUBMODULE: u32 = 0o160000;
pub const MODE_SYMLINK: u32 = 0o120000;
pub const MODE_EXECUTABLE: u32 = 0o100755;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Blob,
    Tree,
    Submodule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsTreeEntry {
    /// Path from the top-level repository root
    pub path: String,
    pub mode: u32,
    pub oid: Oid,
    pub kind: EntryKind,
    /// Git directory (or worktree) of the repository holding the object
    pub repo_dir: PathBuf,
}

/// Repositories opened during a walk, keyed by directory
#[derive(Default)]
pub(crate) struct Repos {
    repos: HashMap<PathBuf, Repository>,
}

impl Repos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already opened repository under `dir`
    pub fn insert(&mut self, dir: impl Into<PathBuf>, repo: Repository) {
        self.repos.insert(dir.into(), repo);
    }

    pub fn get(&mut self, dir: &Path) -> StrataResult<&Repository> {
        if !self.repos.contains_key(dir) {
            let repo = Repository::open(dir).map_err(|e| StrataError::RepositoryOpen {
                path: dir.to_path_buf(),
                reason: e.message().to_string(),
            })?;
            self.repos.insert(dir.to_path_buf(), repo);
        }
        self.repos
            .get(dir)
            .ok_or_else(|| StrataError::Internal(format!("repository {} vanished", dir.display())))
    }

    /// Raw content of a blob entry
    pub fn blob(&mut self, entry: &LsTreeEntry) -> StrataResult<Vec<u8>> {
        let repo = self.get(&entry.repo_dir)?;
        Ok(repo.find_blob(entry.oid)?.content().to_vec())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LsTreeResult {
    entries: Vec<LsTreeEntry>,
    worktree: Option<PathBuf>,
}

struct RawEntry {
    name: String,
    mode: u32,
    oid: Oid,
    kind: EntryKind,
}

struct Walker<'a> {
    repos: &'a mut Repos,
    matcher: &'a PathMatcher,
    worktree: Option<&'a Path>,
    out: Vec<LsTreeEntry>,
}

impl Walker<'_> {
    fn children(&mut self, repo_dir: &Path, tree: Oid) -> StrataResult<Vec<RawEntry>> {
        let repo = self.repos.get(repo_dir)?;
        let tree = repo.find_tree(tree)?;
        let entries = tree
            .iter()
            .filter_map(|entry| {
                let kind = match entry.kind() {
                    Some(ObjectType::Blob) => EntryKind::Blob,
                    Some(ObjectType::Tree) => EntryKind::Tree,
                    Some(ObjectType::Commit) => EntryKind::Submodule,
                    _ => return None,
                };
                Some(RawEntry {
                    name: String::from_utf8_lossy(entry.name_bytes()).into_owned(),
                    mode: entry.filemode() as u32,
                    oid: entry.id(),
                    kind,
                })
            })
            .collect();
        Ok(entries)
    }

    fn walk_tree(&mut self, repo_dir: &Path, tree: Oid, prefix: &str) -> StrataResult<()> {
        for raw in self.children(repo_dir, tree)? {
            let entry = LsTreeEntry {
                path: join(prefix, &raw.name),
                mode: raw.mode,
                oid: raw.oid,
                kind: raw.kind,
                repo_dir: repo_dir.to_path_buf(),
            };
            self.visit(entry)?;
        }
        Ok(())
    }

    fn visit(&mut self, entry: LsTreeEntry) -> StrataResult<()> {
        match entry.kind {
            EntryKind::Blob => {
                if self.matcher.is_path_matched(&entry.path) {
                    self.out.push(entry);
                }
            }
            EntryKind::Tree | EntryKind::Submodule => {
                if self.matcher.is_dir_or_submodule_path_matched(&entry.path) {
                    self.out.push(entry);
                } else if self.matcher.should_go_through(&entry.path) {
                    self.expand(entry)?;
                }
            }
        }
        Ok(())
    }

    fn expand(&mut self, entry: LsTreeEntry) -> StrataResult<()> {
        match entry.kind {
            EntryKind::Tree => self.walk_tree(&entry.repo_dir, entry.oid, &entry.path),
            EntryKind::Submodule => {
                let Some(worktree) = self.worktree else {
                    if self.matcher.is_path_matched(&entry.path) {
                        self.out.push(entry);
                    }
                    return Ok(());
                };
                let sub_dir = worktree.join(&entry.path);
                let tree = {
                    let repo = self.repos.get(&sub_dir)?;
                    repo.find_commit(entry.oid)
                        .map_err(|e| StrataError::BadCommit {
                            role: "submodule",
                            commit: entry.oid.to_string(),
                            reason: format!("{}: {}", entry.path, e.message()),
                        })?
                        .tree_id()
                };
                debug!("ls-tree: entering submodule {}", entry.path);
                self.walk_tree(&sub_dir, tree, &entry.path)
            }
            EntryKind::Blob => Ok(()),
        }
    }
}

/// List the tree of `commit` in the repository at `repo_dir`, keeping what
/// `matcher` selects
pub(crate) fn ls_tree(
    repos: &mut Repos,
    repo_dir: &Path,
    commit: Oid,
    matcher: &PathMatcher,
    worktree: Option<&Path>,
) -> StrataResult<LsTreeResult> {
    let tree = repos.get(repo_dir)?.find_commit(commit)?.tree_id();

    let mut walker = Walker {
        repos,
        matcher,
        worktree,
        out: Vec::new(),
    };
    walker.walk_tree(repo_dir, tree, "")?;

    let mut entries = walker.out;
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    debug!("ls-tree ({}): {} entries", matcher, entries.len());

    Ok(LsTreeResult {
        entries,
        worktree: worktree.map(Path::to_path_buf),
    })
}

impl LsTreeResult {
    pub fn entries(&self) -> &[LsTreeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Narrow this listing with another matcher without walking the
    /// commit again; whole entries are expanded only where needed
    pub(crate) fn filter(
        &self,
        repos: &mut Repos,
        matcher: &PathMatcher,
    ) -> StrataResult<LsTreeResult> {
        let mut walker = Walker {
            repos,
            matcher,
            worktree: self.worktree.as_deref(),
            out: Vec::new(),
        };
        for entry in &self.entries {
            walker.visit(entry.clone())?;
        }

        let mut entries = walker.out;
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(LsTreeResult {
            entries,
            worktree: self.worktree.clone(),
        })
    }

    /// SHA256 over path, mode and object id of every entry in path order
    pub fn checksum(&self) -> String {
        let mut sorted: Vec<&LsTreeEntry> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.path.cmp(&b.path));

        let mut hasher = Sha256::new();
        for entry in sorted {
            hasher.update(entry.path.as_bytes());
            hasher.update([0]);
            hasher.update(format!("{:06o}", entry.mode).as_bytes());
            hasher.update([0]);
            hasher.update(entry.oid.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}
