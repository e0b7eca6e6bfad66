//! Binary-safe patches between two commits
//!
//! Output is in `git diff --full-index` format with repository-relative
//! paths, so it applies with `git apply` on top of an archive of the
//! `from` commit. Submodule gitlinks are never printed as such: with a
//! worktree the submodule contents are diffed in place under the
//! submodule path, without one they are left out. A removed submodule is
//! read from its module repository and printed as deletions.

use crate::error::{StrataError, StrataResult};
use crate::git::matcher::PathMatcher;
use git2::{Delta, Diff, DiffDelta, DiffFormat, DiffOptions, FileMode, Oid, Repository, Tree};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use tracing::debug;

pub(crate) struct PatchSettings<'a> {
    pub from: Oid,
    pub to: Oid,
    pub matcher: &'a PathMatcher,
    pub with_entire_file_context: bool,
    pub with_binary: bool,
}

/// Paths touched by a written patch
#[derive(Debug, Default)]
pub(crate) struct PatchOutcome {
    pub paths: BTreeSet<String>,
    pub binary_paths: BTreeSet<String>,
}

/// Write the patch between `settings.from` and `settings.to` into `out`
///
/// `worktree` must be a checkout of `to` with submodules initialized when
/// submodule changes should be followed. Submodules that `to` removed are
/// found only if the checkout was primed with `from`.
pub(crate) fn write_patch<W: Write>(
    out: &mut W,
    repo: &Repository,
    settings: &PatchSettings<'_>,
    worktree: Option<&Path>,
) -> StrataResult<PatchOutcome> {
    let from = repo.find_commit(settings.from)?.tree()?;
    let to = repo.find_commit(settings.to)?.tree()?;

    let mut outcome = PatchOutcome::default();
    let mut writer = PatchWriter {
        out,
        settings,
        worktree,
        outcome: &mut outcome,
    };
    writer.diff(repo, Some(&from), Some(&to), "")?;

    debug!(
        "Patch {}..{}: {} paths ({} binary)",
        settings.from,
        settings.to,
        outcome.paths.len(),
        outcome.binary_paths.len()
    );
    Ok(outcome)
}

struct PatchWriter<'a, 'b, W: Write> {
    out: &'a mut W,
    settings: &'a PatchSettings<'b>,
    worktree: Option<&'a Path>,
    outcome: &'a mut PatchOutcome,
}

struct Gitlink {
    path: String,
    old: Option<Oid>,
    new: Option<Oid>,
}

impl<W: Write> PatchWriter<'_, '_, W> {
    fn diff_options(&self, prefix: &str) -> DiffOptions {
        let mut opts = DiffOptions::new();
        opts.id_abbrev(40)
            .show_binary(self.settings.with_binary)
            .ignore_submodules(false);
        if self.settings.with_entire_file_context {
            opts.context_lines(i32::MAX as u32);
        }
        if !prefix.is_empty() {
            opts.old_prefix(format!("a/{}/", prefix))
                .new_prefix(format!("b/{}/", prefix));
        }
        opts
    }

    /// Diff two trees of `repo`, whose root sits at `prefix` in the
    /// top-level repository
    fn diff(
        &mut self,
        repo: &Repository,
        from: Option<&Tree<'_>>,
        to: Option<&Tree<'_>>,
        prefix: &str,
    ) -> StrataResult<()> {
        let mut opts = self.diff_options(prefix);
        let diff = repo.diff_tree_to_tree(from, to, Some(&mut opts))?;

        let gitlinks = self.print(&diff, prefix)?;
        for link in gitlinks {
            self.diff_submodule(repo, from, prefix, link)?;
        }
        Ok(())
    }

    fn print(&mut self, diff: &Diff<'_>, prefix: &str) -> StrataResult<Vec<Gitlink>> {
        let matcher = self.settings.matcher;
        let mut gitlinks = Vec::new();
        let mut write_error: Option<std::io::Error> = None;

        let full_path = |delta: &DiffDelta<'_>| {
            let file = if delta.status() == Delta::Deleted {
                delta.old_file()
            } else {
                delta.new_file()
            };
            let rel = file
                .path_bytes()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default();
            if prefix.is_empty() {
                rel
            } else {
                format!("{}/{}", prefix, rel)
            }
        };

        let result = diff.print(DiffFormat::Patch, |delta, _hunk, line| {
            let path = full_path(&delta);

            if is_gitlink(&delta) {
                if line.origin() == 'F' && matcher.should_go_through(&path) {
                    gitlinks.push(Gitlink {
                        path,
                        old: non_zero(delta.old_file().id()),
                        new: non_zero(delta.new_file().id()),
                    });
                }
                return true;
            }

            if !matcher.is_path_matched(&path) {
                return true;
            }
            if delta.flags().is_binary() {
                self.outcome.binary_paths.insert(path.clone());
            }
            self.outcome.paths.insert(path);

            let origin = line.origin();
            let written = match origin {
                '+' | '-' | ' ' => self
                    .out
                    .write_all(&[origin as u8])
                    .and_then(|_| self.out.write_all(line.content())),
                _ => self.out.write_all(line.content()),
            };
            match written {
                Ok(()) => true,
                Err(e) => {
                    write_error = Some(e);
                    false
                }
            }
        });

        if let Some(e) = write_error {
            return Err(StrataError::io("writing patch", e));
        }
        result?;
        Ok(gitlinks)
    }

    fn diff_submodule(
        &mut self,
        parent: &Repository,
        parent_from: Option<&Tree<'_>>,
        prefix: &str,
        link: Gitlink,
    ) -> StrataResult<()> {
        let Some(worktree) = self.worktree else {
            debug!("Skipping submodule {} without a worktree", link.path);
            return Ok(());
        };

        let sub = match link.new {
            Some(_) => {
                let sub_dir = worktree.join(&link.path);
                Repository::open(&sub_dir).map_err(|e| StrataError::RepositoryOpen {
                    path: sub_dir.clone(),
                    reason: e.message().to_string(),
                })?
            }
            None => {
                let rel = relative_to(&link.path, prefix);
                let name = parent_from
                    .and_then(|tree| submodule_name(parent, tree, rel))
                    .unwrap_or_else(|| rel.to_string());
                open_module(parent, worktree, prefix, &name)?
            }
        };

        let find_tree = |oid: Oid| {
            sub.find_commit(oid)
                .and_then(|c| c.tree())
                .map_err(|e| StrataError::BadCommit {
                    role: "submodule",
                    commit: oid.to_string(),
                    reason: format!("{}: {}", link.path, e.message()),
                })
        };
        let to = match link.new {
            Some(new) => Some(find_tree(new)?),
            None => None,
        };
        let from = match link.old {
            Some(old) => Some(find_tree(old)?),
            None => None,
        };

        if to.is_none() {
            debug!("Patch: deleting removed submodule {}", link.path);
        } else {
            debug!("Patch: entering submodule {}", link.path);
        }
        self.diff(&sub, from.as_ref(), to.as_ref(), &link.path)
    }
}

/// `path` with the `prefix/` of its repository stripped
fn relative_to<'p>(path: &'p str, prefix: &str) -> &'p str {
    if prefix.is_empty() {
        return path;
    }
    path.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(path)
}

/// Name under which `.gitmodules` of `tree` declares the submodule at `path`
fn submodule_name(repo: &Repository, tree: &Tree<'_>, path: &str) -> Option<String> {
    let entry = tree.get_name(".gitmodules")?;
    let blob = repo.find_blob(entry.id()).ok()?;
    let text = String::from_utf8_lossy(blob.content());

    let mut current: Option<&str> = None;
    for line in text.lines() {
        let line = line.trim();
        if let Some(header) = line.strip_prefix("[submodule \"") {
            current = header.strip_suffix("\"]");
        } else if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "path" && value.trim() == path {
                return current.map(str::to_string);
            }
        }
    }
    None
}

/// Module repository of a submodule no longer in the checkout
///
/// Looks in the checkout's own git directory first, then in the parent
/// repository's.
fn open_module(
    parent: &Repository,
    worktree: &Path,
    prefix: &str,
    name: &str,
) -> StrataResult<Repository> {
    let mut candidates = Vec::new();
    if prefix.is_empty() {
        if let Ok(checkout) = Repository::open(worktree) {
            candidates.push(checkout.path().join("modules").join(name));
        }
    }
    candidates.push(parent.path().join("modules").join(name));

    for dir in &candidates {
        if dir.is_dir() {
            return Repository::open(dir).map_err(|e| StrataError::RepositoryOpen {
                path: dir.clone(),
                reason: e.message().to_string(),
            });
        }
    }
    Err(StrataError::RepositoryOpen {
        path: candidates.pop().unwrap_or_default(),
        reason: format!("module repository of removed submodule {} not found", name),
    })
}

fn is_gitlink(delta: &DiffDelta<'_>) -> bool {
    delta.old_file().mode() == FileMode::Commit || delta.new_file().mode() == FileMode::Commit
}

fn non_zero(oid: Oid) -> Option<Oid> {
    (!oid.is_zero()).then_some(oid)
}
