//! Path matchers restricting which repository paths take part in a
//! patch, archive or checksum
//!
//! All paths are repository-relative with `/` separators. Include and
//! exclude patterns are globs relative to the base path; a pattern that
//! names a directory covers everything below it.

use crate::error::{StrataError, StrataResult};
use globset::{GlobBuilder, GlobMatcher};
use std::fmt;

#[derive(Debug, Clone)]
enum Part {
    AnyDepth,
    Component(GlobMatcher),
}

#[derive(Debug, Clone)]
struct Pattern {
    raw: String,
    full: GlobMatcher,
    parts: Vec<Part>,
}

impl Pattern {
    fn compile(raw: &str) -> StrataResult<Self> {
        let glob = |p: &str| {
            GlobBuilder::new(p)
                .literal_separator(true)
                .build()
                .map(|g| g.compile_matcher())
                .map_err(|e| StrataError::PathPattern {
                    pattern: raw.to_string(),
                    reason: e.to_string(),
                })
        };

        let parts = raw
            .split('/')
            .map(|part| {
                if part == "**" {
                    Ok(Part::AnyDepth)
                } else {
                    glob(part).map(Part::Component)
                }
            })
            .collect::<StrataResult<Vec<_>>>()?;

        Ok(Self {
            raw: raw.to_string(),
            full: glob(raw)?,
            parts,
        })
    }

    /// Whether `path` or one of its ancestor directories matches
    fn covers(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        let mut end = 0;
        for component in path.split('/') {
            end += component.len();
            if self.full.is_match(&path[..end]) {
                return true;
            }
            end += 1;
        }
        false
    }

    /// Whether something strictly inside `dir` could match
    fn could_match_inside(&self, dir: &str) -> bool {
        if dir.is_empty() {
            return true;
        }
        let dir_parts: Vec<&str> = dir.split('/').collect();
        for (i, component) in dir_parts.iter().enumerate() {
            match self.parts.get(i) {
                Some(Part::AnyDepth) => return true,
                Some(Part::Component(glob)) if glob.is_match(component) => {}
                _ => return false,
            }
        }
        self.parts.len() > dir_parts.len()
    }
}

/// Predicate over repository paths built from a base path plus include
/// and exclude globs
///
/// A greedy matcher never reports a directory as matched as a whole and
/// descends into every directory below the base path that is not
/// excluded; listings built with it contain files only.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    base_path: String,
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    greedy: bool,
}

impl PathMatcher {
    /// Matcher for a git mapping: base path with include/exclude lists
    pub fn git_mapping(
        base_path: &str,
        include_paths: &[String],
        exclude_paths: &[String],
        greedy: bool,
    ) -> StrataResult<Self> {
        Ok(Self {
            base_path: normalize(base_path),
            include: compile_all(include_paths)?,
            exclude: compile_all(exclude_paths)?,
            greedy,
        })
    }

    /// Matcher selecting only `paths` below `base_path`
    pub fn simple(base_path: &str, paths: &[String]) -> StrataResult<Self> {
        Self::git_mapping(base_path, paths, &[], false)
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn is_greedy(&self) -> bool {
        self.greedy
    }

    /// Whether the file at `path` is selected
    pub fn is_path_matched(&self, path: &str) -> bool {
        let Some(rel) = self.relative(path) else {
            return false;
        };
        self.included(rel) && !self.excluded(rel)
    }

    /// Whether everything under the directory (or submodule) at `path`
    /// is selected, so it can be taken as a single entry
    pub fn is_dir_or_submodule_path_matched(&self, path: &str) -> bool {
        if self.greedy {
            return false;
        }
        let Some(rel) = self.relative(path) else {
            return false;
        };
        self.included(rel)
            && !self.excluded(rel)
            && !self.exclude.iter().any(|p| p.could_match_inside(rel))
    }

    /// Whether some path under the directory at `path` may be selected
    pub fn should_go_through(&self, path: &str) -> bool {
        let path = path.trim_matches('/');
        let Some(rel) = self.relative(path) else {
            return path.is_empty()
                || self
                    .base_path
                    .strip_prefix(path)
                    .is_some_and(|rest| rest.starts_with('/'));
        };

        if self.excluded(rel) {
            return false;
        }
        if self.greedy || self.included(rel) {
            return true;
        }
        self.include.iter().any(|p| p.could_match_inside(rel))
    }

    /// Path relative to the base path, or None when outside of it
    fn relative<'a>(&self, path: &'a str) -> Option<&'a str> {
        let path = path.trim_matches('/');
        if self.base_path.is_empty() {
            return Some(path);
        }
        if path == self.base_path {
            return Some("");
        }
        path.strip_prefix(self.base_path.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }

    fn included(&self, rel: &str) -> bool {
        self.include.is_empty() || self.include.iter().any(|p| p.covers(rel))
    }

    fn excluded(&self, rel: &str) -> bool {
        self.exclude.iter().any(|p| p.covers(rel))
    }
}

impl fmt::Display for PathMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = |patterns: &[Pattern]| {
            patterns
                .iter()
                .map(|p| p.raw.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "base={:?} include=[{}] exclude=[{}]",
            self.base_path,
            raw(&self.include),
            raw(&self.exclude)
        )?;
        if self.greedy {
            write!(f, " greedy")?;
        }
        Ok(())
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn compile_all(paths: &[String]) -> StrataResult<Vec<Pattern>> {
    paths
        .iter()
        .map(|p| normalize(p))
        .filter(|p| !p.is_empty())
        .map(|p| Pattern::compile(&p))
        .collect()
}
