//! Option sets for patch, archive and checksum requests
//!
//! Each option set is serialized into the content cache key, so field
//! order and naming are part of the on-disk format.

use crate::error::StrataResult;
use crate::git::matcher::PathMatcher;
use serde::{Deserialize, Serialize};

/// Base path with include and exclude globs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathFilter {
    pub base_path: String,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

impl PathFilter {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }

    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.include_paths.push(path.into());
        self
    }

    pub fn exclude(mut self, path: impl Into<String>) -> Self {
        self.exclude_paths.push(path.into());
        self
    }

    pub fn matcher(&self, greedy: bool) -> StrataResult<PathMatcher> {
        PathMatcher::git_mapping(
            &self.base_path,
            &self.include_paths,
            &self.exclude_paths,
            greedy,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOptions {
    #[serde(flatten)]
    pub filter: PathFilter,
    pub from_commit: String,
    pub to_commit: String,
    #[serde(default)]
    pub with_entire_file_context: bool,
    #[serde(default)]
    pub with_binary: bool,
}

impl PatchOptions {
    pub fn new(filter: PathFilter, from_commit: impl Into<String>, to_commit: impl Into<String>) -> Self {
        Self {
            filter,
            from_commit: from_commit.into(),
            to_commit: to_commit.into(),
            with_entire_file_context: false,
            with_binary: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveOptions {
    #[serde(flatten)]
    pub filter: PathFilter,
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumOptions {
    #[serde(flatten)]
    pub filter: PathFilter,
    /// Extra paths hashed one by one into the cumulative digest
    #[serde(default)]
    pub paths: Vec<String>,
    pub commit: String,
}
