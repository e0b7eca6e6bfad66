//! Content-addressed store for materialized patches and archives
//!
//! Entries are keyed by SHA256 over (repository identity, kind, options)
//! and are immutable once published.
//!
//! # Layout
//!
//! ```text
//! <root>/patches/<key>.patch   patch bytes
//! <root>/patches/<key>.json    descriptor
//! <root>/archives/<key>.tar
//! <root>/archives/<key>.json
//! <root>/tmp/                  in-flight files, same filesystem as entries
//! ```
//!
//! Data is written to `tmp/` and renamed into place, then the descriptor
//! is renamed into place. A reader that finds the descriptor therefore
//! always finds complete data. Temporary files are deleted when dropped,
//! so a cancelled or failed computation never publishes anything.

use crate::error::{StrataError, StrataResult};
use crate::git::options::{ArchiveOptions, PatchOptions};
use crate::lock::{LockGuard, LockManager};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Kind of cached git content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Patch,
    Archive,
}

impl ContentKind {
    fn dir(&self) -> &'static str {
        match self {
            Self::Patch => "patches",
            Self::Archive => "archives",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Self::Patch => "patch",
            Self::Archive => "tar",
        }
    }
}

trait Descriptor: Serialize + DeserializeOwned {
    fn set_size(&mut self, size: u64);
}

/// Metadata stored next to a cached patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDescriptor {
    pub from_commit: String,
    pub to_commit: String,
    /// Changed paths, repository-relative
    pub paths: Vec<String>,
    pub binary_paths: Vec<String>,
    pub has_submodules: bool,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl Descriptor for PatchDescriptor {
    fn set_size(&mut self, size: u64) {
        self.size = size;
    }
}

/// Metadata stored next to a cached archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    pub commit: String,
    pub file_count: usize,
    pub has_submodules: bool,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl Descriptor for ArchiveDescriptor {
    fn set_size(&mut self, size: u64) {
        self.size = size;
    }
}

/// Handle to a cached patch file
#[derive(Debug, Clone)]
pub struct Patch {
    path: PathBuf,
    descriptor: PatchDescriptor,
}

impl Patch {
    /// Backing file; owned by the cache, do not modify or delete
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptor(&self) -> &PatchDescriptor {
        &self.descriptor
    }

    pub fn paths(&self) -> &[String] {
        &self.descriptor.paths
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.paths.is_empty()
    }

    pub fn has_binary(&self) -> bool {
        !self.descriptor.binary_paths.is_empty()
    }
}

/// Handle to a cached tar archive
#[derive(Debug, Clone)]
pub struct Archive {
    path: PathBuf,
    descriptor: ArchiveDescriptor,
}

impl Archive {
    /// Backing file; owned by the cache, do not modify or delete
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptor(&self) -> &ArchiveDescriptor {
        &self.descriptor
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.file_count == 0
    }
}

/// Patch and archive store shared by every repository of one invocation
#[derive(Debug)]
pub struct GitContentCache {
    root: PathBuf,
    locks: Arc<LockManager>,
}

impl GitContentCache {
    pub fn new(root: impl Into<PathBuf>, locks: Arc<LockManager>) -> Self {
        Self {
            root: root.into(),
            locks,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache key for a patch request
    pub fn patch_key(&self, repo_id: &str, opts: &PatchOptions) -> StrataResult<String> {
        entry_key(repo_id, ContentKind::Patch, opts)
    }

    /// Cache key for an archive request
    pub fn archive_key(&self, repo_id: &str, opts: &ArchiveOptions) -> StrataResult<String> {
        entry_key(repo_id, ContentKind::Archive, opts)
    }

    pub async fn get_patch(&self, repo_id: &str, opts: &PatchOptions) -> StrataResult<Option<Patch>> {
        let key = self.patch_key(repo_id, opts)?;
        self.get_patch_by_key(&key).await
    }

    pub async fn get_archive(
        &self,
        repo_id: &str,
        opts: &ArchiveOptions,
    ) -> StrataResult<Option<Archive>> {
        let key = self.archive_key(repo_id, opts)?;
        self.get_archive_by_key(&key).await
    }

    pub(crate) async fn get_patch_by_key(&self, key: &str) -> StrataResult<Option<Patch>> {
        Ok(self
            .lookup::<PatchDescriptor>(ContentKind::Patch, key)
            .await?
            .map(|(path, descriptor)| Patch { path, descriptor }))
    }

    pub(crate) async fn get_archive_by_key(&self, key: &str) -> StrataResult<Option<Archive>> {
        Ok(self
            .lookup::<ArchiveDescriptor>(ContentKind::Archive, key)
            .await?
            .map(|(path, descriptor)| Archive { path, descriptor }))
    }

    /// Serialize computation of one entry across tasks and processes
    pub(crate) async fn lock_entry(&self, key: &str) -> StrataResult<LockGuard> {
        self.locks.acquire(&format!("git_data.{}", key)).await
    }

    /// New temporary file on the cache filesystem, removed on drop
    pub(crate) fn new_tmp_file(&self) -> StrataResult<NamedTempFile> {
        let tmp_dir = self.root.join("tmp");
        std::fs::create_dir_all(&tmp_dir)
            .map_err(|e| StrataError::io(format!("creating {}", tmp_dir.display()), e))?;
        NamedTempFile::new_in(&tmp_dir)
            .map_err(|e| StrataError::io("creating git data temporary file", e))
    }

    pub(crate) async fn publish_patch(
        &self,
        key: &str,
        data: NamedTempFile,
        descriptor: PatchDescriptor,
    ) -> StrataResult<Patch> {
        let (path, descriptor) = self.publish(ContentKind::Patch, key, data, descriptor).await?;
        Ok(Patch { path, descriptor })
    }

    pub(crate) async fn publish_archive(
        &self,
        key: &str,
        data: NamedTempFile,
        descriptor: ArchiveDescriptor,
    ) -> StrataResult<Archive> {
        let (path, descriptor) = self
            .publish(ContentKind::Archive, key, data, descriptor)
            .await?;
        Ok(Archive { path, descriptor })
    }

    fn data_path(&self, kind: ContentKind, key: &str) -> PathBuf {
        self.root
            .join(kind.dir())
            .join(format!("{}.{}", key, kind.extension()))
    }

    fn descriptor_path(&self, kind: ContentKind, key: &str) -> PathBuf {
        self.root.join(kind.dir()).join(format!("{}.json", key))
    }

    async fn lookup<D: Descriptor>(
        &self,
        kind: ContentKind,
        key: &str,
    ) -> StrataResult<Option<(PathBuf, D)>> {
        let descriptor_path = self.descriptor_path(kind, key);
        let content = match tokio::fs::read(&descriptor_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StrataError::io(
                    format!("reading {}", descriptor_path.display()),
                    e,
                ))
            }
        };

        let descriptor: D =
            serde_json::from_slice(&content).map_err(|e| StrataError::CacheEntry {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let data_path = self.data_path(kind, key);
        if !data_path.exists() {
            return Err(StrataError::CacheEntry {
                key: key.to_string(),
                reason: format!("{} is missing", data_path.display()),
            });
        }

        debug!("Git data cache hit: {:?} {}", kind, key);
        Ok(Some((data_path, descriptor)))
    }

    /// Publish `data` under `key`; if another writer got there first, keep theirs
    async fn publish<D: Descriptor>(
        &self,
        kind: ContentKind,
        key: &str,
        mut data: NamedTempFile,
        mut descriptor: D,
    ) -> StrataResult<(PathBuf, D)> {
        if let Some(existing) = self.lookup::<D>(kind, key).await? {
            debug!("Git data cache entry {} already published", key);
            return Ok(existing);
        }

        let entry_dir = self.root.join(kind.dir());
        tokio::fs::create_dir_all(&entry_dir)
            .await
            .map_err(|e| StrataError::io(format!("creating {}", entry_dir.display()), e))?;

        data.as_file_mut()
            .sync_all()
            .map_err(|e| StrataError::io("flushing git data file", e))?;
        let size = data
            .as_file()
            .metadata()
            .map_err(|e| StrataError::io("reading git data file size", e))?
            .len();
        descriptor.set_size(size);

        let data_path = self.data_path(kind, key);
        data.persist(&data_path)
            .map_err(|e| StrataError::io(format!("publishing {}", data_path.display()), e.error))?;

        let mut meta = self.new_tmp_file()?;
        serde_json::to_writer_pretty(meta.as_file_mut(), &descriptor)?;
        meta.as_file_mut()
            .flush()
            .map_err(|e| StrataError::io("writing git data descriptor", e))?;
        let descriptor_path = self.descriptor_path(kind, key);
        meta.persist(&descriptor_path).map_err(|e| {
            StrataError::io(format!("publishing {}", descriptor_path.display()), e.error)
        })?;

        info!("Published {:?} {} ({} bytes)", kind, key, size);
        Ok((data_path, descriptor))
    }
}

fn entry_key<O: Serialize>(repo_id: &str, kind: ContentKind, opts: &O) -> StrataResult<String> {
    let material = serde_json::to_vec(&(repo_id, kind, opts))?;
    Ok(hex::encode(Sha256::digest(&material)))
}
