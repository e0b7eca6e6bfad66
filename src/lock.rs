//! Named cross-process locks
//!
//! A lock is a file under the lock directory holding an OS advisory lock
//! (`flock` on Unix, `LockFileEx` on Windows). The OS drops the lock when
//! the owning process exits, so a crashed build never leaves a lock held.
//! The file body records the current holder for diagnostics only.
//!
//! Locks conflict between processes and between separate acquisitions in
//! the same process, so they also serialize concurrent tasks.

use crate::config::schema::LockConfig;
use crate::error::{StrataError, StrataResult};
use chrono::{DateTime, Utc};
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lock file name length limit before the hash suffix
const MAX_READABLE_NAME: usize = 64;

/// Diagnostic record written into a held lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    pub name: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Factory for named locks sharing one lock directory
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, config: &LockConfig) -> Self {
        Self {
            dir: dir.into(),
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the lock file backing `name`
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(lock_file_name(name))
    }

    /// Acquire `name`, waiting up to the configured timeout
    pub async fn acquire(&self, name: &str) -> StrataResult<LockGuard> {
        self.acquire_with_timeout(name, self.timeout).await
    }

    /// Acquire `name`, waiting up to `timeout` while it is contended.
    ///
    /// Contention past the deadline yields `LockTimeout`; any other error
    /// from the filesystem is returned immediately as `LockFailure`.
    pub async fn acquire_with_timeout(
        &self,
        name: &str,
        timeout: Duration,
    ) -> StrataResult<LockGuard> {
        let started = Instant::now();
        let mut announced = false;

        loop {
            if let Some(guard) = self.try_acquire(name)? {
                return Ok(guard);
            }

            if started.elapsed() >= timeout {
                return Err(StrataError::LockTimeout {
                    name: name.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }

            if !announced {
                match self.holder(name) {
                    Some(holder) => debug!(
                        "Waiting for lock {} held by pid {} since {}",
                        name, holder.pid, holder.acquired_at
                    ),
                    None => debug!("Waiting for lock {}", name),
                }
                announced = true;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Try to acquire `name` without waiting.
    ///
    /// Returns `Ok(None)` when another holder has it.
    pub fn try_acquire(&self, name: &str) -> StrataResult<Option<LockGuard>> {
        let failure = |source| StrataError::LockFailure {
            name: name.to_string(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(failure)?;

        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(failure)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
            #[cfg(windows)]
            Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => return Ok(None),
            Err(err) => return Err(failure(err)),
        }

        let mut guard = LockGuard {
            name: name.to_string(),
            path,
            file,
        };
        if let Err(e) = guard.record_holder() {
            warn!("Unable to record holder for lock {}: {}", name, e);
        }
        debug!("Acquired lock {}", name);
        Ok(Some(guard))
    }

    /// Current holder of `name`, if one was recorded
    pub fn holder(&self, name: &str) -> Option<LockHolder> {
        let content = fs::read_to_string(self.lock_path(name)).ok()?;
        serde_json::from_str(&content).ok()
    }
}

/// An acquired named lock, released on drop
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    path: PathBuf,
    file: File,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_holder(&mut self) -> std::io::Result<()> {
        let holder = LockHolder {
            name: self.name.clone(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec(&holder).map_err(std::io::Error::other)?;
        self.file.set_len(0)?;
        self.file.write_all(&body)?;
        self.file.flush()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Clear the record first; once unlocked the file belongs to the next holder
        if let Err(e) = self.file.set_len(0) {
            debug!("Failed to clear holder record of {}: {}", self.name, e);
        }
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock {}: {}", self.name, e);
        } else {
            debug!("Released lock {}", self.name);
        }
    }
}

/// Lock file name: readable prefix plus a hash of the full name
fn lock_file_name(name: &str) -> String {
    let readable: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_READABLE_NAME)
        .collect();

    let digest = Sha256::digest(name.as_bytes());
    format!("{}-{}.lock", readable, &hex::encode(digest)[..12])
}
