//! Error types for Strata
//!
//! All modules use `StrataResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Strata operations
pub type StrataResult<T> = Result<T, StrataError>;

/// Exit code used when a named lock could not be taken in time (EX_TEMPFAIL)
pub const EXIT_LOCK_CONTENTION: u8 = 75;

/// All errors that can occur in Strata
#[derive(Error, Debug)]
pub enum StrataError {
    // Repository errors
    #[error("Cannot open repo `{path}`: {reason}")]
    RepositoryOpen { path: PathBuf, reason: String },

    #[error("Reference not found: {reference}: {reason}")]
    ReferenceNotFound { reference: String, reason: String },

    #[error("Bad `{role}` commit `{commit}`: {reason}")]
    BadCommit {
        role: &'static str,
        commit: String,
        reason: String,
    },

    #[error("Commits `{from}` and `{to}` do not merge cleanly: {reason}")]
    MergeConflict {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Invalid path pattern `{pattern}`: {reason}")]
    PathPattern { pattern: String, reason: String },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Git command failed: {command}, stderr: {stderr}")]
    GitCommand { command: String, stderr: String },

    // Cache errors
    #[error("Git data cache entry {key} is corrupted: {reason}")]
    CacheEntry { key: String, reason: String },

    // Lock errors
    #[error("Timed out after {waited_secs}s waiting for lock {name}")]
    LockTimeout { name: String, waited_secs: u64 },

    #[error("Failed to lock {name}: {source}")]
    LockFailure {
        name: String,
        #[source]
        source: std::io::Error,
    },

    // Container errors
    #[error("Container run failed: {container}, exit code: {code}")]
    ContainerRun { container: String, code: i32 },

    #[error("Container command failed: {command}, stderr: {stderr}")]
    ContainerCommand { command: String, stderr: String },

    #[error("Container {0} is already committed")]
    AlreadyCommitted(String),

    #[error("Image {0} has not been built yet")]
    NotBuilt(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Image {operation} failed: {image}: {reason}")]
    Distribution {
        operation: &'static str,
        image: String,
        reason: String,
    },

    #[error("{primary} (cleanup also failed: {cleanup})")]
    CleanupFailed {
        #[source]
        primary: Box<StrataError>,
        cleanup: Box<StrataError>,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl StrataError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a git command execution error
    pub fn git_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::GitCommand {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a container command execution error
    pub fn container_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::ContainerCommand {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Wrap a primary failure together with the cleanup failure that followed it
    pub fn with_cleanup_failure(self, cleanup: StrataError) -> Self {
        Self::CleanupFailed {
            primary: Box::new(self),
            cleanup: Box::new(cleanup),
        }
    }

    /// The failure that caused this error, looking through cleanup wrappers
    pub fn primary(&self) -> &StrataError {
        match self {
            Self::CleanupFailed { primary, .. } => primary.primary(),
            other => other,
        }
    }

    /// Check if error is retryable
    ///
    /// Lock contention may succeed on a later attempt; distribution
    /// failures are retryable unless the registry rejected the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } => true,
            Self::Distribution { reason, .. } => {
                let reason = reason.to_lowercase();
                !["not found", "unauthorized", "denied", "manifest unknown"]
                    .iter()
                    .any(|marker| reason.contains(marker))
            }
            _ => false,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ContainerRun { code, .. } => u8::try_from(*code)
                .ok()
                .filter(|c| *c != 0)
                .unwrap_or(1),
            Self::CleanupFailed { primary, .. } => primary.exit_code(),
            Self::LockTimeout { .. } => EXIT_LOCK_CONTENTION,
            Self::ReferenceNotFound { .. }
            | Self::BadCommit { .. }
            | Self::PathPattern { .. }
            | Self::ConfigInvalid { .. }
            | Self::User(_) => 2,
            _ => 1,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::LockTimeout { .. } => {
                Some("Another build holds this lock; retry later or raise lock.timeout_secs")
            }
            Self::ReferenceNotFound { .. } | Self::BadCommit { .. } => {
                Some("Fetch the repository or check the commit, branch or tag name")
            }
            Self::ContainerRun { .. } => {
                Some("Enable introspection after error to open a shell in the failed stage")
            }
            Self::CleanupFailed { primary, .. } => primary.hint(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StrataError::BadCommit {
            role: "from",
            commit: "abc".to_string(),
            reason: "not a 40-character hex object id".to_string(),
        };
        assert!(err.to_string().contains("Bad `from` commit `abc`"));
    }

    #[test]
    fn exit_code_carries_container_status() {
        let err = StrataError::ContainerRun {
            container: "strata-build-x".to_string(),
            code: 42,
        };
        assert_eq!(err.exit_code(), 42);

        let wrapped = err.with_cleanup_failure(StrataError::container_exec("rm", "boom"));
        assert_eq!(wrapped.exit_code(), 42);
        assert!(matches!(
            wrapped.primary(),
            StrataError::ContainerRun { code: 42, .. }
        ));
    }

    #[test]
    fn exit_code_out_of_range_falls_back() {
        let err = StrataError::ContainerRun {
            container: "c".to_string(),
            code: -1,
        };
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn lock_contention_is_retryable() {
        let err = StrataError::LockTimeout {
            name: "container.x".to_string(),
            waited_secs: 3,
        };
        assert!(err.is_retryable());
        assert_eq!(err.exit_code(), EXIT_LOCK_CONTENTION);

        let failure = StrataError::LockFailure {
            name: "container.x".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!failure.is_retryable());
    }

    #[test]
    fn distribution_retry_classification() {
        let transient = StrataError::Distribution {
            operation: "push",
            image: "registry/app".to_string(),
            reason: "connection reset by peer".to_string(),
        };
        assert!(transient.is_retryable());

        let fatal = StrataError::Distribution {
            operation: "pull",
            image: "registry/app".to_string(),
            reason: "manifest unknown".to_string(),
        };
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn error_hint() {
        let err = StrataError::ReferenceNotFound {
            reference: "refs/tags/v9".to_string(),
            reason: "no such tag".to_string(),
        };
        assert!(err.hint().is_some());
        assert!(StrataError::Internal("x".into()).hint().is_none());
    }
}
