//! Runner for the `git` binary
//!
//! Worktree and fetch plumbing goes through the CLI so that submodule
//! checkout and transport configuration behave exactly as the user's git.

use crate::error::{StrataError, StrataResult};
use std::ffi::OsStr;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct GitCli {
    config: Vec<(String, String)>,
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass `-c key=value` to every invocation
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.push((key.into(), value.into()));
        self
    }

    fn config_args(&self) -> Vec<String> {
        self.config
            .iter()
            .flat_map(|(k, v)| ["-c".to_string(), format!("{}={}", k, v)])
            .collect()
    }

    /// Run git and return trimmed stdout, failing on a non-zero exit
    pub async fn run<I, S>(&self, cwd: Option<&Path>, args: I) -> StrataResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let shown = display_args(&args);
        debug!("Executing: git {}", shown);

        let mut command = Command::new("git");
        command
            .args(self.config_args())
            .args(&args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command
            .output()
            .await
            .map_err(|e| StrataError::command_failed(format!("git {}", shown), e))?;

        check(&shown, output)
    }

    /// Blocking variant for cleanup paths that cannot await
    pub fn run_blocking<I, S>(&self, cwd: Option<&Path>, args: I) -> StrataResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let shown = display_args(&args);
        debug!("Executing: git {}", shown);

        let mut command = std::process::Command::new("git");
        command
            .args(self.config_args())
            .args(&args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command
            .output()
            .map_err(|e| StrataError::command_failed(format!("git {}", shown), e))?;

        check(&shown, output)
    }
}

fn display_args<S: AsRef<OsStr>>(args: &[S]) -> String {
    args.iter()
        .map(|a| a.as_ref().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn check(shown: &str, output: Output) -> StrataResult<String> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(StrataError::git_exec(
            format!("git {}", shown),
            stderr.trim(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_stderr_on_failure() {
        let temp = tempfile::TempDir::new().unwrap();
        let err = GitCli::new()
            .run(Some(temp.path()), ["rev-parse", "--verify", "HEAD"])
            .await
            .unwrap_err();
        match err {
            StrataError::GitCommand { command, stderr } => {
                assert_eq!(command, "git rev-parse --verify HEAD");
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn blocking_runner_returns_stdout() {
        let out = GitCli::new().run_blocking(None, ["--version"]).unwrap();
        assert!(out.starts_with("git version"));
    }
}
