//! Docker/Podman CLI container runtime
//!
//! Implements `ContainerRuntime` by shelling out to the engine binary.
//! Both engines accept the same subset of commands used here.

use crate::container::runtime::{ContainerRuntime, ImageInspect, RunSpec};
use crate::error::{StrataError, StrataResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

/// Max number of output lines to include in build error messages.
const BUILD_ERROR_TAIL_LINES: usize = 50;

/// Container runtime driving the `docker` or `podman` binary
pub struct CliRuntime {
    binary: String,
}

impl CliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Execute an engine command and return the output
    async fn exec(&self, args: &[&str]) -> StrataResult<std::process::Output> {
        debug!("Executing: {} {:?}", self.binary, args);

        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StrataError::command_failed(format!("{} {:?}", self.binary, args), e))
    }

    /// Execute an engine command, failing with its stderr on a non-zero exit
    async fn exec_checked(&self, what: &str, args: &[&str]) -> StrataResult<String> {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StrataError::container_exec(
                format!("{} {}", self.binary, what),
                stderr.trim(),
            ))
        }
    }

    /// Execute an engine command interactively
    async fn exec_interactive(&self, args: &[String]) -> StrataResult<i32> {
        debug!("Executing interactively: {} {:?}", self.binary, args);

        let status = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| StrataError::command_failed(format!("{} {:?}", self.binary, args), e))?;

        Ok(status.code().unwrap_or(-1))
    }

    async fn distribute(&self, operation: &'static str, image: &str) -> StrataResult<()> {
        info!("{} image: {}", if operation == "pull" { "Pulling" } else { "Pushing" }, image);

        let output = self.exec(&[operation, image]).await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StrataError::Distribution {
                operation,
                image: image.to_string(),
                reason: stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn run(&self, spec: &RunSpec) -> StrataResult<()> {
        let mut args = vec!["run".to_string()];
        args.extend(spec.args());

        info!("Running container: {}", spec.name);
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StrataError::command_failed(format!("{} run", self.binary), e))?;

        let name = spec.name.clone();
        stream_child_output(&mut child, &|line| info!("[{}] {}", name, line)).await?;

        let status = child
            .wait()
            .await
            .map_err(|e| StrataError::command_failed(format!("{} run", self.binary), e))?;

        if status.success() {
            Ok(())
        } else {
            Err(StrataError::ContainerRun {
                container: spec.name.clone(),
                code: status.code().unwrap_or(-1),
            })
        }
    }

    async fn introspect(&self, spec: &RunSpec) -> StrataResult<i32> {
        let mut args = vec!["run".to_string(), "--rm".to_string(), "-it".to_string()];
        args.extend(spec.args());
        self.exec_interactive(&args).await
    }

    async fn commit(&self, container: &str) -> StrataResult<String> {
        debug!("Committing container: {}", container);
        let id = self.exec_checked("commit", &["commit", container]).await?;
        info!("Committed {} into {}", container, id);
        Ok(id)
    }

    async fn remove(&self, container: &str) -> StrataResult<()> {
        debug!("Removing container: {}", container);

        let output = self.exec(&["rm", "-f", container]).await?;

        if output.status.success() {
            Ok(())
        } else {
            // Ignore error if container doesn't exist
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("no such container") {
                Ok(())
            } else {
                Err(StrataError::container_exec(
                    format!("{} rm", self.binary),
                    stderr.trim(),
                ))
            }
        }
    }

    async fn tag(&self, image: &str, tag: &str) -> StrataResult<()> {
        debug!("Tagging {} as {}", image, tag);
        self.exec_checked("tag", &["tag", image, tag]).await?;
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> StrataResult<()> {
        debug!("Removing image: {}", image);
        self.exec_checked("rmi", &["rmi", image]).await?;
        Ok(())
    }

    async fn pull(&self, image: &str) -> StrataResult<()> {
        self.distribute("pull", image).await
    }

    async fn push(&self, image: &str) -> StrataResult<()> {
        self.distribute("push", image).await
    }

    async fn inspect_image(&self, image: &str) -> StrataResult<Option<ImageInspect>> {
        let output = self.exec(&["image", "inspect", image]).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
            if stderr.contains("no such image") || stderr.contains("image not known") {
                return Ok(None);
            }
            return Err(StrataError::container_exec(
                format!("{} image inspect", self.binary),
                stderr.trim(),
            ));
        }

        // Inspect returns an array even for a single image
        let images: Vec<ImageInspect> = serde_json::from_slice(&output.stdout)?;
        Ok(images.into_iter().next())
    }

    async fn build_dockerfile(
        &self,
        context: &Path,
        dockerfile: &Path,
        build_args: &BTreeMap<String, String>,
        target: Option<&str>,
    ) -> StrataResult<String> {
        let mut args = vec![
            "build".to_string(),
            "-q".to_string(),
            "-f".to_string(),
            dockerfile.display().to_string(),
        ];
        for (k, v) in build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", k, v));
        }
        if let Some(target) = target {
            args.push("--target".to_string());
            args.push(target.to_string());
        }
        args.push(context.display().to_string());

        let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.exec(&args_refs).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(StrataError::container_exec(
                format!("{} build", self.binary),
                build_error_output(&stdout, &stderr),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| StrataError::container_exec(format!("{} build", self.binary), "no image id in output"))
    }

    fn runtime_name(&self) -> &'static str {
        match self.binary.rsplit('/').next() {
            Some("podman") => "Podman",
            _ => "Docker",
        }
    }
}

/// Extract the useful tail of build output for error diagnostics.
fn build_error_output(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let total = lines.len();
    let tail: Vec<&str> = if total > BUILD_ERROR_TAIL_LINES {
        lines[total - BUILD_ERROR_TAIL_LINES..].to_vec()
    } else {
        lines
    };
    tail.join("\n")
}

/// Stream stdout+stderr from a child process, calling `on_output` for each line.
async fn stream_child_output(
    child: &mut tokio::process::Child,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> StrataResult<()> {
    let (Some(stderr), Some(stdout)) = (child.stderr.take(), child.stdout.take()) else {
        return Err(StrataError::Internal("child output is not piped".to_string()));
    };

    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stdout_reader = BufReader::new(stdout).lines();

    let mut stderr_done = false;
    let mut stdout_done = false;

    while !stderr_done || !stdout_done {
        tokio::select! {
            line = stderr_reader.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => on_output(line),
                    _ => stderr_done = true,
                }
            }
            line = stdout_reader.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => on_output(line),
                    _ => stdout_done = true,
                }
            }
        }
    }

    Ok(())
}
