//! Recording in-memory runtime for tests

use crate::container::runtime::{ContainerRuntime, ImageInspect, RunSpec};
use crate::error::{StrataError, StrataResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub container: String,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    runs: Vec<RunRecord>,
    containers: HashSet<String>,
    /// Tag or id -> image id
    images: HashMap<String, String>,
    next_id: u32,
    fail: HashMap<&'static str, StrataError>,
    fail_counts: HashMap<&'static str, u32>,
    run_exit_code: Option<i32>,
}

/// Fake engine keeping containers and images in memory
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
    run_delay: Duration,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_delay(run_delay: Duration) -> Self {
        Self {
            run_delay,
            ..Self::default()
        }
    }

    /// Make every call of `op` fail with a clone-equivalent of `err`
    pub fn fail(&self, op: &'static str, err: StrataError) {
        self.state.lock().unwrap().fail.insert(op, err);
    }

    /// Make the next `times` calls of `op` fail with a transient error
    pub fn fail_times(&self, op: &'static str, times: u32) {
        self.state.lock().unwrap().fail_counts.insert(op, times);
    }

    pub fn set_run_exit_code(&self, code: i32) {
        self.state.lock().unwrap().run_exit_code = Some(code);
    }

    /// Register a local image under `reference`
    pub fn add_image(&self, reference: &str, id: &str) {
        self.state
            .lock()
            .unwrap()
            .images
            .insert(reference.to_string(), id.to_string());
    }

    /// Leave a container behind as a crashed build would
    pub fn add_container(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn ops(&self) -> Vec<&'static str> {
        self.calls().into_iter().map(|c| c.op).collect()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.state.lock().unwrap().runs.clone()
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.state.lock().unwrap().containers.contains(name)
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.state.lock().unwrap().images.contains_key(reference)
    }

    fn record(&self, op: &'static str, target: &str) -> StrataResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            op,
            target: target.to_string(),
        });
        if let Some(err) = state.fail.get(op) {
            return Err(copy_error(err));
        }
        if let Some(left) = state.fail_counts.get_mut(op) {
            if *left > 0 {
                *left -= 1;
                return Err(StrataError::Distribution {
                    operation: op,
                    image: target.to_string(),
                    reason: "connection reset by peer".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn copy_error(err: &StrataError) -> StrataError {
    match err {
        StrataError::Distribution {
            operation,
            image,
            reason,
        } => StrataError::Distribution {
            operation: *operation,
            image: image.clone(),
            reason: reason.clone(),
        },
        StrataError::ContainerCommand { command, stderr } => StrataError::ContainerCommand {
            command: command.clone(),
            stderr: stderr.clone(),
        },
        other => StrataError::Internal(other.to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run(&self, spec: &RunSpec) -> StrataResult<()> {
        self.record("run", &spec.name)?;
        let started = Instant::now();
        {
            let mut state = self.state.lock().unwrap();
            if !state.containers.insert(spec.name.clone()) {
                return Err(StrataError::container_exec(
                    "fake run",
                    format!("container name {} is already in use", spec.name),
                ));
            }
        }
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.runs.push(RunRecord {
            container: spec.name.clone(),
            started,
            finished: Instant::now(),
        });
        match state.run_exit_code {
            Some(code) if code != 0 => Err(StrataError::ContainerRun {
                container: spec.name.clone(),
                code,
            }),
            _ => Ok(()),
        }
    }

    async fn introspect(&self, spec: &RunSpec) -> StrataResult<i32> {
        self.record("introspect", &spec.image)?;
        Ok(0)
    }

    async fn commit(&self, container: &str) -> StrataResult<String> {
        self.record("commit", container)?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("sha256:{:064x}", state.next_id);
        state.images.insert(id.clone(), id.clone());
        Ok(id)
    }

    async fn remove(&self, container: &str) -> StrataResult<()> {
        self.record("remove", container)?;
        self.state.lock().unwrap().containers.remove(container);
        Ok(())
    }

    async fn tag(&self, image: &str, tag: &str) -> StrataResult<()> {
        self.record("tag", tag)?;
        let mut state = self.state.lock().unwrap();
        let id = state
            .images
            .get(image)
            .or_else(|| state.images.values().find(|id| *id == image))
            .cloned()
            .ok_or_else(|| StrataError::ImageNotFound(image.to_string()))?;
        state.images.insert(tag.to_string(), id);
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> StrataResult<()> {
        self.record("remove_image", image)?;
        self.state.lock().unwrap().images.remove(image);
        Ok(())
    }

    async fn pull(&self, image: &str) -> StrataResult<()> {
        self.record("pull", image)?;
        let mut state = self.state.lock().unwrap();
        if !state.images.contains_key(image) {
            state.next_id += 1;
            let id = format!("sha256:{:064x}", state.next_id);
            state.images.insert(image.to_string(), id);
        }
        Ok(())
    }

    async fn push(&self, image: &str) -> StrataResult<()> {
        self.record("push", image)
    }

    async fn inspect_image(&self, image: &str) -> StrataResult<Option<ImageInspect>> {
        self.record("inspect", image)?;
        let state = self.state.lock().unwrap();
        Ok(state.images.get(image).map(|id| ImageInspect {
            id: id.clone(),
            repo_tags: Some(
                state
                    .images
                    .iter()
                    .filter(|(reference, target)| *target == id && !reference.starts_with("sha256:"))
                    .map(|(reference, _)| reference.clone())
                    .collect(),
            ),
            ..ImageInspect::default()
        }))
    }

    async fn build_dockerfile(
        &self,
        context: &Path,
        _dockerfile: &Path,
        _build_args: &BTreeMap<String, String>,
        _target: Option<&str>,
    ) -> StrataResult<String> {
        self.record("build_dockerfile", &context.display().to_string())?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("sha256:{:064x}", state.next_id);
        state.images.insert(id.clone(), id.clone());
        Ok(id)
    }

    fn runtime_name(&self) -> &'static str {
        "Fake"
    }
}
