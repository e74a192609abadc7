//! In-memory mock implementation of `ContainerRuntime` for testing.
//!
//! Tracks all calls and manages fake container state so the supervisor and
//! session runtime can be tested without a daemon.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use super::{
    ContainerRuntime, ContainerSummary, CreateSpec, InspectInfo, LogChunk, LogChunkStream,
    LogSource, RuntimeError,
};

// ---------------------------------------------------------------------------
// Call recording
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCall {
    Ping,
    ImageExists(String),
    PullImage(String),
    CreateContainer(String), // name
    StartContainer(String),  // id
    StopContainer(String),   // id
    RestartContainer(String),
    RemoveContainer(String),
    ListContainers,
    InspectContainer(String),
    FindByName(String),
    LogStream(String),
    Exec { id: String, command: Vec<String> },
}

// ---------------------------------------------------------------------------
// Mock state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    name: String,
    image: String,
    state: String,
    env: Vec<String>,
    ports: HashMap<String, u16>,
    labels: HashMap<String, String>,
}

struct Inner {
    calls: Vec<RuntimeCall>,
    images: Vec<String>,
    containers: HashMap<String, FakeContainer>,
    next_id: u64,
    log_chunks: Vec<LogChunk>,
    exec_result: (i64, Vec<u8>),
    exec_delay: Option<Duration>,
    // Behavior overrides for edge cases
    fail_pull: bool,
    fail_create: Option<RuntimeError>,
    fail_create_times: usize,
}

pub struct MockRuntime {
    inner: Mutex<Inner>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                calls: Vec::new(),
                images: Vec::new(),
                containers: HashMap::new(),
                next_id: 1,
                log_chunks: Vec::new(),
                exec_result: (0, Vec::new()),
                exec_delay: None,
                fail_pull: false,
                fail_create: None,
                fail_create_times: 0,
            }),
        }
    }

    /// Pre-populate with a local image so `pull_image` is skipped.
    pub fn with_image(self, image: &str) -> Self {
        self.inner.lock().unwrap().images.push(image.to_string());
        self
    }

    pub fn with_container(self, id: &str, name: &str, state: &str) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.containers.insert(
                id.to_string(),
                FakeContainer {
                    id: id.to_string(),
                    name: name.to_string(),
                    image: "example/image:latest".to_string(),
                    state: state.to_string(),
                    env: Vec::new(),
                    ports: HashMap::new(),
                    labels: HashMap::new(),
                },
            );
        }
        self
    }

    pub fn with_log_chunks(self, chunks: Vec<LogChunk>) -> Self {
        self.inner.lock().unwrap().log_chunks = chunks;
        self
    }

    pub fn with_exec_result(self, exit_code: i64, output: &[u8]) -> Self {
        self.inner.lock().unwrap().exec_result = (exit_code, output.to_vec());
        self
    }

    /// Make each `exec` call take this long before returning.
    pub fn with_exec_delay(self, delay: Duration) -> Self {
        self.inner.lock().unwrap().exec_delay = Some(delay);
        self
    }

    pub fn fail_pull(self) -> Self {
        self.inner.lock().unwrap().fail_pull = true;
        self
    }

    /// Make the next `times` create calls fail with a clone-alike of `error`.
    pub fn fail_create_times(self, times: usize, conflict: bool) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.fail_create_times = times;
            inner.fail_create = Some(if conflict {
                RuntimeError::Conflict("name already in use".into())
            } else {
                RuntimeError::Other("create failed".into())
            });
        }
        self
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, needle: &RuntimeCall) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| *c == needle)
            .count()
    }

    pub fn container_env(&self, id: &str) -> Option<Vec<String>> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.env.clone())
    }

    pub fn container_state(&self, id: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.state.clone())
    }

    fn record(&self, call: RuntimeCall) {
        self.inner.lock().unwrap().calls.push(call);
    }

    fn summary(container: &FakeContainer) -> ContainerSummary {
        ContainerSummary {
            id: container.id.clone(),
            name: container.name.clone(),
            image: container.image.clone(),
            state: container.state.clone(),
            created_at_unix: Some(0),
            ports: container.ports.clone(),
            labels: container.labels.clone(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Ping);
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        self.record(RuntimeCall::ImageExists(image.to_string()));
        Ok(self.inner.lock().unwrap().images.iter().any(|i| i == image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::PullImage(image.to_string()));
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_pull {
            return Err(RuntimeError::ImageNotFound(image.to_string()));
        }
        inner.images.push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: CreateSpec) -> Result<String, RuntimeError> {
        self.record(RuntimeCall::CreateContainer(spec.name.clone()));
        let mut inner = self.inner.lock().unwrap();

        if inner.fail_create_times > 0 {
            inner.fail_create_times -= 1;
            return Err(match inner.fail_create.as_ref() {
                Some(RuntimeError::Conflict(m)) => RuntimeError::Conflict(m.clone()),
                Some(RuntimeError::Other(m)) => RuntimeError::Other(m.clone()),
                _ => RuntimeError::Other("create failed".into()),
            });
        }
        if inner
            .containers
            .values()
            .any(|c| c.name == spec.name)
        {
            return Err(RuntimeError::Conflict(format!(
                "container name {} already in use",
                spec.name
            )));
        }

        let id = format!("mock-{:08x}", inner.next_id);
        inner.next_id += 1;
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name,
                image: spec.image,
                state: "created".to_string(),
                env: spec.env,
                ports: spec.ports,
                labels: spec.labels,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::StartContainer(id.to_string()));
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.get_mut(id) {
            Some(container) => {
                container.state = "running".to_string();
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn stop_container(&self, id: &str, _timeout_secs: i64) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::StopContainer(id.to_string()));
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.get_mut(id) {
            Some(container) => {
                container.state = "exited".to_string();
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn restart_container(&self, id: &str, _timeout_secs: i64) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::RestartContainer(id.to_string()));
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.get_mut(id) {
            Some(container) => {
                container.state = "running".to_string();
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::RemoveContainer(id.to_string()));
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.get(id) {
            Some(container) if container.state == "running" && !force => Err(
                RuntimeError::Conflict("cannot remove a running container".into()),
            ),
            Some(_) => {
                inner.containers.remove(id);
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.record(RuntimeCall::ListContainers);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .containers
            .values()
            .filter(|c| all || c.state == "running")
            .map(Self::summary)
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<InspectInfo, RuntimeError> {
        self.record(RuntimeCall::InspectContainer(id.to_string()));
        let inner = self.inner.lock().unwrap();
        match inner.containers.get(id) {
            Some(c) => Ok(InspectInfo {
                id: c.id.clone(),
                name: c.name.clone(),
                state: c.state.clone(),
                env: c.env.clone(),
                ports: c.ports.clone(),
                labels: c.labels.clone(),
            }),
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerSummary>, RuntimeError> {
        self.record(RuntimeCall::FindByName(name.to_string()));
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .containers
            .values()
            .find(|c| c.name == name)
            .map(Self::summary))
    }

    async fn log_stream(
        &self,
        id: &str,
        _follow: bool,
        _tail: u32,
    ) -> Result<LogChunkStream, RuntimeError> {
        self.record(RuntimeCall::LogStream(id.to_string()));
        let inner = self.inner.lock().unwrap();
        if !inner.containers.contains_key(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        let chunks: Vec<Result<LogChunk, RuntimeError>> =
            inner.log_chunks.iter().cloned().map(Ok).collect();
        Ok(futures_util::stream::iter(chunks).boxed())
    }

    async fn exec(&self, id: &str, command: Vec<String>) -> Result<(i64, Vec<u8>), RuntimeError> {
        self.record(RuntimeCall::Exec {
            id: id.to_string(),
            command,
        });
        let (result, delay) = {
            let inner = self.inner.lock().unwrap();
            if !inner.containers.contains_key(id) {
                return Err(RuntimeError::NotFound(id.to_string()));
            }
            (inner.exec_result.clone(), inner.exec_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(result)
    }
}

// Convenience for building demultiplexed log fixtures.
pub fn chunk(line: &str, stream: LogSource) -> LogChunk {
    LogChunk {
        bytes: line.as_bytes().to_vec(),
        stream,
    }
}
