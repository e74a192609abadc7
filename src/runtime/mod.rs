pub mod docker;

#[cfg(test)]
pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("name conflict: {0}")]
    Conflict(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Restart policy forwarded to the runtime.
#[derive(Debug, Clone, Serialize)]
pub struct RestartPolicySpec {
    pub name: String,
    pub maximum_retry_count: i64,
}

/// Everything the runtime needs to create one container. Env values arrive
/// already resolved; no secret references reach this layer.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    /// container port (e.g. `"8080"`) → host port.
    pub ports: HashMap<String, u16>,
    /// host path → container path, mounted read-write.
    pub volumes: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub command: Option<Vec<String>>,
    pub network_mode: Option<String>,
    pub nano_cpus: Option<i64>,
    pub memory_bytes: Option<i64>,
    pub restart_policy: Option<RestartPolicySpec>,
}

/// Container info from list operations. `state` is the runtime's raw state
/// string; the supervisor maps it to the public status vocabulary.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub created_at_unix: Option<i64>,
    pub ports: HashMap<String, u16>,
    pub labels: HashMap<String, String>,
}

/// Detail from a single-container inspect.
#[derive(Debug, Clone)]
pub struct InspectInfo {
    pub id: String,
    pub name: String,
    pub state: String,
    pub env: Vec<String>,
    pub ports: HashMap<String, u16>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// One demultiplexed chunk from the runtime's log endpoint, still carrying
/// the raw timestamp prefix.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub bytes: Vec<u8>,
    pub stream: LogSource,
}

pub type LogChunkStream = BoxStream<'static, Result<LogChunk, RuntimeError>>;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Operations the console needs from a local container runtime. The
/// production implementation is bollard over a unix socket; tests use an
/// in-memory mock.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    // Images
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    // Containers
    async fn create_container(&self, spec: CreateSpec) -> Result<String, RuntimeError>;
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;
    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), RuntimeError>;
    async fn restart_container(&self, id: &str, timeout_secs: i64) -> Result<(), RuntimeError>;
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError>;
    async fn inspect_container(&self, id: &str) -> Result<InspectInfo, RuntimeError>;
    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerSummary>, RuntimeError>;

    // Logs & exec
    async fn log_stream(
        &self,
        id: &str,
        follow: bool,
        tail: u32,
    ) -> Result<LogChunkStream, RuntimeError>;
    async fn exec(&self, id: &str, command: Vec<String>) -> Result<(i64, Vec<u8>), RuntimeError>;
}
