use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::{
    ContainerRuntime, CreateSpec, LogSource, RestartPolicySpec, RuntimeError,
};
use crate::secrets::{SecretError, SecretResolver};
use crate::store::{ContainerConfigRecord, StateStore};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container name {name} is already in use")]
    AlreadyExists {
        name: String,
        container_id: Option<String>,
        status: Option<String>,
    },

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("secret resolution failed: {0}")]
    Secret(#[from] SecretError),

    #[error("{0}")]
    Other(String),
}

impl From<RuntimeError> for ContainerError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::NotFound(m) => ContainerError::NotFound(m),
            RuntimeError::ImageNotFound(m) => ContainerError::ImageNotFound(m),
            RuntimeError::Unavailable(m) => ContainerError::Unavailable(m),
            RuntimeError::Conflict(m) | RuntimeError::Other(m) => ContainerError::Other(m),
        }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicyConfig {
    pub name: String,
    #[serde(default)]
    pub maximum_retry_count: i64,
}

/// User-facing container configuration. Env values may carry inline secret
/// references that are resolved at create time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// container port → host port.
    #[serde(default)]
    pub ports: HashMap<String, u16>,
    /// host path → container path.
    #[serde(default)]
    pub volumes: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub cpus: Option<f64>,
    /// e.g. `"512m"`, `"2g"`, or a plain byte count.
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub restart_policy: Option<RestartPolicyConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub ports: HashMap<String, u16>,
    pub labels: HashMap<String, String>,
}

/// One parsed log line handed to clients.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub stream: LogSource,
}

pub const ORIGINAL_NAME_LABEL: &str = "mcp.original_name";

// ---------------------------------------------------------------------------
// ContainerService
// ---------------------------------------------------------------------------

/// Container lifecycle supervisor.
///
/// Sits between the HTTP layer and the runtime: resolves secret references,
/// normalizes names to the runtime's grammar, ensures images are present,
/// and persists a config snapshot for every started container.
pub struct ContainerService {
    runtime: Arc<dyn ContainerRuntime>,
    secrets: Arc<SecretResolver>,
    store: Arc<StateStore>,
}

impl ContainerService {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        secrets: Arc<SecretResolver>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            runtime,
            secrets,
            store,
        }
    }

    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>, ContainerError> {
        let summaries = self.runtime.list_containers(all).await?;
        Ok(summaries
            .into_iter()
            .map(|s| ContainerInfo {
                status: map_status(&s.state).to_string(),
                created_at: s
                    .created_at_unix
                    .and_then(|ts| DateTime::from_timestamp(ts, 0))
                    .unwrap_or_else(Utc::now),
                id: s.id,
                name: s.name,
                image: s.image,
                ports: s.ports,
                labels: s.labels,
            })
            .collect())
    }

    /// Create and start a container, resolving inline secret references in
    /// its environment first. Returns the container id.
    pub async fn create_container(
        &self,
        config: &ContainerConfig,
        session_id: &str,
        vault_handle: &str,
    ) -> Result<String, ContainerError> {
        let resolved_env = self.resolve_env(&config.env, session_id, vault_handle).await?;

        let normalized_name = normalize_container_name(&config.name);
        let mut labels = config.labels.clone();
        if normalized_name != config.name {
            labels
                .entry(ORIGINAL_NAME_LABEL.to_string())
                .or_insert_with(|| config.name.clone());
        }

        if !self.runtime.image_exists(&config.image).await? {
            self.runtime.pull_image(&config.image).await?;
        }

        let spec = CreateSpec {
            name: normalized_name.clone(),
            image: config.image.clone(),
            env: resolved_env
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
            ports: config.ports.clone(),
            volumes: config
                .volumes
                .iter()
                .map(|(host, container)| (host.clone(), container.clone()))
                .collect(),
            labels,
            command: config.command.clone(),
            network_mode: config.network_mode.clone(),
            nano_cpus: config.cpus.map(|c| (c * 1_000_000_000.0) as i64),
            memory_bytes: config
                .memory_limit
                .as_deref()
                .and_then(parse_memory_limit),
            restart_policy: config.restart_policy.as_ref().map(|p| RestartPolicySpec {
                name: p.name.clone(),
                maximum_retry_count: p.maximum_retry_count,
            }),
        };

        let container_id = match self.runtime.create_container(spec).await {
            Ok(id) => id,
            Err(RuntimeError::Conflict(_)) => {
                return Err(self.already_exists(&normalized_name).await);
            }
            Err(e) => return Err(e.into()),
        };

        self.runtime.start_container(&container_id).await?;

        // Best-effort snapshot; a store failure must not undo the start.
        let record = ContainerConfigRecord {
            container_id: container_id.clone(),
            name: normalized_name,
            image: config.image.clone(),
            config: serde_json::to_value(config).unwrap_or(Value::Null),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.save_container_config(&record) {
            log::warn!("Failed to persist container config: {}", e);
        }

        Ok(container_id)
    }

    async fn already_exists(&self, normalized_name: &str) -> ContainerError {
        let (container_id, status) = match self.runtime.find_by_name(normalized_name).await {
            Ok(Some(existing)) => (
                Some(existing.id),
                Some(map_status(&existing.state).to_string()),
            ),
            Ok(None) => (None, None),
            Err(e) => {
                log::debug!("Conflict lookup failed for {}: {}", normalized_name, e);
                (None, None)
            }
        };
        ContainerError::AlreadyExists {
            name: normalized_name.to_string(),
            container_id,
            status,
        }
    }

    async fn resolve_env(
        &self,
        env: &HashMap<String, String>,
        session_id: &str,
        vault_handle: &str,
    ) -> Result<HashMap<String, String>, ContainerError> {
        let as_value = Value::Object(
            env.iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        );
        let resolved = self
            .secrets
            .resolve_all(&as_value, session_id, vault_handle)
            .await?;

        let mut out = HashMap::with_capacity(env.len());
        if let Some(map) = resolved.as_object() {
            for (key, value) in map {
                match value.as_str() {
                    Some(s) => {
                        out.insert(key.clone(), s.to_string());
                    }
                    None => {
                        out.insert(key.clone(), value.to_string());
                    }
                }
            }
        }
        Ok(out)
    }

    pub async fn start_container(&self, container_id: &str) -> Result<(), ContainerError> {
        Ok(self.runtime.start_container(container_id).await?)
    }

    pub async fn stop_container(&self, container_id: &str) -> Result<(), ContainerError> {
        Ok(self.runtime.stop_container(container_id, 10).await?)
    }

    pub async fn restart_container(&self, container_id: &str) -> Result<(), ContainerError> {
        Ok(self.runtime.restart_container(container_id, 10).await?)
    }

    pub async fn delete_container(
        &self,
        container_id: &str,
        force: bool,
    ) -> Result<(), ContainerError> {
        self.runtime.remove_container(container_id, force).await?;
        if let Err(e) = self.store.delete_container_config(container_id) {
            log::warn!("Failed to drop container config record: {}", e);
        }
        Ok(())
    }

    pub fn get_container_config(&self, container_id: &str) -> Result<Value, ContainerError> {
        match self.store.get_container_config(container_id) {
            Ok(Some(record)) => Ok(record.config),
            Ok(None) => Err(ContainerError::NotFound(format!(
                "no stored config for {container_id}"
            ))),
            Err(e) => Err(ContainerError::Other(e.to_string())),
        }
    }

    /// Lazy stream of parsed log entries. Ends when the runtime closes the
    /// underlying stream.
    pub async fn stream_logs(
        &self,
        container_id: &str,
        follow: bool,
        tail: u32,
    ) -> Result<BoxStream<'static, LogEntry>, ContainerError> {
        let chunks = self.runtime.log_stream(container_id, follow, tail).await?;
        let stream = async_stream::stream! {
            let mut chunks = chunks;
            while let Some(result) = chunks.next().await {
                match result {
                    Ok(chunk) => {
                        let raw = String::from_utf8_lossy(&chunk.bytes);
                        let raw = raw.trim_end_matches(['\r', '\n']);
                        if raw.is_empty() {
                            continue;
                        }
                        yield parse_log_line(raw, chunk.stream);
                    }
                    Err(e) => {
                        log::warn!("Log stream error: {}", e);
                        break;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }

    /// Run a command in a container, capturing combined stdout+stderr.
    pub async fn exec_command(
        &self,
        container_id: &str,
        command: Vec<String>,
    ) -> Result<(i64, Vec<u8>), ContainerError> {
        Ok(self.runtime.exec(container_id, command).await?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a runtime state string to the public status vocabulary.
pub fn map_status(state: &str) -> &'static str {
    match state.to_ascii_lowercase().as_str() {
        "running" => "running",
        "exited" | "created" | "paused" => "stopped",
        _ => "error",
    }
}

/// Normalize a container name to the runtime's naming grammar: disallowed
/// runs become `-`, boundary punctuation is stripped, names that do not
/// start with an alphanumeric get an `mcp-` prefix, and the result is
/// truncated to the 63-character DNS label limit.
pub fn normalize_container_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut last_was_dash = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-') {
            normalized.push(ch);
            last_was_dash = false;
        } else if !last_was_dash {
            normalized.push('-');
            last_was_dash = true;
        }
    }

    let mut normalized = normalized.trim_matches(['.', '_', '-']).to_string();
    if normalized.is_empty() {
        normalized = "mcp-server".to_string();
    }
    if !normalized
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
    {
        normalized = format!("mcp-{normalized}");
        normalized = normalized.trim_matches(['.', '_', '-']).to_string();
        if normalized.is_empty() {
            normalized = "mcp-server".to_string();
        }
    }
    normalized.chars().take(63).collect()
}

/// Parse limits like `512m` or `2g` into bytes.
fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.trim().to_ascii_lowercase();
    if limit.is_empty() {
        return None;
    }
    let (number, multiplier) = match limit.chars().last() {
        Some('k') => (&limit[..limit.len() - 1], 1024i64),
        Some('m') => (&limit[..limit.len() - 1], 1024i64 * 1024),
        Some('g') => (&limit[..limit.len() - 1], 1024i64 * 1024 * 1024),
        _ => (limit.as_str(), 1),
    };
    number.parse::<i64>().ok().map(|n| n * multiplier)
}

/// Split the runtime's `<iso-timestamp> <message>` prefix; fall back to the
/// wall clock with the whole line kept as message.
fn parse_log_line(raw: &str, stream: LogSource) -> LogEntry {
    if let Some((timestamp_str, message)) = raw.split_once(' ') {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp_str) {
            return LogEntry {
                timestamp: parsed.with_timezone(&Utc),
                message: message.to_string(),
                stream,
            };
        }
    }
    LogEntry {
        timestamp: Utc::now(),
        message: raw.to_string(),
        stream,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
