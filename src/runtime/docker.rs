use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::service::{
    ContainerCreateBody, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::Docker;
use futures_util::StreamExt;

use super::{
    ContainerRuntime, ContainerSummary, CreateSpec, InspectInfo, LogChunk, LogChunkStream,
    LogSource, RuntimeError,
};

const CONNECT_ERROR_CACHE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT_SECS: u64 = 120;

// ---------------------------------------------------------------------------
// DockerRuntime
// ---------------------------------------------------------------------------

/// bollard-backed runtime with lazy connection over a unix socket.
///
/// The socket path is discovered through a fallback chain: configured value,
/// `$XDG_RUNTIME_DIR/docker.sock`, `/run/user/<uid>/docker.sock`, then
/// `/var/run/docker.sock`. A failed connect is memoized for 30 seconds so
/// request bursts do not hammer a dead daemon.
pub struct DockerRuntime {
    configured_host: Option<String>,
    client: Mutex<Option<Docker>>,
    last_connect_error: Mutex<Option<(String, Instant)>>,
}

impl DockerRuntime {
    pub fn new(configured_host: Option<String>) -> Self {
        Self {
            configured_host,
            client: Mutex::new(None),
            last_connect_error: Mutex::new(None),
        }
    }

    fn socket_candidates(&self) -> Vec<String> {
        let mut candidates = Vec::new();
        if let Some(host) = &self.configured_host {
            let path = host.strip_prefix("unix://").unwrap_or(host);
            candidates.push(path.to_string());
        }
        if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
            if !runtime_dir.is_empty() {
                candidates.push(format!("{runtime_dir}/docker.sock"));
            }
        }
        if let Some(uid) = current_uid() {
            candidates.push(format!("/run/user/{uid}/docker.sock"));
        }
        candidates.push("/var/run/docker.sock".to_string());
        candidates.dedup();
        candidates
    }

    async fn client(&self) -> Result<Docker, RuntimeError> {
        if let Some(client) = self.client.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Ok(client);
        }

        if let Some((message, at)) = self
            .last_connect_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            if at.elapsed() < CONNECT_ERROR_CACHE {
                return Err(RuntimeError::Unavailable(message));
            }
        }

        let mut errors: Vec<String> = Vec::new();
        for path in self.socket_candidates() {
            if !std::path::Path::new(&path).exists() {
                errors.push(format!("{path}: socket not found"));
                continue;
            }
            let addr = format!("unix://{path}");
            match Docker::connect_with_unix(&addr, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            {
                Ok(docker) => match docker.ping().await {
                    Ok(_) => {
                        *self.client.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(docker.clone());
                        *self
                            .last_connect_error
                            .lock()
                            .unwrap_or_else(|e| e.into_inner()) = None;
                        log::info!("Connected to container runtime at {}", addr);
                        return Ok(docker);
                    }
                    Err(e) => errors.push(format!("{addr}: {e}")),
                },
                Err(e) => errors.push(format!("{addr}: {e}")),
            }
        }

        let message = format!(
            "cannot reach the container runtime daemon ({})",
            errors.join(" | ")
        );
        *self
            .last_connect_error
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some((message.clone(), Instant::now()));
        Err(RuntimeError::Unavailable(message))
    }
}

#[cfg(unix)]
fn current_uid() -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").ok().map(|m| m.uid())
}

#[cfg(not(unix))]
fn current_uid() -> Option<u32> {
    None
}

fn to_err(e: bollard::errors::Error) -> RuntimeError {
    match &e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(e.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409, ..
        } => RuntimeError::Conflict(e.to_string()),
        _ => RuntimeError::Other(e.to_string()),
    }
}

fn summary_ports(summary: &bollard::service::ContainerSummary) -> HashMap<String, u16> {
    let mut ports = HashMap::new();
    for port in summary.ports.iter().flatten() {
        if let Some(public) = port.public_port {
            ports.insert(port.private_port.to_string(), public);
        }
    }
    ports
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        let docker = self.client().await?;
        docker.ping().await.map_err(to_err)?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let docker = self.client().await?;
        match docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(to_err(e)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let docker = self.client().await?;

        let (repo, tag) = match image.rsplit_once(':') {
            Some((r, t)) if !t.contains('/') => (r, t),
            _ => (image, "latest"),
        };

        let opts = CreateImageOptions {
            from_image: Some(repo.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        };

        let mut stream = docker.create_image(Some(opts), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        log::debug!("Pull: {}", status);
                    }
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(RuntimeError::ImageNotFound(image.to_string())),
                Err(e) => return Err(to_err(e)),
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: CreateSpec) -> Result<String, RuntimeError> {
        let docker = self.client().await?;

        let mut port_bindings = HashMap::new();
        let mut exposed_ports = Vec::new();
        for (container_port, host_port) in &spec.ports {
            let key = format!("{container_port}/tcp");
            port_bindings.insert(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            );
            exposed_ports.push(key);
        }

        let binds: Vec<String> = spec
            .volumes
            .iter()
            .map(|(host, container)| format!("{host}:{container}:rw"))
            .collect();

        let restart_policy = spec.restart_policy.as_ref().map(|p| RestartPolicy {
            name: Some(match p.name.as_str() {
                "always" => RestartPolicyNameEnum::ALWAYS,
                "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
                "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
                _ => RestartPolicyNameEnum::NO,
            }),
            maximum_retry_count: Some(p.maximum_retry_count),
        });

        let host_config = HostConfig {
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            binds: if binds.is_empty() { None } else { Some(binds) },
            network_mode: spec.network_mode.clone(),
            nano_cpus: spec.nano_cpus,
            memory: spec.memory_bytes,
            restart_policy,
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            cmd: spec.command.clone(),
            labels: Some(spec.labels.clone()),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let opts = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let response = docker
            .create_container(Some(opts), body)
            .await
            .map_err(to_err)?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let docker = self.client().await?;
        docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(to_err)?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), RuntimeError> {
        let docker = self.client().await?;
        docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: Some(timeout_secs as i32),
                    signal: None,
                }),
            )
            .await
            .map_err(to_err)?;
        Ok(())
    }

    async fn restart_container(&self, id: &str, timeout_secs: i64) -> Result<(), RuntimeError> {
        let docker = self.client().await?;
        docker
            .restart_container(
                id,
                Some(RestartContainerOptions {
                    t: Some(timeout_secs as i32),
                    signal: None,
                }),
            )
            .await
            .map_err(to_err)?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let docker = self.client().await?;
        docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(to_err)?;
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let docker = self.client().await?;
        let opts = ListContainersOptions {
            all,
            ..Default::default()
        };
        let containers = docker.list_containers(Some(opts)).await.map_err(to_err)?;

        Ok(containers
            .into_iter()
            .map(|c| {
                let ports = summary_ports(&c);
                ContainerSummary {
                    id: c.id.unwrap_or_default(),
                    name: c
                        .names
                        .unwrap_or_default()
                        .first()
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    image: c.image.unwrap_or_default(),
                    state: c.state.map(|s| s.to_string()).unwrap_or_default(),
                    created_at_unix: c.created,
                    ports,
                    labels: c.labels.unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<InspectInfo, RuntimeError> {
        let docker = self.client().await?;
        let info = docker.inspect_container(id, None).await.map_err(to_err)?;

        let state = info
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string())
            .unwrap_or_default();

        let config = info.config.unwrap_or_default();
        let env = config.env.unwrap_or_default();
        let labels = config.labels.unwrap_or_default();

        let mut ports = HashMap::new();
        if let Some(network) = info.network_settings {
            for (key, bindings) in network.ports.unwrap_or_default() {
                let container_port = key.split('/').next().unwrap_or(&key).to_string();
                if let Some(binding) = bindings.and_then(|b| b.into_iter().next()) {
                    if let Some(host_port) =
                        binding.host_port.and_then(|p| p.parse::<u16>().ok())
                    {
                        ports.insert(container_port, host_port);
                    }
                }
            }
        }

        Ok(InspectInfo {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            state,
            env,
            ports,
            labels,
        })
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerSummary>, RuntimeError> {
        let containers = self.list_containers(true).await?;
        Ok(containers.into_iter().find(|c| c.name == name))
    }

    async fn log_stream(
        &self,
        id: &str,
        follow: bool,
        tail: u32,
    ) -> Result<LogChunkStream, RuntimeError> {
        let docker = self.client().await?;
        // Surface missing containers before handing back a lazy stream.
        docker.inspect_container(id, None).await.map_err(to_err)?;

        let opts = LogsOptions {
            follow,
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let id = id.to_string();

        let stream = async_stream::stream! {
            let mut logs = docker.logs(&id, Some(opts));
            while let Some(result) = logs.next().await {
                match result {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        yield Ok(LogChunk {
                            bytes: message.to_vec(),
                            stream: LogSource::Stdout,
                        });
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        yield Ok(LogChunk {
                            bytes: message.to_vec(),
                            stream: LogSource::Stderr,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => yield Err(to_err(e)),
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn exec(&self, id: &str, command: Vec<String>) -> Result<(i64, Vec<u8>), RuntimeError> {
        let docker = self.client().await?;

        let exec = docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(command),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(to_err)?;

        let mut output = Vec::new();
        match docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(to_err)?
        {
            StartExecResults::Attached {
                output: mut attached,
                ..
            } => {
                while let Some(chunk) = attached.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message })
                        | Ok(LogOutput::StdErr { message })
                        | Ok(LogOutput::Console { message }) => {
                            output.extend_from_slice(&message)
                        }
                        Ok(_) => {}
                        Err(e) => return Err(to_err(e)),
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = docker.inspect_exec(&exec.id).await.map_err(to_err)?;
        Ok((inspect.exit_code.unwrap_or(0), output))
    }
}
