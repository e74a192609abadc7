use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::containers::{ContainerConfig, ContainerError, ContainerService, RestartPolicyConfig};
use crate::mtls::{self, MtlsError};
use crate::store::{ExecSessionRecord, JobRecord, StateStore, StoreError};

// Defaults and clamps for the per-session execution policy.
const DEFAULT_CPU_QUOTA: f64 = 0.5;
const DEFAULT_MEMORY_LIMIT: &str = "512m";
pub const DEFAULT_IDLE_MINUTES: i64 = 30;
pub const DEFAULT_MAX_RUN_SECONDS: u64 = 60;
const MIN_MAX_RUN_SECONDS: u64 = 10;
const MAX_MAX_RUN_SECONDS: u64 = 300;
pub const DEFAULT_OUTPUT_BYTES_LIMIT: usize = 128_000;
const MIN_OUTPUT_BYTES_LIMIT: usize = 32_000;
const MAX_OUTPUT_BYTES_LIMIT: usize = 1_000_000;
const MTLS_MOUNT_PATH: &str = "/etc/mcp-certs";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("image signature rejected: {0}")]
    SignatureRejected(String),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("mTLS bundle error: {0}")]
    Mtls(#[from] MtlsError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Signature policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureMode {
    #[serde(rename = "audit-only")]
    AuditOnly,
    #[serde(rename = "enforcing")]
    Enforcing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermitUnsignedEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub cert: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignaturePolicy {
    pub mode: SignatureMode,
    #[serde(default)]
    pub verify_signatures: bool,
    #[serde(default)]
    pub permit_unsigned: Vec<PermitUnsignedEntry>,
}

#[derive(Debug, Clone)]
pub struct SignatureVerificationError {
    pub error_code: String,
    pub message: String,
}

/// Seam for image signature verification; the default implementation
/// accepts everything.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify_image(
        &self,
        image: &str,
        policy: &SignaturePolicy,
        correlation_id: &str,
    ) -> Result<(), SignatureVerificationError>;
}

pub struct NoopSignatureVerifier;

#[async_trait]
impl SignatureVerifier for NoopSignatureVerifier {
    async fn verify_image(
        &self,
        _image: &str,
        _policy: &SignaturePolicy,
        _correlation_id: &str,
    ) -> Result<(), SignatureVerificationError> {
        Ok(())
    }
}

fn is_permitted_unsigned(image: &str, entries: &[PermitUnsignedEntry]) -> bool {
    entries.iter().any(|entry| match entry.entry_type.as_str() {
        "any" => true,
        "image" => entry.name.as_deref() == Some(image),
        "sha256" => entry.digest.as_deref() == Some(image),
        "thumbprint" => entry.cert.as_deref() == Some(image),
        _ => false,
    })
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one synchronous command execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub output: String,
    pub exit_code: i64,
    pub timeout: bool,
    pub truncated: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Snapshot of an async job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub status: String,
    pub output: Option<String>,
    pub exit_code: Option<i64>,
    pub timeout: bool,
    pub truncated: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Sync execs return a result; async execs return the queued job row.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ExecOutcome {
    Sync(ExecResult),
    Job(JobRecord),
}

// ---------------------------------------------------------------------------
// SessionService
// ---------------------------------------------------------------------------

/// Owns interactive exec sessions: a gateway container per session, an mTLS
/// bundle, an idle deadline, and the execution policy applied to every
/// command run inside it.
pub struct SessionService {
    containers: Arc<ContainerService>,
    store: Arc<StateStore>,
    cert_base: PathBuf,
    placeholder_mode: bool,
    verifier: Arc<dyn SignatureVerifier>,
    job_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SessionService {
    pub fn new(
        containers: Arc<ContainerService>,
        store: Arc<StateStore>,
        cert_base: PathBuf,
        placeholder_mode: bool,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            containers,
            store,
            cert_base,
            placeholder_mode,
            verifier,
            job_tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start a session-scoped gateway container and persist the session.
    ///
    /// The container runs network-isolated with 0.5 CPU / 512 MiB limits and
    /// an on-failure restart policy; the fresh mTLS bundle is mounted at
    /// `/etc/mcp-certs`.
    pub async fn create_session(
        &self,
        server_id: &str,
        image: &str,
        env: HashMap<String, String>,
        vault_handle: &str,
        correlation_id: &str,
        idle_minutes: i64,
        signature_policy: Option<&SignaturePolicy>,
    ) -> Result<ExecSessionRecord, SessionError> {
        let session_id = Uuid::new_v4().simple().to_string();

        if let Some(policy) = signature_policy {
            self.enforce_signature_policy(image, policy, correlation_id)
                .await?;
        }

        let bundle = mtls::generate_bundle(&self.cert_base, &session_id, self.placeholder_mode)?;

        let mut labels = HashMap::new();
        labels.insert("mcp.session_id".to_string(), session_id.clone());
        labels.insert("mcp.server_id".to_string(), server_id.to_string());

        let mut volumes = HashMap::new();
        volumes.insert(
            bundle.bundle_dir.to_string_lossy().to_string(),
            MTLS_MOUNT_PATH.to_string(),
        );

        let config = ContainerConfig {
            name: format!("mcp-session-{}", &session_id[..8]),
            image: image.to_string(),
            env,
            ports: HashMap::new(),
            volumes,
            labels,
            command: None,
            network_mode: Some("none".to_string()),
            cpus: Some(DEFAULT_CPU_QUOTA),
            memory_limit: Some(DEFAULT_MEMORY_LIMIT.to_string()),
            restart_policy: Some(RestartPolicyConfig {
                name: "on-failure".to_string(),
                maximum_retry_count: 1,
            }),
        };

        let container_id = self
            .create_with_retry(&config, &session_id, vault_handle, correlation_id)
            .await?;

        let mut merged_config = serde_json::to_value(&config).unwrap_or(Value::Null);
        merged_config["runtime"] = json!({
            "max_run_seconds": DEFAULT_MAX_RUN_SECONDS,
            "output_bytes_limit": DEFAULT_OUTPUT_BYTES_LIMIT,
        });

        let record = ExecSessionRecord {
            session_id: session_id.clone(),
            server_id: server_id.to_string(),
            config: merged_config,
            state: "running".to_string(),
            idle_deadline: Utc::now() + Duration::minutes(idle_minutes),
            gateway_endpoint: format!("container://{container_id}"),
            metrics_endpoint: String::new(),
            mtls_cert_ref: Some(bundle.cert_ref()),
            feature_flags: json!({"cost_priority": false}),
            created_at: Utc::now(),
        };
        self.store.save_exec_session(&record)?;
        Ok(record)
    }

    async fn enforce_signature_policy(
        &self,
        image: &str,
        policy: &SignaturePolicy,
        correlation_id: &str,
    ) -> Result<(), SessionError> {
        if !policy.verify_signatures || is_permitted_unsigned(image, &policy.permit_unsigned) {
            return Ok(());
        }
        match self
            .verifier
            .verify_image(image, policy, correlation_id)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if policy.mode == SignatureMode::AuditOnly => {
                if let Err(audit_err) = self.store.record_audit_log(
                    "sessions",
                    "signature_verification_failed",
                    "system",
                    correlation_id,
                    &json!({
                        "error_code": e.error_code,
                        "message": e.message,
                        "mode": "audit-only",
                        "image": image,
                    }),
                ) {
                    log::warn!("Failed to audit signature failure: {}", audit_err);
                }
                Ok(())
            }
            Err(e) => Err(SessionError::SignatureRejected(e.message)),
        }
    }

    /// Container creation gets a single retry before the error surfaces.
    async fn create_with_retry(
        &self,
        config: &ContainerConfig,
        session_id: &str,
        vault_handle: &str,
        correlation_id: &str,
    ) -> Result<String, SessionError> {
        for attempt in 1..=2u32 {
            match self
                .containers
                .create_container(config, session_id, vault_handle)
                .await
            {
                Ok(id) => return Ok(id),
                Err(e) if attempt == 1 => {
                    log::warn!(
                        "Session container creation failed (attempt={}, correlation_id={}): {}",
                        attempt,
                        correlation_id,
                        e
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("create_with_retry loops at most twice")
    }

    /// Update and persist the session's execution policy, clamped to the
    /// allowed ranges.
    pub async fn update_session_config(
        &self,
        session_id: &str,
        max_run_seconds: Option<u64>,
        output_bytes_limit: Option<usize>,
    ) -> Result<ExecSessionRecord, SessionError> {
        let mut record = self
            .store
            .get_exec_session(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let runtime = runtime_policy(&record.config);
        let max_run = clamp_max_run_seconds(max_run_seconds.unwrap_or(runtime.0));
        let limit = clamp_output_bytes_limit(output_bytes_limit.unwrap_or(runtime.1));

        record.config["runtime"] = json!({
            "max_run_seconds": max_run,
            "output_bytes_limit": limit,
        });
        self.store.save_exec_session(&record)?;
        Ok(record)
    }

    /// Run `mcp-exec <tool> [args…]` inside the session's container, either
    /// synchronously or as a background job.
    pub async fn execute_command(
        &self,
        session_id: &str,
        tool: &str,
        args: Vec<String>,
        async_mode: bool,
        max_run_seconds: Option<u64>,
        output_bytes_limit: Option<usize>,
    ) -> Result<ExecOutcome, SessionError> {
        let record = self
            .store
            .get_exec_session(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let runtime = runtime_policy(&record.config);
        let max_run = clamp_max_run_seconds(max_run_seconds.unwrap_or(runtime.0));
        let limit = clamp_output_bytes_limit(output_bytes_limit.unwrap_or(runtime.1));

        let container_id = extract_container_id(&record.gateway_endpoint);
        let mut command = vec!["mcp-exec".to_string(), tool.to_string()];
        command.extend(args);

        if async_mode {
            let job = JobRecord {
                job_id: Uuid::new_v4().simple().to_string(),
                session_id: session_id.to_string(),
                status: "queued".to_string(),
                queued_at: Utc::now(),
                started_at: None,
                finished_at: None,
                exit_code: None,
                timeout: false,
                truncated: false,
                output_ref: None,
                created_at: Utc::now(),
            };
            self.store.save_job(&job)?;

            let store = self.store.clone();
            let containers = self.containers.clone();
            let job_id = job.job_id.clone();
            let handle = tokio::spawn(run_job(
                store,
                containers,
                job_id.clone(),
                container_id,
                command,
                max_run,
                limit,
            ));
            self.job_tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(job_id, handle);

            return Ok(ExecOutcome::Job(job));
        }

        let result =
            run_command(&self.containers, &container_id, command, max_run, limit).await?;
        Ok(ExecOutcome::Sync(result))
    }

    /// Current job snapshot. When the background task finished during a
    /// short poll, the persisted row is re-read so callers never observe a
    /// stale `running` with final output missing.
    pub async fn get_job_status(&self, job_id: &str) -> Result<Option<JobStatus>, SessionError> {
        let mut record = match self.store.get_job(job_id)? {
            Some(r) => r,
            None => return Ok(None),
        };

        if record.status == "running" {
            let finished = {
                let tasks = self.job_tasks.lock().unwrap_or_else(|e| e.into_inner());
                tasks.get(job_id).map(|h| h.is_finished())
            };
            if let Some(finished) = finished {
                if !finished {
                    tokio::time::sleep(StdDuration::from_millis(50)).await;
                }
                let now_finished = {
                    let tasks = self.job_tasks.lock().unwrap_or_else(|e| e.into_inner());
                    tasks.get(job_id).map(|h| h.is_finished()).unwrap_or(true)
                };
                if now_finished {
                    if let Some(fresh) = self.store.get_job(job_id)? {
                        record = fresh;
                    }
                    self.job_tasks
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(job_id);
                }
            }
        }

        let output = record
            .output_ref
            .as_ref()
            .filter(|r| r["kind"] == "inline")
            .and_then(|r| r["data"].as_str())
            .map(String::from);

        Ok(Some(JobStatus {
            job_id: record.job_id,
            status: record.status,
            output,
            exit_code: record.exit_code,
            timeout: record.timeout,
            truncated: record.truncated,
            started_at: record.started_at,
            finished_at: record.finished_at,
        }))
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<ExecSessionRecord>, SessionError> {
        Ok(self.store.get_exec_session(session_id)?)
    }
}

// ---------------------------------------------------------------------------
// Execution internals
// ---------------------------------------------------------------------------

/// Run the command with the wall-clock timeout and output cap applied.
async fn run_command(
    containers: &ContainerService,
    container_id: &str,
    command: Vec<String>,
    max_run: u64,
    output_bytes_limit: usize,
) -> Result<ExecResult, SessionError> {
    let started_at = Utc::now();
    let exec = tokio::time::timeout(
        StdDuration::from_secs(max_run),
        containers.exec_command(container_id, command),
    )
    .await;

    let (exit_code, output_bytes, timed_out) = match exec {
        Ok(result) => {
            let (code, bytes) = result?;
            (code, bytes, false)
        }
        Err(_) => (124, Vec::new(), true),
    };
    let finished_at = Utc::now();

    let output_text = String::from_utf8_lossy(&output_bytes).to_string();
    let encoded = output_text.as_bytes();
    let (output, truncated) = if encoded.len() > output_bytes_limit {
        (
            String::from_utf8_lossy(&encoded[..output_bytes_limit]).to_string(),
            true,
        )
    } else {
        (output_text, false)
    };

    Ok(ExecResult {
        output,
        exit_code,
        timeout: timed_out,
        truncated,
        started_at,
        finished_at,
    })
}

/// Background body of an async job: marks it running, executes, and writes
/// the terminal state back. Failures land as `failed` with the error
/// message as the output payload and exit code −1.
async fn run_job(
    store: Arc<StateStore>,
    containers: Arc<ContainerService>,
    job_id: String,
    container_id: String,
    command: Vec<String>,
    max_run: u64,
    output_bytes_limit: usize,
) {
    let mut job = match store.get_job(&job_id) {
        Ok(Some(job)) => job,
        _ => return,
    };

    job.status = "running".to_string();
    job.started_at = Some(Utc::now());
    if let Err(e) = store.save_job(&job) {
        log::warn!("Failed to mark job {} running: {}", job_id, e);
    }

    match run_command(&containers, &container_id, command, max_run, output_bytes_limit).await {
        Ok(result) => {
            job.status = "completed".to_string();
            job.output_ref = Some(json!({"kind": "inline", "data": result.output}));
            job.finished_at = Some(result.finished_at);
            job.exit_code = Some(result.exit_code);
            job.timeout = result.timeout;
            job.truncated = result.truncated;
        }
        Err(e) => {
            log::error!("Job {} failed: {}", job_id, e);
            job.status = "failed".to_string();
            job.output_ref = Some(json!({"kind": "inline", "data": e.to_string()}));
            job.finished_at = Some(Utc::now());
            job.exit_code = Some(-1);
            job.timeout = false;
            job.truncated = false;
        }
    }

    if let Err(e) = store.save_job(&job) {
        log::error!("Failed to persist terminal state for job {}: {}", job_id, e);
    }
}

fn runtime_policy(config: &Value) -> (u64, usize) {
    let runtime = &config["runtime"];
    let max_run = runtime["max_run_seconds"]
        .as_u64()
        .unwrap_or(DEFAULT_MAX_RUN_SECONDS);
    let limit = runtime["output_bytes_limit"]
        .as_u64()
        .map(|v| v as usize)
        .unwrap_or(DEFAULT_OUTPUT_BYTES_LIMIT);
    (max_run, limit)
}

fn extract_container_id(gateway_endpoint: &str) -> String {
    gateway_endpoint
        .strip_prefix("container://")
        .unwrap_or(gateway_endpoint)
        .to_string()
}

fn clamp_max_run_seconds(value: u64) -> u64 {
    value.clamp(MIN_MAX_RUN_SECONDS, MAX_MAX_RUN_SECONDS)
}

fn clamp_output_bytes_limit(value: usize) -> usize {
    value.clamp(MIN_OUTPUT_BYTES_LIMIT, MAX_OUTPUT_BYTES_LIMIT)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
