use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde_json::{json, Value};

use crate::runtime::{ContainerRuntime, InspectInfo, RuntimeError};

// Ports an MCP server is conventionally reachable on when `MCP_ENDPOINT`
// is not declared.
const CONVENTIONAL_PORTS: [&str; 3] = ["8080", "3000", "5000"];
const JSONRPC_ID: u32 = 1;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum InspectorError {
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("no reachable MCP endpoint on container {0}")]
    Unreachable(String),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("container runtime error: {0}")]
    Runtime(String),
}

impl From<RuntimeError> for InspectorError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::NotFound(m) => InspectorError::ContainerNotFound(m),
            other => InspectorError::Runtime(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// InspectorService
// ---------------------------------------------------------------------------

/// Reads a live container's advertised MCP surface by forwarding JSON-RPC
/// list envelopes.
///
/// Endpoint discovery: the container's `MCP_ENDPOINT` env var, then
/// conventional ports mapped on the container, then an `mcp` subcommand
/// executed inside it.
pub struct InspectorService {
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
}

impl InspectorService {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { runtime, http }
    }

    pub async fn list_tools(&self, container_id: &str) -> Result<Value, InspectorError> {
        self.query(container_id, "tools/list", "tools").await
    }

    pub async fn list_resources(&self, container_id: &str) -> Result<Value, InspectorError> {
        self.query(container_id, "resources/list", "resources").await
    }

    pub async fn list_prompts(&self, container_id: &str) -> Result<Value, InspectorError> {
        self.query(container_id, "prompts/list", "prompts").await
    }

    pub async fn capabilities(&self, container_id: &str) -> Result<Value, InspectorError> {
        self.query(container_id, "initialize", "capabilities").await
    }

    async fn query(
        &self,
        container_id: &str,
        method: &str,
        subcommand: &str,
    ) -> Result<Value, InspectorError> {
        let info = self.runtime.inspect_container(container_id).await?;

        for endpoint in candidate_endpoints(&info) {
            match self.rpc_over_http(&endpoint, method).await {
                Ok(result) => return Ok(result),
                Err(InspectorError::Protocol(e)) => {
                    // The server answered but refused the call; no point in
                    // trying other endpoints or the exec fallback.
                    return Err(InspectorError::Protocol(e));
                }
                Err(e) => {
                    log::debug!("Endpoint {} not usable: {}", endpoint, e);
                }
            }
        }

        self.query_via_exec(container_id, subcommand).await
    }

    async fn rpc_over_http(&self, endpoint: &str, method: &str) -> Result<Value, InspectorError> {
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": JSONRPC_ID,
            "method": method,
        });
        let response = self
            .http
            .post(endpoint)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| InspectorError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(InspectorError::Unreachable(format!(
                "endpoint returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| InspectorError::Protocol(format!("invalid JSON-RPC response: {e}")))?;
        unwrap_jsonrpc(body)
    }

    /// Exec fallback: `mcp <subcommand>` inside the container, stdout parsed
    /// as a JSON-RPC envelope or a bare result object.
    async fn query_via_exec(
        &self,
        container_id: &str,
        subcommand: &str,
    ) -> Result<Value, InspectorError> {
        let (exit_code, output) = self
            .runtime
            .exec(
                container_id,
                vec!["mcp".to_string(), subcommand.to_string()],
            )
            .await?;
        if exit_code != 0 {
            return Err(InspectorError::Unreachable(format!(
                "mcp {subcommand} exited with {exit_code}"
            )));
        }

        let text = String::from_utf8_lossy(&output);
        let body: Value = serde_json::from_str(text.trim())
            .map_err(|e| InspectorError::Protocol(format!("invalid JSON from mcp CLI: {e}")))?;
        if body.get("jsonrpc").is_some() {
            unwrap_jsonrpc(body)
        } else {
            Ok(body)
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// HTTP endpoints worth trying, in priority order.
fn candidate_endpoints(info: &InspectInfo) -> Vec<String> {
    let mut endpoints = Vec::new();

    for entry in &info.env {
        if let Some(value) = entry.strip_prefix("MCP_ENDPOINT=") {
            if !value.is_empty() {
                endpoints.push(value.to_string());
            }
        }
    }

    for port in CONVENTIONAL_PORTS {
        if let Some(host_port) = info.ports.get(port) {
            endpoints.push(format!("http://127.0.0.1:{host_port}/mcp"));
        }
    }

    endpoints
}

fn unwrap_jsonrpc(body: Value) -> Result<Value, InspectorError> {
    if let Some(error) = body.get("error") {
        return Err(InspectorError::Protocol(error.to_string()));
    }
    Ok(body.get("result").cloned().unwrap_or(Value::Null))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
