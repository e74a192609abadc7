use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::oauth::tokens::TokenVault;
use crate::store::{CredentialRecord, RemoteServerRecord, StateStore, StoreError};

// Prompt 429 instead of queueing behind the connection cap.
const SLOT_ACQUIRE_TIMEOUT: StdDuration = StdDuration::from_millis(50);
const DEFAULT_HEARTBEAT_INTERVAL: StdDuration = StdDuration::from_secs(30);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RemoteMcpError {
    #[error("endpoint not allowed: {0}")]
    EndpointNotAllowed(String),

    #[error("server already registered: {0}")]
    Duplicate(String),

    #[error("remote server not found: {0}")]
    NotFound(String),

    #[error("credential not found for server: {0}")]
    CredentialNotFound(String),

    #[error("too many concurrent connections")]
    TooManyConnections,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Status & domain model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteServerStatus {
    Unregistered,
    Registered,
    AuthRequired,
    Authenticated,
    Disabled,
    Error,
}

impl RemoteServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteServerStatus::Unregistered => "unregistered",
            RemoteServerStatus::Registered => "registered",
            RemoteServerStatus::AuthRequired => "auth_required",
            RemoteServerStatus::Authenticated => "authenticated",
            RemoteServerStatus::Disabled => "disabled",
            RemoteServerStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "registered" => RemoteServerStatus::Registered,
            "auth_required" => RemoteServerStatus::AuthRequired,
            "authenticated" => RemoteServerStatus::Authenticated,
            "disabled" => RemoteServerStatus::Disabled,
            "error" => RemoteServerStatus::Error,
            _ => RemoteServerStatus::Unregistered,
        }
    }
}

/// Typed view over the persisted remote server row.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteServer {
    pub server_id: String,
    pub catalog_item_id: String,
    pub name: String,
    pub endpoint: String,
    pub status: RemoteServerStatus,
    pub credential_key: Option<String>,
    pub last_connected_at: Option<chrono::DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
}

impl RemoteServer {
    fn from_record(record: RemoteServerRecord) -> Self {
        Self {
            status: RemoteServerStatus::parse(&record.status),
            server_id: record.server_id,
            catalog_item_id: record.catalog_item_id,
            name: record.name,
            endpoint: record.endpoint,
            credential_key: record.credential_key,
            last_connected_at: record.last_connected_at,
            error_message: record.error_message,
            created_at: record.created_at,
        }
    }

    fn to_record(&self) -> RemoteServerRecord {
        RemoteServerRecord {
            server_id: self.server_id.clone(),
            catalog_item_id: self.catalog_item_id.clone(),
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            status: self.status.as_str().to_string(),
            credential_key: self.credential_key.clone(),
            last_connected_at: self.last_connected_at,
            error_message: self.error_message.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TestConnectionResult {
    pub reachable: bool,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// One live event-stream session against a remote server. The console only
/// forwards JSON-RPC envelopes through it.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Forward the `initialize` envelope; returns the advertised
    /// capabilities.
    async fn initialize(&self) -> Result<Value, RemoteMcpError>;

    /// Forward a `ping` envelope.
    async fn ping(&self) -> Result<(), RemoteMcpError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        endpoint: &str,
        bearer_token: Option<String>,
    ) -> Result<Arc<dyn RemoteTransport>, RemoteMcpError>;
}

/// reqwest-backed transport posting JSON-RPC envelopes to the endpoint.
pub struct HttpTransportFactory {
    client: reqwest::Client,
}

impl HttpTransportFactory {
    pub fn new(timeout: StdDuration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    bearer_token: Option<String>,
}

impl HttpTransport {
    async fn rpc(&self, method: &str, params: Value) -> Result<Value, RemoteMcpError> {
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json, text/event-stream")
            .json(&envelope);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RemoteMcpError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RemoteMcpError::Connect(format!(
                "endpoint returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| RemoteMcpError::Connect(format!("invalid JSON-RPC response: {e}")))?;
        if let Some(error) = body.get("error") {
            return Err(RemoteMcpError::Connect(error.to_string()));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn initialize(&self) -> Result<Value, RemoteMcpError> {
        self.rpc(
            "initialize",
            json!({"clientInfo": {"name": "mcp-console", "version": env!("CARGO_PKG_VERSION")}}),
        )
        .await
    }

    async fn ping(&self) -> Result<(), RemoteMcpError> {
        self.rpc("ping", json!({})).await.map(|_| ())
    }
}

#[async_trait]
impl TransportFactory for HttpTransportFactory {
    async fn open(
        &self,
        endpoint: &str,
        bearer_token: Option<String>,
    ) -> Result<Arc<dyn RemoteTransport>, RemoteMcpError> {
        Ok(Arc::new(HttpTransport {
            client: self.client.clone(),
            endpoint: endpoint.to_string(),
            bearer_token,
        }))
    }
}

// ---------------------------------------------------------------------------
// RemoteMcpService
// ---------------------------------------------------------------------------

struct ActiveConnection {
    heartbeat: JoinHandle<()>,
}

/// Registry and connection governor for remote MCP servers.
///
/// Long-lived sessions are capped by a semaphore whose permits travel into
/// the heartbeat task; dropping the task frees the slot.
pub struct RemoteMcpService {
    store: Arc<StateStore>,
    tokens: Arc<TokenVault>,
    factory: Arc<dyn TransportFactory>,
    slots: Arc<Semaphore>,
    active: Mutex<HashMap<String, ActiveConnection>>,
    heartbeat_interval: StdDuration,
}

impl RemoteMcpService {
    pub fn new(
        store: Arc<StateStore>,
        tokens: Arc<TokenVault>,
        factory: Arc<dyn TransportFactory>,
        max_connections: usize,
    ) -> Self {
        Self {
            store,
            tokens,
            factory,
            slots: Arc::new(Semaphore::new(max_connections)),
            active: Mutex::new(HashMap::new()),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: StdDuration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Register a remote server derived from a catalog item.
    pub async fn register_server(
        &self,
        catalog_item_id: &str,
        name: &str,
        endpoint: &str,
        correlation_id: Option<&str>,
    ) -> Result<RemoteServer, RemoteMcpError> {
        let endpoint = endpoint.trim();
        if catalog_item_id.is_empty() || name.is_empty() || endpoint.is_empty() {
            return Err(RemoteMcpError::Validation(
                "catalog_item_id, name, and endpoint are required".to_string(),
            ));
        }

        if !self.store.is_endpoint_allowed(endpoint) {
            self.audit(
                "endpoint_rejected",
                correlation_id.unwrap_or(catalog_item_id),
                json!({
                    "catalog_item_id": catalog_item_id,
                    "endpoint": endpoint,
                    "reason": "not_in_allowlist",
                }),
            );
            return Err(RemoteMcpError::EndpointNotAllowed(endpoint.to_string()));
        }

        let existing = self.store.list_remote_servers()?;
        if existing
            .iter()
            .any(|r| r.catalog_item_id == catalog_item_id || r.endpoint == endpoint)
        {
            return Err(RemoteMcpError::Duplicate(catalog_item_id.to_string()));
        }

        let mut server_id = format!("remote-{catalog_item_id}");
        if existing.iter().any(|r| r.server_id == server_id) {
            server_id = format!("{server_id}-{}", &Uuid::new_v4().simple().to_string()[..8]);
        }

        let server = RemoteServer {
            server_id: server_id.clone(),
            catalog_item_id: catalog_item_id.to_string(),
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            status: RemoteServerStatus::Registered,
            credential_key: None,
            last_connected_at: None,
            error_message: None,
            created_at: Utc::now(),
        };
        self.store.save_remote_server(&server.to_record())?;

        self.audit(
            "server_registered",
            correlation_id.unwrap_or(&server_id),
            json!({
                "server_id": server_id.clone(),
                "catalog_item_id": catalog_item_id,
                "endpoint": endpoint,
            }),
        );
        Ok(server)
    }

    pub async fn list_servers(&self) -> Result<Vec<RemoteServer>, RemoteMcpError> {
        Ok(self
            .store
            .list_remote_servers()?
            .into_iter()
            .map(RemoteServer::from_record)
            .collect())
    }

    pub async fn get_server(&self, server_id: &str) -> Result<Option<RemoteServer>, RemoteMcpError> {
        Ok(self
            .store
            .get_remote_server(server_id)?
            .map(RemoteServer::from_record))
    }

    async fn require_server(&self, server_id: &str) -> Result<RemoteServer, RemoteMcpError> {
        self.get_server(server_id)
            .await?
            .ok_or_else(|| RemoteMcpError::NotFound(server_id.to_string()))
    }

    pub async fn delete_server(
        &self,
        server_id: &str,
        delete_credentials: bool,
        correlation_id: Option<&str>,
    ) -> Result<(), RemoteMcpError> {
        let server = self.require_server(server_id).await?;

        self.disconnect(server_id);
        if delete_credentials {
            if let Some(credential_key) = &server.credential_key {
                self.store.delete_credential(credential_key)?;
                self.tokens.drop_key(credential_key);
            }
        }
        self.store.delete_remote_server(server_id)?;

        self.audit(
            "server_deleted",
            correlation_id.unwrap_or(server_id),
            json!({
                "server_id": server_id,
                "catalog_item_id": server.catalog_item_id,
                "delete_credentials": delete_credentials && server.credential_key.is_some(),
            }),
        );
        Ok(())
    }

    /// Bind a credential and/or move the server to a new status.
    pub async fn set_status(
        &self,
        server_id: &str,
        status: RemoteServerStatus,
        credential_key: Option<Option<String>>,
    ) -> Result<RemoteServer, RemoteMcpError> {
        let mut server = self.require_server(server_id).await?;
        let old_status = server.status;
        server.status = status;
        if let Some(credential_key) = credential_key {
            server.credential_key = credential_key;
        }
        self.store.save_remote_server(&server.to_record())?;

        self.audit(
            "server_status_changed",
            server_id,
            json!({
                "server_id": server_id,
                "old_status": old_status.as_str(),
                "new_status": status.as_str(),
            }),
        );
        Ok(server)
    }

    /// Promote a disabled/registered server. Lands on `authenticated` when a
    /// valid credential is bound, `auth_required` otherwise.
    pub async fn enable_server(&self, server_id: &str) -> Result<RemoteServer, RemoteMcpError> {
        let server = self.require_server(server_id).await?;
        let status = match self.server_credential(&server) {
            Ok(_) => RemoteServerStatus::Authenticated,
            Err(_) => RemoteServerStatus::AuthRequired,
        };
        self.set_status(server_id, status, None).await
    }

    pub async fn disable_server(&self, server_id: &str) -> Result<RemoteServer, RemoteMcpError> {
        self.disconnect(server_id);
        self.set_status(server_id, RemoteServerStatus::Disabled, None)
            .await
    }

    /// Drop the bound credential and require re-authorization.
    pub async fn revoke_credentials(
        &self,
        server_id: &str,
    ) -> Result<RemoteServer, RemoteMcpError> {
        let server = self.require_server(server_id).await?;
        if let Some(credential_key) = &server.credential_key {
            self.store.delete_credential(credential_key)?;
            self.tokens.drop_key(credential_key);
        }
        self.set_status(server_id, RemoteServerStatus::AuthRequired, Some(None))
            .await
    }

    fn server_credential(
        &self,
        server: &RemoteServer,
    ) -> Result<CredentialRecord, RemoteMcpError> {
        let credential_key = server
            .credential_key
            .as_deref()
            .ok_or_else(|| RemoteMcpError::CredentialNotFound(server.server_id.clone()))?;
        let record = self
            .store
            .get_credential(credential_key)
            .map_err(RemoteMcpError::Store)?
            .filter(|record| record.server_id == server.server_id)
            .ok_or_else(|| RemoteMcpError::CredentialNotFound(server.server_id.clone()))?;
        Ok(record)
    }

    fn bearer_for(&self, record: &CredentialRecord) -> Option<String> {
        self.tokens
            .get(&record.credential_key)
            .map(|set| set.access_token)
    }

    async fn acquire_slot(&self) -> Result<tokio::sync::OwnedSemaphorePermit, RemoteMcpError> {
        match tokio::time::timeout(SLOT_ACQUIRE_TIMEOUT, self.slots.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => Err(RemoteMcpError::TooManyConnections),
        }
    }

    /// Open a long-lived session: allowlist re-check, credential load, slot
    /// acquisition, transport initialize, then a heartbeat that keeps the
    /// slot for the life of the session.
    pub async fn connect(&self, server_id: &str) -> Result<Value, RemoteMcpError> {
        let mut server = self.require_server(server_id).await?;
        if !self.store.is_endpoint_allowed(&server.endpoint) {
            return Err(RemoteMcpError::EndpointNotAllowed(server.endpoint.clone()));
        }
        let credential = self.server_credential(&server)?;
        let bearer = self.bearer_for(&credential);

        let permit = self.acquire_slot().await?;

        // From here every failure path must release the slot; the permit is
        // dropped when this function returns early.
        let transport = self.factory.open(&server.endpoint, bearer).await?;
        let capabilities = transport.initialize().await?;

        server.last_connected_at = Some(Utc::now());
        server.status = RemoteServerStatus::Authenticated;
        server.error_message = None;
        self.store.save_remote_server(&server.to_record())?;

        let interval = self.heartbeat_interval;
        let heartbeat_server = server_id.to_string();
        let heartbeat = tokio::spawn(async move {
            // The permit rides along; ending the task frees the slot.
            let _permit = permit;
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = transport.ping().await {
                    log::warn!("Heartbeat failed for {}: {}", heartbeat_server, e);
                    break;
                }
            }
        });

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = active.insert(server_id.to_string(), ActiveConnection { heartbeat })
        {
            previous.heartbeat.abort();
        }

        Ok(capabilities)
    }

    /// Probe reachability and auth without leaving a session behind.
    pub async fn test_connection(
        &self,
        server_id: &str,
    ) -> Result<TestConnectionResult, RemoteMcpError> {
        let server = self.require_server(server_id).await?;
        if !self.store.is_endpoint_allowed(&server.endpoint) {
            return Err(RemoteMcpError::EndpointNotAllowed(server.endpoint.clone()));
        }
        let credential = self.server_credential(&server)?;
        let bearer = self.bearer_for(&credential);

        let _permit = self.acquire_slot().await?;

        let transport = match self.factory.open(&server.endpoint, bearer).await {
            Ok(t) => t,
            Err(e) => {
                return Ok(TestConnectionResult {
                    reachable: false,
                    authenticated: false,
                    capabilities: None,
                    error: Some(e.to_string()),
                })
            }
        };
        match transport.initialize().await {
            Ok(capabilities) => Ok(TestConnectionResult {
                reachable: true,
                authenticated: true,
                capabilities: Some(capabilities),
                error: None,
            }),
            Err(e) => Ok(TestConnectionResult {
                reachable: false,
                authenticated: false,
                capabilities: None,
                error: Some(e.to_string()),
            }),
        }
    }

    /// Tear down the long-lived session for a server, if any.
    pub fn disconnect(&self, server_id: &str) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(connection) = active.remove(server_id) {
            connection.heartbeat.abort();
        }
    }

    /// Abort every heartbeat task. Used at process shutdown.
    pub fn shutdown(&self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        for (_, connection) in active.drain() {
            connection.heartbeat.abort();
        }
    }

    fn audit(&self, action: &str, target: &str, metadata: Value) {
        if let Err(e) =
            self.store
                .record_audit_log("remote_mcp", action, "system", target, &metadata)
        {
            log::warn!("Failed to record audit log for {}: {}", action, e);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
