use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid JSON column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid timestamp column: {0}")]
    Timestamp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A login session minted after a successful vault unlock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSessionRecord {
    pub session_id: String,
    pub user_email: String,
    /// Opaque vault unlock handle. Never logged, never rendered to clients
    /// outside of login responses.
    pub vault_unlock_handle: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Configuration snapshot persisted when a container is started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfigRecord {
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub config: Value,
    pub created_at: DateTime<Utc>,
}

/// One interactive exec session backed by a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSessionRecord {
    pub session_id: String,
    pub server_id: String,
    pub config: Value,
    pub state: String,
    pub idle_deadline: DateTime<Utc>,
    pub gateway_endpoint: String,
    pub metrics_endpoint: String,
    pub mtls_cert_ref: Option<Value>,
    pub feature_flags: Value,
    pub created_at: DateTime<Utc>,
}

/// A queued or finished command execution inside an exec session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub session_id: String,
    pub status: String,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub timeout: bool,
    pub truncated: bool,
    pub output_ref: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Persisted OAuth credential. Token plaintext never lands here; `token_ref`
/// carries an opaque (encrypted) reference only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub credential_key: String,
    pub token_ref: Value,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub server_id: String,
    pub oauth_token_url: Option<String>,
    pub oauth_client_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Single-use OAuth authorization state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthStateRecord {
    pub state: String,
    pub server_id: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub scopes: Vec<String>,
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Registered remote MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteServerRecord {
    pub server_id: String,
    pub catalog_item_id: String,
    pub name: String,
    pub endpoint: String,
    pub status: String,
    pub credential_key: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Gateway allowlist entry. When IDs collide during merging, the higher
/// `version` wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayAllowEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub value: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub enabled: bool,
    pub version: i64,
}

/// Singleton GitHub token row (id = 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubTokenRecord {
    pub token_ref: Value,
    pub source: String,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

/// Per-server image signature policy payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignaturePolicyRecord {
    pub server_id: String,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

/// One audit log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub category: String,
    pub action: String,
    pub actor: String,
    pub target: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Per-entity deletion counts returned by [`StateStore::gc_expired`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcCounts {
    pub credentials: usize,
    pub sessions: usize,
    pub jobs: usize,
    pub auth_sessions: usize,
    pub oauth_states: usize,
}

/// Retention windows applied by GC.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub credential_days: i64,
    pub job_hours: i64,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            credential_days: 30,
            job_hours: 24,
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

// Fixed-width RFC 3339 so string comparison in SQL orders chronologically.
fn to_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_iso(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Timestamp(format!("{value}: {e}")))
}

fn opt_iso(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(to_iso)
}

fn opt_from_iso(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(|v| from_iso(&v)).transpose()
}

fn opt_json(value: &Option<Value>) -> Result<Option<String>, StoreError> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(StoreError::from))
        .transpose()
}

fn opt_from_json(value: Option<String>) -> Result<Option<Value>, StoreError> {
    value
        .map(|v| serde_json::from_str(&v).map_err(StoreError::from))
        .transpose()
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Embedded relational store backing every persisted entity.
///
/// Writes are serialized by opening a fresh connection per operation with
/// foreign keys enforced; readers open independent connections and never
/// block behind a process-level lock.
pub struct StateStore {
    db_path: String,
    retention: Retention,
}

impl StateStore {
    pub fn new(db_path: &str, retention: Retention) -> Self {
        Self {
            db_path: db_path.to_string(),
            retention,
        }
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = Path::new(&self.db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Create all tables and run lightweight column migrations. Safe to call
    /// repeatedly.
    pub fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS credentials (
                credential_key TEXT PRIMARY KEY,
                token_ref TEXT NOT NULL,
                scopes TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                server_id TEXT NOT NULL,
                oauth_token_url TEXT,
                oauth_client_id TEXT,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS remote_servers (
                server_id TEXT PRIMARY KEY,
                catalog_item_id TEXT NOT NULL,
                name TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                status TEXT NOT NULL,
                credential_key TEXT REFERENCES credentials(credential_key) ON DELETE SET NULL,
                last_connected_at TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_remote_servers_catalog_item_id
                ON remote_servers(catalog_item_id);
            CREATE TABLE IF NOT EXISTS oauth_states (
                state TEXT PRIMARY KEY,
                server_id TEXT NOT NULL,
                code_challenge TEXT,
                code_challenge_method TEXT,
                scopes TEXT NOT NULL,
                authorize_url TEXT NOT NULL,
                token_url TEXT NOT NULL,
                client_id TEXT NOT NULL,
                redirect_uri TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_oauth_states_expires_at
                ON oauth_states(expires_at);
            CREATE TABLE IF NOT EXISTS exec_sessions (
                session_id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL,
                config TEXT NOT NULL,
                state TEXT NOT NULL,
                idle_deadline TEXT NOT NULL,
                gateway_endpoint TEXT NOT NULL,
                metrics_endpoint TEXT NOT NULL,
                mtls_cert_ref TEXT,
                feature_flags TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                status TEXT NOT NULL,
                queued_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                exit_code INTEGER,
                timeout INTEGER NOT NULL,
                truncated INTEGER NOT NULL,
                output_ref TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS signature_policies (
                server_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS gateway_allowlist (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                value TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                version INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS audit_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                category TEXT NOT NULL,
                action TEXT NOT NULL,
                actor TEXT NOT NULL,
                target TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS github_tokens (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                token_ref TEXT NOT NULL,
                source TEXT NOT NULL,
                updated_by TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS auth_sessions (
                session_id TEXT PRIMARY KEY,
                user_email TEXT NOT NULL,
                vault_unlock_handle TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                last_activity TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS container_configs (
                container_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                image TEXT NOT NULL,
                config TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            ",
        )?;
        self.migrate_columns(&conn)?;
        Ok(())
    }

    fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let cols = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cols)
    }

    fn migrate_columns(&self, conn: &Connection) -> Result<(), StoreError> {
        let credential_columns = Self::table_columns(conn, "credentials")?;
        if !credential_columns.iter().any(|c| c == "oauth_token_url") {
            conn.execute_batch("ALTER TABLE credentials ADD COLUMN oauth_token_url TEXT;")?;
            log::info!("State store: added credentials.oauth_token_url");
        }
        if !credential_columns.iter().any(|c| c == "oauth_client_id") {
            conn.execute_batch("ALTER TABLE credentials ADD COLUMN oauth_client_id TEXT;")?;
            log::info!("State store: added credentials.oauth_client_id");
        }
        self.migrate_audit_logs(conn)
    }

    /// Rebuild `audit_logs` when a historical schema is detected, carrying
    /// rows over through mapped column fallbacks.
    fn migrate_audit_logs(&self, conn: &Connection) -> Result<(), StoreError> {
        let desired = [
            "id",
            "category",
            "action",
            "actor",
            "target",
            "metadata",
            "created_at",
        ];
        let allowed = [
            "id",
            "category",
            "action",
            "event_type",
            "actor",
            "target",
            "correlation_id",
            "metadata",
            "created_at",
        ];

        let existing = Self::table_columns(conn, "audit_logs")?;
        if existing.is_empty() {
            return Ok(());
        }
        let unexpected: Vec<&String> = existing
            .iter()
            .filter(|c| !allowed.contains(&c.as_str()))
            .collect();
        if !unexpected.is_empty() {
            log::debug!("Ignoring unexpected audit_logs columns: {:?}", unexpected);
        }

        let mut existing_sorted: Vec<&str> = existing
            .iter()
            .map(|c| c.as_str())
            .filter(|c| allowed.contains(c))
            .collect();
        existing_sorted.sort_unstable();
        let mut desired_sorted = desired.to_vec();
        desired_sorted.sort_unstable();
        if existing.len() == desired.len() && existing_sorted == desired_sorted {
            return Ok(());
        }

        let pick = |preferred: &[&str], fallback: &str| -> String {
            for candidate in preferred {
                if existing.iter().any(|c| c == candidate) {
                    return candidate.to_string();
                }
            }
            fallback.to_string()
        };

        let select_id = pick(&["id"], "NULL");
        let select_category = pick(&["category"], "'legacy'");
        let select_action = pick(&["action", "event_type"], "'unknown'");
        let select_actor = pick(&["actor"], "'system'");
        let select_target = pick(&["target", "correlation_id"], "'unknown'");
        let select_metadata = pick(&["metadata"], "'{}'");
        let select_created_at = pick(&["created_at"], "'1970-01-01T00:00:00.000000Z'");

        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS audit_logs_migrated (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                category TEXT NOT NULL,
                action TEXT NOT NULL,
                actor TEXT NOT NULL,
                target TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            INSERT INTO audit_logs_migrated (id, category, action, actor, target, metadata, created_at)
            SELECT {select_id}, {select_category}, {select_action}, {select_actor},
                   {select_target}, {select_metadata}, {select_created_at}
            FROM audit_logs;
            DROP TABLE audit_logs;
            ALTER TABLE audit_logs_migrated RENAME TO audit_logs;
            ",
        ))?;
        log::info!("State store: rebuilt audit_logs with current schema");
        Ok(())
    }

    /// Table names present in the database (test helper).
    pub fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table'")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    // ── Credentials ──────────────────────────────────────────────

    pub fn save_credential(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO credentials (
                credential_key, token_ref, scopes, expires_at,
                server_id, oauth_token_url, oauth_client_id, created_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.credential_key,
                serde_json::to_string(&record.token_ref)?,
                serde_json::to_string(&record.scopes)?,
                to_iso(record.expires_at),
                record.server_id,
                record.oauth_token_url,
                record.oauth_client_id,
                record.created_by,
                to_iso(record.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_credential(
        &self,
        credential_key: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT credential_key, token_ref, scopes, expires_at, server_id,
                        oauth_token_url, oauth_client_id, created_by, created_at
                 FROM credentials WHERE credential_key=?1",
                params![credential_key],
                Self::credential_from_row,
            )
            .optional()?;
        row.transpose()
    }

    pub fn list_credentials(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT credential_key, token_ref, scopes, expires_at, server_id,
                    oauth_token_url, oauth_client_id, created_by, created_at
             FROM credentials",
        )?;
        let rows = stmt
            .query_map([], Self::credential_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    pub fn delete_credential(&self, credential_key: &str) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM credentials WHERE credential_key=?1",
            params![credential_key],
        )?;
        Ok(())
    }

    fn credential_from_row(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<Result<CredentialRecord, StoreError>> {
        let token_ref: String = row.get(1)?;
        let scopes: String = row.get(2)?;
        let expires_at: String = row.get(3)?;
        let created_at: String = row.get(8)?;
        Ok((|| {
            Ok(CredentialRecord {
                credential_key: row.get(0)?,
                token_ref: serde_json::from_str(&token_ref)?,
                scopes: serde_json::from_str(&scopes)?,
                expires_at: from_iso(&expires_at)?,
                server_id: row.get(4)?,
                oauth_token_url: row.get(5)?,
                oauth_client_id: row.get(6)?,
                created_by: row.get(7)?,
                created_at: from_iso(&created_at)?,
            })
        })())
    }

    // ── Remote servers ───────────────────────────────────────────

    pub fn save_remote_server(&self, record: &RemoteServerRecord) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO remote_servers (
                server_id, catalog_item_id, name, endpoint, status,
                credential_key, last_connected_at, error_message, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.server_id,
                record.catalog_item_id,
                record.name,
                record.endpoint,
                record.status,
                record.credential_key,
                opt_iso(record.last_connected_at),
                record.error_message,
                to_iso(record.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_remote_server(
        &self,
        server_id: &str,
    ) -> Result<Option<RemoteServerRecord>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT server_id, catalog_item_id, name, endpoint, status,
                        credential_key, last_connected_at, error_message, created_at
                 FROM remote_servers WHERE server_id=?1",
                params![server_id],
                Self::remote_server_from_row,
            )
            .optional()?;
        row.transpose()
    }

    pub fn list_remote_servers(&self) -> Result<Vec<RemoteServerRecord>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT server_id, catalog_item_id, name, endpoint, status,
                    credential_key, last_connected_at, error_message, created_at
             FROM remote_servers",
        )?;
        let rows = stmt
            .query_map([], Self::remote_server_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    pub fn delete_remote_server(&self, server_id: &str) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM remote_servers WHERE server_id=?1",
            params![server_id],
        )?;
        Ok(())
    }

    fn remote_server_from_row(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<Result<RemoteServerRecord, StoreError>> {
        let last_connected_at: Option<String> = row.get(6)?;
        let created_at: String = row.get(8)?;
        let record = RemoteServerRecord {
            server_id: row.get(0)?,
            catalog_item_id: row.get(1)?,
            name: row.get(2)?,
            endpoint: row.get(3)?,
            status: row.get(4)?,
            credential_key: row.get(5)?,
            last_connected_at: None,
            error_message: row.get(7)?,
            created_at: Utc::now(),
        };
        Ok((|| {
            Ok(RemoteServerRecord {
                last_connected_at: opt_from_iso(last_connected_at)?,
                created_at: from_iso(&created_at)?,
                ..record
            })
        })())
    }

    // ── OAuth states ─────────────────────────────────────────────

    pub fn save_oauth_state(&self, record: &OAuthStateRecord) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO oauth_states (
                state, server_id, code_challenge, code_challenge_method, scopes,
                authorize_url, token_url, client_id, redirect_uri, expires_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.state,
                record.server_id,
                record.code_challenge,
                record.code_challenge_method,
                serde_json::to_string(&record.scopes)?,
                record.authorize_url,
                record.token_url,
                record.client_id,
                record.redirect_uri,
                to_iso(record.expires_at),
                to_iso(record.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_oauth_state(&self, state: &str) -> Result<Option<OAuthStateRecord>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT state, server_id, code_challenge, code_challenge_method, scopes,
                        authorize_url, token_url, client_id, redirect_uri, expires_at, created_at
                 FROM oauth_states WHERE state=?1",
                params![state],
                |row| {
                    let scopes: String = row.get(4)?;
                    let expires_at: String = row.get(9)?;
                    let created_at: String = row.get(10)?;
                    let partial = OAuthStateRecord {
                        state: row.get(0)?,
                        server_id: row.get(1)?,
                        code_challenge: row.get(2)?,
                        code_challenge_method: row.get(3)?,
                        scopes: Vec::new(),
                        authorize_url: row.get(5)?,
                        token_url: row.get(6)?,
                        client_id: row.get(7)?,
                        redirect_uri: row.get(8)?,
                        expires_at: Utc::now(),
                        created_at: Utc::now(),
                    };
                    Ok((partial, scopes, expires_at, created_at))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((partial, scopes, expires_at, created_at)) => Ok(Some(OAuthStateRecord {
                scopes: serde_json::from_str(&scopes)?,
                expires_at: from_iso(&expires_at)?,
                created_at: from_iso(&created_at)?,
                ..partial
            })),
        }
    }

    pub fn delete_oauth_state(&self, state: &str) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM oauth_states WHERE state=?1", params![state])?;
        Ok(())
    }

    // ── Container configs ────────────────────────────────────────

    pub fn save_container_config(&self, record: &ContainerConfigRecord) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO container_configs (
                container_id, name, image, config, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.container_id,
                record.name,
                record.image,
                serde_json::to_string(&record.config)?,
                to_iso(record.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_container_config(
        &self,
        container_id: &str,
    ) -> Result<Option<ContainerConfigRecord>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT container_id, name, image, config, created_at
                 FROM container_configs WHERE container_id=?1",
                params![container_id],
                |row| {
                    let config: String = row.get(3)?;
                    let created_at: String = row.get(4)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        config,
                        created_at,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((container_id, name, image, config, created_at)) => {
                Ok(Some(ContainerConfigRecord {
                    container_id,
                    name,
                    image,
                    config: serde_json::from_str(&config)?,
                    created_at: from_iso(&created_at)?,
                }))
            }
        }
    }

    pub fn delete_container_config(&self, container_id: &str) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM container_configs WHERE container_id=?1",
            params![container_id],
        )?;
        Ok(())
    }

    // ── GitHub token (singleton) ─────────────────────────────────

    pub fn save_github_token(&self, record: &GitHubTokenRecord) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO github_tokens (id, token_ref, source, updated_by, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 token_ref=excluded.token_ref,
                 source=excluded.source,
                 updated_by=excluded.updated_by,
                 updated_at=excluded.updated_at",
            params![
                serde_json::to_string(&record.token_ref)?,
                record.source,
                record.updated_by,
                to_iso(record.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_github_token(&self) -> Result<Option<GitHubTokenRecord>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT token_ref, source, updated_by, updated_at FROM github_tokens WHERE id=1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((token_ref, source, updated_by, updated_at)) => Ok(Some(GitHubTokenRecord {
                token_ref: serde_json::from_str(&token_ref)?,
                source,
                updated_by,
                updated_at: from_iso(&updated_at)?,
            })),
        }
    }

    pub fn delete_github_token(&self) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM github_tokens WHERE id=1", [])?;
        Ok(())
    }

    // ── Auth sessions ────────────────────────────────────────────

    pub fn save_auth_session(&self, record: &AuthSessionRecord) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO auth_sessions (
                session_id, user_email, vault_unlock_handle,
                created_at, expires_at, last_activity
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.session_id,
                record.user_email,
                record.vault_unlock_handle,
                to_iso(record.created_at),
                to_iso(record.expires_at),
                to_iso(record.last_activity),
            ],
        )?;
        Ok(())
    }

    pub fn get_auth_session(
        &self,
        session_id: &str,
    ) -> Result<Option<AuthSessionRecord>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT session_id, user_email, vault_unlock_handle,
                        created_at, expires_at, last_activity
                 FROM auth_sessions WHERE session_id=?1",
                params![session_id],
                Self::auth_session_from_row,
            )
            .optional()?;
        row.transpose()
    }

    pub fn list_auth_sessions(&self) -> Result<Vec<AuthSessionRecord>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, user_email, vault_unlock_handle,
                    created_at, expires_at, last_activity
             FROM auth_sessions",
        )?;
        let rows = stmt
            .query_map([], Self::auth_session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    pub fn delete_auth_session(&self, session_id: &str) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM auth_sessions WHERE session_id=?1",
            params![session_id],
        )?;
        Ok(())
    }

    fn auth_session_from_row(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<Result<AuthSessionRecord, StoreError>> {
        let created_at: String = row.get(3)?;
        let expires_at: String = row.get(4)?;
        let last_activity: String = row.get(5)?;
        let partial = AuthSessionRecord {
            session_id: row.get(0)?,
            user_email: row.get(1)?,
            vault_unlock_handle: row.get(2)?,
            created_at: Utc::now(),
            expires_at: Utc::now(),
            last_activity: Utc::now(),
        };
        Ok((|| {
            Ok(AuthSessionRecord {
                created_at: from_iso(&created_at)?,
                expires_at: from_iso(&expires_at)?,
                last_activity: from_iso(&last_activity)?,
                ..partial
            })
        })())
    }

    // ── Exec sessions ────────────────────────────────────────────

    pub fn save_exec_session(&self, record: &ExecSessionRecord) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO exec_sessions (
                session_id, server_id, config, state, idle_deadline,
                gateway_endpoint, metrics_endpoint, mtls_cert_ref,
                feature_flags, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.session_id,
                record.server_id,
                serde_json::to_string(&record.config)?,
                record.state,
                to_iso(record.idle_deadline),
                record.gateway_endpoint,
                record.metrics_endpoint,
                opt_json(&record.mtls_cert_ref)?,
                serde_json::to_string(&record.feature_flags)?,
                to_iso(record.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_exec_session(
        &self,
        session_id: &str,
    ) -> Result<Option<ExecSessionRecord>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT session_id, server_id, config, state, idle_deadline,
                        gateway_endpoint, metrics_endpoint, mtls_cert_ref,
                        feature_flags, created_at
                 FROM exec_sessions WHERE session_id=?1",
                params![session_id],
                |row| {
                    let config: String = row.get(2)?;
                    let idle_deadline: String = row.get(4)?;
                    let mtls_cert_ref: Option<String> = row.get(7)?;
                    let feature_flags: String = row.get(8)?;
                    let created_at: String = row.get(9)?;
                    let partial = ExecSessionRecord {
                        session_id: row.get(0)?,
                        server_id: row.get(1)?,
                        config: Value::Null,
                        state: row.get(3)?,
                        idle_deadline: Utc::now(),
                        gateway_endpoint: row.get(5)?,
                        metrics_endpoint: row.get(6)?,
                        mtls_cert_ref: None,
                        feature_flags: Value::Null,
                        created_at: Utc::now(),
                    };
                    Ok((
                        partial,
                        config,
                        idle_deadline,
                        mtls_cert_ref,
                        feature_flags,
                        created_at,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((partial, config, idle_deadline, mtls_cert_ref, feature_flags, created_at)) => {
                Ok(Some(ExecSessionRecord {
                    config: serde_json::from_str(&config)?,
                    idle_deadline: from_iso(&idle_deadline)?,
                    mtls_cert_ref: opt_from_json(mtls_cert_ref)?,
                    feature_flags: serde_json::from_str(&feature_flags)?,
                    created_at: from_iso(&created_at)?,
                    ..partial
                }))
            }
        }
    }

    pub fn delete_exec_session(&self, session_id: &str) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM exec_sessions WHERE session_id=?1",
            params![session_id],
        )?;
        Ok(())
    }

    // ── Jobs ─────────────────────────────────────────────────────

    pub fn save_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO jobs (
                job_id, session_id, status, queued_at, started_at,
                finished_at, exit_code, timeout, truncated, output_ref, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.job_id,
                record.session_id,
                record.status,
                to_iso(record.queued_at),
                opt_iso(record.started_at),
                opt_iso(record.finished_at),
                record.exit_code,
                record.timeout as i64,
                record.truncated as i64,
                opt_json(&record.output_ref)?,
                to_iso(record.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT job_id, session_id, status, queued_at, started_at,
                        finished_at, exit_code, timeout, truncated, output_ref, created_at
                 FROM jobs WHERE job_id=?1",
                params![job_id],
                |row| {
                    let queued_at: String = row.get(3)?;
                    let started_at: Option<String> = row.get(4)?;
                    let finished_at: Option<String> = row.get(5)?;
                    let output_ref: Option<String> = row.get(9)?;
                    let created_at: String = row.get(10)?;
                    let partial = JobRecord {
                        job_id: row.get(0)?,
                        session_id: row.get(1)?,
                        status: row.get(2)?,
                        queued_at: Utc::now(),
                        started_at: None,
                        finished_at: None,
                        exit_code: row.get(6)?,
                        timeout: row.get::<_, i64>(7)? != 0,
                        truncated: row.get::<_, i64>(8)? != 0,
                        output_ref: None,
                        created_at: Utc::now(),
                    };
                    Ok((
                        partial, queued_at, started_at, finished_at, output_ref, created_at,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((partial, queued_at, started_at, finished_at, output_ref, created_at)) => {
                Ok(Some(JobRecord {
                    queued_at: from_iso(&queued_at)?,
                    started_at: opt_from_iso(started_at)?,
                    finished_at: opt_from_iso(finished_at)?,
                    output_ref: opt_from_json(output_ref)?,
                    created_at: from_iso(&created_at)?,
                    ..partial
                }))
            }
        }
    }

    // ── Signature policies ───────────────────────────────────────

    pub fn save_signature_policy(&self, record: &SignaturePolicyRecord) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO signature_policies (server_id, payload, updated_at)
             VALUES (?1, ?2, ?3)",
            params![
                record.server_id,
                serde_json::to_string(&record.payload)?,
                to_iso(record.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_signature_policy(
        &self,
        server_id: &str,
    ) -> Result<Option<SignaturePolicyRecord>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT server_id, payload, updated_at FROM signature_policies WHERE server_id=?1",
                params![server_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((server_id, payload, updated_at)) => Ok(Some(SignaturePolicyRecord {
                server_id,
                payload: serde_json::from_str(&payload)?,
                updated_at: from_iso(&updated_at)?,
            })),
        }
    }

    // ── Gateway allowlist ────────────────────────────────────────

    pub fn save_gateway_allow_entry(&self, record: &GatewayAllowEntry) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO gateway_allowlist (
                id, type, value, created_by, created_at, enabled, version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.entry_type,
                record.value,
                record.created_by,
                to_iso(record.created_at),
                record.enabled as i64,
                record.version,
            ],
        )?;
        Ok(())
    }

    pub fn list_gateway_allow_entries(&self) -> Result<Vec<GatewayAllowEntry>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, value, created_by, created_at, enabled, version
             FROM gateway_allowlist",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let created_at: String = row.get(4)?;
                let partial = GatewayAllowEntry {
                    id: row.get(0)?,
                    entry_type: row.get(1)?,
                    value: row.get(2)?,
                    created_by: row.get(3)?,
                    created_at: Utc::now(),
                    enabled: row.get::<_, i64>(5)? != 0,
                    version: row.get(6)?,
                };
                Ok((partial, created_at))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(partial, created_at)| {
                Ok(GatewayAllowEntry {
                    created_at: from_iso(&created_at)?,
                    ..partial
                })
            })
            .collect()
    }

    // ── Audit log ────────────────────────────────────────────────

    /// Record an audit entry. Metadata keys whose lowercase name contains
    /// `token`, `secret`, or `credential` are redacted before write,
    /// regardless of caller.
    pub fn record_audit_log(
        &self,
        category: &str,
        action: &str,
        actor: &str,
        target: &str,
        metadata: &Value,
    ) -> Result<(), StoreError> {
        let sanitized = sanitize_metadata(metadata);
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO audit_logs (category, action, actor, target, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                category,
                action,
                actor,
                target,
                serde_json::to_string(&sanitized)?,
                to_iso(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn get_recent_audit_logs(&self, limit: usize) -> Result<Vec<AuditLogEntry>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, category, action, actor, target, metadata, created_at
             FROM audit_logs ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let metadata: String = row.get(5)?;
                let created_at: String = row.get(6)?;
                let partial = AuditLogEntry {
                    id: row.get(0)?,
                    category: row.get(1)?,
                    action: row.get(2)?,
                    actor: row.get(3)?,
                    target: row.get(4)?,
                    metadata: Value::Null,
                    created_at: Utc::now(),
                };
                Ok((partial, metadata, created_at))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(partial, metadata, created_at)| {
                Ok(AuditLogEntry {
                    metadata: serde_json::from_str(&metadata)?,
                    created_at: from_iso(&created_at)?,
                    ..partial
                })
            })
            .collect()
    }

    // ── Endpoint allowlist ───────────────────────────────────────

    /// Validate an endpoint URL against `REMOTE_MCP_ALLOWED_DOMAINS`.
    ///
    /// An empty allowlist denies everything; IPv6 literals are always
    /// denied.
    pub fn is_endpoint_allowed(&self, url: &str) -> bool {
        let raw = std::env::var("REMOTE_MCP_ALLOWED_DOMAINS").unwrap_or_default();
        endpoint_allowed_with(url, &raw)
    }

    // ── GC ───────────────────────────────────────────────────────

    /// Remove expired credentials, exec sessions, jobs, auth sessions, and
    /// OAuth states in one transaction. Returns per-entity counts.
    pub fn gc_expired(&self, now: DateTime<Utc>) -> Result<GcCounts, StoreError> {
        let credential_cutoff = now - Duration::days(self.retention.credential_days);
        let job_cutoff = now - Duration::hours(self.retention.job_hours);

        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        let credentials = tx.execute(
            "DELETE FROM credentials WHERE expires_at < ?1",
            params![to_iso(credential_cutoff)],
        )?;
        let sessions = tx.execute(
            "DELETE FROM exec_sessions WHERE idle_deadline < ?1",
            params![to_iso(now)],
        )?;
        let jobs = tx.execute(
            "DELETE FROM jobs WHERE COALESCE(finished_at, queued_at) < ?1",
            params![to_iso(job_cutoff)],
        )?;
        let auth_sessions = tx.execute(
            "DELETE FROM auth_sessions WHERE expires_at < ?1",
            params![to_iso(now)],
        )?;
        let oauth_states = tx.execute(
            "DELETE FROM oauth_states WHERE expires_at < ?1",
            params![to_iso(now)],
        )?;

        tx.commit()?;

        Ok(GcCounts {
            credentials,
            sessions,
            jobs,
            auth_sessions,
            oauth_states,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const REDACTION_SENTINEL: &str = "***redacted***";

fn sanitize_metadata(metadata: &Value) -> Value {
    match metadata.as_object() {
        Some(map) => {
            let mut sanitized = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                let lowered = key.to_lowercase();
                if ["token", "credential", "secret"]
                    .iter()
                    .any(|needle| lowered.contains(needle))
                {
                    sanitized.insert(key.clone(), Value::String(REDACTION_SENTINEL.into()));
                } else {
                    sanitized.insert(key.clone(), value.clone());
                }
            }
            Value::Object(sanitized)
        }
        None => metadata.clone(),
    }
}

/// Allowlist check with an explicit rule string, exposed for tests.
///
/// Entries are comma-separated `host[:port]` or `*.suffix[:port]`. Wildcard
/// entries match strict subdomains only, never the bare suffix.
pub fn endpoint_allowed_with(url: &str, raw_allowlist: &str) -> bool {
    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => return false,
    };

    let scheme = parsed.scheme().to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return false;
    }

    let host = match parsed.host_str() {
        Some(h) if !h.is_empty() => h.to_ascii_lowercase(),
        _ => return false,
    };
    // IPv6 literals are not allowlistable.
    if host.contains(':') || host.starts_with('[') {
        return false;
    }

    let default_port: u16 = if scheme == "https" { 443 } else { 80 };
    let port = parsed.port().unwrap_or(default_port);

    let entries: Vec<String> = raw_allowlist
        .split(',')
        .map(|e| e.trim().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect();
    if entries.is_empty() {
        return false;
    }

    for entry in entries {
        let (entry_host, entry_port) = match entry.rsplit_once(':') {
            Some((h, p)) => match p.parse::<u16>() {
                Ok(port) => (h.to_string(), port),
                Err(_) => continue,
            },
            None => (entry, default_port),
        };

        if let Some(suffix) = entry_host.strip_prefix("*.") {
            if host.ends_with(&format!(".{suffix}")) && entry_port == port {
                return true;
            }
        } else if host == entry_host && entry_port == port {
            return true;
        }
    }

    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn temp_store() -> (StateStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        let store = StateStore::new(path.to_str().unwrap(), Retention::default());
        store.init_schema().unwrap();
        (store, dir)
    }

    fn sample_credential(key: &str, expires_at: DateTime<Utc>) -> CredentialRecord {
        CredentialRecord {
            credential_key: key.into(),
            token_ref: json!({"kind": "encrypted", "key": key}),
            scopes: vec!["repo:read".into()],
            expires_at,
            server_id: "remote-cat-1".into(),
            oauth_token_url: None,
            oauth_client_id: None,
            created_by: "system".into(),
            created_at: Utc::now(),
        }
    }

    // =====================================================================
    // Schema
    // =====================================================================

    #[test]
    fn init_schema_creates_all_tables() {
        let (store, _dir) = temp_store();
        let tables = store.list_tables().unwrap();
        for expected in [
            "credentials",
            "remote_servers",
            "oauth_states",
            "exec_sessions",
            "jobs",
            "signature_policies",
            "gateway_allowlist",
            "audit_logs",
            "github_tokens",
            "auth_sessions",
            "container_configs",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[test]
    fn init_schema_is_idempotent() {
        let (store, _dir) = temp_store();
        store.init_schema().unwrap();
        store.init_schema().unwrap();
    }

    #[test]
    fn credential_migration_adds_missing_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE credentials (
                    credential_key TEXT PRIMARY KEY,
                    token_ref TEXT NOT NULL,
                    scopes TEXT NOT NULL,
                    expires_at TEXT NOT NULL,
                    server_id TEXT NOT NULL,
                    created_by TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );",
            )
            .unwrap();
        }
        let store = StateStore::new(path.to_str().unwrap(), Retention::default());
        store.init_schema().unwrap();

        let record = sample_credential("cred-1", Utc::now() + Duration::hours(1));
        store.save_credential(&record).unwrap();
        let loaded = store.get_credential("cred-1").unwrap().unwrap();
        assert_eq!(loaded.oauth_token_url, None);
    }

    #[test]
    fn audit_migration_rebuilds_legacy_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE audit_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_type TEXT NOT NULL,
                    correlation_id TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                INSERT INTO audit_logs (event_type, correlation_id, metadata, created_at)
                VALUES ('token_saved', 'corr-1', '{}', '2024-01-01T00:00:00.000000Z');",
            )
            .unwrap();
        }
        let store = StateStore::new(path.to_str().unwrap(), Retention::default());
        store.init_schema().unwrap();

        let entries = store.get_recent_audit_logs(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "token_saved");
        assert_eq!(entries[0].target, "corr-1");
        assert_eq!(entries[0].category, "legacy");
        assert_eq!(entries[0].actor, "system");
    }

    // =====================================================================
    // Round-trips
    // =====================================================================

    #[test]
    fn credential_roundtrip() {
        let (store, _dir) = temp_store();
        let record = sample_credential("cred-rt", from_iso(&to_iso(Utc::now() + Duration::hours(1))).unwrap());
        store.save_credential(&record).unwrap();

        let loaded = store.get_credential("cred-rt").unwrap().unwrap();
        assert_eq!(loaded.credential_key, record.credential_key);
        assert_eq!(loaded.token_ref, record.token_ref);
        assert_eq!(loaded.scopes, record.scopes);
        assert_eq!(loaded.server_id, record.server_id);
        assert_eq!(loaded.expires_at, record.expires_at);
    }

    #[test]
    fn remote_server_roundtrip() {
        let (store, _dir) = temp_store();
        let record = RemoteServerRecord {
            server_id: "remote-cat-1".into(),
            catalog_item_id: "cat-1".into(),
            name: "Example".into(),
            endpoint: "https://api.example.com/sse".into(),
            status: "registered".into(),
            credential_key: None,
            last_connected_at: None,
            error_message: None,
            created_at: Utc::now(),
        };
        store.save_remote_server(&record).unwrap();
        let loaded = store.get_remote_server("remote-cat-1").unwrap().unwrap();
        assert_eq!(loaded.endpoint, record.endpoint);
        assert_eq!(loaded.status, "registered");
        assert!(loaded.last_connected_at.is_none());
    }

    #[test]
    fn exec_session_roundtrip() {
        let (store, _dir) = temp_store();
        let record = ExecSessionRecord {
            session_id: "sess-1".into(),
            server_id: "srv-1".into(),
            config: json!({"runtime": {"max_run_seconds": 60}}),
            state: "running".into(),
            idle_deadline: Utc::now() + Duration::minutes(30),
            gateway_endpoint: "container://abc".into(),
            metrics_endpoint: "".into(),
            mtls_cert_ref: Some(json!({"kind": "file", "ca_path": "/tmp/ca.crt"})),
            feature_flags: json!({"cost_priority": false}),
            created_at: Utc::now(),
        };
        store.save_exec_session(&record).unwrap();
        let loaded = store.get_exec_session("sess-1").unwrap().unwrap();
        assert_eq!(loaded.gateway_endpoint, "container://abc");
        assert_eq!(loaded.config["runtime"]["max_run_seconds"], 60);
        assert_eq!(loaded.mtls_cert_ref.unwrap()["kind"], "file");
    }

    #[test]
    fn job_roundtrip() {
        let (store, _dir) = temp_store();
        let record = JobRecord {
            job_id: "job-1".into(),
            session_id: "sess-1".into(),
            status: "completed".into(),
            queued_at: Utc::now() - Duration::minutes(2),
            started_at: Some(Utc::now() - Duration::minutes(1)),
            finished_at: Some(Utc::now()),
            exit_code: Some(0),
            timeout: false,
            truncated: true,
            output_ref: Some(json!({"storage": "memory", "data": "ok"})),
            created_at: Utc::now(),
        };
        store.save_job(&record).unwrap();
        let loaded = store.get_job("job-1").unwrap().unwrap();
        assert_eq!(loaded.status, "completed");
        assert_eq!(loaded.exit_code, Some(0));
        assert!(loaded.truncated);
        assert!(!loaded.timeout);
        assert_eq!(loaded.output_ref.unwrap()["data"], "ok");
    }

    #[test]
    fn oauth_state_roundtrip_and_delete() {
        let (store, _dir) = temp_store();
        let record = OAuthStateRecord {
            state: "state-1".into(),
            server_id: "srv-1".into(),
            code_challenge: Some("challenge".into()),
            code_challenge_method: Some("S256".into()),
            scopes: vec!["repo:read".into(), "repo:write".into()],
            authorize_url: "https://auth.example.com/authorize".into(),
            token_url: "https://auth.example.com/token".into(),
            client_id: "client-1".into(),
            redirect_uri: "http://localhost:8000/api/oauth/callback".into(),
            expires_at: Utc::now() + Duration::minutes(10),
            created_at: Utc::now(),
        };
        store.save_oauth_state(&record).unwrap();
        let loaded = store.get_oauth_state("state-1").unwrap().unwrap();
        assert_eq!(loaded.scopes, record.scopes);
        assert_eq!(loaded.code_challenge_method.as_deref(), Some("S256"));

        store.delete_oauth_state("state-1").unwrap();
        assert!(store.get_oauth_state("state-1").unwrap().is_none());
    }

    #[test]
    fn auth_session_roundtrip() {
        let (store, _dir) = temp_store();
        let now = Utc::now();
        let record = AuthSessionRecord {
            session_id: "login-1".into(),
            user_email: "alice@example.com".into(),
            vault_unlock_handle: "handle-xyz".into(),
            created_at: now,
            expires_at: now + Duration::minutes(30),
            last_activity: now,
        };
        store.save_auth_session(&record).unwrap();
        let loaded = store.get_auth_session("login-1").unwrap().unwrap();
        assert_eq!(loaded.user_email, "alice@example.com");
        assert_eq!(loaded.vault_unlock_handle, "handle-xyz");
    }

    #[test]
    fn github_token_singleton_upsert() {
        let (store, _dir) = temp_store();
        assert!(store.get_github_token().unwrap().is_none());

        store
            .save_github_token(&GitHubTokenRecord {
                token_ref: json!({"kind": "encrypted", "data": "abc"}),
                source: "vault:item-1:password".into(),
                updated_by: "alice@example.com".into(),
                updated_at: Utc::now(),
            })
            .unwrap();
        store
            .save_github_token(&GitHubTokenRecord {
                token_ref: json!({"kind": "encrypted", "data": "def"}),
                source: "manual".into(),
                updated_by: "bob@example.com".into(),
                updated_at: Utc::now(),
            })
            .unwrap();

        let loaded = store.get_github_token().unwrap().unwrap();
        assert_eq!(loaded.source, "manual");
        assert_eq!(loaded.token_ref["data"], "def");

        store.delete_github_token().unwrap();
        assert!(store.get_github_token().unwrap().is_none());
    }

    #[test]
    fn gateway_allow_entry_roundtrip() {
        let (store, _dir) = temp_store();
        let entry = GatewayAllowEntry {
            id: "allow-1".into(),
            entry_type: "domain".into(),
            value: "gateway.example.com".into(),
            created_by: "admin".into(),
            created_at: Utc::now(),
            enabled: true,
            version: 3,
        };
        store.save_gateway_allow_entry(&entry).unwrap();
        let entries = store.list_gateway_allow_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, "gateway.example.com");
        assert_eq!(entries[0].version, 3);
    }

    #[test]
    fn signature_policy_roundtrip() {
        let (store, _dir) = temp_store();
        let record = SignaturePolicyRecord {
            server_id: "srv-1".into(),
            payload: json!({"mode": "audit-only", "permit_unsigned": [{"type": "any"}]}),
            updated_at: Utc::now(),
        };
        store.save_signature_policy(&record).unwrap();
        let loaded = store.get_signature_policy("srv-1").unwrap().unwrap();
        assert_eq!(loaded.payload["mode"], "audit-only");
    }

    // =====================================================================
    // Audit sanitization
    // =====================================================================

    #[test]
    fn audit_metadata_redacts_sensitive_keys() {
        let (store, _dir) = temp_store();
        store
            .record_audit_log(
                "oauth",
                "token_saved",
                "system",
                "corr-1",
                &json!({
                    "credential_key": "cred-1",
                    "access_token": "plaintext!",
                    "Client_Secret": "hunter2",
                    "server_id": "srv-1",
                }),
            )
            .unwrap();

        let entries = store.get_recent_audit_logs(1).unwrap();
        let metadata = &entries[0].metadata;
        assert_eq!(metadata["credential_key"], "***redacted***");
        assert_eq!(metadata["access_token"], "***redacted***");
        assert_eq!(metadata["Client_Secret"], "***redacted***");
        assert_eq!(metadata["server_id"], "srv-1");
    }

    // =====================================================================
    // GC
    // =====================================================================

    #[test]
    fn gc_removes_only_expired_credentials() {
        let (store, _dir) = temp_store();
        let now = Utc::now();
        // Expired beyond the 30-day retention window.
        store
            .save_credential(&sample_credential("stale", now - Duration::days(31)))
            .unwrap();
        store
            .save_credential(&sample_credential("fresh", now + Duration::hours(1)))
            .unwrap();

        let counts = store.gc_expired(now).unwrap();
        assert_eq!(counts.credentials, 1);
        assert!(store.get_credential("stale").unwrap().is_none());
        assert!(store.get_credential("fresh").unwrap().is_some());
    }

    #[test]
    fn gc_sweeps_every_entity_class() {
        let (store, _dir) = temp_store();
        let now = Utc::now();

        store
            .save_exec_session(&ExecSessionRecord {
                session_id: "sess-expired".into(),
                server_id: "srv-1".into(),
                config: json!({}),
                state: "running".into(),
                idle_deadline: now - Duration::minutes(1),
                gateway_endpoint: "container://x".into(),
                metrics_endpoint: "".into(),
                mtls_cert_ref: None,
                feature_flags: json!({}),
                created_at: now,
            })
            .unwrap();
        store
            .save_job(&JobRecord {
                job_id: "job-old".into(),
                session_id: "sess-expired".into(),
                status: "completed".into(),
                queued_at: now - Duration::hours(30),
                started_at: None,
                finished_at: Some(now - Duration::hours(25)),
                exit_code: Some(0),
                timeout: false,
                truncated: false,
                output_ref: None,
                created_at: now - Duration::hours(30),
            })
            .unwrap();
        store
            .save_auth_session(&AuthSessionRecord {
                session_id: "login-old".into(),
                user_email: "a@example.com".into(),
                vault_unlock_handle: "h".into(),
                created_at: now - Duration::hours(2),
                expires_at: now - Duration::hours(1),
                last_activity: now - Duration::hours(2),
            })
            .unwrap();
        store
            .save_oauth_state(&OAuthStateRecord {
                state: "state-old".into(),
                server_id: "srv-1".into(),
                code_challenge: None,
                code_challenge_method: None,
                scopes: vec![],
                authorize_url: "a".into(),
                token_url: "t".into(),
                client_id: "c".into(),
                redirect_uri: "r".into(),
                expires_at: now - Duration::minutes(5),
                created_at: now - Duration::minutes(15),
            })
            .unwrap();

        let counts = store.gc_expired(now).unwrap();
        assert_eq!(counts.sessions, 1);
        assert_eq!(counts.jobs, 1);
        assert_eq!(counts.auth_sessions, 1);
        assert_eq!(counts.oauth_states, 1);
    }

    #[test]
    fn gc_keeps_queued_jobs_within_retention() {
        let (store, _dir) = temp_store();
        let now = Utc::now();
        store
            .save_job(&JobRecord {
                job_id: "job-recent".into(),
                session_id: "sess-1".into(),
                status: "queued".into(),
                queued_at: now - Duration::hours(1),
                started_at: None,
                finished_at: None,
                exit_code: None,
                timeout: false,
                truncated: false,
                output_ref: None,
                created_at: now - Duration::hours(1),
            })
            .unwrap();

        let counts = store.gc_expired(now).unwrap();
        assert_eq!(counts.jobs, 0);
        assert!(store.get_job("job-recent").unwrap().is_some());
    }

    // =====================================================================
    // Endpoint allowlist
    // =====================================================================

    #[test]
    fn allowlist_exact_host_default_port() {
        assert!(endpoint_allowed_with(
            "https://api.example.com/x",
            "api.example.com"
        ));
        assert!(!endpoint_allowed_with(
            "https://api.example.com:8443/x",
            "api.example.com"
        ));
    }

    #[test]
    fn allowlist_wildcard_matches_strict_subdomains_only() {
        assert!(endpoint_allowed_with(
            "https://v2.api.example.com/x",
            "*.example.com"
        ));
        assert!(!endpoint_allowed_with(
            "https://example.com/x",
            "*.example.com"
        ));
    }

    #[test]
    fn allowlist_empty_denies_all() {
        assert!(!endpoint_allowed_with("https://api.example.com/x", ""));
        assert!(!endpoint_allowed_with("https://api.example.com/x", " , "));
    }

    #[test]
    fn allowlist_explicit_port_entry() {
        assert!(endpoint_allowed_with(
            "https://api.example.com:8443/x",
            "api.example.com:8443"
        ));
        assert!(!endpoint_allowed_with(
            "https://api.example.com/x",
            "api.example.com:8443"
        ));
    }

    #[test]
    fn allowlist_http_default_port_is_80() {
        assert!(endpoint_allowed_with(
            "http://api.example.com/x",
            "api.example.com"
        ));
    }

    #[test]
    fn allowlist_rejects_ipv6_and_bad_schemes() {
        assert!(!endpoint_allowed_with("https://[::1]/x", "*"));
        assert!(!endpoint_allowed_with("ftp://api.example.com/x", "api.example.com"));
        assert!(!endpoint_allowed_with("not a url", "api.example.com"));
    }

    #[test]
    fn allowlist_skips_malformed_port_entries() {
        assert!(!endpoint_allowed_with(
            "https://api.example.com/x",
            "api.example.com:notaport"
        ));
    }

    // =====================================================================
    // Metadata sanitization helper
    // =====================================================================

    #[test]
    fn sanitize_passes_non_objects_through() {
        assert_eq!(sanitize_metadata(&json!("plain")), json!("plain"));
        assert_eq!(sanitize_metadata(&json!(42)), json!(42));
    }
}
