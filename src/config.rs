use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Application settings sourced from environment variables.
///
/// Every field has a default so the console can start with nothing but a
/// vault binary on PATH. Production deployments are expected to set at
/// least `REMOTE_MCP_ALLOWED_DOMAINS` and `OAUTH_TOKEN_ENCRYPTION_KEY`.
#[derive(Debug, Clone)]
pub struct Settings {
    // Vault CLI
    pub vault_cli_path: String,
    pub vault_cli_timeout_seconds: u64,

    // Container runtime
    pub docker_host: Option<String>,

    // Sessions & retention
    pub session_timeout_minutes: i64,
    pub state_db_path: String,
    pub credential_retention_days: i64,
    pub job_retention_hours: i64,
    pub mtls_placeholder_mode: bool,
    pub cert_base_dir: Option<PathBuf>,

    // Catalog
    pub catalog_cache_ttl_seconds: u64,
    pub catalog_docker_url: String,
    pub catalog_official_url: String,
    pub catalog_official_max_pages: u32,
    pub catalog_official_page_delay_ms: u64,
    pub catalog_official_fetch_timeout_seconds: u64,

    // OAuth
    pub oauth_authorize_url: String,
    pub oauth_token_url: String,
    pub oauth_client_id: String,
    pub oauth_redirect_uri: String,
    pub oauth_request_timeout_seconds: u64,
    pub oauth_permitted_scopes: Vec<String>,
    pub oauth_token_key_file: PathBuf,

    // Remote MCP
    pub remote_max_connections: usize,
    pub allow_insecure_endpoint: bool,

    // Gateways
    pub gateway_healthcheck_timeout_seconds: u64,

    // HTTP server
    pub bind_addr: String,
    pub cors_origins: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vault_cli_path: "/usr/local/bin/bw".to_string(),
            vault_cli_timeout_seconds: 30,
            docker_host: None,
            session_timeout_minutes: 30,
            state_db_path: "data/state.db".to_string(),
            credential_retention_days: 30,
            job_retention_hours: 24,
            mtls_placeholder_mode: false,
            cert_base_dir: None,
            catalog_cache_ttl_seconds: 3600,
            catalog_docker_url:
                "https://api.github.com/repos/docker/mcp-registry/contents/servers".to_string(),
            catalog_official_url: "https://registry.modelcontextprotocol.io/v0/servers"
                .to_string(),
            catalog_official_max_pages: 20,
            catalog_official_page_delay_ms: 100,
            catalog_official_fetch_timeout_seconds: 60,
            oauth_authorize_url: "https://auth.example.com/authorize".to_string(),
            oauth_token_url: "https://auth.example.com/token".to_string(),
            oauth_client_id: "mcp-console".to_string(),
            oauth_redirect_uri: "http://localhost:8000/api/oauth/callback".to_string(),
            oauth_request_timeout_seconds: 10,
            oauth_permitted_scopes: Vec::new(),
            oauth_token_key_file: PathBuf::from("data/oauth_encryption.key"),
            remote_max_connections: 10,
            allow_insecure_endpoint: false,
            gateway_healthcheck_timeout_seconds: 15,
            bind_addr: "0.0.0.0:8000".to_string(),
            cors_origins: "http://localhost:3000".to_string(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_string(key).map(|v| v.parse::<T>()) {
        Some(Ok(parsed)) => parsed,
        Some(Err(_)) => {
            log::warn!("Ignoring unparsable value for {}", key);
            default
        }
        None => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key).map(|v| v.to_ascii_lowercase()) {
        Some(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Settings {
            vault_cli_path: env_string("VAULT_CLI_PATH").unwrap_or(defaults.vault_cli_path),
            vault_cli_timeout_seconds: env_parse(
                "VAULT_CLI_TIMEOUT_SECONDS",
                defaults.vault_cli_timeout_seconds,
            ),
            docker_host: env_string("DOCKER_HOST"),
            session_timeout_minutes: env_parse(
                "SESSION_TIMEOUT_MINUTES",
                defaults.session_timeout_minutes,
            ),
            state_db_path: env_string("STATE_DB_PATH").unwrap_or(defaults.state_db_path),
            credential_retention_days: env_parse(
                "CREDENTIAL_RETENTION_DAYS",
                defaults.credential_retention_days,
            ),
            job_retention_hours: env_parse("JOB_RETENTION_HOURS", defaults.job_retention_hours),
            mtls_placeholder_mode: env_bool("MTLS_PLACEHOLDER_MODE", false),
            cert_base_dir: env_string("MTLS_CERT_BASE_DIR").map(PathBuf::from),
            catalog_cache_ttl_seconds: env_parse(
                "CATALOG_CACHE_TTL_SECONDS",
                defaults.catalog_cache_ttl_seconds,
            ),
            catalog_docker_url: env_string("CATALOG_DOCKER_URL")
                .unwrap_or(defaults.catalog_docker_url),
            catalog_official_url: env_string("CATALOG_OFFICIAL_URL")
                .unwrap_or(defaults.catalog_official_url),
            catalog_official_max_pages: env_parse(
                "CATALOG_OFFICIAL_MAX_PAGES",
                defaults.catalog_official_max_pages,
            ),
            catalog_official_page_delay_ms: env_parse(
                "CATALOG_OFFICIAL_PAGE_DELAY_MS",
                defaults.catalog_official_page_delay_ms,
            ),
            catalog_official_fetch_timeout_seconds: env_parse(
                "CATALOG_OFFICIAL_FETCH_TIMEOUT_SECONDS",
                defaults.catalog_official_fetch_timeout_seconds,
            ),
            oauth_authorize_url: env_string("OAUTH_AUTHORIZE_URL")
                .unwrap_or(defaults.oauth_authorize_url),
            oauth_token_url: env_string("OAUTH_TOKEN_URL").unwrap_or(defaults.oauth_token_url),
            oauth_client_id: env_string("OAUTH_CLIENT_ID").unwrap_or(defaults.oauth_client_id),
            oauth_redirect_uri: env_string("OAUTH_REDIRECT_URI")
                .unwrap_or(defaults.oauth_redirect_uri),
            oauth_request_timeout_seconds: env_parse(
                "OAUTH_REQUEST_TIMEOUT_SECONDS",
                defaults.oauth_request_timeout_seconds,
            ),
            oauth_permitted_scopes: env_string("OAUTH_PERMITTED_SCOPES")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            oauth_token_key_file: env_string("OAUTH_TOKEN_ENCRYPTION_KEY_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.oauth_token_key_file),
            remote_max_connections: env_parse(
                "REMOTE_MCP_MAX_CONNECTIONS",
                defaults.remote_max_connections,
            ),
            allow_insecure_endpoint: env_bool("ALLOW_INSECURE_ENDPOINT", false),
            gateway_healthcheck_timeout_seconds: env_parse(
                "GATEWAY_HEALTHCHECK_TIMEOUT_SECONDS",
                defaults.gateway_healthcheck_timeout_seconds,
            ),
            bind_addr: env_string("BIND_ADDR").unwrap_or(defaults.bind_addr),
            cors_origins: env_string("CORS_ORIGINS").unwrap_or(defaults.cors_origins),
        }
    }

    /// Directory holding per-session mTLS bundles. Defaults to `certs/`
    /// next to the state database.
    pub fn cert_base(&self) -> PathBuf {
        match &self.cert_base_dir {
            Some(dir) => dir.clone(),
            None => {
                let db = PathBuf::from(&self.state_db_path);
                db.parent()
                    .map(|p| p.join("certs"))
                    .unwrap_or_else(|| PathBuf::from("certs"))
            }
        }
    }

    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.session_timeout_minutes)
    }
}
