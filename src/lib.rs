//! Control-plane backend for managing a fleet of MCP servers.
//!
//! Users authenticate through an external password vault, register MCP
//! servers as local containers or remote endpoints, inspect their
//! advertised surface, run commands against them under an execution
//! policy, and manage the OAuth credentials those servers need.

pub mod api;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod containers;
pub mod gateways;
pub mod github_token;
pub mod inspector;
pub mod metrics;
pub mod mtls;
pub mod oauth;
pub mod remote;
pub mod runtime;
pub mod secrets;
pub mod sessions;
pub mod store;
pub mod vault;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;

use auth::AuthService;
use catalog::{CatalogConfig, CatalogService};
use config::Settings;
use containers::ContainerService;
use gateways::{GatewayService, HttpHealthProbe};
use github_token::GitHubTokenService;
use inspector::InspectorService;
use metrics::MetricsRecorder;
use oauth::tokens::{TokenCipher, TokenCipherError, TokenVault};
use oauth::{OAuthConfig, OAuthService};
use remote::{HttpTransportFactory, RemoteMcpService};
use runtime::docker::DockerRuntime;
use runtime::ContainerRuntime;
use secrets::SecretResolver;
use sessions::{NoopSignatureVerifier, SessionService};
use store::{Retention, StateStore, StoreError};
use vault::cli::VaultCli;
use vault::VaultClient;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("state store initialization failed: {0}")]
    Store(#[from] StoreError),

    #[error("token encryption key setup failed: {0}")]
    Cipher(#[from] TokenCipherError),
}

/// Explicitly constructed and injected dependencies, owned by the process
/// for its lifetime. This is the axum application state.
#[derive(Clone)]
pub struct AppServices {
    pub settings: Arc<Settings>,
    pub store: Arc<StateStore>,
    pub auth: Arc<AuthService>,
    pub secrets: Arc<SecretResolver>,
    pub containers: Arc<ContainerService>,
    pub sessions: Arc<SessionService>,
    pub oauth: Arc<OAuthService>,
    pub remote: Arc<RemoteMcpService>,
    pub gateways: Arc<GatewayService>,
    pub catalog: Arc<CatalogService>,
    pub github_token: Arc<GitHubTokenService>,
    pub inspector: Arc<InspectorService>,
    pub metrics: Arc<MetricsRecorder>,
}

impl AppServices {
    /// Wire every component in dependency order.
    pub fn build(settings: Settings) -> Result<Self, BuildError> {
        let settings = Arc::new(settings);

        let store = Arc::new(StateStore::new(
            &settings.state_db_path,
            Retention {
                credential_days: settings.credential_retention_days,
                job_hours: settings.job_retention_hours,
            },
        ));
        store.init_schema()?;

        let vault: Arc<dyn VaultClient> = Arc::new(VaultCli::new(
            &settings.vault_cli_path,
            settings.vault_cli_timeout_seconds,
        ));

        let auth = Arc::new(AuthService::new(
            store.clone(),
            vault.clone(),
            settings.session_timeout(),
        ));
        let secrets = Arc::new(SecretResolver::new(
            vault.clone(),
            settings.session_timeout(),
        ));
        // Session teardown purges the per-session secret cache.
        {
            let secrets = secrets.clone();
            auth.on_session_end(Arc::new(move |session_id| {
                secrets.clear_session_cache(session_id);
            }));
        }

        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(DockerRuntime::new(settings.docker_host.clone()));
        let containers = Arc::new(ContainerService::new(
            runtime.clone(),
            secrets.clone(),
            store.clone(),
        ));
        let sessions = Arc::new(SessionService::new(
            containers.clone(),
            store.clone(),
            settings.cert_base(),
            settings.mtls_placeholder_mode,
            Arc::new(NoopSignatureVerifier),
        ));

        let cipher = Arc::new(TokenCipher::load(&settings.oauth_token_key_file)?);
        let tokens = Arc::new(TokenVault::new());
        let oauth = Arc::new(OAuthService::new(
            store.clone(),
            OAuthConfig {
                authorize_url: settings.oauth_authorize_url.clone(),
                token_url: settings.oauth_token_url.clone(),
                client_id: settings.oauth_client_id.clone(),
                redirect_uri: settings.oauth_redirect_uri.clone(),
                request_timeout: StdDuration::from_secs(settings.oauth_request_timeout_seconds),
                credential_creator: "system".to_string(),
            },
            cipher.clone(),
            tokens.clone(),
            settings.oauth_permitted_scopes.clone(),
        ));

        let remote = Arc::new(RemoteMcpService::new(
            store.clone(),
            tokens,
            Arc::new(HttpTransportFactory::new(StdDuration::from_secs(30))),
            settings.remote_max_connections,
        ));

        let metrics = Arc::new(MetricsRecorder::new());
        let gateways = Arc::new(GatewayService::new(
            store.clone(),
            metrics.clone(),
            Arc::new(HttpHealthProbe::new(StdDuration::from_secs(
                settings.gateway_healthcheck_timeout_seconds,
            ))),
        ));

        let catalog = Arc::new(CatalogService::new(CatalogConfig {
            docker_url: settings.catalog_docker_url.clone(),
            official_url: settings.catalog_official_url.clone(),
            max_pages: settings.catalog_official_max_pages,
            page_delay: StdDuration::from_millis(settings.catalog_official_page_delay_ms),
            cache_ttl: chrono::Duration::seconds(settings.catalog_cache_ttl_seconds as i64),
            fetch_timeout: StdDuration::from_secs(
                settings.catalog_official_fetch_timeout_seconds,
            ),
        }));

        let github_token = Arc::new(GitHubTokenService::new(
            store.clone(),
            secrets.clone(),
            vault,
            cipher,
        ));
        let inspector = Arc::new(InspectorService::new(runtime));

        Ok(Self {
            settings,
            store,
            auth,
            secrets,
            containers,
            sessions,
            oauth,
            remote,
            gateways,
            catalog,
            github_token,
            inspector,
            metrics,
        })
    }

    /// One maintenance pass: GC expired rows and sweep idle login sessions.
    pub async fn run_maintenance(&self) {
        match self.store.gc_expired(Utc::now()) {
            Ok(counts) => {
                if counts != Default::default() {
                    log::info!(
                        "GC removed credentials={} sessions={} jobs={} auth_sessions={} oauth_states={}",
                        counts.credentials,
                        counts.sessions,
                        counts.jobs,
                        counts.auth_sessions,
                        counts.oauth_states
                    );
                }
            }
            Err(e) => log::warn!("GC pass failed: {}", e),
        }
        if let Err(e) = self.auth.cleanup_expired().await {
            log::warn!("Session cleanup failed: {}", e);
        }
    }

    /// Spawn the periodic maintenance loop.
    pub fn spawn_maintenance(&self, interval: StdDuration) -> tokio::task::JoinHandle<()> {
        let services = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                services.run_maintenance().await;
            }
        })
    }

    /// Graceful teardown of background work.
    pub async fn shutdown(&self) {
        self.remote.shutdown();
        self.gateways.shutdown().await;
    }
}
