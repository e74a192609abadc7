pub mod tokens;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::store::{CredentialRecord, OAuthStateRecord, StateStore, StoreError};
use tokens::{TokenCipher, TokenSet, TokenVault};

const STATE_TTL_MINUTES: i64 = 10;
const DEFAULT_EXPIRES_IN: i64 = 3600;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("state mismatch; restart the authorization flow")]
    StateMismatch,

    #[error("provider rejected the request; re-authorize")]
    ProviderError,

    #[error("provider unavailable; retry later")]
    ProviderUnavailable,

    #[error("stored token is no longer valid; re-authorize")]
    InvalidGrant,

    #[error("requested scopes are not permitted: {}", missing.join(", "))]
    ScopeNotAllowed { missing: Vec<String> },

    #[error("credential not found: {0}")]
    CredentialNotFound(String),

    #[error("only administrators may change the scope policy")]
    ScopeUpdateForbidden,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("OAuth configuration incomplete: {0}")]
    Config(String),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("token encryption error: {0}")]
    Cipher(#[from] tokens::TokenCipherError),
}

// ---------------------------------------------------------------------------
// Scope policy
// ---------------------------------------------------------------------------

/// Permitted scope tokens. Entries ending in `*` match by prefix; anything
/// else matches exactly. An empty policy permits everything.
#[derive(Debug, Clone, Default)]
pub struct ScopePolicy {
    permitted: Vec<String>,
}

impl ScopePolicy {
    pub fn new(permitted: Vec<String>) -> Self {
        Self { permitted }
    }

    /// Scopes from `required` that the policy does not permit.
    pub fn missing(&self, required: &[String]) -> Vec<String> {
        if self.permitted.is_empty() || required.is_empty() {
            return Vec::new();
        }
        required
            .iter()
            .filter(|scope| !self.is_permitted(scope))
            .cloned()
            .collect()
    }

    fn is_permitted(&self, scope: &str) -> bool {
        self.permitted.iter().any(|permitted| {
            match permitted.strip_suffix('*') {
                Some(prefix) => scope.starts_with(prefix),
                None => scope == permitted,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StartAuthResult {
    pub auth_url: String,
    pub state: String,
    pub required_scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenGrant {
    pub status: &'static str,
    pub scope: Vec<String>,
    pub expires_in: i64,
    pub credential_key: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub credential_key: String,
    pub refreshed: bool,
    pub scope: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub request_timeout: StdDuration,
    pub credential_creator: String,
}

#[derive(Debug, Clone)]
struct PendingState {
    server_id: String,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    scopes: Vec<String>,
}

// ---------------------------------------------------------------------------
// OAuthService
// ---------------------------------------------------------------------------

/// Authorization-code + PKCE state machine with refresh.
///
/// Token plaintext lives only in the in-memory [`TokenVault`]; what lands in
/// the credentials table is the AES-GCM-encrypted `token_ref` payload.
pub struct OAuthService {
    store: Arc<StateStore>,
    config: OAuthConfig,
    http: reqwest::Client,
    cipher: Arc<TokenCipher>,
    tokens: Arc<TokenVault>,
    states: Mutex<HashMap<String, PendingState>>,
    scope_policy: Mutex<ScopePolicy>,
    backoff: Vec<StdDuration>,
    refresh_backoff: Vec<StdDuration>,
    refresh_threshold: Duration,
}

impl OAuthService {
    pub fn new(
        store: Arc<StateStore>,
        config: OAuthConfig,
        cipher: Arc<TokenCipher>,
        tokens: Arc<TokenVault>,
        permitted_scopes: Vec<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            store,
            config,
            http,
            cipher,
            tokens,
            states: Mutex::new(HashMap::new()),
            scope_policy: Mutex::new(ScopePolicy::new(permitted_scopes)),
            backoff: vec![
                StdDuration::from_secs(1),
                StdDuration::from_secs(2),
                StdDuration::from_secs(4),
            ],
            refresh_backoff: vec![StdDuration::from_secs(2), StdDuration::from_secs(4)],
            refresh_threshold: Duration::minutes(15),
        }
    }

    /// Override the retry schedules (tests use millisecond delays).
    pub fn with_backoff(
        mut self,
        backoff: Vec<StdDuration>,
        refresh_backoff: Vec<StdDuration>,
    ) -> Self {
        self.backoff = backoff;
        self.refresh_backoff = refresh_backoff;
        self
    }

    pub fn token_vault(&self) -> &TokenVault {
        &self.tokens
    }

    /// Begin an authorization-code flow: validate scopes, mint the state,
    /// and compose the provider authorize URL.
    pub fn start_auth(
        &self,
        server_id: &str,
        scopes: Vec<String>,
        code_challenge: Option<String>,
        code_challenge_method: Option<String>,
    ) -> Result<StartAuthResult, OAuthError> {
        if self.config.authorize_url.is_empty() || self.config.client_id.is_empty() {
            return Err(OAuthError::Config(
                "authorize_url and client_id must be configured".to_string(),
            ));
        }

        let state = random_state();

        let missing = self
            .scope_policy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .missing(&scopes);
        if !missing.is_empty() {
            self.audit(
                "scope_denied",
                &state,
                json!({
                    "server_id": server_id,
                    "requested_scopes": scopes.clone(),
                    "missing": missing.clone(),
                }),
            );
            return Err(OAuthError::ScopeNotAllowed { missing });
        }

        let method = match (&code_challenge, code_challenge_method.as_deref()) {
            (None, _) => None,
            (Some(_), Some("S256")) | (Some(_), None) => Some("S256".to_string()),
            (Some(_), Some("plain")) => Some("plain".to_string()),
            (Some(_), Some(other)) => {
                return Err(OAuthError::InvalidRequest(format!(
                    "unsupported code_challenge_method: {other} (use S256 or plain)"
                )))
            }
        };

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("state", &state)
            .append_pair("scope", &scopes.join(" "));
        if let (Some(challenge), Some(method)) = (&code_challenge, &method) {
            query
                .append_pair("code_challenge", challenge)
                .append_pair("code_challenge_method", method);
        }
        let auth_url = format!("{}?{}", self.config.authorize_url, query.finish());

        self.states.lock().unwrap_or_else(|e| e.into_inner()).insert(
            state.clone(),
            PendingState {
                server_id: server_id.to_string(),
                code_challenge: code_challenge.clone(),
                code_challenge_method: method.clone(),
                scopes: scopes.clone(),
            },
        );
        // Persisted twin of the in-memory entry; GC reclaims abandoned ones.
        let now = Utc::now();
        self.store.save_oauth_state(&OAuthStateRecord {
            state: state.clone(),
            server_id: server_id.to_string(),
            code_challenge,
            code_challenge_method: method,
            scopes: scopes.clone(),
            authorize_url: self.config.authorize_url.clone(),
            token_url: self.config.token_url.clone(),
            client_id: self.config.client_id.clone(),
            redirect_uri: self.config.redirect_uri.clone(),
            expires_at: now + Duration::minutes(STATE_TTL_MINUTES),
            created_at: now,
        })?;

        log::info!("OAuth authorization started: server_id={}", server_id);
        Ok(StartAuthResult {
            auth_url,
            state,
            required_scopes: scopes,
        })
    }

    /// Exchange an authorization code for tokens, consuming the state entry.
    pub async fn exchange_token(
        &self,
        code: &str,
        state: &str,
        server_id: Option<&str>,
        code_verifier: Option<&str>,
    ) -> Result<TokenGrant, OAuthError> {
        if self.config.token_url.is_empty() {
            return Err(OAuthError::Config(
                "token_url must be configured".to_string(),
            ));
        }

        let pending = {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            let server_matches = match states.get(state) {
                None => return Err(OAuthError::StateMismatch),
                Some(entry) => server_id.map_or(true, |expected| entry.server_id == expected),
            };
            if !server_matches {
                // The entry stays; only the owning server may consume it.
                return Err(OAuthError::StateMismatch);
            }
            states.remove(state).expect("entry present under lock")
        };
        self.store.delete_oauth_state(state)?;

        if let Some(challenge) = &pending.code_challenge {
            let verifier = code_verifier.ok_or_else(|| {
                OAuthError::InvalidRequest("code_verifier is required".to_string())
            })?;
            let computed = match pending.code_challenge_method.as_deref() {
                Some("plain") => verifier.to_string(),
                _ => compute_code_challenge(verifier),
            };
            if computed.as_bytes().ct_eq(challenge.as_bytes()).unwrap_u8() != 1 {
                return Err(OAuthError::InvalidRequest(
                    "code_verifier does not match the stored challenge".to_string(),
                ));
            }
        }

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.config.redirect_uri.clone()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier.to_string()));
        }

        let payload = self.post_with_retry(&form, &self.backoff, false).await?;

        let scope_list = parse_scope(&payload, &pending.scopes);
        let grant = self.save_tokens(&pending.server_id, scope_list, &payload, Some(state))?;
        Ok(grant)
    }

    /// Refresh a credential when it is inside the refresh threshold.
    pub async fn refresh_token(
        &self,
        server_id: &str,
        credential_key: &str,
    ) -> Result<RefreshOutcome, OAuthError> {
        let record = self
            .store
            .get_credential(credential_key)?
            .ok_or_else(|| OAuthError::CredentialNotFound(credential_key.to_string()))?;
        let secret = self
            .tokens
            .get(credential_key)
            .ok_or_else(|| OAuthError::CredentialNotFound(credential_key.to_string()))?;

        let now = Utc::now();
        if record.expires_at - now > self.refresh_threshold {
            return Ok(RefreshOutcome {
                credential_key: credential_key.to_string(),
                refreshed: false,
                scope: record.scopes,
                expires_at: record.expires_at,
            });
        }

        let refresh_token = match secret.refresh_token {
            Some(token) if !token.is_empty() => token,
            _ => {
                self.delete_credential(credential_key);
                return Err(OAuthError::InvalidGrant);
            }
        };

        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.clone()),
        ];

        let payload = match self
            .post_with_retry(&form, &self.refresh_backoff, true)
            .await
        {
            Ok(payload) => payload,
            Err(OAuthError::ProviderError) => {
                // 4xx on refresh means the grant is dead; wipe it.
                self.delete_credential(credential_key);
                return Err(OAuthError::InvalidGrant);
            }
            Err(e) => return Err(e),
        };

        let scopes = parse_scope(&payload, &record.scopes);
        self.delete_credential(credential_key);
        let grant = self.save_tokens(server_id, scopes.clone(), &payload, None)?;
        self.audit(
            "token_refreshed",
            &grant.credential_key,
            json!({
                "old_credential_key": credential_key,
                "credential_key": grant.credential_key.clone(),
                "server_id": server_id,
            }),
        );

        Ok(RefreshOutcome {
            credential_key: grant.credential_key,
            refreshed: true,
            scope: scopes,
            expires_at: grant.expires_at,
        })
    }

    /// Replace the scope policy (admins only) and invalidate every known
    /// credential.
    pub fn update_permitted_scopes(
        &self,
        scopes: Vec<String>,
        is_admin: bool,
        correlation_id: Option<&str>,
    ) -> Result<(), OAuthError> {
        let correlation = correlation_id
            .map(String::from)
            .unwrap_or_else(random_state);
        if !is_admin {
            self.audit(
                "scope_update_forbidden",
                &correlation,
                json!({"requested_scopes": scopes}),
            );
            return Err(OAuthError::ScopeUpdateForbidden);
        }

        *self.scope_policy.lock().unwrap_or_else(|e| e.into_inner()) =
            ScopePolicy::new(scopes.clone());
        for key in self.tokens.keys() {
            self.delete_credential(&key);
        }
        self.audit(
            "scope_updated",
            &correlation,
            json!({"permitted_scopes": scopes}),
        );
        Ok(())
    }

    fn delete_credential(&self, credential_key: &str) {
        if let Err(e) = self.store.delete_credential(credential_key) {
            log::warn!("Failed to delete credential {}: {}", credential_key, e);
        }
        self.tokens.drop_key(credential_key);
    }

    /// POST the token endpoint with the component's retry schedule. 4xx is
    /// terminal; 5xx and transport timeouts retry until the schedule runs
    /// dry.
    async fn post_with_retry(
        &self,
        form: &[(&str, String)],
        schedule: &[StdDuration],
        refreshing: bool,
    ) -> Result<Value, OAuthError> {
        let mut last_error = OAuthError::ProviderUnavailable;
        for attempt in 0..=schedule.len() {
            if attempt > 0 {
                tokio::time::sleep(schedule[attempt - 1]).await;
            }

            let response = match self
                .http
                .post(&self.config.token_url)
                .form(form)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_timeout() || e.is_connect() => {
                    log::warn!(
                        "Token endpoint unreachable (attempt {}, refreshing={}): {}",
                        attempt + 1,
                        refreshing,
                        e
                    );
                    last_error = OAuthError::ProviderUnavailable;
                    continue;
                }
                Err(e) => {
                    return Err(OAuthError::InvalidRequest(e.to_string()));
                }
            };

            let status = response.status();
            if status.is_client_error() {
                return Err(OAuthError::ProviderError);
            }
            if status.is_server_error() {
                log::warn!(
                    "Token endpoint returned {} (attempt {})",
                    status,
                    attempt + 1
                );
                last_error = OAuthError::ProviderUnavailable;
                continue;
            }

            return response
                .json::<Value>()
                .await
                .map_err(|e| OAuthError::InvalidRequest(format!("invalid token response: {e}")));
        }
        Err(last_error)
    }

    /// Persist a credential row (encrypted token_ref) and stash plaintext in
    /// the vault. Returns the grant summary.
    fn save_tokens(
        &self,
        server_id: &str,
        scopes: Vec<String>,
        payload: &Value,
        correlation_id: Option<&str>,
    ) -> Result<TokenGrant, OAuthError> {
        let expires_in = payload["expires_in"].as_i64().unwrap_or(DEFAULT_EXPIRES_IN);
        let expires_at = Utc::now() + Duration::seconds(expires_in);
        let credential_key = uuid::Uuid::new_v4().to_string();

        let access_token = payload["access_token"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let refresh_token = payload["refresh_token"].as_str().map(String::from);

        let token_set = TokenSet {
            access_token,
            refresh_token,
            scopes: scopes.clone(),
            expires_at,
        };
        let token_ref = self
            .cipher
            .encrypt(serde_json::to_vec(&token_set).unwrap_or_default().as_slice())?;

        self.store.save_credential(&CredentialRecord {
            credential_key: credential_key.clone(),
            token_ref,
            scopes: scopes.clone(),
            expires_at,
            server_id: server_id.to_string(),
            oauth_token_url: Some(self.config.token_url.clone()),
            oauth_client_id: Some(self.config.client_id.clone()),
            created_by: self.config.credential_creator.clone(),
            created_at: Utc::now(),
        })?;
        self.tokens.put(&credential_key, token_set);

        self.audit(
            "token_saved",
            correlation_id.unwrap_or(&credential_key),
            json!({
                "credential_key": credential_key.clone(),
                "server_id": server_id,
                "expires_at": expires_at.to_rfc3339(),
            }),
        );

        Ok(TokenGrant {
            status: "authorized",
            scope: scopes,
            expires_in,
            credential_key,
            expires_at,
        })
    }

    fn audit(&self, action: &str, target: &str, metadata: Value) {
        if let Err(e) = self
            .store
            .record_audit_log("oauth", action, "system", target, &metadata)
        {
            log::warn!("Failed to record audit log for {}: {}", action, e);
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// PKCE S256: base64url(sha256(verifier)) without padding.
pub fn compute_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn random_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn parse_scope(payload: &Value, requested: &[String]) -> Vec<String> {
    match payload["scope"].as_str() {
        Some(raw) if !raw.trim().is_empty() => {
            raw.split_whitespace().map(String::from).collect()
        }
        _ => requested.to_vec(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
