use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{AuthSessionRecord, StateStore, StoreError};
use crate::vault::{VaultClient, VaultError};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication failed: {0}")]
    Failed(String),

    #[error("invalid login request: {0}")]
    InvalidRequest(String),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

impl From<VaultError> for AuthError {
    fn from(e: VaultError) -> Self {
        AuthError::Failed(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    MasterPassword,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub method: AuthMethod,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub master_password: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl LoginRequest {
    /// Field presence check per login method. The vault binary requires the
    /// master password for the unlock step on both paths.
    fn validate(&self) -> Result<(), AuthError> {
        let missing = |field: &str| {
            AuthError::InvalidRequest(format!("{field} is required for this login method"))
        };
        match self.method {
            AuthMethod::ApiKey => {
                if self.client_id.as_deref().unwrap_or("").is_empty() {
                    return Err(missing("client_id"));
                }
                if self.client_secret.as_deref().unwrap_or("").is_empty() {
                    return Err(missing("client_secret"));
                }
                if self.master_password.as_deref().unwrap_or("").is_empty() {
                    return Err(missing("master_password"));
                }
            }
            AuthMethod::MasterPassword => {
                if self.email.as_deref().unwrap_or("").is_empty() {
                    return Err(missing("email"));
                }
                if self.master_password.as_deref().unwrap_or("").is_empty() {
                    return Err(missing("master_password"));
                }
            }
        }
        Ok(())
    }
}

type SessionEndHook = Arc<dyn Fn(&str) + Send + Sync>;

// ---------------------------------------------------------------------------
// AuthService
// ---------------------------------------------------------------------------

/// Manages vault-backed login sessions.
///
/// A session pairs an id handed to the client with the vault unlock handle
/// it represents. Validation slides the activity window; expiry on either
/// clock logs the session out as a side effect.
pub struct AuthService {
    store: Arc<StateStore>,
    vault: Arc<dyn VaultClient>,
    session_timeout: Duration,
    session_end_hooks: Mutex<Vec<SessionEndHook>>,
}

impl AuthService {
    pub fn new(
        store: Arc<StateStore>,
        vault: Arc<dyn VaultClient>,
        session_timeout: Duration,
    ) -> Self {
        Self {
            store,
            vault,
            session_timeout,
            session_end_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer fired with the session id on every logout path.
    /// The secret resolver uses this to purge its per-session cache.
    pub fn on_session_end(&self, hook: SessionEndHook) {
        self.session_end_hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    fn notify_session_end(&self, session_id: &str) {
        let hooks = self
            .session_end_hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for hook in hooks {
            hook(session_id);
        }
    }

    /// Authenticate against the vault and mint a session.
    pub async fn login(&self, request: &LoginRequest) -> Result<AuthSessionRecord, AuthError> {
        request.validate()?;

        let handle = match request.method {
            AuthMethod::ApiKey => {
                // API-key login authenticates the client, but only the
                // master password can unlock the vault.
                self.vault
                    .login_api_key(
                        request.client_id.as_deref().unwrap_or_default(),
                        request.client_secret.as_deref().unwrap_or_default(),
                    )
                    .await?;
                self.vault
                    .unlock(request.master_password.as_deref().unwrap_or_default())
                    .await?
            }
            AuthMethod::MasterPassword => {
                self.vault
                    .login_password(
                        request.email.as_deref().unwrap_or_default(),
                        request.master_password.as_deref().unwrap_or_default(),
                    )
                    .await?
            }
        };

        // A handle that cannot be verified is an auth failure, not a
        // partially-working session.
        self.vault.verify(&handle).await?;

        let now = Utc::now();
        let record = AuthSessionRecord {
            session_id: Uuid::new_v4().to_string(),
            user_email: request.email.clone().unwrap_or_default(),
            vault_unlock_handle: handle,
            created_at: now,
            expires_at: now + self.session_timeout,
            last_activity: now,
        };
        self.store.save_auth_session(&record)?;

        log::info!(
            "Session created for {}: {}",
            record.user_email,
            record.session_id
        );
        Ok(record)
    }

    /// Terminate a session. Locking the vault is best-effort; the session
    /// row is removed and observers fire regardless.
    pub async fn logout(&self, session_id: &str) -> Result<bool, AuthError> {
        let session = match self.store.get_auth_session(session_id)? {
            Some(s) => s,
            None => {
                log::warn!("Logout attempted for unknown session: {}", session_id);
                return Ok(false);
            }
        };

        if let Err(e) = self.vault.lock(&session.vault_unlock_handle).await {
            log::warn!("Failed to lock vault during logout: {}", e);
        }

        self.store.delete_auth_session(session_id)?;
        self.notify_session_end(session_id);
        log::info!("Session terminated: {}", session_id);
        Ok(true)
    }

    /// Check validity and slide the activity window forward.
    pub async fn validate_session(&self, session_id: &str) -> Result<bool, AuthError> {
        let mut session = match self.store.get_auth_session(session_id)? {
            Some(s) => s,
            None => return Ok(false),
        };

        let now = Utc::now();
        if now >= session.expires_at {
            log::info!("Session expired: {}", session_id);
            self.logout(session_id).await?;
            return Ok(false);
        }
        if now - session.last_activity >= self.session_timeout {
            log::info!("Session timed out from inactivity: {}", session_id);
            self.logout(session_id).await?;
            return Ok(false);
        }

        session.last_activity = now;
        self.store.save_auth_session(&session)?;
        Ok(true)
    }

    /// Fetch the session record if it is still valid.
    pub async fn get_session(
        &self,
        session_id: &str,
    ) -> Result<Option<AuthSessionRecord>, AuthError> {
        if !self.validate_session(session_id).await? {
            return Ok(None);
        }
        Ok(self.store.get_auth_session(session_id)?)
    }

    /// Yield the vault unlock handle for a valid session.
    pub async fn get_vault_access(&self, session_id: &str) -> Result<Option<String>, AuthError> {
        Ok(self
            .get_session(session_id)
            .await?
            .map(|s| s.vault_unlock_handle))
    }

    /// Log out every expired or idle session. Returns the count removed.
    pub async fn cleanup_expired(&self) -> Result<usize, AuthError> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .store
            .list_auth_sessions()?
            .into_iter()
            .filter(|s| now >= s.expires_at || now - s.last_activity >= self.session_timeout)
            .map(|s| s.session_id)
            .collect();

        for session_id in &expired {
            self.logout(session_id).await?;
        }
        if !expired.is_empty() {
            log::info!("Cleaned up {} expired sessions", expired.len());
        }
        Ok(expired.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
