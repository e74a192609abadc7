pub mod cli;

use async_trait::async_trait;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault login failed: {0}")]
    LoginFailed(String),

    #[error("vault unlock failed: {0}")]
    UnlockFailed(String),

    #[error("vault command timed out")]
    Timeout,

    #[error("invalid JSON from vault binary: {0}")]
    InvalidJson(String),

    #[error("vault command failed: {0}")]
    CommandFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Contract offered by the external password-vault binary.
///
/// The production implementation shells out to the CLI; tests substitute an
/// in-memory stub. An unlock handle returned here is opaque to the rest of
/// the system and is never persisted in plaintext responses or logs.
#[async_trait]
pub trait VaultClient: Send + Sync {
    /// Authenticate the client against the vault service with API-key
    /// credentials. Does not unlock the vault.
    async fn login_api_key(&self, client_id: &str, client_secret: &str)
        -> Result<(), VaultError>;

    /// Login with email + master password. Returns an unlock handle.
    async fn login_password(&self, email: &str, password: &str) -> Result<String, VaultError>;

    /// Unlock the vault with the master password. Returns an unlock handle.
    async fn unlock(&self, master_password: &str) -> Result<String, VaultError>;

    /// Probe that the handle actually grants vault access.
    async fn verify(&self, handle: &str) -> Result<(), VaultError>;

    /// Lock the vault for the given handle.
    async fn lock(&self, handle: &str) -> Result<(), VaultError>;

    /// Fetch a single item as JSON.
    async fn get_item(&self, item_id: &str, handle: &str) -> Result<Value, VaultError>;

    /// List items matching a search query as JSON.
    async fn list_items(&self, query: &str, handle: &str) -> Result<Value, VaultError>;
}
