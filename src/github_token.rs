use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::oauth::tokens::{TokenCipher, TokenCipherError};
use crate::secrets::{SecretError, SecretResolver};
use crate::store::{GitHubTokenRecord, StateStore, StoreError};
use crate::vault::{VaultClient, VaultError};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GitHubTokenError {
    #[error("no GitHub token is configured")]
    NotConfigured,

    #[error("empty token value returned from the vault")]
    EmptyToken,

    #[error("secret resolution failed: {0}")]
    Secret(#[from] SecretError),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("token encryption error: {0}")]
    Cipher(#[from] TokenCipherError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Vault item summary offered to the token picker UI.
#[derive(Debug, Clone, Serialize)]
pub struct VaultItemSummary {
    pub id: String,
    pub name: String,
    pub field_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GitHubTokenStatus {
    pub configured: bool,
    pub source: Option<String>,
    pub updated_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// GitHubTokenService
// ---------------------------------------------------------------------------

/// Singleton GitHub token sourced from the vault.
///
/// The persisted row carries only the encrypted payload; plaintext is cached
/// in memory for catalog requests. Callers pass the vault unlock handle as a
/// plain value, so this service holds no reference back into the auth layer.
pub struct GitHubTokenService {
    store: Arc<StateStore>,
    secrets: Arc<SecretResolver>,
    vault: Arc<dyn VaultClient>,
    cipher: Arc<TokenCipher>,
    cached: Mutex<Option<String>>,
}

impl GitHubTokenService {
    pub fn new(
        store: Arc<StateStore>,
        secrets: Arc<SecretResolver>,
        vault: Arc<dyn VaultClient>,
        cipher: Arc<TokenCipher>,
    ) -> Self {
        Self {
            store,
            secrets,
            vault,
            cipher,
            cached: Mutex::new(None),
        }
    }

    /// Search vault items by name; returns ids, names, and the field names
    /// available on each item (never the values).
    pub async fn search_items(
        &self,
        query: &str,
        vault_handle: &str,
        limit: usize,
    ) -> Result<Vec<VaultItemSummary>, GitHubTokenError> {
        let listing = self.vault.list_items(query, vault_handle).await?;
        let items = listing.as_array().cloned().unwrap_or_default();

        Ok(items
            .iter()
            .take(limit)
            .filter_map(|item| {
                let id = item["id"].as_str()?.to_string();
                let name = item["name"].as_str().unwrap_or_default().to_string();
                let mut field_names = Vec::new();
                if item["login"]["username"].is_string() {
                    field_names.push("username".to_string());
                }
                if item["login"]["password"].is_string() {
                    field_names.push("password".to_string());
                }
                if let Some(fields) = item["fields"].as_array() {
                    for field in fields {
                        if let Some(name) = field["name"].as_str() {
                            field_names.push(name.to_string());
                        }
                    }
                }
                Some(VaultItemSummary {
                    id,
                    name,
                    field_names,
                })
            })
            .collect())
    }

    /// Resolve `{{ bw:<item>:<field> }}` through the secret resolver and
    /// persist the encrypted token.
    pub async fn save_from_vault(
        &self,
        session_id: &str,
        vault_handle: &str,
        user_email: &str,
        item_id: &str,
        field: &str,
    ) -> Result<GitHubTokenStatus, GitHubTokenError> {
        let reference = format!("{{{{ bw:{item_id}:{field} }}}}");
        let token_value = self
            .secrets
            .resolve_reference(&reference, session_id, vault_handle)
            .await?;
        if token_value.is_empty() {
            return Err(GitHubTokenError::EmptyToken);
        }

        let token_ref = self.cipher.encrypt(token_value.as_bytes())?;
        self.store.save_github_token(&GitHubTokenRecord {
            token_ref,
            source: format!("vault:{item_id}:{field}"),
            updated_by: user_email.to_string(),
            updated_at: Utc::now(),
        })?;

        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = Some(token_value);
        self.get_status()
    }

    /// Plaintext token for outbound registry calls; decrypts on a cold
    /// cache.
    pub fn get_token(&self) -> Result<Option<String>, GitHubTokenError> {
        if let Some(token) = self
            .cached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Ok(Some(token));
        }

        let record = match self.store.get_github_token()? {
            Some(record) => record,
            None => return Ok(None),
        };
        let plaintext = self.cipher.decrypt(&record.token_ref)?;
        let token = String::from_utf8_lossy(&plaintext).to_string();
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        Ok(Some(token))
    }

    pub fn delete_token(&self) -> Result<(), GitHubTokenError> {
        self.store.delete_github_token()?;
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    pub fn get_status(&self) -> Result<GitHubTokenStatus, GitHubTokenError> {
        Ok(match self.store.get_github_token()? {
            Some(record) => GitHubTokenStatus {
                configured: true,
                source: Some(record.source),
                updated_by: Some(record.updated_by),
                updated_at: Some(record.updated_at),
            },
            None => GitHubTokenStatus {
                configured: false,
                source: None,
                updated_by: None,
                updated_at: None,
            },
        })
    }

    /// Token ref as persisted (for diagnostics); never contains plaintext.
    pub fn stored_ref(&self) -> Result<Option<Value>, GitHubTokenError> {
        Ok(self.store.get_github_token()?.map(|r| r.token_ref))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Retention;
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    struct StubVault;

    #[async_trait]
    impl VaultClient for StubVault {
        async fn login_api_key(&self, _i: &str, _s: &str) -> Result<(), VaultError> {
            Ok(())
        }
        async fn login_password(&self, _e: &str, _p: &str) -> Result<String, VaultError> {
            Ok("h".into())
        }
        async fn unlock(&self, _p: &str) -> Result<String, VaultError> {
            Ok("h".into())
        }
        async fn verify(&self, _h: &str) -> Result<(), VaultError> {
            Ok(())
        }
        async fn lock(&self, _h: &str) -> Result<(), VaultError> {
            Ok(())
        }
        async fn get_item(&self, _item: &str, _h: &str) -> Result<Value, VaultError> {
            Ok(json!({
                "login": {"password": "ghp_secret123"},
                "fields": [{"name": "token", "value": "ghp_custom456"}],
            }))
        }
        async fn list_items(&self, query: &str, _h: &str) -> Result<Value, VaultError> {
            Ok(json!([
                {
                    "id": "item-1",
                    "name": format!("GitHub ({query})"),
                    "login": {"username": "alice", "password": "pw"},
                    "fields": [{"name": "token", "value": "v"}],
                },
                {"id": "item-2", "name": "Other", "login": {}, "fields": []},
            ]))
        }
    }

    fn fixture() -> (GitHubTokenService, Arc<StateStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        let store = Arc::new(StateStore::new(
            path.to_str().unwrap(),
            Retention::default(),
        ));
        store.init_schema().unwrap();
        let vault: Arc<dyn VaultClient> = Arc::new(StubVault);
        let secrets = Arc::new(SecretResolver::new(vault.clone(), Duration::minutes(30)));
        let service = GitHubTokenService::new(
            store.clone(),
            secrets,
            vault,
            Arc::new(TokenCipher::with_key([3u8; 32])),
        );
        (service, store, dir)
    }

    #[tokio::test]
    async fn save_encrypts_and_reports_status() {
        let (service, store, _dir) = fixture();

        let status = service
            .save_from_vault("sess-1", "handle", "alice@example.com", "item-1", "password")
            .await
            .unwrap();

        assert!(status.configured);
        assert_eq!(status.source.as_deref(), Some("vault:item-1:password"));
        assert_eq!(status.updated_by.as_deref(), Some("alice@example.com"));

        // Plaintext never reaches the persisted row.
        let record = store.get_github_token().unwrap().unwrap();
        assert_eq!(record.token_ref["kind"], "aes-gcm");
        assert!(!record.token_ref.to_string().contains("ghp_secret123"));
    }

    #[tokio::test]
    async fn get_token_decrypts_after_cache_drop() {
        let (service, store, _dir) = fixture();
        service
            .save_from_vault("sess-1", "handle", "alice@example.com", "item-1", "password")
            .await
            .unwrap();

        // Simulate a process restart by clearing the memory cache.
        *service.cached.lock().unwrap() = None;
        let token = service.get_token().unwrap();
        assert_eq!(token.as_deref(), Some("ghp_secret123"));

        let _ = store;
    }

    #[tokio::test]
    async fn custom_field_resolves() {
        let (service, _store, _dir) = fixture();
        service
            .save_from_vault("sess-1", "handle", "alice@example.com", "item-1", "token")
            .await
            .unwrap();
        assert_eq!(service.get_token().unwrap().as_deref(), Some("ghp_custom456"));
    }

    #[tokio::test]
    async fn delete_clears_row_and_cache() {
        let (service, _store, _dir) = fixture();
        service
            .save_from_vault("sess-1", "handle", "alice@example.com", "item-1", "password")
            .await
            .unwrap();

        service.delete_token().unwrap();
        assert!(!service.get_status().unwrap().configured);
        assert!(service.get_token().unwrap().is_none());
    }

    #[tokio::test]
    async fn status_unconfigured_by_default() {
        let (service, _store, _dir) = fixture();
        let status = service.get_status().unwrap();
        assert!(!status.configured);
        assert!(status.source.is_none());
    }

    #[tokio::test]
    async fn search_lists_field_names_only() {
        let (service, _store, _dir) = fixture();
        let items = service.search_items("github", "handle", 20).await.unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "item-1");
        assert_eq!(
            items[0].field_names,
            vec!["username".to_string(), "password".to_string(), "token".to_string()]
        );
        assert!(items[1].field_names.is_empty());
    }

    #[tokio::test]
    async fn search_respects_limit() {
        let (service, _store, _dir) = fixture();
        let items = service.search_items("github", "handle", 1).await.unwrap();
        assert_eq!(items.len(), 1);
    }
}
