use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TokenCipherError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// TokenSet / TokenVault
// ---------------------------------------------------------------------------

/// Plaintext token pair held only in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

/// The only place OAuth token plaintext lives. Entries are dropped when
/// their credential is deleted; nothing here is persisted.
#[derive(Default)]
pub struct TokenVault {
    entries: Mutex<HashMap<String, TokenSet>>,
}

impl TokenVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, credential_key: &str, tokens: TokenSet) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(credential_key.to_string(), tokens);
    }

    pub fn get(&self, credential_key: &str) -> Option<TokenSet> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(credential_key)
            .cloned()
    }

    pub fn drop_key(&self, credential_key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(credential_key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// TokenCipher
// ---------------------------------------------------------------------------

const KEY_ENV: &str = "OAUTH_TOKEN_ENCRYPTION_KEY";

/// AES-256-GCM cipher for token material at rest.
///
/// The key is sourced env > key file > generated; a generated key is written
/// 0600 to the configured path so restarts keep the same key.
pub struct TokenCipher {
    key: [u8; 32],
    key_id: String,
}

impl TokenCipher {
    pub fn load(key_file: &Path) -> Result<Self, TokenCipherError> {
        if let Ok(raw) = std::env::var(KEY_ENV) {
            if !raw.trim().is_empty() {
                let key = decode_key(raw.trim())?;
                log::info!("Loaded OAuth token encryption key from environment");
                return Ok(Self {
                    key,
                    key_id: "env".to_string(),
                });
            }
        }

        if key_file.exists() {
            let raw = std::fs::read_to_string(key_file)?;
            let key = decode_key(raw.trim())?;
            log::info!("Loaded OAuth token encryption key from {:?}", key_file);
            return Ok(Self {
                key,
                key_id: "file".to_string(),
            });
        }

        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        let encoded = URL_SAFE_NO_PAD.encode(key);
        if let Some(parent) = key_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        write_key_file(key_file, encoded.as_bytes())?;
        log::warn!(
            "Generated a new OAuth token encryption key at {:?}; supply {} in production",
            key_file,
            KEY_ENV
        );
        Ok(Self {
            key,
            key_id: "file".to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_key(key: [u8; 32]) -> Self {
        Self {
            key,
            key_id: "test".to_string(),
        }
    }

    /// Encrypt plaintext into the tagged `token_ref` payload persisted on a
    /// credential row.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Value, TokenCipherError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| TokenCipherError::InvalidKey(e.to_string()))?;

        let mut nonce_bytes = [0u8; 12];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| TokenCipherError::Encrypt(e.to_string()))?;

        Ok(json!({
            "kind": "aes-gcm",
            "key_id": self.key_id,
            "nonce": URL_SAFE_NO_PAD.encode(nonce_bytes),
            "ciphertext": URL_SAFE_NO_PAD.encode(ciphertext),
        }))
    }

    pub fn decrypt(&self, token_ref: &Value) -> Result<Vec<u8>, TokenCipherError> {
        if token_ref["kind"] != "aes-gcm" {
            return Err(TokenCipherError::Decrypt(format!(
                "unsupported token_ref kind: {}",
                token_ref["kind"]
            )));
        }
        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(token_ref["nonce"].as_str().unwrap_or_default())
            .map_err(|e| TokenCipherError::Decrypt(e.to_string()))?;
        let ciphertext = URL_SAFE_NO_PAD
            .decode(token_ref["ciphertext"].as_str().unwrap_or_default())
            .map_err(|e| TokenCipherError::Decrypt(e.to_string()))?;

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| TokenCipherError::InvalidKey(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| TokenCipherError::Decrypt(e.to_string()))
    }
}

fn decode_key(raw: &str) -> Result<[u8; 32], TokenCipherError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(raw.trim_end_matches('='))
        .map_err(|e| TokenCipherError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| TokenCipherError::InvalidKey("key must decode to 32 bytes".to_string()))
}

#[cfg(unix)]
fn write_key_file(path: &Path, contents: &[u8]) -> Result<(), TokenCipherError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, contents: &[u8]) -> Result<(), TokenCipherError> {
    std::fs::write(path, contents)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
