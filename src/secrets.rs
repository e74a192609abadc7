use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde_json::Value;

use crate::vault::{VaultClient, VaultError};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("invalid secret reference format: {0}")]
    Parse(String),

    #[error("field '{field}' not found in vault item '{item_id}'")]
    FieldNotFound { item_id: String, field: String },

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
}

// ---------------------------------------------------------------------------
// SecretResolver
// ---------------------------------------------------------------------------

type SessionCache = HashMap<String, HashMap<String, (String, DateTime<Utc>)>>;

/// Expands inline `{{ bw:item:field }}` references into plaintext values.
///
/// Resolved values live only in process memory, keyed by (session, cache
/// key), and the whole session sub-map is dropped when the owning login
/// session ends. Nothing here is ever persisted.
pub struct SecretResolver {
    vault: Arc<dyn VaultClient>,
    cache: Mutex<SessionCache>,
    cache_ttl: Duration,
    pattern: Regex,
}

impl SecretResolver {
    pub fn new(vault: Arc<dyn VaultClient>, cache_ttl: Duration) -> Self {
        Self {
            vault,
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
            // {{ <ws> bw:<item-no-colon>:<field-no-brace> <ws> }}
            pattern: Regex::new(r"^\{\{\s*bw:([^:]+):([^}]+)\s*\}\}")
                .expect("reference pattern is a valid regex"),
        }
    }

    pub fn is_valid_reference(&self, reference: &str) -> bool {
        self.pattern.is_match(reference)
    }

    /// Extract `(item_id, field)` from a reference string.
    pub fn parse_reference(&self, reference: &str) -> Result<(String, String), SecretError> {
        let captures = self
            .pattern
            .captures(reference)
            .ok_or_else(|| SecretError::Parse(reference.to_string()))?;
        let item_id = captures[1].trim().to_string();
        let field = captures[2].trim().to_string();
        Ok((item_id, field))
    }

    fn cached(&self, session_id: &str, key: &str) -> Option<String> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let session_cache = cache.get_mut(session_id)?;
        let expired = match session_cache.get(key) {
            Some((value, expires_at)) if Utc::now() < *expires_at => {
                return Some(value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            session_cache.remove(key);
        }
        None
    }

    fn store_cached(&self, session_id: &str, key: &str, value: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(session_id.to_string())
            .or_default()
            .insert(key.to_string(), (value.to_string(), Utc::now() + self.cache_ttl));
    }

    /// Drop every cached value belonging to a session.
    pub fn clear_session_cache(&self, session_id: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(session_id);
    }

    /// Resolve one reference, hitting the vault at most once per
    /// (session, item:field) within the cache TTL.
    pub async fn resolve_reference(
        &self,
        reference: &str,
        session_id: &str,
        vault_handle: &str,
    ) -> Result<String, SecretError> {
        let (item_id, field) = self.parse_reference(reference)?;
        let cache_key = format!("{item_id}:{field}");

        if let Some(value) = self.cached(session_id, &cache_key) {
            return Ok(value);
        }

        let item = self.vault.get_item(&item_id, vault_handle).await?;
        let value =
            extract_field(&item, &field).ok_or_else(|| SecretError::FieldNotFound {
                item_id: item_id.clone(),
                field: field.clone(),
            })?;

        self.store_cached(session_id, &cache_key, &value);
        Ok(value)
    }

    /// Recursively resolve every reference inside a JSON config. Maps and
    /// arrays are walked; non-reference leaves pass through unchanged.
    pub async fn resolve_all(
        &self,
        config: &Value,
        session_id: &str,
        vault_handle: &str,
    ) -> Result<Value, SecretError> {
        self.resolve_value(config, session_id, vault_handle).await
    }

    fn resolve_value<'a>(
        &'a self,
        value: &'a Value,
        session_id: &'a str,
        vault_handle: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Value, SecretError>> + Send + 'a>> {
        Box::pin(async move {
            match value {
                Value::String(s) if self.is_valid_reference(s) => Ok(Value::String(
                    self.resolve_reference(s, session_id, vault_handle).await?,
                )),
                Value::Object(map) => {
                    let mut resolved = serde_json::Map::with_capacity(map.len());
                    for (key, nested) in map {
                        resolved.insert(
                            key.clone(),
                            self.resolve_value(nested, session_id, vault_handle).await?,
                        );
                    }
                    Ok(Value::Object(resolved))
                }
                Value::Array(items) => {
                    let mut resolved = Vec::with_capacity(items.len());
                    for item in items {
                        resolved.push(self.resolve_value(item, session_id, vault_handle).await?);
                    }
                    Ok(Value::Array(resolved))
                }
                other => Ok(other.clone()),
            }
        })
    }
}

/// Field extraction order: structured login fields first, then the item's
/// custom fields array by case-sensitive name match.
fn extract_field(item: &Value, field: &str) -> Option<String> {
    let structured = match field {
        "password" | "username" | "totp" => item.get("login").and_then(|l| l.get(field)),
        "notes" => item.get("notes"),
        _ => None,
    };
    if let Some(value) = structured.and_then(|v| v.as_str()) {
        return Some(value.to_string());
    }

    item.get("fields")?.as_array()?.iter().find_map(|f| {
        if f.get("name").and_then(|n| n.as_str()) == Some(field) {
            f.get("value").and_then(|v| v.as_str()).map(String::from)
        } else {
            None
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubVault {
        item: Value,
        get_item_calls: AtomicUsize,
    }

    impl StubVault {
        fn with_item(item: Value) -> Arc<Self> {
            Arc::new(Self {
                item,
                get_item_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl VaultClient for StubVault {
        async fn login_api_key(&self, _id: &str, _secret: &str) -> Result<(), VaultError> {
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
            self.get_item_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.item.clone())
        }
        async fn list_items(&self, _q: &str, _h: &str) -> Result<Value, VaultError> {
            Ok(json!([]))
        }
    }

    fn resolver_with(item: Value) -> (SecretResolver, Arc<StubVault>) {
        let vault = StubVault::with_item(item);
        let resolver = SecretResolver::new(vault.clone(), Duration::minutes(30));
        (resolver, vault)
    }

    fn login_item(password: &str) -> Value {
        json!({"login": {"password": password, "username": "alice"}, "fields": []})
    }

    // =====================================================================
    // Reference grammar
    // =====================================================================

    #[test]
    fn accepts_canonical_reference() {
        let (resolver, _) = resolver_with(json!({}));
        assert!(resolver.is_valid_reference("{{ bw:item-1:password }}"));
        assert!(resolver.is_valid_reference("{{bw:item-1:password}}"));
        assert!(resolver.is_valid_reference("{{  bw:item-1:api_key  }}"));
    }

    #[test]
    fn rejects_non_references() {
        let (resolver, _) = resolver_with(json!({}));
        assert!(!resolver.is_valid_reference("plain-value"));
        assert!(!resolver.is_valid_reference("{ bw:item:field }"));
        assert!(!resolver.is_valid_reference("{{ vault:item:field }}"));
        assert!(!resolver.is_valid_reference("{{ bw:itemfield }}"));
        assert!(!resolver.is_valid_reference("{{ bw::field }}"));
    }

    #[test]
    fn parse_extracts_trimmed_parts() {
        let (resolver, _) = resolver_with(json!({}));
        let (item, field) = resolver.parse_reference("{{ bw:item-1:password }}").unwrap();
        assert_eq!(item, "item-1");
        assert_eq!(field, "password");
    }

    #[test]
    fn parse_reference_roundtrips_through_canonical_form() {
        let (resolver, _) = resolver_with(json!({}));
        for reference in ["{{bw:abc:password}}", "{{ bw:abc:My Field }}"] {
            let (item, field) = resolver.parse_reference(reference).unwrap();
            let canonical = format!("{{{{ bw:{item}:{field} }}}}");
            let (item2, field2) = resolver.parse_reference(&canonical).unwrap();
            assert_eq!((item, field), (item2, field2));
        }
    }

    #[test]
    fn first_colon_separates_item_from_field() {
        let (resolver, _) = resolver_with(json!({}));
        let (item, field) = resolver.parse_reference("{{ bw:item:a:b }}").unwrap();
        assert_eq!(item, "item");
        assert_eq!(field, "a:b");
    }

    #[test]
    fn parse_failure_is_an_error() {
        let (resolver, _) = resolver_with(json!({}));
        assert!(matches!(
            resolver.parse_reference("nope"),
            Err(SecretError::Parse(_))
        ));
    }

    // =====================================================================
    // Field extraction
    // =====================================================================

    #[test]
    fn extracts_structured_fields() {
        let item = json!({
            "login": {"password": "pw", "username": "user", "totp": "otpauth://x"},
            "notes": "note-text",
            "fields": [],
        });
        assert_eq!(extract_field(&item, "password").as_deref(), Some("pw"));
        assert_eq!(extract_field(&item, "username").as_deref(), Some("user"));
        assert_eq!(extract_field(&item, "totp").as_deref(), Some("otpauth://x"));
        assert_eq!(extract_field(&item, "notes").as_deref(), Some("note-text"));
    }

    #[test]
    fn extracts_custom_field_case_sensitively() {
        let item = json!({
            "login": {},
            "fields": [
                {"name": "API_KEY", "value": "k-1"},
                {"name": "api_key", "value": "k-2"},
            ],
        });
        assert_eq!(extract_field(&item, "api_key").as_deref(), Some("k-2"));
        assert_eq!(extract_field(&item, "API_KEY").as_deref(), Some("k-1"));
        assert!(extract_field(&item, "Api_Key").is_none());
    }

    // =====================================================================
    // Resolution & cache
    // =====================================================================

    #[tokio::test]
    async fn resolves_and_caches_per_session() {
        let (resolver, vault) = resolver_with(login_item("s3cret"));

        let first = resolver
            .resolve_reference("{{ bw:item-1:password }}", "sess-1", "handle")
            .await
            .unwrap();
        let second = resolver
            .resolve_reference("{{ bw:item-1:password }}", "sess-1", "handle")
            .await
            .unwrap();

        assert_eq!(first, "s3cret");
        assert_eq!(first, second);
        assert_eq!(vault.get_item_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_is_isolated_per_session() {
        let (resolver, vault) = resolver_with(login_item("s3cret"));

        resolver
            .resolve_reference("{{ bw:item-1:password }}", "sess-1", "handle")
            .await
            .unwrap();
        resolver
            .resolve_reference("{{ bw:item-1:password }}", "sess-2", "handle")
            .await
            .unwrap();

        assert_eq!(vault.get_item_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn session_end_purges_cache() {
        let (resolver, vault) = resolver_with(login_item("s3cret"));

        resolver
            .resolve_reference("{{ bw:item-1:password }}", "sess-1", "handle")
            .await
            .unwrap();
        resolver.clear_session_cache("sess-1");
        resolver
            .resolve_reference("{{ bw:item-1:password }}", "sess-1", "handle")
            .await
            .unwrap();

        assert_eq!(vault.get_item_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_cache_entry_refetches() {
        let vault = StubVault::with_item(login_item("s3cret"));
        let resolver = SecretResolver::new(vault.clone(), Duration::milliseconds(-1));

        resolver
            .resolve_reference("{{ bw:item-1:password }}", "sess-1", "handle")
            .await
            .unwrap();
        resolver
            .resolve_reference("{{ bw:item-1:password }}", "sess-1", "handle")
            .await
            .unwrap();

        assert_eq!(vault.get_item_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_field_fails() {
        let (resolver, _) = resolver_with(json!({"login": {}, "fields": []}));
        let err = resolver
            .resolve_reference("{{ bw:item-1:password }}", "sess-1", "handle")
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::FieldNotFound { .. }));
    }

    // =====================================================================
    // resolve_all
    // =====================================================================

    #[tokio::test]
    async fn resolve_all_walks_maps_and_arrays() {
        let (resolver, _) = resolver_with(login_item("s3cret"));
        let config = json!({
            "env": {
                "API_KEY": "{{ bw:item-1:password }}",
                "PLAIN": "value",
                "PORT": 8080,
            },
            "args": ["{{ bw:item-1:password }}", "literal", {"nested": "{{ bw:item-1:password }}"}],
        });

        let resolved = resolver
            .resolve_all(&config, "sess-1", "handle")
            .await
            .unwrap();

        assert_eq!(resolved["env"]["API_KEY"], "s3cret");
        assert_eq!(resolved["env"]["PLAIN"], "value");
        assert_eq!(resolved["env"]["PORT"], 8080);
        assert_eq!(resolved["args"][0], "s3cret");
        assert_eq!(resolved["args"][1], "literal");
        assert_eq!(resolved["args"][2]["nested"], "s3cret");
    }

    #[tokio::test]
    async fn resolve_all_leaves_non_references_untouched() {
        let (resolver, vault) = resolver_with(login_item("s3cret"));
        let config = json!({"env": {"A": "1", "B": true, "C": null}});
        let resolved = resolver
            .resolve_all(&config, "sess-1", "handle")
            .await
            .unwrap();
        assert_eq!(resolved, config);
        assert_eq!(vault.get_item_calls.load(Ordering::SeqCst), 0);
    }
}
