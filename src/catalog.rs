use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown catalog source: {0}")]
    InvalidSource(String),

    #[error("upstream registry rate limited the request")]
    RateLimited { retry_after_seconds: Option<u64> },

    #[error("upstream registry unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("catalog fetch failed: {0}")]
    Fetch(String),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Closed set of catalog origins. Anything else fails before an outbound
/// call is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatalogSource {
    Docker,
    Official,
}

impl CatalogSource {
    pub fn parse(raw: &str) -> Result<Self, CatalogError> {
        match raw {
            "docker" => Ok(CatalogSource::Docker),
            "official" => Ok(CatalogSource::Official),
            other => Err(CatalogError::InvalidSource(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogSource::Docker => "docker",
            CatalogSource::Official => "official",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub docker_image: String,
    #[serde(default)]
    pub default_env: HashMap<String, String>,
    #[serde(default)]
    pub required_envs: Vec<String>,
    #[serde(default)]
    pub required_secrets: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogResponse {
    pub servers: Vec<CatalogItem>,
    pub total: usize,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub docker_url: String,
    pub official_url: String,
    pub max_pages: u32,
    pub page_delay: StdDuration,
    pub cache_ttl: Duration,
    pub fetch_timeout: StdDuration,
}

#[derive(Clone)]
struct CacheEntry {
    items: Vec<CatalogItem>,
    expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CatalogService
// ---------------------------------------------------------------------------

/// Read-mostly ingester for public MCP server catalogs.
///
/// Live cache entries are served immediately while a background refresh
/// runs; cold misses fetch synchronously, falling back to a stale cached
/// copy when the upstream is down.
pub struct CatalogService {
    http: reqwest::Client,
    config: CatalogConfig,
    cache: Arc<Mutex<HashMap<&'static str, CacheEntry>>>,
}

impl CatalogService {
    pub fn new(config: CatalogConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            config,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetch a source's catalog, serving from cache when possible.
    pub async fn get_catalog(&self, source: &str) -> Result<CatalogResponse, CatalogError> {
        let source = CatalogSource::parse(source)?;

        if let Some(items) = self.live_cached(source) {
            self.spawn_background_refresh(source);
            return Ok(CatalogResponse {
                total: items.len(),
                servers: items,
                cached: true,
                warning: None,
            });
        }

        match self.fetch_fresh(source).await {
            Ok((items, warning)) => {
                self.store_cache(source, &items);
                Ok(CatalogResponse {
                    total: items.len(),
                    servers: items,
                    cached: false,
                    warning,
                })
            }
            Err(e) => {
                // Read-only cold request: a stale copy beats an error page.
                if let Some(items) = self.any_cached(source) {
                    log::warn!(
                        "Catalog fetch for {} failed ({}); serving stale cache",
                        source.as_str(),
                        e
                    );
                    return Ok(CatalogResponse {
                        total: items.len(),
                        servers: items,
                        cached: true,
                        warning: Some(e.to_string()),
                    });
                }
                Err(e)
            }
        }
    }

    /// Keyword + category filter over a source's catalog.
    pub async fn search_catalog(
        &self,
        source: &str,
        query: &str,
        category: Option<&str>,
    ) -> Result<CatalogResponse, CatalogError> {
        let response = self.get_catalog(source).await?;
        let query_lower = query.to_lowercase();
        let servers: Vec<CatalogItem> = response
            .servers
            .into_iter()
            .filter(|item| {
                let keyword_hit = query_lower.is_empty()
                    || item.name.to_lowercase().contains(&query_lower)
                    || item.description.to_lowercase().contains(&query_lower);
                let category_hit = category.map_or(true, |c| item.category == c);
                keyword_hit && category_hit
            })
            .collect();
        Ok(CatalogResponse {
            total: servers.len(),
            servers,
            cached: response.cached,
            warning: response.warning,
        })
    }

    /// Drop cached data for one source, or everything.
    pub fn clear_cache(&self, source: Option<&str>) -> Result<(), CatalogError> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match source {
            Some(raw) => {
                let source = CatalogSource::parse(raw)?;
                cache.remove(source.as_str());
            }
            None => cache.clear(),
        }
        Ok(())
    }

    fn live_cached(&self, source: CatalogSource) -> Option<Vec<CatalogItem>> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(source.as_str())
            .filter(|entry| Utc::now() < entry.expires_at)
            .map(|entry| entry.items.clone())
    }

    fn any_cached(&self, source: CatalogSource) -> Option<Vec<CatalogItem>> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(source.as_str()).map(|entry| entry.items.clone())
    }

    fn store_cache(&self, source: CatalogSource, items: &[CatalogItem]) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            source.as_str(),
            CacheEntry {
                items: items.to_vec(),
                expires_at: Utc::now() + self.config.cache_ttl,
            },
        );
    }

    fn spawn_background_refresh(&self, source: CatalogSource) {
        let http = self.http.clone();
        let config = self.config.clone();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            match fetch_source(&http, &config, source).await {
                Ok((items, _)) => {
                    let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
                    cache.insert(
                        source.as_str(),
                        CacheEntry {
                            expires_at: Utc::now() + config.cache_ttl,
                            items,
                        },
                    );
                }
                Err(e) => {
                    // The cached items stay; the next hit still serves them.
                    log::warn!(
                        "Background catalog refresh for {} failed: {}",
                        source.as_str(),
                        e
                    );
                }
            }
        });
    }

    async fn fetch_fresh(
        &self,
        source: CatalogSource,
    ) -> Result<(Vec<CatalogItem>, Option<String>), CatalogError> {
        fetch_source(&self.http, &self.config, source).await
    }
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

async fn fetch_source(
    http: &reqwest::Client,
    config: &CatalogConfig,
    source: CatalogSource,
) -> Result<(Vec<CatalogItem>, Option<String>), CatalogError> {
    match source {
        CatalogSource::Docker => {
            let body = fetch_page(http, &config.docker_url).await?;
            Ok((parse_docker_catalog(&body), None))
        }
        CatalogSource::Official => fetch_official_paginated(http, config).await,
    }
}

/// Walk the official registry's cursor pagination.
///
/// The first request carries no cursor; `metadata.nextCursor` drives the
/// rest. The configured delay runs between pages, never after the last. A
/// failure on a later page keeps what was fetched and surfaces a warning.
async fn fetch_official_paginated(
    http: &reqwest::Client,
    config: &CatalogConfig,
) -> Result<(Vec<CatalogItem>, Option<String>), CatalogError> {
    let mut items: Vec<CatalogItem> = Vec::new();
    let mut cursor: Option<String> = None;
    let mut warning: Option<String> = None;

    for page in 0..config.max_pages {
        let url = match &cursor {
            None => config.official_url.clone(),
            Some(cursor) => format!(
                "{}?cursor={}",
                config.official_url,
                urlencoding::encode(cursor)
            ),
        };

        let body = match fetch_page(http, &url).await {
            Ok(body) => body,
            Err(e) if page == 0 => return Err(e),
            Err(e) => {
                log::warn!("Official registry page {} failed: {}", page + 1, e);
                warning = Some(format!(
                    "pagination stopped after {} page(s): {}",
                    page, e
                ));
                break;
            }
        };

        items.extend(parse_official_page(&body));
        cursor = body["metadata"]["nextCursor"]
            .as_str()
            .map(String::from)
            .filter(|c| !c.is_empty());

        if cursor.is_none() || page + 1 >= config.max_pages {
            break;
        }
        tokio::time::sleep(config.page_delay).await;
    }

    Ok((dedupe_by_id(items), warning))
}

async fn fetch_page(http: &reqwest::Client, url: &str) -> Result<Value, CatalogError> {
    let response = match http.get(url).send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() || e.is_connect() => {
            return Err(CatalogError::UpstreamUnavailable(e.to_string()))
        }
        Err(e) => return Err(CatalogError::Fetch(e.to_string())),
    };

    let status = response.status();
    if status.as_u16() == 429 {
        let retry_after_seconds = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        return Err(CatalogError::RateLimited {
            retry_after_seconds,
        });
    }
    if status.is_server_error() {
        return Err(CatalogError::UpstreamUnavailable(format!(
            "upstream returned {status}"
        )));
    }
    if !status.is_success() {
        return Err(CatalogError::Fetch(format!("upstream returned {status}")));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| CatalogError::Fetch(format!("invalid catalog JSON: {e}")))
}

/// `Retry-After` is either integer seconds or an HTTP-date, parsed relative
/// to now and floored at zero.
fn parse_retry_after(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds);
    }
    let when = DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    Some(delta.num_seconds().max(0) as u64)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn is_secret_env(key: &str) -> bool {
    let upper = key.to_uppercase();
    ["KEY", "SECRET", "TOKEN", "PASSWORD"]
        .iter()
        .any(|needle| upper.contains(needle))
}

/// Docker registry payloads are either a bare array of entries or an object
/// wrapping a `servers` list.
fn parse_docker_catalog(body: &Value) -> Vec<CatalogItem> {
    let entries = match body {
        Value::Array(entries) => entries.as_slice(),
        other => match other["servers"].as_array() {
            Some(entries) => entries.as_slice(),
            None => return Vec::new(),
        },
    };

    entries
        .iter()
        .filter_map(|entry| {
            let name = entry["name"].as_str()?;
            let required_envs: Vec<String> = entry["required_envs"]
                .as_array()
                .map(|envs| {
                    envs.iter()
                        .filter_map(|e| e.as_str())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            let required_secrets = required_envs
                .iter()
                .filter(|e| is_secret_env(e))
                .cloned()
                .collect();
            Some(CatalogItem {
                id: name.to_string(),
                name: name.to_string(),
                description: entry["description"].as_str().unwrap_or_default().to_string(),
                vendor: entry["vendor"].as_str().unwrap_or_default().to_string(),
                category: "general".to_string(),
                docker_image: entry["image"].as_str().unwrap_or_default().to_string(),
                default_env: HashMap::new(),
                required_envs,
                required_secrets,
            })
        })
        .collect()
}

/// One page of the official registry: `servers[].server` entries with OCI
/// package identifiers.
fn parse_official_page(body: &Value) -> Vec<CatalogItem> {
    let servers = match body["servers"].as_array() {
        Some(servers) => servers,
        None => return Vec::new(),
    };

    servers
        .iter()
        .filter_map(|wrapper| {
            let server = wrapper.get("server")?;
            let name = server["name"].as_str()?;

            let mut docker_image = String::new();
            if let Some(packages) = server["packages"].as_array() {
                for package in packages {
                    let identifier = package["identifier"].as_str().unwrap_or_default();
                    if identifier.is_empty() {
                        continue;
                    }
                    let registry_type = package["registryType"]
                        .as_str()
                        .or_else(|| package["type"].as_str())
                        .unwrap_or_default()
                        .to_lowercase();
                    if registry_type == "oci" {
                        docker_image = identifier.to_string();
                        break;
                    }
                    if docker_image.is_empty() {
                        docker_image = identifier.to_string();
                    }
                }
            }

            let vendor = server["repository"]["source"]
                .as_str()
                .or_else(|| server["repository"]["url"].as_str())
                .map(String::from)
                .or_else(|| name.split('/').next().map(String::from))
                .unwrap_or_default();

            Some(CatalogItem {
                id: name.to_string(),
                name: name.to_string(),
                description: server["description"].as_str().unwrap_or_default().to_string(),
                vendor,
                category: server["category"].as_str().unwrap_or("general").to_string(),
                docker_image,
                default_env: HashMap::new(),
                required_envs: Vec::new(),
                required_secrets: Vec::new(),
            })
        })
        .collect()
}

/// Stable-id dedup across pages: collisions get `-2`, `-3`, … suffixes.
fn dedupe_by_id(items: Vec<CatalogItem>) -> Vec<CatalogItem> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut result = Vec::with_capacity(items.len());
    for mut item in items {
        if seen.contains(&item.id) {
            let mut counter = 2;
            let mut candidate = format!("{}-{}", item.id, counter);
            while seen.contains(&candidate) {
                counter += 1;
                candidate = format!("{}-{}", item.id, counter);
            }
            item.id = candidate;
        }
        seen.insert(item.id.clone());
        result.push(item);
    }
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    type Scripted = (StatusCode, HeaderMap, Value);

    #[derive(Clone)]
    struct RegistryScript {
        responses: Arc<Mutex<VecDeque<Scripted>>>,
        hits: Arc<AtomicUsize>,
        urls: Arc<Mutex<Vec<String>>>,
    }

    async fn registry_endpoint(
        State(script): State<RegistryScript>,
        request: axum::extract::Request,
    ) -> (StatusCode, HeaderMap, axum::Json<Value>) {
        script.hits.fetch_add(1, Ordering::SeqCst);
        script
            .urls
            .lock()
            .unwrap()
            .push(request.uri().to_string());
        let (status, headers, body) = script
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or((StatusCode::OK, HeaderMap::new(), json!({"servers": []})));
        (status, headers, axum::Json(body))
    }

    async fn spawn_registry(responses: Vec<Scripted>) -> (String, RegistryScript) {
        let script = RegistryScript {
            responses: Arc::new(Mutex::new(responses.into())),
            hits: Arc::new(AtomicUsize::new(0)),
            urls: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/v0/servers", get(registry_endpoint))
            .with_state(script.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/v0/servers"), script)
    }

    fn service(url: &str, page_delay_ms: u64) -> CatalogService {
        CatalogService::new(CatalogConfig {
            docker_url: url.to_string(),
            official_url: url.to_string(),
            max_pages: 20,
            page_delay: StdDuration::from_millis(page_delay_ms),
            cache_ttl: Duration::seconds(3600),
            fetch_timeout: StdDuration::from_secs(5),
        })
    }

    fn ok(body: Value) -> Scripted {
        (StatusCode::OK, HeaderMap::new(), body)
    }

    fn official_page(prefix: &str, count: usize, next_cursor: Option<&str>) -> Value {
        let servers: Vec<Value> = (0..count)
            .map(|i| {
                json!({
                    "server": {
                        "name": format!("{prefix}-{i}"),
                        "description": format!("Server {prefix} {i}"),
                        "packages": [{"identifier": format!("test/{prefix}:{i}"), "registryType": "oci"}],
                    },
                    "_meta": {},
                })
            })
            .collect();
        let mut metadata = json!({"count": count});
        if let Some(cursor) = next_cursor {
            metadata["nextCursor"] = json!(cursor);
        }
        json!({"servers": servers, "metadata": metadata})
    }

    // =====================================================================
    // Source validation
    // =====================================================================

    #[tokio::test]
    async fn unknown_source_fails_before_any_outbound_call() {
        let (url, script) = spawn_registry(vec![]).await;
        let svc = service(&url, 10);

        let err = svc.get_catalog("github").await.unwrap_err();
        assert!(matches!(err, CatalogError::InvalidSource(_)));
        assert_eq!(script.hits.load(Ordering::SeqCst), 0);
    }

    // =====================================================================
    // Official pagination
    // =====================================================================

    #[tokio::test]
    async fn single_page_without_cursor() {
        let (url, script) = spawn_registry(vec![ok(official_page("solo", 30, None))]).await;
        let svc = service(&url, 100);

        let start = Instant::now();
        let response = svc.get_catalog("official").await.unwrap();
        assert_eq!(response.total, 30);
        assert!(!response.cached);
        assert_eq!(script.hits.load(Ordering::SeqCst), 1);
        // No inter-page delay on a single page.
        assert!(start.elapsed() < StdDuration::from_millis(100));
        assert!(!script.urls.lock().unwrap()[0].contains("cursor="));
    }

    #[tokio::test]
    async fn three_pages_follow_cursors_with_delays() {
        let (url, script) = spawn_registry(vec![
            ok(official_page("page1", 30, Some("cursor-page2"))),
            ok(official_page("page2", 30, Some("cursor-page3"))),
            ok(official_page("page3", 30, None)),
        ])
        .await;
        let svc = service(&url, 100);

        let start = Instant::now();
        let response = svc.get_catalog("official").await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(response.total, 90);
        assert!(!response.cached);
        assert!(response.warning.is_none());
        assert_eq!(script.hits.load(Ordering::SeqCst), 3);

        let urls = script.urls.lock().unwrap();
        assert!(!urls[0].contains("cursor="));
        assert!(urls[1].contains("cursor=cursor-page2"));
        assert!(urls[2].contains("cursor=cursor-page3"));

        // Exactly two inter-page sleeps of the configured delay.
        assert!(elapsed >= StdDuration::from_millis(200));
        assert!(elapsed < StdDuration::from_millis(400));
    }

    #[tokio::test]
    async fn max_pages_caps_the_walk() {
        let (url, script) = spawn_registry(vec![
            ok(official_page("p1", 5, Some("c2"))),
            ok(official_page("p2", 5, Some("c3"))),
            ok(official_page("p3", 5, Some("c4"))),
        ])
        .await;
        let mut svc = service(&url, 1);
        svc.config.max_pages = 2;

        let response = svc.get_catalog("official").await.unwrap();
        assert_eq!(response.total, 10);
        assert_eq!(script.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn later_page_failure_is_partial_success() {
        let (url, script) = spawn_registry(vec![
            ok(official_page("p1", 30, Some("c2"))),
            (StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), json!({})),
        ])
        .await;
        let svc = service(&url, 1);

        let response = svc.get_catalog("official").await.unwrap();
        assert_eq!(response.total, 30);
        assert!(!response.cached);
        assert!(response.warning.is_some());
        assert_eq!(script.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicate_ids_across_pages_are_suffixed() {
        let page1 = json!({
            "servers": [
                {"server": {"name": "test-1", "packages": []}},
                {"server": {"name": "test-2", "packages": []}},
            ],
            "metadata": {"nextCursor": "c2"},
        });
        let page2 = json!({
            "servers": [
                {"server": {"name": "test-2", "packages": []}},
                {"server": {"name": "test-3", "packages": []}},
            ],
            "metadata": {},
        });
        let (url, _script) = spawn_registry(vec![ok(page1), ok(page2)]).await;
        let svc = service(&url, 1);

        let response = svc.get_catalog("official").await.unwrap();
        let mut ids: Vec<String> = response.servers.iter().map(|s| s.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["test-1", "test-2", "test-2-2", "test-3"]);
    }

    // =====================================================================
    // Upstream errors
    // =====================================================================

    #[tokio::test]
    async fn rate_limit_with_integer_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", "60".parse().unwrap());
        let (url, _script) =
            spawn_registry(vec![(StatusCode::TOO_MANY_REQUESTS, headers, json!({}))]).await;
        let svc = service(&url, 1);

        let err = svc.get_catalog("docker").await.unwrap_err();
        match err {
            CatalogError::RateLimited {
                retry_after_seconds,
            } => assert_eq!(retry_after_seconds, Some(60)),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_without_retry_after() {
        let (url, _script) = spawn_registry(vec![(
            StatusCode::TOO_MANY_REQUESTS,
            HeaderMap::new(),
            json!({}),
        )])
        .await;
        let svc = service(&url, 1);

        let err = svc.get_catalog("docker").await.unwrap_err();
        match err {
            CatalogError::RateLimited {
                retry_after_seconds,
            } => assert!(retry_after_seconds.is_none()),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn retry_after_http_date_parses_relative_to_now() {
        let future = (Utc::now() + Duration::seconds(90)).to_rfc2822();
        let seconds = parse_retry_after(&future).unwrap();
        assert!((85..=90).contains(&seconds));

        let past = (Utc::now() - Duration::seconds(90)).to_rfc2822();
        assert_eq!(parse_retry_after(&past), Some(0));

        assert!(parse_retry_after("not-a-date").is_none());
    }

    #[tokio::test]
    async fn server_error_is_upstream_unavailable() {
        let (url, _script) = spawn_registry(vec![(
            StatusCode::SERVICE_UNAVAILABLE,
            HeaderMap::new(),
            json!({}),
        )])
        .await;
        let svc = service(&url, 1);

        let err = svc.get_catalog("docker").await.unwrap_err();
        assert!(matches!(err, CatalogError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn connect_failure_is_upstream_unavailable() {
        // Nothing listens on this port.
        let svc = service("http://127.0.0.1:9/v0/servers", 1);
        let err = svc.get_catalog("docker").await.unwrap_err();
        assert!(matches!(err, CatalogError::UpstreamUnavailable(_)));
    }

    // =====================================================================
    // Cache behavior
    // =====================================================================

    #[tokio::test]
    async fn live_cache_serves_immediately() {
        let (url, script) = spawn_registry(vec![
            ok(official_page("p", 3, None)),
            ok(official_page("p", 3, None)),
        ])
        .await;
        let svc = service(&url, 1);

        let first = svc.get_catalog("official").await.unwrap();
        assert!(!first.cached);

        let second = svc.get_catalog("official").await.unwrap();
        assert!(second.cached);
        assert_eq!(second.total, 3);

        // The background refresh eventually lands its own request.
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert_eq!(script.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_cache_survives_upstream_failure() {
        let (url, _script) = spawn_registry(vec![
            ok(official_page("p", 3, None)),
            (StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new(), json!({})),
        ])
        .await;
        let mut svc = service(&url, 1);
        // Everything cached is immediately stale.
        svc.config.cache_ttl = Duration::seconds(-1);

        let first = svc.get_catalog("official").await.unwrap();
        assert!(!first.cached);

        let second = svc.get_catalog("official").await.unwrap();
        assert!(second.cached);
        assert_eq!(second.total, 3);
        assert!(second.warning.is_some());
    }

    #[tokio::test]
    async fn clear_cache_forces_refetch() {
        let (url, script) = spawn_registry(vec![
            ok(official_page("p", 3, None)),
            ok(official_page("p", 5, None)),
        ])
        .await;
        let svc = service(&url, 1);

        svc.get_catalog("official").await.unwrap();
        svc.clear_cache(Some("official")).unwrap();
        let fresh = svc.get_catalog("official").await.unwrap();
        assert!(!fresh.cached);
        assert_eq!(fresh.total, 5);
        assert_eq!(script.hits.load(Ordering::SeqCst), 2);
    }

    // =====================================================================
    // Search & parsing
    // =====================================================================

    #[tokio::test]
    async fn search_filters_by_keyword_and_category() {
        let body = json!({
            "servers": [
                {"server": {"name": "github-tools", "description": "GitHub helpers", "packages": []}},
                {"server": {"name": "slack-bridge", "description": "Chat relay", "packages": []}},
            ],
            "metadata": {},
        });
        let (url, _script) = spawn_registry(vec![ok(body)]).await;
        let svc = service(&url, 1);

        let hits = svc.search_catalog("official", "github", None).await.unwrap();
        assert_eq!(hits.total, 1);
        assert_eq!(hits.servers[0].name, "github-tools");

        let misses = svc
            .search_catalog("official", "github", Some("database"))
            .await
            .unwrap();
        assert_eq!(misses.total, 0);
    }

    #[test]
    fn docker_catalog_parses_array_payload() {
        let body = json!([
            {"name": "server-a", "description": "A", "image": "org/a:latest",
             "required_envs": ["API_KEY", "REGION"]},
            {"description": "missing name is skipped"},
        ]);
        let items = parse_docker_catalog(&body);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].docker_image, "org/a:latest");
        assert_eq!(items[0].required_secrets, vec!["API_KEY"]);
        assert_eq!(items[0].required_envs.len(), 2);
    }

    #[test]
    fn official_page_prefers_oci_identifier() {
        let body = json!({
            "servers": [{
                "server": {
                    "name": "mixed",
                    "packages": [
                        {"identifier": "npm-package", "registryType": "npm"},
                        {"identifier": "org/image:1", "registryType": "oci"},
                    ],
                },
            }],
        });
        let items = parse_official_page(&body);
        assert_eq!(items[0].docker_image, "org/image:1");
    }

    #[test]
    fn secret_env_heuristic() {
        assert!(is_secret_env("API_KEY"));
        assert!(is_secret_env("client_secret"));
        assert!(is_secret_env("AUTH_TOKEN"));
        assert!(is_secret_env("DB_PASSWORD"));
        assert!(!is_secret_env("REGION"));
    }
}
