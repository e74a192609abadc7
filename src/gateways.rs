use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

use crate::metrics::MetricsRecorder;
use crate::store::{GatewayAllowEntry, StateStore, StoreError};

const DEFAULT_PERIODIC_INTERVAL: StdDuration = StdDuration::from_secs(300);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway URL rejected by allowlist: {0}")]
    Allowlist(String),

    #[error("gateway not found: {0}")]
    NotFound(String),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Per-request allowlist override. Wins over a stored entry with the same
/// id when its version is higher.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayAllowOverride {
    pub id: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub value: String,
    pub enabled: bool,
    pub version: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayRegistrationRequest {
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(rename = "type")]
    pub gateway_type: String,
    #[serde(default)]
    pub allowlist_overrides: Vec<GatewayAllowOverride>,
    /// Disable the 5-minute periodic probe for this gateway.
    #[serde(default)]
    pub skip_periodic: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    pub status: String,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayRecord {
    pub gateway_id: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub token: String,
    #[serde(rename = "type")]
    pub gateway_type: String,
    pub created_at: DateTime<Utc>,
    pub last_health: Option<GatewayHealth>,
}

// ---------------------------------------------------------------------------
// Probe seam
// ---------------------------------------------------------------------------

/// One healthcheck attempt. Returns the observed latency in milliseconds.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, url: &str, token: &str) -> Result<f64, String>;
}

/// GETs `<url>/healthcheck` with a bearer token when one is configured.
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: StdDuration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, url: &str, token: &str) -> Result<f64, String> {
        let target = format!("{}/healthcheck", url.trim_end_matches('/'));
        let mut request = self.client.get(&target);
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }

        let start = Instant::now();
        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("healthcheck returned {}", response.status()));
        }
        Ok(start.elapsed().as_secs_f64() * 1000.0)
    }
}

// ---------------------------------------------------------------------------
// GatewayService
// ---------------------------------------------------------------------------

/// External gateway registrations with backoff-governed health probes.
pub struct GatewayService {
    store: Arc<StateStore>,
    metrics: Arc<MetricsRecorder>,
    probe: Arc<dyn HealthProbe>,
    gateways: Arc<Mutex<HashMap<String, GatewayRecord>>>,
    periodic_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    backoff: Vec<StdDuration>,
    periodic_interval: StdDuration,
    enable_periodic: bool,
}

impl GatewayService {
    pub fn new(
        store: Arc<StateStore>,
        metrics: Arc<MetricsRecorder>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            store,
            metrics,
            probe,
            gateways: Arc::new(Mutex::new(HashMap::new())),
            periodic_tasks: Mutex::new(HashMap::new()),
            backoff: vec![
                StdDuration::from_secs(1),
                StdDuration::from_secs(2),
                StdDuration::from_secs(4),
            ],
            periodic_interval: DEFAULT_PERIODIC_INTERVAL,
            enable_periodic: true,
        }
    }

    pub fn with_backoff(mut self, backoff: Vec<StdDuration>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_periodic(mut self, enabled: bool, interval: StdDuration) -> Self {
        self.enable_periodic = enabled;
        self.periodic_interval = interval;
        self
    }

    /// Register an external gateway: validate the URL against the merged
    /// allowlist, persist the registration in memory, probe it once, and
    /// schedule the periodic probe.
    pub async fn register_gateway(
        &self,
        request: GatewayRegistrationRequest,
        correlation_id: Option<&str>,
    ) -> Result<GatewayRecord, GatewayError> {
        let entries = self.merged_allowlist(&request.allowlist_overrides)?;

        match validate_against_allowlist(&request.url, &request.gateway_type, &entries) {
            Ok(()) => {
                self.metrics
                    .increment("gateway_allowlist_total", &[("result", "pass")]);
                self.audit_allowlist("gateway_allowlist_pass", correlation_id, &request);
            }
            Err(e) => {
                self.metrics
                    .increment("gateway_allowlist_total", &[("result", "reject")]);
                self.audit_allowlist("gateway_allowlist_reject", correlation_id, &request);
                return Err(e);
            }
        }

        let mut record = GatewayRecord {
            gateway_id: Uuid::new_v4().to_string(),
            url: request.url.clone(),
            token: request.token.clone(),
            gateway_type: request.gateway_type.clone(),
            created_at: Utc::now(),
            last_health: None,
        };

        // The token is masked by the store's metadata sanitization.
        if let Err(e) = self.store.record_audit_log(
            "gateways",
            "gateway_registered",
            "system",
            correlation_id.unwrap_or(&record.gateway_id),
            &json!({
                "gateway_id": record.gateway_id.clone(),
                "url": record.url.clone(),
                "type": record.gateway_type.clone(),
                "token": record.token.clone(),
            }),
        ) {
            log::warn!("Failed to audit gateway registration: {}", e);
        }

        record.last_health = Some(self.run_healthcheck(&record).await);
        self.gateways
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.gateway_id.clone(), record.clone());

        if self.enable_periodic && !request.skip_periodic {
            self.schedule_periodic(&record.gateway_id);
        }
        Ok(record)
    }

    pub fn get_gateway(&self, gateway_id: &str) -> Option<GatewayRecord> {
        self.gateways
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(gateway_id)
            .cloned()
    }

    /// Run a manual health probe against a registered gateway.
    pub async fn healthcheck(&self, gateway_id: &str) -> Result<GatewayRecord, GatewayError> {
        let record = self
            .get_gateway(gateway_id)
            .ok_or_else(|| GatewayError::NotFound(gateway_id.to_string()))?;

        let health = self.run_healthcheck(&record).await;
        let mut gateways = self.gateways.lock().unwrap_or_else(|e| e.into_inner());
        let record = gateways
            .get_mut(gateway_id)
            .ok_or_else(|| GatewayError::NotFound(gateway_id.to_string()))?;
        record.last_health = Some(health);
        Ok(record.clone())
    }

    /// Cancel all periodic probes and await their completion, suppressing
    /// cancellation errors.
    pub async fn shutdown(&self) {
        let tasks: Vec<(String, JoinHandle<()>)> = {
            let mut periodic = self.periodic_tasks.lock().unwrap_or_else(|e| e.into_inner());
            periodic.drain().collect()
        };
        for (gateway_id, task) in tasks {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    log::warn!("Periodic probe for {} ended abnormally: {}", gateway_id, e);
                }
            }
        }
    }

    fn schedule_periodic(&self, gateway_id: &str) {
        let mut tasks = self.periodic_tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.contains_key(gateway_id) {
            return;
        }

        let probe = self.probe.clone();
        let metrics = self.metrics.clone();
        let gateways = self.gateways.clone();
        let backoff = self.backoff.clone();
        let gateway_id_owned = gateway_id.to_string();
        let interval = self.periodic_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let record = {
                    let gateways = gateways.lock().unwrap_or_else(|e| e.into_inner());
                    gateways.get(&gateway_id_owned).cloned()
                };
                // Gateway dropped out from under us; stop probing.
                let Some(record) = record else { break };
                let health = probe_with_backoff(&*probe, &metrics, &backoff, &record).await;
                let mut gateways = gateways.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(record) = gateways.get_mut(&gateway_id_owned) {
                    record.last_health = Some(health);
                }
            }
        });
        tasks.insert(gateway_id.to_string(), handle);
    }

    async fn run_healthcheck(&self, record: &GatewayRecord) -> GatewayHealth {
        probe_with_backoff(&*self.probe, &self.metrics, &self.backoff, record).await
    }

    /// Merge the stored allowlist with request overrides. Higher version
    /// wins on id collision; disabled entries drop out of the result.
    fn merged_allowlist(
        &self,
        overrides: &[GatewayAllowOverride],
    ) -> Result<Vec<GatewayAllowEntry>, GatewayError> {
        let mut stored = self.store.list_gateway_allow_entries()?;
        stored.sort_by_key(|e| e.version);

        let mut merged: HashMap<String, GatewayAllowEntry> = HashMap::new();
        for entry in stored {
            merged.insert(entry.id.clone(), entry);
        }
        for o in overrides {
            let wins = merged
                .get(&o.id)
                .map(|existing| o.version > existing.version)
                .unwrap_or(true);
            if wins {
                merged.insert(
                    o.id.clone(),
                    GatewayAllowEntry {
                        id: o.id.clone(),
                        entry_type: o.entry_type.clone(),
                        value: o.value.clone(),
                        created_by: "override".to_string(),
                        created_at: Utc::now(),
                        enabled: o.enabled,
                        version: o.version,
                    },
                );
            }
        }

        Ok(merged.into_values().filter(|e| e.enabled).collect())
    }

    fn audit_allowlist(
        &self,
        action: &str,
        correlation_id: Option<&str>,
        request: &GatewayRegistrationRequest,
    ) {
        if let Err(e) = self.store.record_audit_log(
            "gateways",
            action,
            "system",
            correlation_id.unwrap_or("gateway-allowlist"),
            &json!({"url": request.url.clone(), "type": request.gateway_type.clone()}),
        ) {
            log::warn!("Failed to audit allowlist decision: {}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Probe with the retry schedule, then fold latencies into the health
/// summary.
async fn probe_with_backoff(
    probe: &dyn HealthProbe,
    metrics: &MetricsRecorder,
    backoff: &[StdDuration],
    record: &GatewayRecord,
) -> GatewayHealth {
    let mut latencies: Vec<f64> = Vec::new();
    let mut last_error: Option<String> = None;
    let mut had_errors = false;

    for attempt in 0..=backoff.len() {
        if attempt > 0 {
            tokio::time::sleep(backoff[attempt - 1]).await;
        }
        match probe.check(&record.url, &record.token).await {
            Ok(latency_ms) => {
                latencies.push(latency_ms);
                last_error = None;
                break;
            }
            Err(e) => {
                had_errors = true;
                log::warn!(
                    "Healthcheck failed ({}/{}) gateway={} reason={}",
                    attempt + 1,
                    backoff.len() + 1,
                    record.gateway_id,
                    e
                );
                last_error = Some(e);
            }
        }
    }

    let health = build_health(&latencies, had_errors, last_error);
    metrics.increment(
        "gateway_healthcheck_total",
        &[("result", health.status.as_str())],
    );
    for value in [health.p50_ms, health.p95_ms, health.p99_ms] {
        metrics.observe(
            "gateway_healthcheck_latency_ms",
            value,
            &[("status", health.status.as_str())],
        );
    }
    if health.last_error.is_some() {
        metrics.increment(
            "gateway_healthcheck_errors",
            &[("status", health.status.as_str()), ("category", "last_error")],
        );
    }
    health
}

fn validate_against_allowlist(
    url: &str,
    gateway_type: &str,
    entries: &[GatewayAllowEntry],
) -> Result<(), GatewayError> {
    let parsed =
        Url::parse(url).map_err(|e| GatewayError::Allowlist(format!("invalid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(GatewayError::Allowlist(
            "only http/https gateway URLs are allowed".to_string(),
        ));
    }

    let domain = parsed.host_str().unwrap_or_default();
    let path = if parsed.path().is_empty() {
        "/"
    } else {
        parsed.path()
    };

    for entry in entries {
        let matched = match entry.entry_type.as_str() {
            "domain" => domain == entry.value || domain.ends_with(&format!(".{}", entry.value)),
            "pattern" => glob_match(&entry.value, &format!("{domain}{path}")),
            "service" => gateway_type == entry.value,
            _ => false,
        };
        if matched {
            return Ok(());
        }
    }

    Err(GatewayError::Allowlist(format!(
        "no allowlist entry matches {url}"
    )))
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let mut regex_str = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex_str.push_str(".*"),
            '?' => regex_str.push('.'),
            '.' | '+' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '$' | '|' | '\\' => {
                regex_str.push('\\');
                regex_str.push(ch);
            }
            _ => regex_str.push(ch),
        }
    }
    regex_str.push('$');
    regex::Regex::new(&regex_str)
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

fn build_health(latencies: &[f64], had_errors: bool, last_error: Option<String>) -> GatewayHealth {
    if latencies.is_empty() {
        return GatewayHealth {
            status: "unhealthy".to_string(),
            p50_ms: 0.0,
            p95_ms: 0.0,
            p99_ms: 0.0,
            last_error,
        };
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let status = if had_errors { "degraded" } else { "healthy" };
    GatewayHealth {
        status: status.to_string(),
        p50_ms: percentile(&sorted, 50.0),
        p95_ms: percentile(&sorted, 95.0),
        p99_ms: percentile(&sorted, 99.0),
        last_error,
    }
}

/// Percentile by linear interpolation between the neighbors of the ordered
/// sample.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let k = (sorted.len() - 1) as f64 * (p / 100.0);
    let floor = k.floor() as usize;
    let ceil = k.ceil() as usize;
    if floor == ceil {
        return sorted[floor];
    }
    sorted[floor] * (ceil as f64 - k) + sorted[ceil] * (k - floor as f64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
