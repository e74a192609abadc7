use std::collections::HashMap;
use std::sync::Mutex;

/// Minimal labelled counter / observation recorder.
///
/// Keys are rendered as `name{k=v,...}` with labels sorted, so the same
/// label set always lands on the same series.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: Mutex<HashMap<String, u64>>,
    observations: Mutex<HashMap<String, Vec<f64>>>,
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut labels: Vec<_> = labels.to_vec();
    labels.sort_unstable();
    let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str, labels: &[(&str, &str)]) {
        let key = series_key(name, labels);
        *self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_insert(0) += 1;
    }

    pub fn observe(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = series_key(name, labels);
        self.observations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_default()
            .push(value);
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = series_key(name, labels);
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    pub fn observation_count(&self, name: &str, labels: &[(&str, &str)]) -> usize {
        let key = series_key(name, labels);
        self.observations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
