use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;

/// The single configuration object of §6, merged from defaults, an optional JSON file,
/// and environment variables — the teacher's `ConfigStore` layering discipline
/// (`tandem-core::config`), simplified from six layers to three since this service has no
/// per-project/global/managed/runtime/CLI distinction to make (see `DESIGN.md`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// C1 timeout: how long a parked interrupt waits before a synthetic reject (§6).
    pub interrupt_deadline_seconds: u64,
    /// N in §4.5: the bounded worker pool size.
    pub worker_pool_size: usize,
    /// Admission cap across concurrently running missions.
    pub max_concurrent_missions: usize,
    /// Fallback task timeout when a plan's instance omits its own.
    pub default_task_timeout_seconds: u64,
    /// Used when a plan omits `fail_fast`.
    pub fail_fast_default: bool,
    /// Per-subscriber event backlog before backpressure drops the oldest.
    pub event_subscriber_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interrupt_deadline_seconds: 300,
            worker_pool_size: 4,
            max_concurrent_missions: 8,
            default_task_timeout_seconds: 600,
            fail_fast_default: true,
            event_subscriber_buffer: 256,
        }
    }
}

impl Config {
    /// Loads defaults, then overlays an optional JSON file, then `EXPEDITION_*`
    /// environment variables — each layer only overriding the keys it sets.
    pub async fn load(file_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut merged = json!({});
        deep_merge(&mut merged, &serde_json::to_value(Config::default())?);

        if let Some(path) = file_path {
            match fs::read_to_string(path).await {
                Ok(raw) => {
                    let file_value: Value = serde_json::from_str(&raw)?;
                    deep_merge(&mut merged, &file_value);
                    tracing::info!(path = %path.display(), "loaded config file");
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "config file absent, using defaults");
                }
                Err(err) => return Err(err.into()),
            }
        }

        deep_merge(&mut merged, &env_layer());
        Ok(serde_json::from_value(merged)?)
    }
}

fn env_layer() -> Value {
    let mut map = serde_json::Map::new();
    for (field, env_key) in [
        ("interrupt_deadline_seconds", "EXPEDITION_INTERRUPT_DEADLINE_SECONDS"),
        ("worker_pool_size", "EXPEDITION_WORKER_POOL_SIZE"),
        ("max_concurrent_missions", "EXPEDITION_MAX_CONCURRENT_MISSIONS"),
        (
            "default_task_timeout_seconds",
            "EXPEDITION_DEFAULT_TASK_TIMEOUT_SECONDS",
        ),
        ("fail_fast_default", "EXPEDITION_FAIL_FAST_DEFAULT"),
        ("event_subscriber_buffer", "EXPEDITION_EVENT_SUBSCRIBER_BUFFER"),
    ] {
        if let Ok(raw) = std::env::var(env_key) {
            if let Ok(parsed) = serde_json::from_str::<Value>(&raw) {
                map.insert(field.to_string(), parsed);
            } else {
                map.insert(field.to_string(), Value::String(raw));
            }
        }
    }
    Value::Object(map)
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_merge(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}
