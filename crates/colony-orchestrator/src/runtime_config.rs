//! Layered configuration for the `colony` runtime binary: a JSON file on
//! disk merged with `COLONY_<SECTION>_<FIELD>` environment overrides,
//! modeled on the teacher orchestrator's `ConfigStore` (global/project/env
//! layers merged with `deep_merge`). Here there is a single on-disk layer
//! plus env, since the runtime binary has no per-user/per-project split.

use colony_types::ColonyResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::config::{ApprovalMode, OrchestratorConfig};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionThresholdsConfig {
    pub stage1: f64,
    pub stage2: f64,
    pub stage3: f64,
    pub stage4: f64,
    pub stage5: f64,
}

impl Default for CompressionThresholdsConfig {
    fn default() -> Self {
        // Mirrors colony-compression's STAGE1_THRESHOLD..STAGE5_THRESHOLD.
        Self {
            stage1: 70.0,
            stage2: 80.0,
            stage3: 85.0,
            stage4: 90.0,
            stage5: 95.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyConfig {
    pub max_parallel_local_workers: usize,
    pub max_parallel_inference_calls: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel_local_workers: 4,
            max_parallel_inference_calls: 4,
        }
    }
}

/// Top-level runtime configuration. Field names use `snake_case` on disk;
/// the environment override for `field_name` under section `SECTION` is
/// `COLONY_SECTION_FIELD_NAME` (uppercased).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    pub workspace_root: PathBuf,
    pub database_path: PathBuf,
    pub approval_mode: String,
    pub auto_budget_threshold_cents: i64,
    pub max_replans: u32,
    pub default_task_funding_cents: i64,
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub compression_thresholds: CompressionThresholdsConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Seconds to sleep between ticks when the orchestrator has no active
    /// goal to work on.
    pub idle_poll_interval_secs: u64,
    /// Token budget the compression engine measures utilization against.
    pub context_window_tokens: u64,
    /// Days of rotated JSON log files to keep before sweeping on startup.
    pub log_retention_days: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            workspace_root: PathBuf::from("./colony-workspace"),
            database_path: PathBuf::from("./colony-workspace/colony.db"),
            approval_mode: "auto".to_string(),
            auto_budget_threshold_cents: defaults.auto_budget_threshold_cents,
            max_replans: defaults.max_replans,
            default_task_funding_cents: defaults.default_task_funding_cents,
            default_timeout_ms: defaults.default_timeout_ms,
            compression_thresholds: CompressionThresholdsConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            idle_poll_interval_secs: 5,
            context_window_tokens: 100_000,
            log_retention_days: 14,
        }
    }
}

impl RuntimeConfig {
    /// Loads the on-disk file (if present), merges it over the defaults,
    /// then merges the environment layer on top, and deserializes the
    /// result. A missing file is not an error — the defaults plus any
    /// environment overrides are a complete, usable configuration.
    pub async fn load(path: impl AsRef<Path>) -> ColonyResult<Self> {
        let path = path.as_ref();
        let mut merged = serde_json::to_value(Self::default())?;

        if let Ok(true) = tokio::fs::try_exists(path).await {
            let raw = tokio::fs::read_to_string(path).await?;
            let disk: Value = serde_json::from_str(&raw)?;
            deep_merge(&mut merged, &disk);
        }

        deep_merge(&mut merged, &env_layer());

        Ok(serde_json::from_value(merged)?)
    }

    pub fn to_orchestrator_config(&self, self_address: Option<String>) -> OrchestratorConfig {
        OrchestratorConfig {
            approval_mode: parse_approval_mode(&self.approval_mode),
            auto_budget_threshold_cents: self.auto_budget_threshold_cents,
            max_replans: self.max_replans,
            default_task_funding_cents: self.default_task_funding_cents,
            default_timeout_ms: self.default_timeout_ms,
            self_address,
            dispatch_claim_batch: OrchestratorConfig::default().dispatch_claim_batch,
        }
    }
}

fn parse_approval_mode(raw: &str) -> ApprovalMode {
    match raw.to_ascii_lowercase().as_str() {
        "supervised" => ApprovalMode::Supervised,
        "consensus" => ApprovalMode::Consensus,
        _ => ApprovalMode::Auto,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

fn env_str(key: &str) -> Option<Value> {
    std::env::var(key).ok().map(Value::String)
}

fn env_i64(key: &str) -> Option<Value> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .map(Value::from)
}

fn env_u64(key: &str) -> Option<Value> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Value::from)
}

fn env_f64(key: &str) -> Option<Value> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .map(Value::from)
}

fn env_usize(key: &str) -> Option<Value> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .map(Value::from)
}

/// Builds the `COLONY_<SECTION>_<FIELD>` override layer as a JSON object
/// shaped like the on-disk config, so it can go through the same
/// `deep_merge` as the file layer.
fn env_layer() -> Value {
    let mut root = serde_json::Map::new();

    if let Some(v) = env_str("COLONY_ORCHESTRATOR_WORKSPACE_ROOT") {
        root.insert("workspace_root".into(), v);
    }
    if let Some(v) = env_str("COLONY_ORCHESTRATOR_DATABASE_PATH") {
        root.insert("database_path".into(), v);
    }
    if let Some(v) = env_str("COLONY_ORCHESTRATOR_APPROVAL_MODE") {
        root.insert("approval_mode".into(), v);
    }
    if let Some(v) = env_i64("COLONY_ORCHESTRATOR_AUTO_BUDGET_THRESHOLD_CENTS") {
        root.insert("auto_budget_threshold_cents".into(), v);
    }
    if let Some(v) = env_u64("COLONY_ORCHESTRATOR_MAX_REPLANS").and_then(|v| v.as_u64()).map(|v| Value::from(v as u32)) {
        root.insert("max_replans".into(), v);
    }
    if let Some(v) = env_i64("COLONY_ORCHESTRATOR_DEFAULT_TASK_FUNDING_CENTS") {
        root.insert("default_task_funding_cents".into(), v);
    }
    if let Some(v) = env_u64("COLONY_ORCHESTRATOR_DEFAULT_TIMEOUT_MS") {
        root.insert("default_timeout_ms".into(), v);
    }
    if let Some(v) = env_u64("COLONY_ORCHESTRATOR_IDLE_POLL_INTERVAL_SECS") {
        root.insert("idle_poll_interval_secs".into(), v);
    }
    if let Some(v) = env_u64("COLONY_ORCHESTRATOR_CONTEXT_WINDOW_TOKENS") {
        root.insert("context_window_tokens".into(), v);
    }
    if let Some(v) = env_u64("COLONY_ORCHESTRATOR_LOG_RETENTION_DAYS") {
        root.insert("log_retention_days".into(), v);
    }

    let mut compression = serde_json::Map::new();
    if let Some(v) = env_f64("COLONY_COMPRESSION_STAGE1") {
        compression.insert("stage1".into(), v);
    }
    if let Some(v) = env_f64("COLONY_COMPRESSION_STAGE2") {
        compression.insert("stage2".into(), v);
    }
    if let Some(v) = env_f64("COLONY_COMPRESSION_STAGE3") {
        compression.insert("stage3".into(), v);
    }
    if let Some(v) = env_f64("COLONY_COMPRESSION_STAGE4") {
        compression.insert("stage4".into(), v);
    }
    if let Some(v) = env_f64("COLONY_COMPRESSION_STAGE5") {
        compression.insert("stage5".into(), v);
    }
    if !compression.is_empty() {
        root.insert("compression_thresholds".into(), Value::Object(compression));
    }

    let mut concurrency = serde_json::Map::new();
    if let Some(v) = env_usize("COLONY_CONCURRENCY_MAX_PARALLEL_LOCAL_WORKERS") {
        concurrency.insert("max_parallel_local_workers".into(), v);
    }
    if let Some(v) = env_usize("COLONY_CONCURRENCY_MAX_PARALLEL_INFERENCE_CALLS") {
        concurrency.insert("max_parallel_inference_calls".into(), v);
    }
    if !concurrency.is_empty() {
        root.insert("concurrency".into(), Value::Object(concurrency));
    }

    Value::Object(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_defaults_when_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::load(dir.path().join("missing.json")).await.unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[tokio::test]
    async fn file_layer_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("colony.json");
        tokio::fs::write(&path, r#"{"max_replans": 7, "approval_mode": "supervised"}"#)
            .await
            .unwrap();
        let config = RuntimeConfig::load(&path).await.unwrap();
        assert_eq!(config.max_replans, 7);
        assert_eq!(config.approval_mode, "supervised");
        assert_eq!(config.default_timeout_ms, RuntimeConfig::default().default_timeout_ms);
    }

    #[tokio::test]
    async fn env_layer_overrides_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("colony.json");
        tokio::fs::write(&path, r#"{"max_replans": 7}"#).await.unwrap();
        std::env::set_var("COLONY_ORCHESTRATOR_MAX_REPLANS", "9");
        std::env::set_var("COLONY_COMPRESSION_STAGE1", "60.0");
        let config = RuntimeConfig::load(&path).await.unwrap();
        std::env::remove_var("COLONY_ORCHESTRATOR_MAX_REPLANS");
        std::env::remove_var("COLONY_COMPRESSION_STAGE1");
        assert_eq!(config.max_replans, 9);
        assert_eq!(config.compression_thresholds.stage1, 60.0);
    }

    #[test]
    fn approval_mode_parsing_defaults_to_auto() {
        assert_eq!(parse_approval_mode("supervised"), ApprovalMode::Supervised);
        assert_eq!(parse_approval_mode("CONSENSUS"), ApprovalMode::Consensus);
        assert_eq!(parse_approval_mode("garbage"), ApprovalMode::Auto);
    }
}
