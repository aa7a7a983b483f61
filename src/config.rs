// =============================================================================
// Engine Configuration: Thresholds, weights and cache settings with atomic save
// =============================================================================
//
// Every tunable of the confluence engine lives here.  All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.  Persistence uses an atomic tmp + rename.
//
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::anomaly::AnomalyThresholdConfig;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_buy_threshold() -> f64 {
    65.0
}

fn default_sell_threshold() -> f64 {
    35.0
}

fn default_min_reliability() -> f64 {
    0.4
}

fn default_component_weights() -> HashMap<String, f64> {
    [
        "momentum",
        "volume",
        "orderflow",
        "orderbook",
        "sentiment",
        "price_structure",
    ]
    .iter()
    .map(|name| (name.to_string(), 1.0))
    .collect()
}

fn default_window_minutes() -> i64 {
    30
}

fn default_analysis_interval_secs() -> u64 {
    5
}

fn default_snapshot_dir() -> String {
    "snapshots".to_string()
}

fn default_confluence_ttl_secs() -> u64 {
    30
}

fn default_whale_ttl_secs() -> u64 {
    15
}

fn default_compute_timeout_secs() -> u64 {
    10
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

// =============================================================================
// CacheSettings
// =============================================================================

/// TTLs and time budgets for the single-flight cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Lifetime of a `confluence:<SYMBOL>` entry.
    #[serde(default = "default_confluence_ttl_secs")]
    pub confluence_ttl_secs: u64,

    /// Lifetime of a `whale:<SYMBOL>` entry.
    #[serde(default = "default_whale_ttl_secs")]
    pub whale_ttl_secs: u64,

    /// Time budget for one computation before the placeholder is returned.
    #[serde(default = "default_compute_timeout_secs")]
    pub compute_timeout_secs: u64,

    /// Period of the expired-entry sweep.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl CacheSettings {
    pub fn confluence_ttl(&self) -> Duration {
        Duration::from_secs(self.confluence_ttl_secs)
    }

    pub fn whale_ttl(&self) -> Duration {
        Duration::from_secs(self.whale_ttl_secs)
    }

    pub fn compute_timeout(&self) -> Duration {
        Duration::from_secs(self.compute_timeout_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            confluence_ttl_secs: default_confluence_ttl_secs(),
            whale_ttl_secs: default_whale_ttl_secs(),
            compute_timeout_secs: default_compute_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the confluence engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Symbols & loop ------------------------------------------------------

    /// Symbols analysed every cycle.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Seconds between analysis cycles.
    #[serde(default = "default_analysis_interval_secs")]
    pub analysis_interval_secs: u64,

    /// Directory holding `<SYMBOL>.json` market snapshots.
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,

    // --- Classification -----------------------------------------------------

    /// Aggregate score at or above which a reliable result is BUY.
    #[serde(default = "default_buy_threshold")]
    pub buy_threshold: f64,

    /// Aggregate score at or below which a reliable result is SELL.
    #[serde(default = "default_sell_threshold")]
    pub sell_threshold: f64,

    /// Reliability below which every result is NEUTRAL.
    #[serde(default = "default_min_reliability")]
    pub min_reliability: f64,

    /// Component weights. The keys define the required component set.
    #[serde(default = "default_component_weights")]
    pub component_weights: HashMap<String, f64>,

    // --- Anomaly detection --------------------------------------------------

    /// Default whale / liquidation thresholds.
    #[serde(default)]
    pub anomaly: AnomalyThresholdConfig,

    /// Per-symbol threshold overrides.
    #[serde(default)]
    pub anomaly_overrides: HashMap<String, AnomalyThresholdConfig>,

    /// Length of the rolling event window.
    #[serde(default = "default_window_minutes")]
    pub anomaly_window_minutes: i64,

    // --- Cache --------------------------------------------------------------

    #[serde(default)]
    pub cache: CacheSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            analysis_interval_secs: default_analysis_interval_secs(),
            snapshot_dir: default_snapshot_dir(),
            buy_threshold: default_buy_threshold(),
            sell_threshold: default_sell_threshold(),
            min_reliability: default_min_reliability(),
            component_weights: default_component_weights(),
            anomaly: AnomalyThresholdConfig::default(),
            anomaly_overrides: HashMap::new(),
            anomaly_window_minutes: default_window_minutes(),
            cache: CacheSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            buy_threshold = config.buy_threshold,
            sell_threshold = config.sell_threshold,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Apply `CONFLUENCE_SYMBOLS` (comma separated) and
    /// `CONFLUENCE_SNAPSHOT_DIR` overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("CONFLUENCE_SYMBOLS") {
            self.symbols = parse_symbols(&syms);
        }
        if let Ok(dir) = std::env::var("CONFLUENCE_SNAPSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.snapshot_dir = dir.trim().to_string();
            }
        }
        if self.symbols.is_empty() {
            self.symbols = default_symbols();
        }
    }
}

fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}
