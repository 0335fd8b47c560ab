// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian trading engine.  Every tunable
// parameter lives here so that the engine can be reconfigured at runtime
// without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.  Environment variables override
// file values at startup (see `apply_env_overrides`).
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::StrategyMode;

/// Default on-disk location of the engine config.
pub const CONFIG_PATH: &str = "engine_config.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_database_url() -> String {
    "meridian.db".to_string()
}

fn default_engine_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_min_confidence() -> f64 {
    75.0
}

fn default_trailing_activate_pct() -> f64 {
    1.0
}

fn default_trailing_distance_pct() -> f64 {
    0.5
}

fn default_win_loss_threshold_pct() -> f64 {
    0.5
}

fn default_bodyguard_interval_secs() -> u64 {
    10
}

fn default_reviewer_interval_secs() -> u64 {
    180
}

fn default_reviewer_min_age_secs() -> i64 {
    300
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_price_staleness_max_secs() -> u64 {
    10
}

fn default_failure_cooldown_secs() -> i64 {
    1800
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- External services --------------------------------------------------

    /// Path or URL of the SQLite database.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Base URL of the AI engine service (analysis, execution, prices).
    #[serde(default = "default_engine_url")]
    pub engine_url: String,

    /// Optional webhook URL for best-effort notifications.
    #[serde(default)]
    pub notify_url: Option<String>,

    // --- Symbols ------------------------------------------------------------

    /// Top-N symbols always scanned and price-subscribed, in addition to any
    /// symbol with an open position.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- Signal admission ---------------------------------------------------

    /// Signals below this confidence are dropped before dedup (inclusive
    /// boundary: a signal exactly at the threshold is kept).
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Seconds a FAILED signal blocks re-admission of its symbol.
    #[serde(default = "default_failure_cooldown_secs")]
    pub failure_cooldown_secs: i64,

    // --- Bodyguard ----------------------------------------------------------

    /// Margin-based unrealized PnL % required before the trailing stop arms.
    #[serde(default = "default_trailing_activate_pct")]
    pub trailing_activate_pct: f64,

    /// Distance of the trailing stop from price, in percent.
    #[serde(default = "default_trailing_distance_pct")]
    pub trailing_distance_pct: f64,

    /// Bodyguard evaluation interval.
    #[serde(default = "default_bodyguard_interval_secs")]
    pub bodyguard_interval_secs: u64,

    /// Cache entries older than this trigger the REST price fallback.
    #[serde(default = "default_price_staleness_max_secs")]
    pub price_staleness_max_secs: u64,

    // --- Outcome reviewer ---------------------------------------------------

    /// Price-move % band separating FLOATING from FLOATING_WIN/FLOATING_LOSS.
    #[serde(default = "default_win_loss_threshold_pct")]
    pub win_loss_threshold_pct: f64,

    /// Reviewer sweep interval.
    #[serde(default = "default_reviewer_interval_secs")]
    pub reviewer_interval_secs: u64,

    /// Minimum signal age before the reviewer classifies it.
    #[serde(default = "default_reviewer_min_age_secs")]
    pub reviewer_min_age_secs: i64,

    // --- Reconciliation -----------------------------------------------------

    /// Exchange-vs-store drift check interval.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    // --- Strategy -----------------------------------------------------------

    /// Hint passed to the AI service. Does not alter scan cadence.
    #[serde(default)]
    pub strategy_mode: StrategyMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            engine_url: default_engine_url(),
            notify_url: None,
            symbols: default_symbols(),
            min_confidence: default_min_confidence(),
            failure_cooldown_secs: default_failure_cooldown_secs(),
            trailing_activate_pct: default_trailing_activate_pct(),
            trailing_distance_pct: default_trailing_distance_pct(),
            bodyguard_interval_secs: default_bodyguard_interval_secs(),
            price_staleness_max_secs: default_price_staleness_max_secs(),
            win_loss_threshold_pct: default_win_loss_threshold_pct(),
            reviewer_interval_secs: default_reviewer_interval_secs(),
            reviewer_min_age_secs: default_reviewer_min_age_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            strategy_mode: StrategyMode::Scalper,
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
            strategy_mode = %config.strategy_mode,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
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

    /// Apply environment-variable overrides on top of the loaded file.
    ///
    /// Numeric variables that fail to parse are ignored with a warning so a
    /// typo in the environment never takes the engine down.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                self.database_url = url;
            }
        }
        if let Ok(url) = std::env::var("PYTHON_ENGINE_URL") {
            if !url.is_empty() {
                self.engine_url = url;
            }
        }
        if let Ok(url) = std::env::var("NOTIFY_WEBHOOK_URL") {
            if !url.is_empty() {
                self.notify_url = Some(url);
            }
        }
        if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }

        Self::override_f64("MIN_CONFIDENCE", &mut self.min_confidence);
        Self::override_f64("TRAILING_ACTIVATE_PCT", &mut self.trailing_activate_pct);
        Self::override_f64("TRAILING_DISTANCE_PCT", &mut self.trailing_distance_pct);
        Self::override_f64("WIN_LOSS_THRESHOLD_PCT", &mut self.win_loss_threshold_pct);
    }

    fn override_f64(var: &str, slot: &mut f64) {
        if let Ok(raw) = std::env::var(var) {
            match raw.parse::<f64>() {
                Ok(v) => *slot = v,
                Err(e) => warn!(var, raw = %raw, error = %e, "ignoring unparseable env override"),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.symbols.len(), 5);
        assert_eq!(cfg.symbols[0], "BTCUSDT");
        assert!((cfg.min_confidence - 75.0).abs() < f64::EPSILON);
        assert!((cfg.trailing_activate_pct - 1.0).abs() < f64::EPSILON);
        assert!((cfg.trailing_distance_pct - 0.5).abs() < f64::EPSILON);
        assert!((cfg.win_loss_threshold_pct - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.bodyguard_interval_secs, 10);
        assert_eq!(cfg.failure_cooldown_secs, 1800);
        assert_eq!(cfg.strategy_mode, StrategyMode::Scalper);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.database_url, "meridian.db");
        assert_eq!(cfg.engine_url, "http://localhost:8000");
        assert_eq!(cfg.reviewer_interval_secs, 180);
        assert_eq!(cfg.reviewer_min_age_secs, 300);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "strategy_mode": "INVESTOR", "symbols": ["ETHUSDT"] }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.strategy_mode, StrategyMode::Investor);
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert!((cfg.min_confidence - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.database_url, cfg2.database_url);
        assert_eq!(cfg.strategy_mode, cfg2.strategy_mode);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine_config.json");

        let mut cfg = EngineConfig::default();
        cfg.symbols = vec!["DOGEUSDT".into()];
        cfg.strategy_mode = StrategyMode::Investor;
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["DOGEUSDT"]);
        assert_eq!(loaded.strategy_mode, StrategyMode::Investor);
    }
}
