// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian engine.  The struct is populated
// once at startup (file + environment overrides) and injected everywhere; the
// core performs no dynamic reloading.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{BookAction, Classification, MarginMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_max_ticks_per_symbol() -> usize {
    50_000
}

fn default_throttle_epsilon() -> f64 {
    1e-5
}

fn default_persist_queue_capacity() -> usize {
    10_000
}

fn default_persist_batch_size() -> usize {
    500
}

fn default_persist_flush_secs() -> u64 {
    30
}

fn default_retention_days() -> i64 {
    180
}

fn default_archive_after_days() -> i64 {
    7
}

fn default_broadcast_interval_ms() -> u64 {
    16
}

fn default_broadcast_batch_size() -> usize {
    50
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_slow_consumer_cycles() -> u32 {
    10
}

fn default_ohlc_history_bars() -> usize {
    500
}

fn default_decision_history() -> usize {
    10_000
}

fn default_lp_order_timeout_secs() -> u64 {
    5
}

fn default_dedup_window_secs() -> u64 {
    60
}

fn default_stop_out_level_pct() -> f64 {
    50.0
}

fn default_exposure_limit_lots() -> f64 {
    100.0
}

fn default_default_route() -> BookAction {
    BookAction::BBook
}

fn default_ws_read_deadline_secs() -> u64 {
    60
}

fn default_ws_write_deadline_secs() -> u64 {
    10
}

fn default_ping_period_secs() -> u64 {
    27
}

fn default_rate_limit_msgs_per_sec() -> u32 {
    1000
}

fn default_memory_limit_mib() -> u64 {
    2048
}

fn default_leverage() -> u32 {
    100
}

fn default_contract_size() -> f64 {
    100_000.0
}

fn default_pip_size() -> f64 {
    0.0001
}

fn default_pip_value() -> f64 {
    10.0
}

fn default_margin_percent() -> f64 {
    1.0
}

fn default_min_lot() -> f64 {
    0.01
}

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<SymbolConfig> {
    ["EURUSD", "GBPUSD", "USDJPY", "AUDUSD", "XAUUSD"]
        .iter()
        .map(|name| SymbolConfig {
            name: (*name).to_string(),
            contract_size: default_contract_size(),
            pip_size: default_pip_size(),
            pip_value: default_pip_value(),
            margin_percent: default_margin_percent(),
            commission_per_lot: 0.0,
            min_lot: default_min_lot(),
            exposure_limit_lots: default_exposure_limit_lots(),
            enabled: true,
        })
        .collect()
}

// =============================================================================
// Sub-configs
// =============================================================================

/// Static description of a tradable symbol, loaded at startup and mutable via
/// the admin path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub name: String,
    #[serde(default = "default_contract_size")]
    pub contract_size: f64,
    #[serde(default = "default_pip_size")]
    pub pip_size: f64,
    #[serde(default = "default_pip_value")]
    pub pip_value: f64,
    /// Margin requirement as a percentage of notional (e.g. 1.0 = 1 %).
    #[serde(default = "default_margin_percent")]
    pub margin_percent: f64,
    #[serde(default)]
    pub commission_per_lot: f64,
    #[serde(default = "default_min_lot")]
    pub min_lot: f64,
    /// Net exposure limit in lots used by the routing engine's risk input.
    #[serde(default = "default_exposure_limit_lots")]
    pub exposure_limit_lots: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Transport flavour of a liquidity provider connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LpKind {
    Fix,
    WsJson,
    RestPoll,
}

impl std::fmt::Display for LpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fix => write!(f, "fix"),
            Self::WsJson => write!(f, "ws_json"),
            Self::RestPoll => write!(f, "rest_poll"),
        }
    }
}

/// One upstream liquidity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LpConfig {
    pub name: String,
    pub kind: LpKind,
    /// `host:port` for FIX, URL for WebSocket/REST.
    pub endpoint: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    /// FIX session identifiers; ignored by other transports.
    #[serde(default)]
    pub sender_comp_id: String,
    #[serde(default)]
    pub target_comp_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Seed state for an account loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: u64,
    pub user_id: u64,
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default)]
    pub margin_mode: MarginMode,
    pub balance: f64,
    #[serde(default)]
    pub credit: f64,
    #[serde(default)]
    pub classification: Classification,
}

/// One statically configured bearer token the auth provider accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    pub user_id: u64,
    pub account_id: u64,
    #[serde(default)]
    pub admin: bool,
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Process ------------------------------------------------------------
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Soft memory budget hint surfaced to operators; the engine's bounded
    /// buffers are sized so steady state stays well under it.
    #[serde(default = "default_memory_limit_mib")]
    pub memory_limit_mib: u64,

    // --- Tick store (C1) ----------------------------------------------------
    #[serde(default = "default_max_ticks_per_symbol")]
    pub max_ticks_per_symbol: usize,

    /// Relative mid-price move below which a tick is dropped as
    /// non-informative.
    #[serde(default = "default_throttle_epsilon")]
    pub throttle_epsilon: f64,

    // --- Persistence (C2) ---------------------------------------------------
    #[serde(default = "default_persist_queue_capacity")]
    pub persist_queue_capacity: usize,

    #[serde(default = "default_persist_batch_size")]
    pub persist_batch_size: usize,

    #[serde(default = "default_persist_flush_secs")]
    pub persist_flush_secs: u64,

    #[serde(default = "default_archive_after_days")]
    pub archive_after_days: i64,

    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    // --- OHLC (C3) ----------------------------------------------------------
    /// Frozen bars retained per (symbol, timeframe).
    #[serde(default = "default_ohlc_history_bars")]
    pub ohlc_history_bars: usize,

    // --- Broadcast (C5) -----------------------------------------------------
    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,

    #[serde(default = "default_broadcast_batch_size")]
    pub broadcast_batch_size: usize,

    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Consecutive flush cycles with dropped batches before a connection is
    /// closed as a slow consumer.
    #[serde(default = "default_slow_consumer_cycles")]
    pub slow_consumer_cycles: u32,

    // --- Ledger (C6) --------------------------------------------------------
    /// Margin level (percent) below which stop-out liquidation begins.
    #[serde(default = "default_stop_out_level_pct")]
    pub stop_out_level_pct: f64,

    // --- Routing (C7) -------------------------------------------------------
    #[serde(default = "default_decision_history")]
    pub decision_history: usize,

    /// Action taken when no routing rule matches.
    #[serde(default = "default_default_route")]
    pub default_route: BookAction,

    // --- Dispatch (C8) ------------------------------------------------------
    #[serde(default = "default_lp_order_timeout_secs")]
    pub lp_order_timeout_secs: u64,

    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,

    // --- Gateway (C9) -------------------------------------------------------
    #[serde(default = "default_ws_read_deadline_secs")]
    pub ws_read_deadline_secs: u64,

    #[serde(default = "default_ws_write_deadline_secs")]
    pub ws_write_deadline_secs: u64,

    #[serde(default = "default_ping_period_secs")]
    pub ping_period_secs: u64,

    #[serde(default = "default_rate_limit_msgs_per_sec")]
    pub rate_limit_msgs_per_sec: u32,

    // --- Static registries --------------------------------------------------
    #[serde(default = "default_symbols")]
    pub symbols: Vec<SymbolConfig>,

    #[serde(default)]
    pub lps: Vec<LpConfig>,

    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        // Round-trip through serde so every `default = "..."` helper applies.
        serde_json::from_str("{}").expect("empty config deserialises")
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        info!(path = %path.display(), "runtime config loaded");
        Ok(config)
    }

    /// Apply `MERIDIAN_*` environment variable overrides on top of whatever
    /// was loaded from disk.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("MERIDIAN_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(dir) = std::env::var("MERIDIAN_DATA_DIR") {
            self.data_dir = dir;
        }
        if let Ok(eps) = std::env::var("MERIDIAN_THROTTLE_EPSILON") {
            if let Ok(v) = eps.parse() {
                self.throttle_epsilon = v;
            }
        }
        if let Ok(cap) = std::env::var("MERIDIAN_MAX_TICKS_PER_SYMBOL") {
            if let Ok(v) = cap.parse() {
                self.max_ticks_per_symbol = v;
            }
        }
    }

    /// Save the configuration atomically (tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("failed to serialise config")?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)
            .with_context(|| format!("failed to write temp config {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename temp config into {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_ticks_per_symbol, 50_000);
        assert_eq!(config.persist_queue_capacity, 10_000);
        assert_eq!(config.persist_batch_size, 500);
        assert_eq!(config.persist_flush_secs, 30);
        assert_eq!(config.throttle_epsilon, 1e-5);
        assert_eq!(config.broadcast_interval_ms, 16);
        assert_eq!(config.broadcast_batch_size, 50);
        assert_eq!(config.outbound_queue_capacity, 256);
        assert_eq!(config.retention_days, 180);
        assert_eq!(config.archive_after_days, 7);
        assert_eq!(config.default_route, BookAction::BBook);
    }

    #[test]
    fn older_file_without_new_fields_still_loads() {
        let raw = r#"{ "bind_addr": "127.0.0.1:9000" }"#;
        let config: RuntimeConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.persist_batch_size, 500);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine_config.json");

        let mut config = RuntimeConfig::default();
        config.bind_addr = "127.0.0.1:4040".into();
        config.save(&path).unwrap();

        let reloaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(reloaded.bind_addr, "127.0.0.1:4040");
    }
}
