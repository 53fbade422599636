// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Vega ticker engine. Every tunable
// parameter lives here so the engine can be reconfigured without code
// changes.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_channel_prefix() -> String {
    "vega".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_db_path() -> String {
    "vega_nexus.db".to_string()
}

fn default_tick_batch_window_ms() -> u64 {
    100
}

fn default_tick_batch_max_size() -> usize {
    1000
}

fn default_max_instruments_per_ws_connection() -> usize {
    1000
}

fn default_mock_state_max_size() -> usize {
    5000
}

fn default_order_executor_max_tasks() -> usize {
    10_000
}

fn default_order_executor_poll_interval_ms() -> u64 {
    1000
}

fn default_order_executor_max_attempts() -> u32 {
    5
}

fn default_order_idempotency_window_secs() -> i64 {
    300
}

fn default_redis_circuit_failure_threshold() -> u32 {
    5
}

fn default_redis_circuit_recovery_seconds() -> u64 {
    30
}

fn default_historical_backfill_days() -> u32 {
    5
}

fn default_historical_backfill_batch() -> usize {
    20
}

fn default_reload_debounce_ms() -> u64 {
    1000
}

fn default_reload_max_debounce_ms() -> u64 {
    5000
}

fn default_reload_min_gap_ms() -> u64 {
    5000
}

fn default_lease_timeout_secs() -> u64 {
    30
}

fn default_risk_free_rate() -> f64 {
    0.065
}

fn default_greeks_max_spot_age_ms() -> u64 {
    2000
}

fn default_registry_staleness_secs() -> u64 {
    6 * 60 * 60
}

fn default_redis_pool_size() -> usize {
    10
}

// =============================================================================
// AccountConfig
// =============================================================================

/// Credentials and identity of one broker account.
///
/// Token bootstrap happens outside this service: the access token is issued
/// by the broker's login flow and handed in via config or environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub account_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub access_token: String,
    /// Unhealthy accounts are excluded from instrument assignment.
    #[serde(default = "crate::config::default_account_enabled")]
    pub enabled: bool,
}

pub(crate) fn default_account_enabled() -> bool {
    true
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Accounts ----------------------------------------------------------
    /// Broker accounts available for streaming and order execution.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    // --- Service endpoints -------------------------------------------------
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Number of pooled Redis connections.
    #[serde(default = "default_redis_pool_size")]
    pub redis_pool_size: usize,

    /// SQLite database holding subscriptions and order tasks.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    // --- Publishing --------------------------------------------------------
    /// Prefix for all published channels (`ticker:<prefix>:underlying`, ...).
    #[serde(default = "default_channel_prefix")]
    pub publish_channel_prefix: String,

    #[serde(default = "default_tick_batch_window_ms")]
    pub tick_batch_window_ms: u64,

    #[serde(default = "default_tick_batch_max_size")]
    pub tick_batch_max_size: usize,

    #[serde(default = "default_redis_circuit_failure_threshold")]
    pub redis_circuit_failure_threshold: u32,

    #[serde(default = "default_redis_circuit_recovery_seconds")]
    pub redis_circuit_recovery_seconds: u64,

    // --- Broker streaming --------------------------------------------------
    /// Hard broker-side cap on instruments per physical WebSocket.
    #[serde(default = "default_max_instruments_per_ws_connection")]
    pub max_instruments_per_ws_connection: usize,

    // --- Mock data ---------------------------------------------------------
    /// When false, no synthetic values may ever reach publishers.
    #[serde(default)]
    pub mock_data_enabled: bool,

    #[serde(default = "default_mock_state_max_size")]
    pub mock_state_max_size: usize,

    // --- Order executor ----------------------------------------------------
    #[serde(default = "default_order_executor_max_tasks")]
    pub order_executor_max_tasks: usize,

    #[serde(default = "default_order_executor_poll_interval_ms")]
    pub order_executor_poll_interval_ms: u64,

    #[serde(default = "default_order_executor_max_attempts")]
    pub order_executor_max_attempts: u32,

    /// Window within which identical order submissions deduplicate.
    #[serde(default = "default_order_idempotency_window_secs")]
    pub order_idempotency_window_secs: i64,

    // --- Historical backfill ------------------------------------------------
    #[serde(default = "default_historical_backfill_days")]
    pub historical_backfill_days: u32,

    #[serde(default = "default_historical_backfill_batch")]
    pub historical_backfill_batch: usize,

    // --- Reload coalescing --------------------------------------------------
    #[serde(default = "default_reload_debounce_ms")]
    pub reload_debounce_ms: u64,

    #[serde(default = "default_reload_max_debounce_ms")]
    pub reload_max_debounce_ms: u64,

    #[serde(default = "default_reload_min_gap_ms")]
    pub reload_min_gap_ms: u64,

    // --- Sessions -----------------------------------------------------------
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,

    // --- Greeks --------------------------------------------------------------
    /// Continuously-compounded risk-free rate used by the pricing engine.
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,

    /// Maximum age of the underlying reference price before Greeks are
    /// omitted from option snapshots.
    #[serde(default = "default_greeks_max_spot_age_ms")]
    pub greeks_max_spot_age_ms: u64,

    // --- Instrument registry -------------------------------------------------
    /// Cache age beyond which the registry refreshes even within a day.
    #[serde(default = "default_registry_staleness_secs")]
    pub registry_staleness_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            bind_addr: default_bind_addr(),
            redis_url: default_redis_url(),
            redis_pool_size: default_redis_pool_size(),
            db_path: default_db_path(),
            publish_channel_prefix: default_channel_prefix(),
            tick_batch_window_ms: default_tick_batch_window_ms(),
            tick_batch_max_size: default_tick_batch_max_size(),
            redis_circuit_failure_threshold: default_redis_circuit_failure_threshold(),
            redis_circuit_recovery_seconds: default_redis_circuit_recovery_seconds(),
            max_instruments_per_ws_connection: default_max_instruments_per_ws_connection(),
            mock_data_enabled: false,
            mock_state_max_size: default_mock_state_max_size(),
            order_executor_max_tasks: default_order_executor_max_tasks(),
            order_executor_poll_interval_ms: default_order_executor_poll_interval_ms(),
            order_executor_max_attempts: default_order_executor_max_attempts(),
            order_idempotency_window_secs: default_order_idempotency_window_secs(),
            historical_backfill_days: default_historical_backfill_days(),
            historical_backfill_batch: default_historical_backfill_batch(),
            reload_debounce_ms: default_reload_debounce_ms(),
            reload_max_debounce_ms: default_reload_max_debounce_ms(),
            reload_min_gap_ms: default_reload_min_gap_ms(),
            lease_timeout_secs: default_lease_timeout_secs(),
            risk_free_rate: default_risk_free_rate(),
            greeks_max_spot_age_ms: default_greeks_max_spot_age_ms(),
            registry_staleness_secs: default_registry_staleness_secs(),
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
            accounts = config.accounts.len(),
            prefix = %config.publish_channel_prefix,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Accounts eligible for assignment.
    pub fn enabled_accounts(&self) -> Vec<String> {
        self.accounts
            .iter()
            .filter(|a| a.enabled)
            .map(|a| a.account_id.clone())
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.tick_batch_window_ms, 100);
        assert_eq!(config.tick_batch_max_size, 1000);
        assert_eq!(config.max_instruments_per_ws_connection, 1000);
        assert_eq!(config.order_executor_max_attempts, 5);
        assert_eq!(config.order_idempotency_window_secs, 300);
        assert!(!config.mock_data_enabled);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = EngineConfig::default();
        config.publish_channel_prefix = "test-prefix".into();
        config.accounts.push(AccountConfig {
            account_id: "primary".into(),
            api_key: "key".into(),
            access_token: "token".into(),
            enabled: true,
        });
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.publish_channel_prefix, "test-prefix");
        assert_eq!(loaded.enabled_accounts(), vec!["primary".to_string()]);
    }

    #[test]
    fn disabled_accounts_excluded_from_assignment() {
        let mut config = EngineConfig::default();
        config.accounts = vec![
            AccountConfig {
                account_id: "a".into(),
                api_key: String::new(),
                access_token: String::new(),
                enabled: true,
            },
            AccountConfig {
                account_id: "b".into(),
                api_key: String::new(),
                access_token: String::new(),
                enabled: false,
            },
        ];
        assert_eq!(config.enabled_accounts(), vec!["a".to_string()]);
    }
}
