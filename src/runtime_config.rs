// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian research engine.  Every tunable
// parameter lives here so that the engine can be reconfigured at runtime
// without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_per_agent_timeout_ms() -> u64 {
    30_000
}

fn default_whole_run_timeout_ms() -> u64 {
    180_000
}

fn default_max_retries_per_agent() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    1.75
}

fn default_backoff_cap_ms() -> u64 {
    10_000
}

fn default_per_run_parallelism() -> usize {
    10
}

fn default_global_parallelism() -> usize {
    64
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

fn default_drift_tick_seconds() -> u64 {
    300
}

fn default_drift_active_window_hours() -> i64 {
    24
}

fn default_drift_retention_days() -> i64 {
    30
}

fn default_stop_loss_atr_multiplier() -> f64 {
    2.0
}

fn default_account_value() -> f64 {
    100_000.0
}

fn default_progress_backlog() -> usize {
    1_024
}

fn default_bind_addr() -> String {
    "0.0.0.0:3002".to_string()
}

fn default_provider_base_url() -> String {
    "https://query1.finance.yahoo.com".to_string()
}

/// Base weights per agent id used by the consensus engine before the
/// confidence and historical-accuracy multipliers.
fn default_consensus_base_weights() -> HashMap<String, f64> {
    let mut weights = HashMap::new();
    weights.insert("fundamental".to_string(), 0.35);
    weights.insert("valuation".to_string(), 0.30);
    weights.insert("technical".to_string(), 0.25);
    weights.insert("risk".to_string(), 0.20);
    weights.insert("news".to_string(), 0.15);
    weights.insert("sentiment".to_string(), 0.10);
    weights.insert("macro".to_string(), 0.10);
    weights.insert("peer_comparison".to_string(), 0.08);
    weights.insert("insider_activity".to_string(), 0.07);
    weights.insert("market".to_string(), 0.05);
    weights
}

// =============================================================================
// PositionRiskFractions
// =============================================================================

fn default_conservative_fraction() -> f64 {
    0.01
}

fn default_moderate_fraction() -> f64 {
    0.02
}

fn default_aggressive_fraction() -> f64 {
    0.05
}

/// Fixed-fractional risk budgets for the three position-sizing scenarios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRiskFractions {
    /// Capital fraction risked per trade in the conservative scenario.
    #[serde(default = "default_conservative_fraction")]
    pub conservative: f64,

    /// Capital fraction risked per trade in the moderate scenario.
    #[serde(default = "default_moderate_fraction")]
    pub moderate: f64,

    /// Upper bound on the Kelly-style aggressive scenario.
    #[serde(default = "default_aggressive_fraction")]
    pub aggressive: f64,
}

impl Default for PositionRiskFractions {
    fn default() -> Self {
        Self {
            conservative: default_conservative_fraction(),
            moderate: default_moderate_fraction(),
            aggressive: default_aggressive_fraction(),
        }
    }
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
    // --- Agent execution -----------------------------------------------------

    /// Deadline for a single agent execution, in milliseconds.
    #[serde(default = "default_per_agent_timeout_ms")]
    pub per_agent_timeout_ms: u64,

    /// Deadline for a whole analysis run, in milliseconds. Supersedes the
    /// per-agent deadline: on expiry, still-running agents become timed_out
    /// and the run proceeds to synthesis with whatever completed.
    #[serde(default = "default_whole_run_timeout_ms")]
    pub whole_run_timeout_ms: u64,

    /// Maximum attempts per agent on transient failures.
    #[serde(default = "default_max_retries_per_agent")]
    pub max_retries_per_agent: u32,

    /// Initial retry backoff in milliseconds.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Multiplier applied to the backoff after each attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound on a single backoff sleep, in milliseconds.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    // --- Concurrency ---------------------------------------------------------

    /// Maximum concurrent agent executions within one analysis run.
    #[serde(default = "default_per_run_parallelism")]
    pub per_run_parallelism: usize,

    /// Maximum concurrent agent executions across all runs (admission limit).
    #[serde(default = "default_global_parallelism")]
    pub global_parallelism: usize,

    /// Grace period for cancelled agents to unwind, in milliseconds.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    // --- Drift monitor -------------------------------------------------------

    /// Interval between drift monitor ticks, in seconds.
    #[serde(default = "default_drift_tick_seconds")]
    pub drift_tick_seconds: u64,

    /// How long after completion an analysis stays eligible for drift
    /// sampling, in hours.
    #[serde(default = "default_drift_active_window_hours")]
    pub drift_active_window_hours: i64,

    /// Drift history older than this many days may be compacted away.
    #[serde(default = "default_drift_retention_days")]
    pub drift_retention_days: i64,

    // --- Synthesis -----------------------------------------------------------

    /// ATR multiplier for the stop-loss distance.
    #[serde(default = "default_stop_loss_atr_multiplier")]
    pub stop_loss_atr_multiplier: f64,

    /// Account value used for position sizing scenarios.
    #[serde(default = "default_account_value")]
    pub account_value: f64,

    /// Fixed-fractional risk budgets per sizing scenario.
    #[serde(default)]
    pub position_risk_fractions: PositionRiskFractions,

    // --- Consensus -----------------------------------------------------------

    /// Base weights per agent id; unrecognized agents fall back to 0.10.
    #[serde(default = "default_consensus_base_weights")]
    pub consensus_base_weights: HashMap<String, f64>,

    // --- Progress streaming --------------------------------------------------

    /// Bounded backlog per progress subscriber; slower consumers are dropped.
    #[serde(default = "default_progress_backlog")]
    pub progress_backlog: usize,

    // --- Service -------------------------------------------------------------

    /// Address the API server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Base URL of the market data provider.
    #[serde(default = "default_provider_base_url")]
    pub provider_base_url: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            per_agent_timeout_ms: default_per_agent_timeout_ms(),
            whole_run_timeout_ms: default_whole_run_timeout_ms(),
            max_retries_per_agent: default_max_retries_per_agent(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_factor: default_backoff_factor(),
            backoff_cap_ms: default_backoff_cap_ms(),
            per_run_parallelism: default_per_run_parallelism(),
            global_parallelism: default_global_parallelism(),
            cancel_grace_ms: default_cancel_grace_ms(),
            drift_tick_seconds: default_drift_tick_seconds(),
            drift_active_window_hours: default_drift_active_window_hours(),
            drift_retention_days: default_drift_retention_days(),
            stop_loss_atr_multiplier: default_stop_loss_atr_multiplier(),
            account_value: default_account_value(),
            position_risk_fractions: PositionRiskFractions::default(),
            consensus_base_weights: default_consensus_base_weights(),
            progress_backlog: default_progress_backlog(),
            bind_addr: default_bind_addr(),
            provider_base_url: default_provider_base_url(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            per_agent_timeout_ms = config.per_agent_timeout_ms,
            global_parallelism = config.global_parallelism,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        // Atomic write: write to a temporary sibling file, then rename.
        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Base weight for an agent id; unrecognized agents default to 0.10.
    pub fn base_weight(&self, agent_id: &str) -> f64 {
        self.consensus_base_weights
            .get(agent_id)
            .copied()
            .unwrap_or(0.10)
    }
}
