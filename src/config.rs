// =============================================================================
// Pair Configuration — store-backed entries with env seeding
// =============================================================================
//
// One `PairConfig` per managed pair, keyed by id in the coordination store.
// The supervisor seeds the store from the environment on first start; workers
// re-validate at startup and refuse to run on an invalid entry.
//
// `force_params` is a *partial* patch: individual fields override the
// defaults field-by-field, so a config that sets only `overbought` keeps the
// default for every sibling.
// =============================================================================

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::DexFamily;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_interval_sec() -> u64 {
    900
}

fn default_max_positions() -> usize {
    5
}

fn default_pra_threshold() -> f64 {
    0.05
}

fn default_rs_threshold() -> f64 {
    0.25
}

// =============================================================================
// Force parameters
// =============================================================================

/// Fully resolved parameters of the signal-to-range mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceParams {
    /// Volatility force above which confidence starts decaying.
    pub critical_force: f64,
    /// Exponent of the confidence decay (negative).
    pub confidence_exp: f64,
    /// Trend force at or above which the market is called bullish.
    pub bullish_from: f64,
    /// Trend force at or below which the market is called bearish.
    pub bearish_from: f64,
    /// Momentum force above which the pair is overbought.
    pub overbought: f64,
    /// Momentum force below which the pair is oversold.
    pub oversold: f64,
    /// Confidence divisor scale applied when momentum is stretched inside a
    /// ranging market.
    pub m_divider: f64,
    /// Bias/confidence divisor scale applied when momentum opposes the trend.
    pub opposing_divider: f64,
    /// Exponent amplifying trend bias when momentum agrees with it.
    pub bias_exp: f64,
    /// Close-difference lookback for the momentum up/down tally.
    pub lookback: usize,
}

impl Default for ForceParams {
    fn default() -> Self {
        Self {
            critical_force: 60.0,
            confidence_exp: -0.05,
            bullish_from: 55.0,
            bearish_from: 45.0,
            overbought: 70.0,
            oversold: 30.0,
            m_divider: 0.1,
            opposing_divider: 0.1,
            bias_exp: 0.01,
            lookback: 48,
        }
    }
}

/// Partial override of [`ForceParams`]. Only the fields present in the
/// stored JSON take effect; everything else keeps its default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForceParamsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_force: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_exp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bullish_from: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearish_from: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overbought: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oversold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m_divider: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opposing_divider: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias_exp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback: Option<usize>,
}

impl ForceParams {
    /// Merge a partial patch over the defaults, field by field.
    pub fn merged(patch: &ForceParamsPatch) -> Self {
        let d = Self::default();
        Self {
            critical_force: patch.critical_force.unwrap_or(d.critical_force),
            confidence_exp: patch.confidence_exp.unwrap_or(d.confidence_exp),
            bullish_from: patch.bullish_from.unwrap_or(d.bullish_from),
            bearish_from: patch.bearish_from.unwrap_or(d.bearish_from),
            overbought: patch.overbought.unwrap_or(d.overbought),
            oversold: patch.oversold.unwrap_or(d.oversold),
            m_divider: patch.m_divider.unwrap_or(d.m_divider),
            opposing_divider: patch.opposing_divider.unwrap_or(d.opposing_divider),
            bias_exp: patch.bias_exp.unwrap_or(d.bias_exp),
            lookback: patch.lookback.unwrap_or(d.lookback),
        }
    }
}

// =============================================================================
// Pair configuration
// =============================================================================

/// Decision thresholds for the PRA / RS selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Relative APR improvement required for a full reallocation.
    #[serde(default = "default_pra_threshold")]
    pub pra: f64,
    /// Interval divergence required for a range shift.
    #[serde(default = "default_rs_threshold")]
    pub rs: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            pra: default_pra_threshold(),
            rs: default_rs_threshold(),
        }
    }
}

/// Reference to one pool the pair is managed across.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRef {
    pub chain: String,
    pub address: String,
    pub dex: DexFamily,
}

/// Configuration entry for one managed pair, stored keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairConfig {
    pub id: String,
    pub pools: Vec<PoolRef>,
    /// Scheduler cycle length in seconds.
    #[serde(default = "default_interval_sec")]
    pub interval_sec: u64,
    /// Upper bound on concurrently held positions.
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default)]
    pub thresholds: Thresholds,
    /// Partial force-parameter override; merged field-wise with defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_params: Option<ForceParamsPatch>,
    /// Stable/stable pairs use a tighter displacement threshold in regime
    /// detection.
    #[serde(default)]
    pub stable_pair: bool,
}

impl PairConfig {
    /// Validate the entry against the configured bounds. Invalid entries are
    /// skipped by the supervisor with a warning and never spawned.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("pair config has an empty id");
        }
        if self.pools.is_empty() {
            bail!("pair {} has no pools configured", self.id);
        }
        if !(60..=86_400).contains(&self.interval_sec) {
            bail!(
                "pair {}: interval_sec {} outside [60, 86400]",
                self.id,
                self.interval_sec
            );
        }
        if !(1..=20).contains(&self.max_positions) {
            bail!(
                "pair {}: max_positions {} outside [1, 20]",
                self.id,
                self.max_positions
            );
        }
        if !(self.thresholds.pra > 0.0 && self.thresholds.pra < 1.0) {
            bail!(
                "pair {}: pra threshold {} outside (0, 1)",
                self.id,
                self.thresholds.pra
            );
        }
        if !(self.thresholds.rs > 0.0 && self.thresholds.rs < 1.0) {
            bail!(
                "pair {}: rs threshold {} outside (0, 1)",
                self.id,
                self.thresholds.rs
            );
        }
        for pool in &self.pools {
            if pool.chain.trim().is_empty() || pool.address.trim().is_empty() {
                bail!("pair {}: pool with empty chain or address", self.id);
            }
        }
        Ok(())
    }

    /// Resolve the effective force parameters (defaults merged with the
    /// per-pair patch).
    pub fn effective_force_params(&self) -> ForceParams {
        match &self.force_params {
            Some(patch) => ForceParams::merged(patch),
            None => ForceParams::default(),
        }
    }
}

/// Environment variable holding the JSON seed used when the store carries no
/// pair configuration.
pub const PAIRS_ENV: &str = "TIDEPOOL_PAIRS";

/// Parse the env-provided seed configuration (a JSON array of entries).
///
/// Entries that fail validation are dropped with a warning so one bad pair
/// cannot block the rest of the fleet.
pub fn pairs_from_env() -> Result<Vec<PairConfig>> {
    let raw = std::env::var(PAIRS_ENV)
        .with_context(|| format!("{PAIRS_ENV} is not set and the store holds no config"))?;

    let parsed: Vec<PairConfig> =
        serde_json::from_str(&raw).with_context(|| format!("{PAIRS_ENV} is not valid JSON"))?;

    let mut valid = Vec::with_capacity(parsed.len());
    for entry in parsed {
        match entry.validate() {
            Ok(()) => valid.push(entry),
            Err(e) => tracing::warn!(error = %e, "skipping invalid pair config from env"),
        }
    }

    info!(count = valid.len(), "pair configuration seeded from environment");
    Ok(valid)
}
