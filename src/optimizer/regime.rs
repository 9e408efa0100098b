// =============================================================================
// Regime Detection — abnormal-condition guard in front of the optimizer
// =============================================================================
//
// Compares the trailing hour of M1 bars against thirty days of hourly
// baseline samples. Rules, evaluated independently:
//
//   1. VOL SPIKE     — 1h Parkinson sigma > mean + 3*std of hourly sigmas
//                      => suppress the optimizer for 4 epochs
//   2. DISPLACEMENT  — |p_now - p_1h_ago| / p_1h_ago above the pair's
//                      threshold (2% stable pairs, 10% otherwise)
//                      => suppress the optimizer for 4 epochs
//   3. VOLUME SPIKE  — last epoch's volume > 5x the mean epoch volume
//                      => widen the next range by 1.5x, do not suppress
//
// With fewer than 10 baseline samples the detector stays silent.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::aggregate::H1_MS;
use crate::indicators::parkinson::parkinson_volatility;
use crate::types::Candle;

/// Epochs the optimizer stays suppressed after a spike or displacement.
pub const SUPPRESS_EPOCHS: u64 = 4;
/// Range widening applied after a volume anomaly.
pub const WIDEN_FACTOR: f64 = 1.5;

/// Minimum hourly baseline samples before any rule can fire.
const MIN_SAMPLES: usize = 10;
/// M1 bars making up the trailing hour under test.
const HOUR_BARS: usize = 60;
/// M1 bars per epoch.
const EPOCH_BARS: usize = 15;
/// Volume anomaly multiple.
const VOLUME_SPIKE_MULT: f64 = 5.0;
/// Displacement thresholds by pair stability.
const DISPLACEMENT_STABLE: f64 = 0.02;
const DISPLACEMENT_VOLATILE: f64 = 0.10;

/// Verdict of one detection pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeVerdict {
    /// Epochs to suppress the optimizer for (0 = none).
    pub suppress_epochs: u64,
    /// Multiplier on the next range width (1.0 = none).
    pub widen_factor: f64,
    /// Which rules fired, for logging and the epoch snapshot.
    pub reasons: Vec<String>,
}

impl RegimeVerdict {
    fn quiet() -> Self {
        Self {
            suppress_epochs: 0,
            widen_factor: 1.0,
            reasons: Vec::new(),
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.suppress_epochs == 0 && self.widen_factor == 1.0
    }
}

/// Run regime detection over the pair's M1 history (trailing 30 days).
pub fn detect(m1: &[Candle], stable_pair: bool) -> RegimeVerdict {
    if m1.len() < HOUR_BARS + 1 {
        return RegimeVerdict::quiet();
    }

    let split = m1.len() - HOUR_BARS;
    let (history, last_hour) = m1.split_at(split);

    // Hourly baseline: per-bucket Parkinson sigma and summed volume.
    let mut buckets: BTreeMap<i64, Vec<&Candle>> = BTreeMap::new();
    for c in history {
        buckets
            .entry(c.ts.div_euclid(H1_MS))
            .or_default()
            .push(c);
    }

    let mut sigmas = Vec::with_capacity(buckets.len());
    let mut volumes = Vec::with_capacity(buckets.len());
    for bars in buckets.values() {
        let owned: Vec<Candle> = bars.iter().map(|c| (*c).clone()).collect();
        sigmas.push(parkinson_volatility(&owned, owned.len()));
        volumes.push(owned.iter().map(|c| c.volume).sum::<f64>());
    }

    if sigmas.len() < MIN_SAMPLES {
        return RegimeVerdict::quiet();
    }

    let mut verdict = RegimeVerdict::quiet();

    // --- 1. Volatility spike -------------------------------------------------
    let (sigma_mean, sigma_std) = mean_std(&sigmas);
    let sigma_now = parkinson_volatility(last_hour, last_hour.len());
    if sigma_now > sigma_mean + 3.0 * sigma_std {
        verdict.suppress_epochs = SUPPRESS_EPOCHS;
        verdict.reasons.push("vol_spike".into());
    }

    // --- 2. Price displacement ----------------------------------------------
    let p_now = last_hour.last().map(|c| c.close).unwrap_or(0.0);
    let p_hour_ago = last_hour.first().map(|c| c.close).unwrap_or(0.0);
    if p_hour_ago > 0.0 {
        let displacement = (p_now - p_hour_ago).abs() / p_hour_ago;
        let threshold = if stable_pair {
            DISPLACEMENT_STABLE
        } else {
            DISPLACEMENT_VOLATILE
        };
        if displacement > threshold {
            verdict.suppress_epochs = SUPPRESS_EPOCHS;
            verdict.reasons.push("price_displacement".into());
        }
    }

    // --- 3. Volume anomaly ---------------------------------------------------
    let epoch_volume: f64 = last_hour[last_hour.len() - EPOCH_BARS.min(last_hour.len())..]
        .iter()
        .map(|c| c.volume)
        .sum();
    let mean_epoch_volume = volumes.iter().sum::<f64>() / volumes.len() as f64 / 4.0;
    if mean_epoch_volume > 0.0 && epoch_volume > VOLUME_SPIKE_MULT * mean_epoch_volume {
        verdict.widen_factor = WIDEN_FACTOR;
        verdict.reasons.push("volume_anomaly".into());
    }

    if !verdict.is_quiet() {
        debug!(
            reasons = ?verdict.reasons,
            suppress_epochs = verdict.suppress_epochs,
            widen_factor = verdict.widen_factor,
            "abnormal regime detected"
        );
    }

    verdict
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    (mean, var.sqrt())
}
