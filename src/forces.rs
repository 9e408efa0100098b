// =============================================================================
// Forces — volatility / momentum / trend summary of recent price action
// =============================================================================
//
// Every force lives on a 0-100 scale with 50 as the neutral point. A force
// triple is computed per timeframe and then blended across M15 / H1 / H4
// with fixed weights; M1 and M5 are deliberately left out as microstructure
// noise.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::ForceParams;
use crate::indicators::aggregate::{aggregate, H1_MS, H4_MS, M15_MS};
use crate::indicators::parkinson::{parkinson_volatility, vforce_from_sigma};
use crate::indicators::rsi::wilder_rsi;
use crate::indicators::sma::calculate_sma;
use crate::types::Candle;

/// RSI period feeding the momentum force.
const RSI_PERIOD: usize = 14;
/// Scale applied to the relative SMA spread in the trend force.
const TFORCE_SCALE: f64 = 1000.0;

/// Timeframe blend: (bar period ms, weight, trailing bars considered).
const TIMEFRAME_BLEND: [(i64, f64, usize); 3] =
    [(M15_MS, 0.30, 96), (H1_MS, 0.40, 168), (H4_MS, 0.30, 180)];

// ---------------------------------------------------------------------------
// Component types
// ---------------------------------------------------------------------------

/// Volatility force with the close-series moments backing its fallback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VForce {
    pub force: f64,
    pub mean: f64,
    pub std: f64,
}

/// Momentum force with the up/down tally of recent close differences.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MForce {
    pub force: f64,
    pub up: f64,
    pub down: f64,
}

/// Trend force with the two moving averages behind the crossover.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TForce {
    pub force: f64,
    pub ma_short: f64,
    pub ma_long: f64,
}

/// The volatility / momentum / trend triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Forces {
    pub v: VForce,
    pub m: MForce,
    pub t: TForce,
}

impl Forces {
    /// The do-nothing triple: zero volatility, balanced momentum and trend.
    pub fn neutral() -> Self {
        Self {
            v: VForce {
                force: 0.0,
                mean: 0.0,
                std: 0.0,
            },
            m: MForce {
                force: 50.0,
                up: 0.0,
                down: 0.0,
            },
            t: TForce {
                force: 50.0,
                ma_short: 0.0,
                ma_long: 0.0,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Per-timeframe components
// ---------------------------------------------------------------------------

/// Volatility force: Parkinson when at least one bar carries real range,
/// otherwise the coefficient of variation of closes, clamped to the scale.
pub fn vforce(candles: &[Candle]) -> VForce {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let (mean, std) = mean_std(&closes);

    let has_range = candles.iter().any(|c| c.high > c.low && c.low > 0.0);
    let force = if has_range {
        vforce_from_sigma(parkinson_volatility(candles, candles.len()))
    } else if mean > 0.0 {
        ((std / mean) * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };

    VForce { force, mean, std }
}

/// Momentum force: Wilder RSI clamped to the scale plus the sign tally of
/// the trailing `min(lookback, len - 1)` close differences.
pub fn mforce(candles: &[Candle], lookback: usize) -> MForce {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let force = wilder_rsi(&closes, RSI_PERIOD).clamp(0.0, 100.0);

    let span = lookback.min(closes.len().saturating_sub(1));
    let mut up = 0.0;
    let mut down = 0.0;
    if span > 0 {
        let tail = &closes[closes.len() - span - 1..];
        for w in tail.windows(2) {
            if w[1] > w[0] {
                up += 1.0;
            } else if w[1] < w[0] {
                down += 1.0;
            }
        }
    }

    MForce { force, up, down }
}

/// Trend force from the SMA crossover of a short window (`len / 3`) against
/// a long window (`2 * len / 3`): `50 + relative spread * 1000`, clamped.
/// Insufficient data reduces to the neutral 50.
pub fn tforce(candles: &[Candle]) -> TForce {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let short_period = closes.len() / 3;
    let long_period = 2 * closes.len() / 3;

    if short_period == 0 || long_period == 0 || long_period > closes.len() {
        return TForce {
            force: 50.0,
            ma_short: 0.0,
            ma_long: 0.0,
        };
    }

    let ma_short = match calculate_sma(&closes, short_period).last() {
        Some(&v) => v,
        None => {
            return TForce {
                force: 50.0,
                ma_short: 0.0,
                ma_long: 0.0,
            }
        }
    };
    let ma_long = match calculate_sma(&closes, long_period).last() {
        Some(&v) => v,
        None => {
            return TForce {
                force: 50.0,
                ma_short: 0.0,
                ma_long: 0.0,
            }
        }
    };

    if ma_long == 0.0 {
        return TForce {
            force: 50.0,
            ma_short,
            ma_long,
        };
    }

    let force = (50.0 + ((ma_short - ma_long) / ma_long) * TFORCE_SCALE).clamp(0.0, 100.0);
    TForce {
        force,
        ma_short,
        ma_long,
    }
}

/// Compute the full triple on a single timeframe.
pub fn timeframe_forces(candles: &[Candle], params: &ForceParams) -> Forces {
    Forces {
        v: vforce(candles),
        m: mforce(candles, params.lookback),
        t: tforce(candles),
    }
}

// ---------------------------------------------------------------------------
// Composite
// ---------------------------------------------------------------------------

/// Blend the force triples of M15 / H1 / H4 into one composite, weighting
/// every component (forces and side fields alike) by the fixed timeframe
/// weights.
pub fn composite(m1: &[Candle], params: &ForceParams) -> Forces {
    let mut acc = Forces {
        v: VForce {
            force: 0.0,
            mean: 0.0,
            std: 0.0,
        },
        m: MForce {
            force: 0.0,
            up: 0.0,
            down: 0.0,
        },
        t: TForce {
            force: 0.0,
            ma_short: 0.0,
            ma_long: 0.0,
        },
    };

    for (period_ms, weight, bars) in TIMEFRAME_BLEND {
        let series = aggregate(m1, period_ms);
        let start = series.len().saturating_sub(bars);
        let tf = timeframe_forces(&series[start..], params);

        acc.v.force += weight * tf.v.force;
        acc.v.mean += weight * tf.v.mean;
        acc.v.std += weight * tf.v.std;
        acc.m.force += weight * tf.m.force;
        acc.m.up += weight * tf.m.up;
        acc.m.down += weight * tf.m.down;
        acc.t.force += weight * tf.t.force;
        acc.t.ma_short += weight * tf.t.ma_short;
        acc.t.ma_long += weight * tf.t.ma_long;
    }

    acc
}

/// Sample mean and population standard deviation.
fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    (mean, var.sqrt())
}
