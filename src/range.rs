// =============================================================================
// Range — mapping forces onto a price interval, plus interval geometry
// =============================================================================
//
// The five range parameters are the optimizer's search space; their hard
// bounds live here next to the math that consumes them. Tick conversion uses
// the canonical 1.0001 base; the lower bound snaps down and the upper bound
// snaps up to the venue's tick spacing so the aligned interval always covers
// the requested one.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::ForceParams;
use crate::forces::Forces;

/// Log-price base of one tick.
const TICK_BASE: f64 = 1.0001;

// =============================================================================
// Range parameters
// =============================================================================

/// Hard bounds of the five tunable parameters, in struct field order:
/// `base_min`, `base_max`, `vforce_exp`, `vforce_divider`, `rs_threshold`.
pub const PARAM_BOUNDS: [(f64, f64); 5] = [
    (1e-4, 5e-3),
    (5e-3, 1e-1),
    (-1.0, -0.05),
    (50.0, 1000.0),
    (0.1, 0.35),
];

/// The five numbers parameterizing the `vforce -> half-width` mapping and
/// the range-shift trigger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeParams {
    /// Minimum half-width as a fraction of price.
    pub base_min: f64,
    /// Maximum half-width as a fraction of price.
    pub base_max: f64,
    /// Exponent shaping the volatility response (negative).
    pub vforce_exp: f64,
    /// Volatility force divisor inside the exponent.
    pub vforce_divider: f64,
    /// Interval divergence beyond which a range shift is considered.
    pub rs_threshold: f64,
}

impl Default for RangeParams {
    fn default() -> Self {
        Self {
            base_min: 1e-3,
            base_max: 3e-2,
            vforce_exp: -0.5,
            vforce_divider: 100.0,
            rs_threshold: 0.25,
        }
    }
}

impl RangeParams {
    /// View as an optimizer vector, in [`PARAM_BOUNDS`] order.
    pub fn to_vec(self) -> [f64; 5] {
        [
            self.base_min,
            self.base_max,
            self.vforce_exp,
            self.vforce_divider,
            self.rs_threshold,
        ]
    }

    /// Rebuild from an optimizer vector, clamping every component into its
    /// bound.
    pub fn from_vec(v: [f64; 5]) -> Self {
        let c = clamp_vec(v);
        Self {
            base_min: c[0],
            base_max: c[1],
            vforce_exp: c[2],
            vforce_divider: c[3],
            rs_threshold: c[4],
        }
    }

    /// Clamp each field into its hard bound.
    pub fn clamped(self) -> Self {
        Self::from_vec(self.to_vec())
    }

    /// Widen both half-width bases by `factor` (regime widening), re-clamped.
    pub fn widened(self, factor: f64) -> Self {
        Self {
            base_min: self.base_min * factor,
            base_max: self.base_max * factor,
            ..self
        }
        .clamped()
    }
}

/// Clamp an optimizer vector component-wise into [`PARAM_BOUNDS`].
pub fn clamp_vec(v: [f64; 5]) -> [f64; 5] {
    let mut out = v;
    for (x, (lo, hi)) in out.iter_mut().zip(PARAM_BOUNDS.iter()) {
        *x = x.clamp(*lo, *hi);
    }
    out
}

// =============================================================================
// Price intervals
// =============================================================================

/// Directional classification of an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalKind {
    Bullish,
    Bearish,
    Neutral,
}

/// A price band around a base price, with the confidence and trend bias that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceInterval {
    pub min: f64,
    pub max: f64,
    pub base: f64,
    pub breadth: f64,
    /// Confidence in the interval, 0-100.
    pub confidence: f64,
    /// Trend bias in [-1, 1]; positive stretches the upper half.
    pub trend_bias: f64,
    pub kind: IntervalKind,
}

impl PriceInterval {
    /// Symmetric interval of the given relative half-width around `price`.
    pub fn symmetric(price: f64, half_width_frac: f64, confidence: f64) -> Self {
        let half = price * half_width_frac;
        Self {
            min: price - half,
            max: price + half,
            base: price,
            breadth: 2.0 * half,
            confidence,
            trend_bias: 0.0,
            kind: IntervalKind::Neutral,
        }
    }

    pub fn contains(&self, price: f64) -> bool {
        price >= self.min && price <= self.max
    }
}

/// Derive the target interval around `price` from the composite forces.
///
/// Confidence starts at 100 and decays with excess volatility; momentum
/// stretch inside a ranging market cuts it further. In a trending market the
/// trend force sets a bias that skews the interval toward the trend, with
/// momentum either amplifying the bias (agreement) or damping both bias and
/// confidence (opposition).
pub fn compute_range(
    price: f64,
    forces: &Forces,
    params: &RangeParams,
    fp: &ForceParams,
) -> PriceInterval {
    let mut confidence: f64 = 100.0;
    let mut bias: f64 = 0.0;
    let mut kind = IntervalKind::Neutral;

    // Volatility decay.
    confidence *= (fp.confidence_exp * (forces.v.force - fp.critical_force)).exp();

    let m_delta = (forces.m.force - 50.0).abs();
    if forces.t.force > fp.bearish_from && forces.t.force < fp.bullish_from {
        // Ranging market: stretched momentum erodes confidence.
        if forces.m.force > fp.overbought || forces.m.force < fp.oversold {
            confidence /= (m_delta * fp.m_divider).max(1.0);
        }
    } else {
        // Trending market.
        kind = if forces.t.force >= fp.bullish_from {
            IntervalKind::Bullish
        } else {
            IntervalKind::Bearish
        };
        bias = (forces.t.force - 50.0) / 100.0;

        let momentum_agrees = (bias > 0.0 && forces.m.force > 50.0)
            || (bias < 0.0 && forces.m.force < 50.0);
        if momentum_agrees {
            bias *= (fp.bias_exp * m_delta).exp();
        } else if m_delta > 0.0 {
            // Divisor floored at 1 so weak opposition never amplifies.
            let divisor = (m_delta * fp.opposing_divider).max(1.0);
            bias /= divisor;
            confidence /= divisor;
        }
    }

    confidence = confidence.clamp(0.0, 100.0);
    bias = bias.clamp(-1.0, 1.0);

    // Half-width response to volatility, floored at the minimum base.
    let half_frac = (params.base_min
        + (params.base_max - params.base_min)
            * (params.vforce_exp * forces.v.force / params.vforce_divider).exp())
    .max(params.base_min);
    let half = price * half_frac;

    let skew = 1.0 + bias.abs();
    let (min, max) = if bias > 0.0 {
        (price - half / skew, price + half * skew)
    } else if bias < 0.0 {
        (price - half * skew, price + half / skew)
    } else {
        (price - half, price + half)
    };

    PriceInterval {
        min,
        max,
        base: price,
        breadth: max - min,
        confidence,
        trend_bias: bias,
        kind,
    }
}

/// Divergence of `target` from `current` in [0, 1]: relative width change
/// plus relative centre displacement, each clamped, with the sum clamped.
///
/// `divergence(r, r) == 0`; non-overlapping intervals of equal width reach 1.
pub fn range_divergence(current: &PriceInterval, target: &PriceInterval) -> f64 {
    let width_c = current.max - current.min;
    let width_t = target.max - target.min;

    if width_c <= 0.0 {
        return if width_t <= 0.0 { 0.0 } else { 1.0 };
    }

    let size_term = ((width_t - width_c).abs() / width_c).clamp(0.0, 1.0);

    let centre_c = (current.max + current.min) / 2.0;
    let centre_t = (target.max + target.min) / 2.0;
    let centre_term = ((centre_t - centre_c).abs() / width_c).clamp(0.0, 1.0);

    (size_term + centre_term).clamp(0.0, 1.0)
}

// =============================================================================
// Tick conversion
// =============================================================================

/// Exact (unaligned) tick of a price: `ln(price) / ln(1.0001)`.
pub fn price_to_tick(price: f64) -> f64 {
    price.ln() / TICK_BASE.ln()
}

/// Price at a tick: `1.0001^tick`.
pub fn tick_to_price(tick: i32) -> f64 {
    TICK_BASE.powi(tick)
}

/// Convert an interval into aligned venue ticks: the lower bound snaps down
/// and the upper bound snaps up to a multiple of `spacing`, so the aligned
/// range always covers the requested one. Degenerate results are widened by
/// one spacing.
pub fn interval_to_ticks(interval: &PriceInterval, spacing: i32) -> (i32, i32) {
    let spacing = spacing.max(1);
    let raw_lower = price_to_tick(interval.min).floor() as i32;
    let raw_upper = price_to_tick(interval.max).ceil() as i32;

    let lower = raw_lower.div_euclid(spacing) * spacing;
    let mut upper = if raw_upper.rem_euclid(spacing) == 0 {
        raw_upper
    } else {
        (raw_upper.div_euclid(spacing) + 1) * spacing
    };
    if upper <= lower {
        upper = lower + spacing;
    }
    (lower, upper)
}

/// Rebuild a neutral interval from venue ticks (geometric mid as base).
pub fn interval_from_ticks(lower: i32, upper: i32) -> PriceInterval {
    let min = tick_to_price(lower);
    let max = tick_to_price(upper);
    PriceInterval {
        min,
        max,
        base: (min * max).sqrt(),
        breadth: max - min,
        confidence: 100.0,
        trend_bias: 0.0,
        kind: IntervalKind::Neutral,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::forces::{MForce, TForce, VForce};

    fn forces(v: f64, m: f64, t: f64) -> Forces {
        Forces {
            v: VForce {
                force: v,
                mean: 0.0,
                std: 0.0,
            },
            m: MForce {
                force: m,
                up: 0.0,
                down: 0.0,
            },
            t: TForce {
                force: t,
                ma_short: 0.0,
                ma_long: 0.0,
            },
        }
    }

    #[test]
    fn default_params_inside_bounds() {
        let d = RangeParams::default().to_vec();
        for (x, (lo, hi)) in d.iter().zip(PARAM_BOUNDS.iter()) {
            assert!(x >= lo && x <= hi, "{x} outside [{lo}, {hi}]");
        }
    }

    #[test]
    fn clamp_vec_pins_out_of_bound_components() {
        let c = clamp_vec([0.0, 1.0, 0.5, 0.0, 1.0]);
        assert_eq!(c[0], 1e-4);
        assert_eq!(c[1], 1e-1);
        assert_eq!(c[2], -0.05);
        assert_eq!(c[3], 50.0);
        assert_eq!(c[4], 0.35);
    }

    #[test]
    fn neutral_forces_yield_symmetric_range() {
        let iv = compute_range(
            1.0,
            &Forces::neutral(),
            &RangeParams::default(),
            &ForceParams::default(),
        );
        let lower = iv.base - iv.min;
        let upper = iv.max - iv.base;
        assert!((lower - upper).abs() < 1e-3, "lower {lower} upper {upper}");
        assert_eq!(iv.kind, IntervalKind::Neutral);
        assert!(iv.min < iv.base && iv.base < iv.max);
    }

    #[test]
    fn bullish_forces_stretch_the_upper_half() {
        let iv = compute_range(
            1.0,
            &forces(20.0, 65.0, 80.0),
            &RangeParams::default(),
            &ForceParams::default(),
        );
        assert_eq!(iv.kind, IntervalKind::Bullish);
        assert!(iv.trend_bias > 0.0);
        assert!(iv.max - iv.base > iv.base - iv.min);
    }

    #[test]
    fn bearish_forces_stretch_the_lower_half() {
        let iv = compute_range(
            1.0,
            &forces(20.0, 35.0, 20.0),
            &RangeParams::default(),
            &ForceParams::default(),
        );
        assert_eq!(iv.kind, IntervalKind::Bearish);
        assert!(iv.trend_bias < 0.0);
        assert!(iv.base - iv.min > iv.max - iv.base);
    }

    #[test]
    fn opposing_momentum_damps_confidence() {
        // High enough volatility that confidence sits below the clamp, so
        // the opposing-momentum division is visible.
        let agreeing = compute_range(
            1.0,
            &forces(80.0, 80.0, 80.0),
            &RangeParams::default(),
            &ForceParams::default(),
        );
        let opposing = compute_range(
            1.0,
            &forces(80.0, 20.0, 80.0),
            &RangeParams::default(),
            &ForceParams::default(),
        );
        assert!(opposing.confidence < agreeing.confidence);
        assert!(opposing.trend_bias < agreeing.trend_bias);
    }

    #[test]
    fn high_volatility_decays_confidence() {
        let calm = compute_range(
            1.0,
            &forces(10.0, 50.0, 50.0),
            &RangeParams::default(),
            &ForceParams::default(),
        );
        let wild = compute_range(
            1.0,
            &forces(95.0, 50.0, 50.0),
            &RangeParams::default(),
            &ForceParams::default(),
        );
        assert!(wild.confidence < calm.confidence);
    }

    #[test]
    fn half_width_floored_at_base_min() {
        let params = RangeParams::default();
        let iv = compute_range(
            100.0,
            &forces(100.0, 50.0, 50.0),
            &params,
            &ForceParams::default(),
        );
        assert!(iv.breadth / 2.0 >= 100.0 * params.base_min - 1e-12);
    }

    #[test]
    fn divergence_reflexive() {
        let iv = PriceInterval::symmetric(1.0, 0.01, 100.0);
        assert_eq!(range_divergence(&iv, &iv), 0.0);
    }

    #[test]
    fn divergence_bounded() {
        let a = PriceInterval::symmetric(1.0, 0.01, 100.0);
        let b = PriceInterval::symmetric(5.0, 0.2, 100.0);
        let d = range_divergence(&a, &b);
        assert!((0.0..=1.0).contains(&d));
    }

    #[test]
    fn non_overlapping_equal_width_diverges_fully() {
        let a = PriceInterval::symmetric(1.0, 0.01, 100.0);
        let b = PriceInterval::symmetric(1.5, 0.01 / 1.5, 100.0);
        // Same absolute width, fully displaced centres.
        let mut b = b;
        b.min = a.min + 10.0 * a.breadth;
        b.max = b.min + a.breadth;
        assert_eq!(range_divergence(&a, &b), 1.0);
    }

    #[test]
    fn tick_roundtrip() {
        let price = 1.5;
        let tick = price_to_tick(price);
        let back = tick_to_price(tick.round() as i32);
        assert!((back - price).abs() / price < 1e-3);
    }

    #[test]
    fn tick_alignment_covers_interval() {
        let iv = PriceInterval::symmetric(1.0, 0.02, 100.0);
        let (lower, upper) = interval_to_ticks(&iv, 60);
        assert_eq!(lower.rem_euclid(60), 0);
        assert_eq!(upper.rem_euclid(60), 0);
        assert!(tick_to_price(lower) <= iv.min);
        assert!(tick_to_price(upper) >= iv.max);
        assert!(upper > lower);
    }

    #[test]
    fn tick_alignment_degenerate_interval_widens() {
        let iv = PriceInterval::symmetric(1.0, 1e-9, 100.0);
        let (lower, upper) = interval_to_ticks(&iv, 10);
        assert!(upper > lower);
    }

    #[test]
    fn interval_from_ticks_geometry() {
        let iv = interval_from_ticks(-100, 100);
        assert!(iv.min < 1.0 && iv.max > 1.0);
        assert!((iv.base - 1.0).abs() < 1e-9); // geometric mid of 1.0001^±100
        assert_eq!(iv.kind, IntervalKind::Neutral);
    }

    #[test]
    fn widened_params_respect_bounds() {
        let w = RangeParams::default().widened(10.0);
        assert!(w.base_max <= PARAM_BOUNDS[1].1);
        assert!(w.base_min <= PARAM_BOUNDS[0].1);
    }
}
