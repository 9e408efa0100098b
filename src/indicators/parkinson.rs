// =============================================================================
// Parkinson Range Volatility
// =============================================================================
//
// Parkinson's estimator uses the high/low range of each bar instead of
// close-to-close moves, which makes it far more sample-efficient on short
// windows:
//
//   sigma = sqrt( sum( ln(H_i / L_i)^2 ) / (4 * N * ln 2) )
//
// The result is a per-bar volatility; annualisation is left to callers that
// need it.
// =============================================================================

use crate::types::Candle;

/// Sigmoid steepness mapping per-bar sigma onto the 0-100 force scale.
const VFORCE_SIGMOID_SCALE: f64 = 60.0;

/// Compute Parkinson per-bar volatility over the trailing `window` bars.
///
/// Bars with a non-positive high or low are skipped; `N` in the denominator
/// counts only the bars that entered the sum. Fewer than two valid bars
/// yields `0.0`.
pub fn parkinson_volatility(candles: &[Candle], window: usize) -> f64 {
    let start = candles.len().saturating_sub(window);
    let mut sum = 0.0;
    let mut n = 0usize;

    for c in &candles[start..] {
        if c.low <= 0.0 || c.high <= 0.0 {
            continue;
        }
        let r = (c.high / c.low).ln();
        sum += r * r;
        n += 1;
    }

    if n < 2 {
        return 0.0;
    }

    (sum / (4.0 * n as f64 * std::f64::consts::LN_2)).sqrt()
}

/// Map a per-bar sigma onto the 0-100 volatility force scale via
/// `100 * (1 - exp(-60 * sigma))`, clamped.
pub fn vforce_from_sigma(sigma: f64) -> f64 {
    if !sigma.is_finite() || sigma <= 0.0 {
        return 0.0;
    }
    (100.0 * (1.0 - (-VFORCE_SIGMOID_SCALE * sigma).exp())).clamp(0.0, 100.0)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64) -> Candle {
        Candle {
            ts: 0,
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 1.0,
        }
    }

    #[test]
    fn flat_bars_yield_zero() {
        // H == L on every bar: ln(H/L) = 0 everywhere.
        let candles = vec![bar(100.0, 100.0); 10];
        assert_eq!(parkinson_volatility(&candles, 10), 0.0);
        assert_eq!(vforce_from_sigma(parkinson_volatility(&candles, 10)), 0.0);
    }

    #[test]
    fn fewer_than_two_valid_bars_yields_zero() {
        let candles = vec![bar(101.0, 100.0)];
        assert_eq!(parkinson_volatility(&candles, 10), 0.0);
    }

    #[test]
    fn invalid_bars_are_skipped() {
        let mut candles = vec![bar(101.0, 100.0), bar(102.0, 100.0)];
        candles.push(bar(103.0, 0.0)); // skipped
        candles.push(bar(103.0, -1.0)); // skipped
        let with_junk = parkinson_volatility(&candles, 10);
        let clean = parkinson_volatility(&candles[..2], 10);
        assert!((with_junk - clean).abs() < 1e-15);
    }

    #[test]
    fn known_value_single_ratio() {
        // Two identical bars with H/L = e: ln = 1, sum = 2,
        // sigma = sqrt(2 / (4 * 2 * ln2)) = sqrt(1 / (4 ln2)).
        let ratio = std::f64::consts::E;
        let candles = vec![bar(ratio * 100.0, 100.0), bar(ratio * 100.0, 100.0)];
        let sigma = parkinson_volatility(&candles, 2);
        let expected = (1.0 / (4.0 * std::f64::consts::LN_2)).sqrt();
        assert!((sigma - expected).abs() < 1e-12);
    }

    #[test]
    fn window_limits_lookback() {
        // Early wild bar must be ignored when the window excludes it.
        let mut candles = vec![bar(200.0, 100.0)];
        candles.extend(vec![bar(100.5, 100.0); 5]);
        let narrow = parkinson_volatility(&candles, 5);
        let wide = parkinson_volatility(&candles, 6);
        assert!(wide > narrow);
    }

    #[test]
    fn vforce_clamped_to_scale() {
        assert_eq!(vforce_from_sigma(0.0), 0.0);
        assert_eq!(vforce_from_sigma(-1.0), 0.0);
        assert_eq!(vforce_from_sigma(f64::NAN), 0.0);
        let huge = vforce_from_sigma(10.0);
        assert!(huge <= 100.0 && huge > 99.0);
    }

    #[test]
    fn vforce_monotone_in_sigma() {
        let lo = vforce_from_sigma(0.001);
        let mid = vforce_from_sigma(0.01);
        let hi = vforce_from_sigma(0.05);
        assert!(lo < mid && mid < hi);
    }
}
