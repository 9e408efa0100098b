// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Step 1 — Compute price changes (deltas) from consecutive closes.
// Step 2 — Seed average gain / average loss with the SMA of the first `period`
//          gains / losses inside the warm-up window.
// Step 3 — Apply Wilder's exponential smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + current_gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + current_loss) / period
// Step 4 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// The walk is bounded to a warm-up window of `4 * period` bars before the
// report point, so successive calls on a growing series agree within
// floating-point tolerance regardless of how much history the caller holds.
// =============================================================================

/// Warm-up multiple: how many periods of history feed the smoothing before
/// the report point.
const WARMUP_PERIODS: usize = 4;

/// Compute the RSI at the end of `closes` for the given `period`.
///
/// # Edge cases
/// - `period == 0` or `closes.len() < period + 1` => neutral `50.0`
/// - Average loss zero with gains present => `100.0`
/// - No movement at all => neutral `50.0`
pub fn wilder_rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 50.0;
    }

    // Bound the walk to the warm-up window ending at the report point.
    let max_bars = WARMUP_PERIODS * period + 1;
    let start = closes.len().saturating_sub(max_bars);
    let window = &closes[start..];

    let deltas: Vec<f64> = window.windows(2).map(|w| w[1] - w[0]).collect();

    // Seed averages with the SMA of the first `period` deltas.
    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    // Wilder's smoothing over the remaining deltas.
    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    rsi_from_averages(avg_gain, avg_loss)
}

/// Convert average gain / average loss into an RSI value in [0, 100].
///
/// - If both averages are zero, RSI is 50.0 (no movement).
/// - If average loss is zero (only gains), RSI is 100.0.
/// - Non-finite results collapse to the neutral 50.0.
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    if rsi.is_finite() {
        rsi
    } else {
        50.0
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_empty_input_is_neutral() {
        assert_eq!(wilder_rsi(&[], 14), 50.0);
    }

    #[test]
    fn rsi_period_zero_is_neutral() {
        assert_eq!(wilder_rsi(&[1.0, 2.0, 3.0], 0), 50.0);
    }

    #[test]
    fn rsi_insufficient_data_is_neutral() {
        // Need period+1 closes (period deltas). 14 closes => 13 deltas < 14.
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert_eq!(wilder_rsi(&closes, 14), 50.0);
    }

    #[test]
    fn rsi_all_gains() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let v = wilder_rsi(&closes, 14);
        assert!((v - 100.0).abs() < 1e-10, "expected 100.0, got {v}");
    }

    #[test]
    fn rsi_all_losses() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        let v = wilder_rsi(&closes, 14);
        assert!(v.abs() < 1e-10, "expected 0.0, got {v}");
    }

    #[test]
    fn rsi_flat_market_is_neutral() {
        let closes = vec![100.0; 30];
        assert_eq!(wilder_rsi(&closes, 14), 50.0);
    }

    #[test]
    fn rsi_range_check() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let v = wilder_rsi(&closes, 14);
        assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
    }

    #[test]
    fn rsi_agrees_on_growing_series() {
        // A long history and a 4*period suffix of it must agree at the
        // report point — that is the purpose of the warm-up bound.
        let closes: Vec<f64> = (0..500)
            .map(|i| 100.0 + ((i as f64) * 0.7).sin() * 5.0 + (i as f64) * 0.01)
            .collect();
        let full = wilder_rsi(&closes, 14);
        let suffix = wilder_rsi(&closes[closes.len() - (4 * 14 + 1)..], 14);
        assert!(
            (full - suffix).abs() < 1e-9,
            "full {full} vs suffix {suffix}"
        );
    }
}
