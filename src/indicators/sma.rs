// =============================================================================
// Simple Moving Average — rolling sum, O(n) over the whole series
// =============================================================================

/// Compute the SMA series for `values` with the given `window`.
///
/// The output has one element per input starting at index `window - 1`.
/// Returns an empty `Vec` when the window is zero or exceeds the input
/// length.
pub fn calculate_sma(values: &[f64], window: usize) -> Vec<f64> {
    if window == 0 || values.len() < window {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(values.len() - window + 1);
    let mut sum: f64 = values[..window].iter().sum();
    out.push(sum / window as f64);

    for i in window..values.len() {
        sum += values[i] - values[i - window];
        out.push(sum / window as f64);
    }

    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_empty_input() {
        assert!(calculate_sma(&[], 3).is_empty());
    }

    #[test]
    fn sma_window_zero() {
        assert!(calculate_sma(&[1.0, 2.0], 0).is_empty());
    }

    #[test]
    fn sma_window_exceeds_input() {
        assert!(calculate_sma(&[1.0, 2.0], 3).is_empty());
    }

    #[test]
    fn sma_window_equals_input() {
        let out = calculate_sma(&[2.0, 4.0, 6.0], 3);
        assert_eq!(out, vec![4.0]);
    }

    #[test]
    fn sma_known_values() {
        let out = calculate_sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 2);
        assert_eq!(out, vec![1.5, 2.5, 3.5, 4.5]);
    }

    #[test]
    fn sma_rolling_matches_naive() {
        let values: Vec<f64> = (0..100).map(|i| ((i as f64) * 0.31).cos() * 10.0).collect();
        let window = 7;
        let rolled = calculate_sma(&values, window);
        for (i, got) in rolled.iter().enumerate() {
            let naive: f64 = values[i..i + window].iter().sum::<f64>() / window as f64;
            assert!((got - naive).abs() < 1e-9);
        }
    }
}
