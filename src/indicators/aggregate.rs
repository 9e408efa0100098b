// =============================================================================
// Candle Aggregation — M1 bars into fixed-period buckets
// =============================================================================
//
// Buckets are keyed by the absolute period boundary `floor(ts / period) *
// period`, never by offsets from the first bar, so repeated aggregation of a
// growing series can never drift.
// =============================================================================

use std::collections::BTreeMap;

use crate::types::Candle;

/// One minute in milliseconds — the base candle period.
pub const M1_MS: i64 = 60_000;
/// Fifteen minutes in milliseconds.
pub const M15_MS: i64 = 15 * M1_MS;
/// One hour in milliseconds.
pub const H1_MS: i64 = 60 * M1_MS;
/// Four hours in milliseconds.
pub const H4_MS: i64 = 240 * M1_MS;

/// Aggregate base bars into `period_ms` buckets.
///
/// Open is the first bar's open, close the last bar's close, high/low are
/// extrema and volume sums. Input order does not matter; output is sorted by
/// bucket timestamp. `period_ms <= 0` returns empty.
pub fn aggregate(candles: &[Candle], period_ms: i64) -> Vec<Candle> {
    if period_ms <= 0 {
        return Vec::new();
    }

    // bucket ts -> (first bar ts, last bar ts, bucket candle)
    let mut buckets: BTreeMap<i64, (i64, i64, Candle)> = BTreeMap::new();

    for c in candles {
        let bucket_ts = c.ts.div_euclid(period_ms) * period_ms;
        match buckets.get_mut(&bucket_ts) {
            None => {
                let mut agg = c.clone();
                agg.ts = bucket_ts;
                buckets.insert(bucket_ts, (c.ts, c.ts, agg));
            }
            Some((first_ts, last_ts, agg)) => {
                if c.ts < *first_ts {
                    *first_ts = c.ts;
                    agg.open = c.open;
                }
                if c.ts > *last_ts {
                    *last_ts = c.ts;
                    agg.close = c.close;
                }
                agg.high = agg.high.max(c.high);
                agg.low = agg.low.min(c.low);
                agg.volume += c.volume;
            }
        }
    }

    buckets.into_values().map(|(_, _, agg)| agg).collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn m1(ts_min: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            ts: ts_min * M1_MS,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn empty_input() {
        assert!(aggregate(&[], M15_MS).is_empty());
    }

    #[test]
    fn non_positive_period() {
        let candles = vec![m1(0, 1.0, 1.0, 1.0, 1.0, 1.0)];
        assert!(aggregate(&candles, 0).is_empty());
        assert!(aggregate(&candles, -60_000).is_empty());
    }

    #[test]
    fn fifteen_minute_bucket_semantics() {
        // Minutes 0..15 land in one bucket; minute 15 starts the next.
        let candles: Vec<Candle> = (0..16)
            .map(|i| m1(i, 100.0 + i as f64, 101.0 + i as f64, 99.0 + i as f64, 100.5 + i as f64, 2.0))
            .collect();
        let m15 = aggregate(&candles, M15_MS);
        assert_eq!(m15.len(), 2);

        let first = &m15[0];
        assert_eq!(first.ts, 0);
        assert_eq!(first.open, 100.0); // minute 0's open
        assert_eq!(first.close, 100.5 + 14.0); // minute 14's close
        assert_eq!(first.high, 101.0 + 14.0);
        assert_eq!(first.low, 99.0);
        assert_eq!(first.volume, 30.0); // 15 bars * 2.0

        assert_eq!(m15[1].ts, M15_MS);
        assert_eq!(m15[1].volume, 2.0);
    }

    #[test]
    fn absolute_boundaries_not_relative_to_first_bar() {
        // Series starting mid-bucket must still snap to the absolute boundary.
        let candles = vec![m1(7, 1.0, 2.0, 0.5, 1.5, 1.0), m1(8, 1.5, 3.0, 1.0, 2.0, 1.0)];
        let m15 = aggregate(&candles, M15_MS);
        assert_eq!(m15.len(), 1);
        assert_eq!(m15[0].ts, 0); // floor(7m / 15m) * 15m
        assert_eq!(m15[0].open, 1.0);
        assert_eq!(m15[0].close, 2.0);
        assert_eq!(m15[0].high, 3.0);
        assert_eq!(m15[0].low, 0.5);
    }

    #[test]
    fn unsorted_input_is_handled() {
        let mut candles = vec![
            m1(2, 3.0, 3.5, 2.5, 3.2, 1.0),
            m1(0, 1.0, 1.5, 0.5, 1.2, 1.0),
            m1(1, 2.0, 2.5, 1.5, 2.2, 1.0),
        ];
        let sorted = aggregate(&{
            candles.sort_by_key(|c| c.ts);
            candles.clone()
        }, M15_MS);
        candles.reverse();
        let unsorted = aggregate(&candles, M15_MS);
        assert_eq!(sorted, unsorted);
        assert_eq!(sorted[0].open, 1.0);
        assert_eq!(sorted[0].close, 3.2);
    }

    #[test]
    fn hourly_rollup_of_m15_equals_direct_hourly() {
        let candles: Vec<Candle> = (0..120)
            .map(|i| {
                let f = i as f64;
                m1(i, 100.0 + f, 101.0 + f, 99.0 + f, 100.2 + f, 1.0)
            })
            .collect();
        let direct = aggregate(&candles, H1_MS);
        let via_m15 = aggregate(&aggregate(&candles, M15_MS), H1_MS);
        assert_eq!(direct, via_m15);
        assert_eq!(direct.len(), 2);
    }
}
