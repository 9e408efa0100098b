// =============================================================================
// Water-Fill Allocator — concave capital split across candidate pools
// =============================================================================
//
// Adding capital to a pool dilutes its APR: with our fraction x of total
// capital U in a pool of depth tvl, the marginal APR is
//
//   apr * tvl / (tvl + x * U)
//
// At the optimum every funded pool sits at a common marginal APR lambda, so
//
//   x_i = max((apr_i / lambda - 1) * tvl_i / U, 0)
//
// and lambda is found by bisection on the monotone budget residual.
// =============================================================================

use tracing::debug;

use crate::types::{AllocationEntry, PoolAnalysis};

/// Bisection iteration cap.
const MAX_ITERATIONS: usize = 64;
/// Budget residual at which bisection stops early.
const BUDGET_TOLERANCE: f64 = 1e-10;
/// Entries below this weight are dropped before normalization.
const MIN_WEIGHT: f64 = 1e-3;
/// Lower edge of the lambda search.
const LAMBDA_FLOOR: f64 = 1e-4;

/// Split the capital across the `max_positions` best pools by equalizing
/// marginal APR. Returns entries summing to exactly 1.0, or empty when no
/// pool carries a positive APR.
pub fn water_fill(
    analyses: &[PoolAnalysis],
    max_positions: usize,
    total_capital_usd: f64,
) -> Vec<AllocationEntry> {
    if max_positions == 0 || total_capital_usd <= 0.0 {
        return Vec::new();
    }

    // Highest-APR candidates first; only positive-APR pools participate.
    let mut candidates: Vec<&PoolAnalysis> = analyses
        .iter()
        .filter(|a| a.apr > 0.0 && a.tvl > 0.0)
        .collect();
    candidates.sort_by(|a, b| b.apr.partial_cmp(&a.apr).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(max_positions);

    if candidates.is_empty() {
        return Vec::new();
    }

    if candidates.len() == 1 {
        let top = candidates[0];
        return vec![entry(top, 1.0, total_capital_usd)];
    }

    // Bisect lambda: the budget sum(x_i) is strictly decreasing in lambda.
    let apr_max = candidates[0].apr;
    let mut lo = LAMBDA_FLOOR;
    let mut hi = apr_max;

    let budget = |lambda: f64| -> f64 {
        candidates
            .iter()
            .map(|a| ((a.apr / lambda - 1.0) * a.tvl / total_capital_usd).max(0.0))
            .sum()
    };

    let mut lambda = (lo + hi) / 2.0;
    for _ in 0..MAX_ITERATIONS {
        lambda = (lo + hi) / 2.0;
        let total = budget(lambda);
        if (total - 1.0).abs() < BUDGET_TOLERANCE {
            break;
        }
        if total > 1.0 {
            lo = lambda;
        } else {
            hi = lambda;
        }
    }

    // Materialize weights, drop dust, renormalize to exactly 1.
    let mut weighted: Vec<(&PoolAnalysis, f64)> = candidates
        .iter()
        .map(|a| {
            let x = ((a.apr / lambda - 1.0) * a.tvl / total_capital_usd).max(0.0);
            (*a, x)
        })
        .filter(|(_, x)| *x >= MIN_WEIGHT)
        .collect();

    if weighted.is_empty() {
        // Degenerate bisection outcome: everything below dust. Fall back to
        // funding the best pool alone.
        let top = candidates[0];
        return vec![entry(top, 1.0, total_capital_usd)];
    }

    let total: f64 = weighted.iter().map(|(_, x)| x).sum();
    for (_, x) in weighted.iter_mut() {
        *x /= total;
    }

    debug!(
        pools = weighted.len(),
        lambda = format!("{lambda:.6}"),
        "water-fill allocation computed"
    );

    weighted
        .into_iter()
        .map(|(a, x)| entry(a, x, total_capital_usd))
        .collect()
}

fn entry(a: &PoolAnalysis, fraction: f64, total_capital_usd: f64) -> AllocationEntry {
    let deployed = fraction * total_capital_usd;
    AllocationEntry {
        pool_id: a.pool_id.clone(),
        chain: a.chain.clone(),
        dex: a.dex,
        fraction,
        expected_apr: a.apr * a.tvl / (a.tvl + deployed),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::PriceInterval;
    use crate::types::DexFamily;

    fn analysis(pool: &str, apr: f64, tvl: f64) -> PoolAnalysis {
        PoolAnalysis {
            pool_id: pool.into(),
            chain: "base".into(),
            dex: DexFamily::V3,
            ts: 0,
            tvl,
            fee_frac: 0.003,
            interval_volume: 0.0,
            fees_generated: 0.0,
            utilization: 0.5,
            apr,
            interval: PriceInterval::symmetric(1.0, 0.01, 100.0),
        }
    }

    fn total(entries: &[AllocationEntry]) -> f64 {
        entries.iter().map(|e| e.fraction).sum()
    }

    #[test]
    fn empty_input_yields_empty_allocation() {
        assert!(water_fill(&[], 5, 100_000.0).is_empty());
    }

    #[test]
    fn non_positive_aprs_are_excluded() {
        let pools = vec![analysis("a", 0.0, 1e6), analysis("b", -0.1, 1e6)];
        assert!(water_fill(&pools, 5, 100_000.0).is_empty());
    }

    #[test]
    fn single_pool_takes_everything() {
        let pools = vec![analysis("a", 0.2, 1e6)];
        let out = water_fill(&pools, 5, 100_000.0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fraction, 1.0);
        let expected = 0.2 * 1e6 / (1e6 + 100_000.0);
        assert!((out[0].expected_apr - expected).abs() < 1e-12);
    }

    #[test]
    fn fractions_sum_to_one() {
        let pools = vec![
            analysis("a", 0.30, 2e6),
            analysis("b", 0.20, 1e6),
            analysis("c", 0.10, 5e5),
            analysis("d", 0.05, 3e6),
        ];
        let out = water_fill(&pools, 4, 250_000.0);
        assert!(!out.is_empty());
        assert!((total(&out) - 1.0).abs() < 1e-9, "sum {}", total(&out));
    }

    #[test]
    fn max_positions_is_respected() {
        let pools: Vec<PoolAnalysis> = (0..10)
            .map(|i| analysis(&format!("p{i}"), 0.1 + i as f64 * 0.01, 1e6))
            .collect();
        let out = water_fill(&pools, 3, 100_000.0);
        assert!(out.len() <= 3);
        assert!((total(&out) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn best_pool_gets_the_largest_share() {
        let pools = vec![
            analysis("best", 0.40, 1e6),
            analysis("mid", 0.20, 1e6),
            analysis("low", 0.10, 1e6),
        ];
        let out = water_fill(&pools, 3, 100_000.0);
        let best = out.iter().find(|e| e.pool_id == "best").unwrap();
        for e in &out {
            assert!(best.fraction >= e.fraction);
        }
    }

    #[test]
    fn top_weight_non_decreasing_in_its_apr() {
        // Equal TVLs: raising the top pool's APR must never shrink its share.
        let base_tvl = 1e6;
        let mut last = 0.0;
        for apr in [0.20, 0.25, 0.30, 0.40, 0.60] {
            let pools = vec![
                analysis("top", apr, base_tvl),
                analysis("b", 0.15, base_tvl),
                analysis("c", 0.10, base_tvl),
            ];
            let out = water_fill(&pools, 3, 200_000.0);
            let top = out
                .iter()
                .find(|e| e.pool_id == "top")
                .map(|e| e.fraction)
                .unwrap_or(0.0);
            assert!(top + 1e-9 >= last, "top {top} < previous {last} at apr {apr}");
            last = top;
        }
    }

    #[test]
    fn concavity_doubling_top_tvl_never_decreases_its_share() {
        let pools = vec![
            analysis("top", 0.40, 1e6),
            analysis("b", 0.20, 2e6),
            analysis("c", 0.15, 1e6),
        ];
        let before = water_fill(&pools, 3, 300_000.0);
        let top_before = before
            .iter()
            .find(|e| e.pool_id == "top")
            .map(|e| e.fraction)
            .unwrap_or(0.0);

        let mut doubled = pools.clone();
        doubled[0].tvl *= 2.0;
        let after = water_fill(&doubled, 3, 300_000.0);
        let top_after = after
            .iter()
            .find(|e| e.pool_id == "top")
            .map(|e| e.fraction)
            .unwrap_or(0.0);

        assert!(
            top_after + 1e-9 >= top_before,
            "top share fell from {top_before} to {top_after}"
        );
    }

    #[test]
    fn expected_apr_reflects_dilution() {
        let pools = vec![analysis("a", 0.30, 1e6), analysis("b", 0.25, 1e6)];
        let out = water_fill(&pools, 2, 500_000.0);
        for e in &out {
            let raw = if e.pool_id == "a" { 0.30 } else { 0.25 };
            assert!(e.expected_apr < raw, "expected_apr must be diluted");
            assert!(e.expected_apr > 0.0);
        }
    }

    #[test]
    fn symmetric_pools_split_evenly() {
        let pools = vec![analysis("a", 0.30, 1e6), analysis("b", 0.30, 1e6)];
        let out = water_fill(&pools, 2, 100_000.0);
        assert_eq!(out.len(), 2);
        assert!((out[0].fraction - 0.5).abs() < 1e-6);
        assert!((out[1].fraction - 0.5).abs() < 1e-6);
    }
}
