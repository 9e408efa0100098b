// =============================================================================
// Decision — pure PRA / RS / HOLD selection
// =============================================================================
//
// Given the cycle's target allocation and the currently open positions, pick
// exactly one action:
//
//   PRA  — burn everything and redeploy to the target allocation
//   RS   — re-range specific positions inside their pools
//   HOLD — do nothing this cycle
//
// Gate order matters: the minimum-hold gate short-circuits everything, PRA
// outranks RS, and both on-chain actions must clear a gas amortization gate
// before they are worth paying for. This function performs no I/O; storage
// and execution live downstream.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::{ForceParams, Thresholds};
use crate::forces::Forces;
use crate::range::{
    compute_range, interval_from_ticks, range_divergence, PriceInterval, RangeParams,
};
use crate::types::{AllocationEntry, Position};

/// Minimum time a freshly rebalanced book is held, milliseconds.
const MIN_HOLD_MS: i64 = 12 * 3_600_000;
/// Gain amortization horizon: one week of a year.
const AMORTIZATION_FRAC: f64 = 7.0 / 365.0;
/// Gas multiple a full reallocation must recoup over the horizon.
const PRA_GAS_MULT: f64 = 1.5;
/// Gas multiple a range shift must recoup over the horizon.
const RS_GAS_MULT: f64 = 2.0;
/// Absolute APR gain treated as a real improvement when the book currently
/// earns nothing.
const IMPROVEMENT_FLOOR: f64 = 0.005;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The selected action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "PRA")]
    Pra,
    #[serde(rename = "RS")]
    Rs,
    #[serde(rename = "HOLD")]
    Hold,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pra => write!(f, "PRA"),
            Self::Rs => write!(f, "RS"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// One position's planned re-ranging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeShift {
    pub pool_id: String,
    pub chain: String,
    pub position_id: String,
    pub old: PriceInterval,
    pub new: PriceInterval,
}

/// The full decision record emitted every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub kind: ActionKind,
    pub ts: i64,
    pub current_apr: f64,
    pub optimal_apr: f64,
    pub improvement: f64,
    pub target_allocations: Vec<AllocationEntry>,
    /// Present iff `kind == Rs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_shifts: Option<Vec<RangeShift>>,
}

impl Decision {
    fn hold(
        ts: i64,
        current_apr: f64,
        optimal_apr: f64,
        improvement: f64,
        targets: &[AllocationEntry],
    ) -> Self {
        Self {
            kind: ActionKind::Hold,
            ts,
            current_apr,
            optimal_apr,
            improvement,
            target_allocations: targets.to_vec(),
            range_shifts: None,
        }
    }
}

/// Gas context for the amortization gates. When absent, the gates pass.
#[derive(Debug, Clone, Copy)]
pub struct GasContext {
    pub gas_usd: f64,
    pub position_value_usd: f64,
}

// ---------------------------------------------------------------------------
// Decision function
// ---------------------------------------------------------------------------

/// Pick the cycle's action. Pure: same inputs, same decision.
#[allow(clippy::too_many_arguments)]
pub fn decide(
    targets: &[AllocationEntry],
    positions: &[Position],
    forces: &Forces,
    price: f64,
    thresholds: &Thresholds,
    range_params: &RangeParams,
    force_params: &ForceParams,
    last_rebalance_ts: Option<i64>,
    gas: Option<GasContext>,
    now_ms: i64,
) -> Decision {
    let optimal_apr: f64 = targets.iter().map(|t| t.fraction * t.expected_apr).sum();
    let current_apr = current_apr(positions);

    let apr_gain = optimal_apr - current_apr;
    let improvement = if current_apr > 0.0 {
        apr_gain / current_apr
    } else if apr_gain > IMPROVEMENT_FLOOR {
        1.0
    } else {
        0.0
    };

    // Minimum-hold gate: a fresh book is never churned.
    if let Some(ts) = last_rebalance_ts {
        if now_ms - ts < MIN_HOLD_MS {
            return Decision::hold(now_ms, current_apr, optimal_apr, improvement, targets);
        }
    }

    // PRA gate: relative improvement plus gas amortization.
    if improvement > thresholds.pra {
        let gas_ok = match gas {
            Some(g) => apr_gain * g.position_value_usd * AMORTIZATION_FRAC >= PRA_GAS_MULT * g.gas_usd,
            None => true,
        };
        if gas_ok {
            return Decision {
                kind: ActionKind::Pra,
                ts: now_ms,
                current_apr,
                optimal_apr,
                improvement,
                target_allocations: targets.to_vec(),
                range_shifts: None,
            };
        }
    }

    // RS gate: per-position divergence against the force-derived target.
    // Bin-based positions do not share the tick scale and are skipped.
    let target_interval = compute_range(price, forces, range_params, force_params);
    let mut shifts = Vec::new();
    for pos in positions {
        if pos.dex.is_bin_based() {
            continue;
        }
        let current = interval_from_ticks(pos.lower_bound, pos.upper_bound);
        let divergence = range_divergence(&current, &target_interval);
        if divergence <= thresholds.rs {
            continue;
        }
        let gas_ok = match gas {
            Some(g) => {
                pos.entry_value_usd * divergence * pos.entry_apr * AMORTIZATION_FRAC
                    >= RS_GAS_MULT * g.gas_usd
            }
            None => true,
        };
        if gas_ok {
            shifts.push(RangeShift {
                pool_id: pos.pool_id.clone(),
                chain: pos.chain.clone(),
                position_id: pos.id.clone(),
                old: current,
                new: target_interval,
            });
        }
    }

    if !shifts.is_empty() {
        return Decision {
            kind: ActionKind::Rs,
            ts: now_ms,
            current_apr,
            optimal_apr,
            improvement,
            target_allocations: targets.to_vec(),
            range_shifts: Some(shifts),
        };
    }

    Decision::hold(now_ms, current_apr, optimal_apr, improvement, targets)
}

/// Value-weighted APR over the open book. With zero total value, the simple
/// average; with no positions, zero.
pub fn current_apr(positions: &[Position]) -> f64 {
    if positions.is_empty() {
        return 0.0;
    }
    let total_value: f64 = positions.iter().map(|p| p.entry_value_usd).sum();
    if total_value > 0.0 {
        positions
            .iter()
            .map(|p| p.entry_apr * p.entry_value_usd)
            .sum::<f64>()
            / total_value
    } else {
        positions.iter().map(|p| p.entry_apr).sum::<f64>() / positions.len() as f64
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DexFamily;

    const HOUR_MS: i64 = 3_600_000;
    const NOW: i64 = 1_700_000_000_000;

    fn target(pool: &str, fraction: f64, apr: f64) -> AllocationEntry {
        AllocationEntry {
            pool_id: pool.into(),
            chain: "base".into(),
            dex: DexFamily::V3,
            fraction,
            expected_apr: apr,
        }
    }

    fn position(pool: &str, apr: f64, value: f64, ticks: (i32, i32), entry_ts: i64) -> Position {
        Position {
            id: format!("pos-{pool}"),
            pool_id: pool.into(),
            chain: "base".into(),
            dex: DexFamily::V3,
            venue_position_id: "1".into(),
            lower_bound: ticks.0,
            upper_bound: ticks.1,
            liquidity: 1,
            amount0: 0,
            amount1: 0,
            entry_price: 1.0,
            entry_ts,
            entry_apr: apr,
            entry_value_usd: value,
        }
    }

    fn run(
        targets: &[AllocationEntry],
        positions: &[Position],
        last_rebalance_ts: Option<i64>,
        gas: Option<GasContext>,
    ) -> Decision {
        decide(
            targets,
            positions,
            &Forces::neutral(),
            1.0,
            &Thresholds::default(),
            &RangeParams::default(),
            &ForceParams::default(),
            last_rebalance_ts,
            gas,
            NOW,
        )
    }

    #[test]
    fn hold_on_matching_aprs() {
        // Fresh start, matching APRs, wide existing range: nothing to do.
        let targets = vec![target("p", 1.0, 0.10)];
        let positions = vec![position("p", 0.10, 5_000.0, (-280, 280), NOW - 24 * HOUR_MS)];
        let d = run(&targets, &positions, Some(NOW - 24 * HOUR_MS), None);
        assert_eq!(d.kind, ActionKind::Hold);
        assert!((d.current_apr - 0.10).abs() < 1e-12);
        assert!((d.optimal_apr - 0.10).abs() < 1e-12);
        assert_eq!(d.improvement, 0.0);
    }

    #[test]
    fn pra_on_apr_gap() {
        let targets = vec![target("p", 1.0, 0.20)];
        let positions = vec![position("p", 0.10, 5_000.0, (-280, 280), NOW - 24 * HOUR_MS)];
        let gas = GasContext {
            gas_usd: 0.0,
            position_value_usd: 5_000.0,
        };
        let d = run(&targets, &positions, Some(NOW - 24 * HOUR_MS), Some(gas));
        assert_eq!(d.kind, ActionKind::Pra);
        assert!((d.improvement - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rs_on_tight_divergent_range() {
        let targets = vec![target("p", 1.0, 0.10)];
        let positions = vec![position("p", 0.10, 5_000.0, (-10, 10), NOW - 24 * HOUR_MS)];
        let d = run(&targets, &positions, Some(NOW - 24 * HOUR_MS), None);
        assert_eq!(d.kind, ActionKind::Rs);
        let shifts = d.range_shifts.expect("RS carries shifts");
        assert_eq!(shifts.len(), 1);
        assert_eq!(shifts[0].pool_id, "p");
    }

    #[test]
    fn min_hold_overrides_apparent_pra() {
        let targets = vec![target("p", 1.0, 0.20)];
        let positions = vec![position("p", 0.10, 5_000.0, (-280, 280), NOW - HOUR_MS)];
        let d = run(&targets, &positions, Some(NOW - HOUR_MS), None);
        assert_eq!(d.kind, ActionKind::Hold);
    }

    #[test]
    fn pra_outranks_rs() {
        // Both the APR gap and the divergence gates are open: PRA wins.
        let targets = vec![target("p", 1.0, 0.30)];
        let positions = vec![position("p", 0.10, 5_000.0, (-10, 10), NOW - 24 * HOUR_MS)];
        let d = run(&targets, &positions, Some(NOW - 24 * HOUR_MS), None);
        assert_eq!(d.kind, ActionKind::Pra);
        assert!(d.range_shifts.is_none());
    }

    #[test]
    fn pra_gas_gate_blocks_marginal_gain() {
        // 1% APR gain on 5k over 7 days ~= 0.96 USD, below 1.5 * 10 USD gas.
        let targets = vec![target("p", 1.0, 0.11)];
        let positions = vec![position("p", 0.10, 5_000.0, (-280, 280), NOW - 24 * HOUR_MS)];
        let gas = GasContext {
            gas_usd: 10.0,
            position_value_usd: 5_000.0,
        };
        let d = run(&targets, &positions, Some(NOW - 24 * HOUR_MS), Some(gas));
        assert_ne!(d.kind, ActionKind::Pra);
    }

    #[test]
    fn rs_gas_gate_blocks_marginal_shift() {
        let targets = vec![target("p", 1.0, 0.10)];
        let positions = vec![position("p", 0.10, 50.0, (-10, 10), NOW - 24 * HOUR_MS)];
        // div=1: 50 * 1 * 0.10 * 7/365 ~= 0.096 USD, below 2 * 10 USD gas.
        let gas = GasContext {
            gas_usd: 10.0,
            position_value_usd: 50.0,
        };
        let d = run(&targets, &positions, Some(NOW - 24 * HOUR_MS), Some(gas));
        assert_eq!(d.kind, ActionKind::Hold);
    }

    #[test]
    fn bin_based_positions_are_skipped_in_rs() {
        let targets = vec![target("p", 1.0, 0.10)];
        let mut pos = position("p", 0.10, 5_000.0, (-10, 10), NOW - 24 * HOUR_MS);
        pos.dex = DexFamily::Lb;
        let d = run(&targets, &[pos], Some(NOW - 24 * HOUR_MS), None);
        assert_eq!(d.kind, ActionKind::Hold);
    }

    #[test]
    fn value_weighted_current_apr() {
        let positions = vec![
            position("a", 0.10, 1_000.0, (-280, 280), NOW),
            position("b", 0.30, 3_000.0, (-280, 280), NOW),
        ];
        let expected = (0.10 * 1_000.0 + 0.30 * 3_000.0) / 4_000.0;
        assert!((current_apr(&positions) - expected).abs() < 1e-9);
    }

    #[test]
    fn zero_value_positions_use_simple_average() {
        let positions = vec![
            position("a", 0.10, 0.0, (-280, 280), NOW),
            position("b", 0.30, 0.0, (-280, 280), NOW),
        ];
        assert!((current_apr(&positions) - 0.20).abs() < 1e-12);
    }

    #[test]
    fn empty_book_has_zero_apr() {
        assert_eq!(current_apr(&[]), 0.0);
    }

    #[test]
    fn improvement_floor_when_book_earns_nothing() {
        // No positions: current APR is 0. A 0.004 absolute gain is noise, a
        // 0.006 gain counts as a full improvement.
        let small = run(&[target("p", 1.0, 0.004)], &[], None, None);
        assert_eq!(small.improvement, 0.0);
        let real = run(&[target("p", 1.0, 0.006)], &[], None, None);
        assert!((real.improvement - 1.0).abs() < 1e-12);
    }

    #[test]
    fn action_kind_wire_format() {
        assert_eq!(serde_json::to_string(&ActionKind::Pra).unwrap(), "\"PRA\"");
        assert_eq!(serde_json::to_string(&ActionKind::Rs).unwrap(), "\"RS\"");
        assert_eq!(serde_json::to_string(&ActionKind::Hold).unwrap(), "\"HOLD\"");
    }
}
