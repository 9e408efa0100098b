// =============================================================================
// Kill-Switches — trailing-health circuit breakers over optimizer output
// =============================================================================
//
// Checked once per cycle after optimization. When any rule fires, the cycle
// proceeds with the default parameter vector instead of the optimized one:
//
//   1. negative_trailing_yield — 24-epoch (~6h) mean yield below zero
//   2. excessive_rs            — more than 8 range shifts in 4 hours
//   3. pathological_range      — optimized base_max - base_min < 1e-3
//   4. gas_budget_exceeded     — trailing-24h gas above 5% of position value
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::range::RangeParams;

/// Epochs in the trailing-yield window (~6h at 15-minute epochs).
const YIELD_WINDOW: usize = 24;
/// Range-shift budget and its window.
const MAX_RS: usize = 8;
const RS_WINDOW_MS: i64 = 4 * 3_600_000;
/// Gas budget window and ceiling.
const GAS_WINDOW_MS: i64 = 24 * 3_600_000;
const GAS_BUDGET_FRAC: f64 = 0.05;
/// Minimum spread between the optimized half-width bases.
const MIN_RANGE_SPREAD: f64 = 1e-3;

/// Why a kill-switch fired. The wire form is the snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchReason {
    NegativeTrailingYield,
    ExcessiveRs,
    PathologicalRange,
    GasBudgetExceeded,
}

impl std::fmt::Display for KillSwitchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NegativeTrailingYield => write!(f, "negative_trailing_yield"),
            Self::ExcessiveRs => write!(f, "excessive_rs"),
            Self::PathologicalRange => write!(f, "pathological_range"),
            Self::GasBudgetExceeded => write!(f, "gas_budget_exceeded"),
        }
    }
}

/// Trailing health windows backing the kill-switch rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillSwitchState {
    /// Last `YIELD_WINDOW` per-epoch yields, newest last.
    trailing_yields: VecDeque<f64>,
    /// Timestamps (ms) of executed range shifts inside the RS window.
    rs_timestamps: VecDeque<i64>,
    /// (timestamp ms, gas USD) of on-chain spend inside the gas window.
    gas_spend: VecDeque<(i64, f64)>,
}

impl KillSwitchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one epoch's observed yield.
    pub fn record_yield(&mut self, epoch_yield: f64) {
        self.trailing_yields.push_back(epoch_yield);
        while self.trailing_yields.len() > YIELD_WINDOW {
            self.trailing_yields.pop_front();
        }
    }

    /// Record one executed range shift.
    pub fn record_range_shift(&mut self, ts_ms: i64) {
        self.rs_timestamps.push_back(ts_ms);
        self.prune(ts_ms);
    }

    /// Record gas spent on any transaction.
    pub fn record_gas(&mut self, ts_ms: i64, gas_usd: f64) {
        self.gas_spend.push_back((ts_ms, gas_usd));
        self.prune(ts_ms);
    }

    /// Trailing-24h gas in USD.
    pub fn trailing_gas_usd(&mut self, now_ms: i64) -> f64 {
        self.prune(now_ms);
        self.gas_spend.iter().map(|(_, g)| g).sum()
    }

    fn prune(&mut self, now_ms: i64) {
        while matches!(self.rs_timestamps.front(), Some(&ts) if now_ms - ts > RS_WINDOW_MS) {
            self.rs_timestamps.pop_front();
        }
        while matches!(self.gas_spend.front(), Some(&(ts, _)) if now_ms - ts > GAS_WINDOW_MS) {
            self.gas_spend.pop_front();
        }
    }

    /// Evaluate every rule against the optimized vector. Returns the first
    /// firing reason in rule order, or `None` when the output may stand.
    pub fn check(
        &mut self,
        optimized: &RangeParams,
        position_value_usd: f64,
        now_ms: i64,
    ) -> Option<KillSwitchReason> {
        self.prune(now_ms);

        // 1. Trailing yield — requires a full window before it can fire.
        if self.trailing_yields.len() >= YIELD_WINDOW {
            let mean: f64 =
                self.trailing_yields.iter().sum::<f64>() / self.trailing_yields.len() as f64;
            if mean < 0.0 {
                warn!(mean_yield = mean, "kill-switch: negative trailing yield");
                return Some(KillSwitchReason::NegativeTrailingYield);
            }
        }

        // 2. Range-shift churn.
        if self.rs_timestamps.len() > MAX_RS {
            warn!(
                shifts = self.rs_timestamps.len(),
                "kill-switch: excessive range shifts"
            );
            return Some(KillSwitchReason::ExcessiveRs);
        }

        // 3. Collapsed parameter range.
        if optimized.base_max - optimized.base_min < MIN_RANGE_SPREAD {
            warn!(
                base_min = optimized.base_min,
                base_max = optimized.base_max,
                "kill-switch: pathological range"
            );
            return Some(KillSwitchReason::PathologicalRange);
        }

        // 4. Gas budget.
        if position_value_usd > 0.0 {
            let gas: f64 = self.gas_spend.iter().map(|(_, g)| g).sum();
            if gas > GAS_BUDGET_FRAC * position_value_usd {
                warn!(gas_usd = gas, "kill-switch: gas budget exceeded");
                return Some(KillSwitchReason::GasBudgetExceeded);
            }
        }

        None
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 3_600_000;

    #[test]
    fn quiet_state_passes() {
        let mut state = KillSwitchState::new();
        assert_eq!(state.check(&RangeParams::default(), 10_000.0, 0), None);
    }

    #[test]
    fn negative_trailing_yield_fires_only_with_full_window() {
        let mut state = KillSwitchState::new();
        for _ in 0..YIELD_WINDOW - 1 {
            state.record_yield(-0.5);
        }
        // Window not yet full.
        assert_eq!(state.check(&RangeParams::default(), 10_000.0, 0), None);
        state.record_yield(-0.5);
        assert_eq!(
            state.check(&RangeParams::default(), 10_000.0, 0),
            Some(KillSwitchReason::NegativeTrailingYield)
        );
    }

    #[test]
    fn yield_window_is_trailing() {
        let mut state = KillSwitchState::new();
        for _ in 0..YIELD_WINDOW {
            state.record_yield(-1.0);
        }
        // A streak of positive epochs displaces the losses.
        for _ in 0..YIELD_WINDOW {
            state.record_yield(1.0);
        }
        assert_eq!(state.check(&RangeParams::default(), 10_000.0, 0), None);
    }

    #[test]
    fn excessive_range_shifts_fire_and_expire() {
        let mut state = KillSwitchState::new();
        for i in 0..9 {
            state.record_range_shift(i * 60_000);
        }
        assert_eq!(
            state.check(&RangeParams::default(), 10_000.0, 9 * 60_000),
            Some(KillSwitchReason::ExcessiveRs)
        );
        // Four hours later the window has drained.
        assert_eq!(
            state.check(&RangeParams::default(), 10_000.0, 9 * 60_000 + RS_WINDOW_MS + 1),
            None
        );
    }

    #[test]
    fn pathological_range_fires() {
        let mut state = KillSwitchState::new();
        let collapsed = RangeParams {
            base_min: 2e-3,
            base_max: 2.5e-3,
            ..RangeParams::default()
        };
        assert_eq!(
            state.check(&collapsed, 10_000.0, 0),
            Some(KillSwitchReason::PathologicalRange)
        );
    }

    #[test]
    fn gas_budget_fires_and_expires() {
        let mut state = KillSwitchState::new();
        state.record_gas(0, 300.0);
        state.record_gas(HOUR_MS, 300.0);
        // 600 USD on a 10k position exceeds the 5% budget.
        assert_eq!(
            state.check(&RangeParams::default(), 10_000.0, 2 * HOUR_MS),
            Some(KillSwitchReason::GasBudgetExceeded)
        );
        // A day past the later entry both have expired from the window.
        assert_eq!(
            state.check(&RangeParams::default(), 10_000.0, HOUR_MS + GAS_WINDOW_MS + 1),
            None
        );
    }

    #[test]
    fn reasons_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&KillSwitchReason::PathologicalRange).unwrap(),
            "\"pathological_range\""
        );
        assert_eq!(
            format!("{}", KillSwitchReason::GasBudgetExceeded),
            "gas_budget_exceeded"
        );
    }

    #[test]
    fn state_roundtrips_through_json() {
        let mut state = KillSwitchState::new();
        state.record_yield(0.1);
        state.record_range_shift(1_000);
        state.record_gas(2_000, 5.0);
        let json = serde_json::to_string(&state).unwrap();
        let mut back: KillSwitchState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.trailing_gas_usd(2_000), 5.0);
    }
}
