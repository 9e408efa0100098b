// =============================================================================
// Optimizer — per-cycle tuning of the range parameters
// =============================================================================
//
// Once per cycle (when enough data exists and the regime is not suppressed)
// the five range parameters are tuned by a bounded Nelder-Mead run against
// the net-yield fitness simulator. The run is seeded with the pair's warm
// start when one exists; afterwards the default vector is re-evaluated and
// wins ties, so a cold or misbehaving optimizer can never underperform the
// defaults it replaces.
// =============================================================================

pub mod fitness;
pub mod kill_switch;
pub mod nelder_mead;
pub mod regime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::range::{clamp_vec, RangeParams, PARAM_BOUNDS};
use self::fitness::FitnessInputs;

/// Persisted warm-start record (`pair:{id}:optimizer` in the store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmStart {
    pub vec: [f64; 5],
    pub fitness: f64,
}

/// Result of one tuning pass.
#[derive(Debug, Clone)]
pub struct TuneOutcome {
    pub params: RangeParams,
    pub fitness: f64,
    /// Objective evaluations spent by the simplex.
    pub evaluations: usize,
    /// True when the default seed beat (or tied) the optimized vector.
    pub used_fallback: bool,
}

/// Tune the range parameters against the given market window.
///
/// `warm_start` is the previous best vector for this pair, if any. The
/// returned parameters always lie inside [`PARAM_BOUNDS`] and their fitness
/// is never below the default seed's.
pub fn tune(warm_start: Option<[f64; 5]>, inputs: &FitnessInputs) -> TuneOutcome {
    let seed = warm_start
        .map(clamp_vec)
        .unwrap_or_else(|| RangeParams::default().to_vec());

    let result = nelder_mead::maximize(seed, &PARAM_BOUNDS, |v| {
        fitness::evaluate(&RangeParams::from_vec(*v), inputs)
    });

    // Fallback guard: the optimized vector must strictly beat the defaults.
    let default_params = RangeParams::default();
    let default_fitness = fitness::evaluate(&default_params, inputs);

    if !(result.fitness > default_fitness) {
        debug!(
            optimized = result.fitness,
            default = default_fitness,
            evaluations = result.evaluations,
            "optimizer fell back to default parameters"
        );
        return TuneOutcome {
            params: default_params,
            fitness: default_fitness,
            evaluations: result.evaluations,
            used_fallback: true,
        };
    }

    let params = RangeParams::from_vec(result.best);
    info!(
        fitness = result.fitness,
        evaluations = result.evaluations,
        base_min = params.base_min,
        base_max = params.base_max,
        rs_threshold = params.rs_threshold,
        "optimizer accepted a new parameter vector"
    );

    TuneOutcome {
        params,
        fitness: result.fitness,
        evaluations: result.evaluations,
        used_fallback: false,
    }
}
