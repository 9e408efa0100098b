// =============================================================================
// Nelder-Mead Simplex — bounded five-dimensional maximizer
// =============================================================================
//
// Derivative-free downhill simplex with the standard coefficients
// (reflection 1.0, expansion 2.0, contraction 0.5, shrink 0.5), adapted to
// maximization and hard per-dimension bounds: every candidate vertex is
// clamped into its bound before evaluation, on every operation.
// =============================================================================

/// Number of tuned dimensions.
pub const DIM: usize = 5;

/// Total objective-evaluation budget per run.
pub const EVAL_BUDGET: usize = 300;

/// Simplex collapse tolerance: stop when best and worst agree this closely.
const TOLERANCE: f64 = 1e-8;

/// Fractional perturbation of a bound's span used to seed the simplex.
const SEED_STEP: f64 = 0.10;

const ALPHA: f64 = 1.0; // reflection
const GAMMA: f64 = 2.0; // expansion
const RHO: f64 = 0.5; // contraction
const SIGMA: f64 = 0.5; // shrink

/// Outcome of one simplex run.
#[derive(Debug, Clone, Copy)]
pub struct SimplexResult {
    pub best: [f64; DIM],
    pub fitness: f64,
    pub evaluations: usize,
}

/// Maximize `objective` from `seed` inside `bounds`.
///
/// The initial simplex is the clamped seed plus one vertex per dimension,
/// each perturbing that dimension by ±10% of its bound span with the sign
/// alternating by index so the simplex stays non-degenerate next to a bound.
pub fn maximize<F>(seed: [f64; DIM], bounds: &[(f64, f64); DIM], mut objective: F) -> SimplexResult
where
    F: FnMut(&[f64; DIM]) -> f64,
{
    let clamp = |v: [f64; DIM]| -> [f64; DIM] {
        let mut out = v;
        for (x, (lo, hi)) in out.iter_mut().zip(bounds.iter()) {
            *x = x.clamp(*lo, *hi);
        }
        out
    };

    let mut evals = 0usize;
    let mut eval = |v: &[f64; DIM], evals: &mut usize| -> f64 {
        *evals += 1;
        objective(v)
    };

    // --- Initial simplex -----------------------------------------------------
    let v0 = clamp(seed);
    let mut simplex: Vec<([f64; DIM], f64)> = Vec::with_capacity(DIM + 1);
    let f0 = eval(&v0, &mut evals);
    simplex.push((v0, f0));

    for d in 0..DIM {
        let span = bounds[d].1 - bounds[d].0;
        let sign = if d % 2 == 0 { 1.0 } else { -1.0 };
        let mut v = v0;
        v[d] += sign * SEED_STEP * span;
        let v = clamp(v);
        let f = eval(&v, &mut evals);
        simplex.push((v, f));
    }

    // --- Iterate -------------------------------------------------------------
    while evals < EVAL_BUDGET {
        // Best first (maximization).
        simplex.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let f_best = simplex[0].1;
        let f_worst = simplex[DIM].1;
        if f_best.is_finite() && f_worst.is_finite() && (f_best - f_worst).abs() < TOLERANCE {
            break;
        }

        // Centroid of all vertices except the worst.
        let mut centroid = [0.0; DIM];
        for (v, _) in &simplex[..DIM] {
            for d in 0..DIM {
                centroid[d] += v[d] / DIM as f64;
            }
        }

        let worst = simplex[DIM].0;

        // Reflection.
        let mut reflected = [0.0; DIM];
        for d in 0..DIM {
            reflected[d] = centroid[d] + ALPHA * (centroid[d] - worst[d]);
        }
        let reflected = clamp(reflected);
        let f_reflected = eval(&reflected, &mut evals);

        let f_second_worst = simplex[DIM - 1].1;

        if f_reflected > f_best {
            // Expansion.
            if evals >= EVAL_BUDGET {
                simplex[DIM] = (reflected, f_reflected);
                break;
            }
            let mut expanded = [0.0; DIM];
            for d in 0..DIM {
                expanded[d] = centroid[d] + GAMMA * (reflected[d] - centroid[d]);
            }
            let expanded = clamp(expanded);
            let f_expanded = eval(&expanded, &mut evals);
            simplex[DIM] = if f_expanded > f_reflected {
                (expanded, f_expanded)
            } else {
                (reflected, f_reflected)
            };
            continue;
        }

        if f_reflected > f_second_worst {
            simplex[DIM] = (reflected, f_reflected);
            continue;
        }

        // Contraction toward the better of (worst, reflected).
        if evals >= EVAL_BUDGET {
            break;
        }
        let toward = if f_reflected > simplex[DIM].1 {
            reflected
        } else {
            worst
        };
        let mut contracted = [0.0; DIM];
        for d in 0..DIM {
            contracted[d] = centroid[d] + RHO * (toward[d] - centroid[d]);
        }
        let contracted = clamp(contracted);
        let f_contracted = eval(&contracted, &mut evals);

        if f_contracted > simplex[DIM].1.max(f_reflected) {
            simplex[DIM] = (contracted, f_contracted);
            continue;
        }

        // Shrink everything toward the best vertex.
        let best = simplex[0].0;
        for i in 1..=DIM {
            if evals >= EVAL_BUDGET {
                break;
            }
            let mut v = [0.0; DIM];
            for d in 0..DIM {
                v[d] = best[d] + SIGMA * (simplex[i].0[d] - best[d]);
            }
            let v = clamp(v);
            let f = eval(&v, &mut evals);
            simplex[i] = (v, f);
        }
    }

    simplex.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    SimplexResult {
        best: simplex[0].0,
        fitness: simplex[0].1,
        evaluations: evals,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const UNIT_BOUNDS: [(f64, f64); DIM] =
        [(0.0, 1.0), (0.0, 1.0), (0.0, 1.0), (0.0, 1.0), (0.0, 1.0)];

    #[test]
    fn finds_interior_quadratic_peak() {
        let target = [0.3, 0.7, 0.5, 0.2, 0.8];
        let result = maximize([0.5; DIM], &UNIT_BOUNDS, |v| {
            -v.iter()
                .zip(target.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f64>()
        });
        for (got, want) in result.best.iter().zip(target.iter()) {
            assert!((got - want).abs() < 0.05, "got {got}, want {want}");
        }
        assert!(result.evaluations <= EVAL_BUDGET);
    }

    #[test]
    fn respects_bounds_when_peak_is_outside() {
        // Objective grows without bound toward +inf in every dimension: the
        // optimum within bounds is the upper corner.
        let result = maximize([0.1; DIM], &UNIT_BOUNDS, |v| v.iter().sum::<f64>());
        for (d, x) in result.best.iter().enumerate() {
            assert!(
                (0.0..=1.0).contains(x),
                "dim {d} escaped bounds: {x}"
            );
            assert!(*x > 0.9, "dim {d} should approach the upper bound: {x}");
        }
    }

    #[test]
    fn evaluation_budget_is_hard() {
        let mut count = 0usize;
        let _ = maximize([0.5; DIM], &UNIT_BOUNDS, |v| {
            count += 1;
            // Rugged objective keeps the simplex from collapsing early.
            v.iter().map(|x| (x * 37.0).sin()).sum::<f64>()
        });
        assert!(count <= EVAL_BUDGET, "{count} evaluations");
    }

    #[test]
    fn seed_outside_bounds_is_clamped() {
        let result = maximize([5.0; DIM], &UNIT_BOUNDS, |v| -v.iter().sum::<f64>());
        for x in result.best {
            assert!((0.0..=1.0).contains(&x));
        }
    }

    #[test]
    fn flat_objective_converges_immediately() {
        let result = maximize([0.5; DIM], &UNIT_BOUNDS, |_| 1.0);
        assert!(result.evaluations <= DIM + 2);
        assert_eq!(result.fitness, 1.0);
    }

    #[test]
    fn neg_infinity_regions_are_survivable() {
        // Half the space is poisoned; the optimizer must still return a
        // finite vertex from the viable half.
        let result = maximize([0.6; DIM], &UNIT_BOUNDS, |v| {
            if v[0] < 0.5 {
                f64::NEG_INFINITY
            } else {
                -(v[0] - 0.75) * (v[0] - 0.75)
            }
        });
        assert!(result.fitness.is_finite());
        assert!(result.best[0] >= 0.5);
    }
}
