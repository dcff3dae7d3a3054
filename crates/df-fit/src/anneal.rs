//! Simulated-annealing backend
//!
//! Geometric cooling with bound-clamped Gaussian proposals scaled by each
//! parameter's step size and the current temperature. Reports no errors
//! and no covariance; a refit with the gradient family is the way to get
//! those.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use df_core::Result;
use df_core::types::RunStatus;

use crate::minimizer::{BackendRun, BoundPlan, MinimizerOptions};
use crate::objective::CostFunctionAdapter;

/// Initial temperature as a multiple of the starting statistic scale.
const T_START_SCALE: f64 = 0.1;
/// Cooling factor per temperature step.
const COOLING: f64 = 0.95;
/// Stop once the temperature drops below this fraction of the start.
const T_STOP_FRACTION: f64 = 1e-4;

pub(crate) fn run(
    adapter: &CostFunctionAdapter<'_>,
    plan: &BoundPlan,
    options: &MinimizerOptions,
) -> Result<BackendRun> {
    let mut rng = StdRng::seed_from_u64(options.seed);
    let n_free = plan.free.len();

    let mut current = plan.extract(&plan.start);
    let mut current_cost = adapter.evaluate(&plan.embed(&current))?;
    let initial_cost = current_cost;
    let mut best = current.clone();
    let mut best_cost = current_cost;

    let t_start = (current_cost.abs() * T_START_SCALE).max(1.0);
    let t_stop = t_start * T_STOP_FRACTION;
    let mut temperature = t_start;

    let moves_per_step = (n_free * 20).max(20) as u64;
    let budget = options.max_evaluations.saturating_sub(1);
    let mut used: u64 = 0;
    let mut steps: u64 = 0;
    let mut exhausted = false;

    'cooling: while temperature > t_stop && steps < options.max_iterations {
        for _ in 0..moves_per_step {
            if used >= budget {
                exhausted = true;
                break 'cooling;
            }

            // Proposal scale shrinks with the temperature.
            let scale = (temperature / t_start).sqrt();
            let mut proposal = current.clone();
            for (k, &slot) in plan.free.iter().enumerate() {
                let z: f64 = rng.sample(StandardNormal);
                let (lo, hi) = plan.bounds[slot];
                proposal[k] = (proposal[k] + z * plan.steps[slot] * scale).clamp(lo, hi);
            }

            let proposal_cost = adapter.evaluate(&plan.embed(&proposal))?;
            used += 1;

            let delta = proposal_cost - current_cost;
            if delta <= 0.0 || rng.gen_range(0.0..1.0) < (-delta / temperature).exp() {
                current = proposal;
                current_cost = proposal_cost;
                if current_cost < best_cost {
                    best = current.clone();
                    best_cost = current_cost;
                }
            }
        }
        temperature *= COOLING;
        steps += 1;
    }

    let status = if !exhausted {
        RunStatus::Converged
    } else if best_cost < initial_cost {
        RunStatus::PartiallyConverged
    } else {
        RunStatus::Failed
    };

    log::debug!(
        "annealing finished after {steps} temperature steps, {used} moves, best {best_cost:.6}"
    );

    Ok(BackendRun {
        values: plan.embed(&best),
        statistic: best_cost,
        status,
        n_iterations: steps,
        errors_free: None,
        covariance_free: None,
    })
}
