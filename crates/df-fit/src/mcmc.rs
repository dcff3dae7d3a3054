//! Random-walk Metropolis backend
//!
//! Samples `exp(-statistic/2)` with bound-clamped Gaussian proposals. The
//! post-run accessors mirror the gradient family: best visited point,
//! per-parameter marginal error (chain standard deviation), and the chain
//! sample covariance over the free coordinates.

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use df_core::Result;
use df_core::types::RunStatus;

use crate::minimizer::{BackendRun, BoundPlan, MinimizerOptions};
use crate::objective::CostFunctionAdapter;

/// Proposal width as a fraction of each parameter's step size.
const PROPOSAL_SCALE: f64 = 0.5;
/// Fraction of the chain discarded as warmup.
const WARMUP_FRACTION: f64 = 0.2;

pub(crate) fn run(
    adapter: &CostFunctionAdapter<'_>,
    plan: &BoundPlan,
    options: &MinimizerOptions,
) -> Result<BackendRun> {
    let mut rng = StdRng::seed_from_u64(options.seed);
    let n_free = plan.free.len();

    let mut current = plan.extract(&plan.start);
    let mut current_stat = adapter.evaluate(&plan.embed(&current))?;
    let mut best = current.clone();
    let mut best_stat = current_stat;

    let n_samples = options.max_evaluations.saturating_sub(1).max(1);
    let warmup = ((n_samples as f64) * WARMUP_FRACTION) as u64;

    let mut kept: Vec<Vec<f64>> = Vec::with_capacity((n_samples - warmup) as usize);
    let mut accepted: u64 = 0;

    for i in 0..n_samples {
        let mut proposal = current.clone();
        for (k, &slot) in plan.free.iter().enumerate() {
            let z: f64 = rng.sample(StandardNormal);
            let (lo, hi) = plan.bounds[slot];
            proposal[k] = (proposal[k] + z * plan.steps[slot] * PROPOSAL_SCALE).clamp(lo, hi);
        }

        let proposal_stat = adapter.evaluate(&plan.embed(&proposal))?;

        // Metropolis acceptance on the statistic as -2 log L.
        let log_alpha = -(proposal_stat - current_stat) / 2.0;
        if log_alpha >= 0.0 || rng.gen_range(0.0..1.0) < log_alpha.exp() {
            current = proposal;
            current_stat = proposal_stat;
            accepted += 1;
            if current_stat < best_stat {
                best = current.clone();
                best_stat = current_stat;
            }
        }

        if i >= warmup {
            kept.push(current.clone());
        }
    }

    let acceptance = accepted as f64 / n_samples as f64;
    log::debug!(
        "metropolis chain of {n_samples} samples, acceptance {acceptance:.3}, best {best_stat:.6}"
    );
    if acceptance < 0.01 {
        log::warn!("metropolis acceptance rate {acceptance:.3} is very low");
    }

    let (errors_free, covariance_free) = chain_moments(&kept, n_free);

    Ok(BackendRun {
        values: plan.embed(&best),
        statistic: best_stat,
        status: RunStatus::Converged,
        n_iterations: n_samples,
        errors_free: Some(errors_free),
        covariance_free: Some(covariance_free),
    })
}

/// Marginal standard deviations and sample covariance of the kept chain.
fn chain_moments(kept: &[Vec<f64>], n_free: usize) -> (Vec<f64>, DMatrix<f64>) {
    let n = kept.len();
    if n < 2 {
        return (vec![0.0; n_free], DMatrix::zeros(n_free, n_free));
    }

    let mut mean = vec![0.0; n_free];
    for sample in kept {
        for (m, &v) in mean.iter_mut().zip(sample.iter()) {
            *m += v;
        }
    }
    for m in &mut mean {
        *m /= n as f64;
    }

    let mut cov = DMatrix::zeros(n_free, n_free);
    for sample in kept {
        for i in 0..n_free {
            let di = sample[i] - mean[i];
            for j in 0..n_free {
                cov[(i, j)] += di * (sample[j] - mean[j]);
            }
        }
    }
    cov /= (n - 1) as f64;

    let errors = (0..n_free).map(|i| cov[(i, i)].max(0.0).sqrt()).collect();
    (errors, cov)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minimizer::{Algorithm, MinimizerDriver};
    use crate::objective::FitContext;
    use crate::params::{ParameterRegistry, ParameterSpec};
    use crate::testutil::{LoggingReweight, QuadraticObjective, shared_log};
    use df_core::types::DialKind;

    #[test]
    fn chain_finds_mode_and_reports_covariance() {
        let log = shared_log();
        let mut ctx = FitContext::new(
            Box::new(LoggingReweight::new(log.clone())),
            Box::new(QuadraticObjective::new(log.clone(), &[("x", 0.5)])),
        );
        let mut reg = ParameterRegistry::new();
        reg.register(
            ParameterSpec::new("x", DialKind::Interaction, 0.0)
                .with_bounds(-4.0, 4.0)
                .with_step(1.0),
        )
        .unwrap();
        let set = reg.parameter_set();
        let adapter = CostFunctionAdapter::new(&set, &mut ctx);

        let mut driver = MinimizerDriver::new();
        driver
            .configure(
                Algorithm::Mcmc,
                MinimizerOptions { max_evaluations: 4000, seed: 3, ..Default::default() },
            )
            .unwrap();
        driver.bind(set.clone()).unwrap();
        let outcome = driver.run(&adapter).unwrap();

        assert_eq!(outcome.status, RunStatus::Converged);
        assert!((outcome.values[0] - 0.5).abs() < 0.2, "got {}", outcome.values[0]);
        assert!(outcome.covariance_available());
        // statistic = (x - 0.5)^2 is N(0.5, 1) as -2 log L; the marginal
        // width should be near 1.
        assert!(outcome.errors[0] > 0.5 && outcome.errors[0] < 1.6, "got {}", outcome.errors[0]);
    }

    #[test]
    fn chain_moments_handle_short_chains() {
        let (errors, cov) = chain_moments(&[vec![1.0, 2.0]], 2);
        assert_eq!(errors, vec![0.0, 0.0]);
        assert_eq!(cov[(0, 1)], 0.0);
    }
}
