//! Minimizer driver
//!
//! One polymorphic contract over the closed set of minimization
//! algorithms: configure, bind a frozen parameter set, run, harvest. The
//! algorithm families are a tagged variant, so adding one means adding a
//! variant and a backend, not editing a dispatch chain.
//!
//! The gradient family runs through `argmin` in the free subspace with
//! bounds enforced by clamping and a projected gradient at active bounds.
//! Afterwards a finite-difference Hessian over the free coordinates is
//! inverted (damped Cholesky, escalating ridge, LU fallback) to obtain the
//! free-space covariance and per-parameter errors.

use std::cell::RefCell;
use std::rc::Rc;

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::gradientdescent::SteepestDescent;
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use df_core::types::RunStatus;
use df_core::{Error, Result};

use crate::objective::CostFunctionAdapter;
use crate::params::ParameterSet;

/// Closed set of minimization algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    /// Quasi-Newton L-BFGS with Moré–Thuente line search.
    Lbfgs,
    /// Steepest descent with the same line search.
    SteepDesc,
    /// Simulated annealing with a geometric cooling schedule.
    SimAn,
    /// Random-walk Metropolis sampler on `exp(-statistic/2)`.
    Mcmc,
}

impl Algorithm {
    /// Resolve an algorithm name; unknown names are a configuration error.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "Lbfgs" => Ok(Self::Lbfgs),
            "SteepDesc" => Ok(Self::SteepDesc),
            "SimAn" => Ok(Self::SimAn),
            "Mcmc" => Ok(Self::Mcmc),
            other => Err(Error::Config(format!("unknown minimizer algorithm '{other}'"))),
        }
    }

    /// Canonical name, matching the strategy-string spelling.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lbfgs => "Lbfgs",
            Self::SteepDesc => "SteepDesc",
            Self::SimAn => "SimAn",
            Self::Mcmc => "Mcmc",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Numeric options shared by all algorithms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimizerOptions {
    /// Iteration ceiling for the gradient family; temperature steps for
    /// annealing.
    pub max_iterations: u64,
    /// Cost-evaluation budget; also the sample count for the stochastic
    /// families.
    pub max_evaluations: u64,
    /// Convergence tolerance on the gradient norm.
    pub tolerance: f64,
    /// Effort level; scales the L-BFGS memory.
    pub strategy_level: u8,
    /// Seed for the stochastic families.
    pub seed: u64,
}

impl Default for MinimizerOptions {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            max_evaluations: 1_000_000,
            tolerance: 1e-6,
            strategy_level: 1,
            seed: 42,
        }
    }
}

/// Driver lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing configured yet.
    Idle,
    /// Algorithm and options set; a parameter set may be bound.
    Configured,
    /// A run is in flight.
    Running,
    /// Last run ended with this status.
    Terminal(RunStatus),
}

/// Everything a backend needs about the bound parameter set.
#[derive(Debug, Clone)]
pub(crate) struct BoundPlan {
    pub start: Vec<f64>,
    pub bounds: Vec<(f64, f64)>,
    pub steps: Vec<f64>,
    pub free: Vec<usize>,
}

impl BoundPlan {
    fn from_set(set: &ParameterSet) -> Self {
        Self {
            start: set.current_values(),
            bounds: set.bounds(),
            steps: set.steps(),
            free: set.free_indices(),
        }
    }

    /// Scatter free-space values into a full-dimension vector; fixed
    /// coordinates keep their bound current values.
    pub fn embed(&self, free_values: &[f64]) -> Vec<f64> {
        let mut full = self.start.clone();
        for (slot, &value) in self.free.iter().zip(free_values.iter()) {
            full[*slot] = value;
        }
        full
    }

    /// Gather the free coordinates out of a full-dimension vector.
    pub fn extract(&self, full: &[f64]) -> Vec<f64> {
        self.free.iter().map(|&i| full[i]).collect()
    }

    /// Clamp a free-space vector into its bounds.
    pub fn clamp_free(&self, free_values: &[f64]) -> Vec<f64> {
        self.free
            .iter()
            .zip(free_values.iter())
            .map(|(&i, &v)| {
                let (lo, hi) = self.bounds[i];
                v.clamp(lo, hi)
            })
            .collect()
    }
}

/// What a backend hands back to the driver.
pub(crate) struct BackendRun {
    pub values: Vec<f64>,
    pub statistic: f64,
    pub status: RunStatus,
    pub n_iterations: u64,
    pub errors_free: Option<Vec<f64>>,
    pub covariance_free: Option<DMatrix<f64>>,
}

/// Result of one minimizer run, in full-dimension coordinates.
#[derive(Debug, Clone)]
pub struct MinimizerOutcome {
    /// Algorithm that produced this outcome.
    pub algorithm: Algorithm,
    /// Best-fit vector, fixed parameters at their bound values.
    pub values: Vec<f64>,
    /// Per-parameter marginal errors; zero for fixed parameters and when
    /// no covariance is available.
    pub errors: Vec<f64>,
    /// Statistic at `values`; `0.0` when nothing was optimized.
    pub statistic: f64,
    /// Terminal status.
    pub status: RunStatus,
    /// Iterations used.
    pub n_iterations: u64,
    /// Cost evaluations used.
    pub n_evaluations: u64,
    /// Full-dimension covariance when the algorithm provides one; fixed
    /// rows and columns are zero.
    pub covariance: Option<DMatrix<f64>>,
}

impl MinimizerOutcome {
    /// Whether a covariance matrix came out of the run.
    pub fn covariance_available(&self) -> bool {
        self.covariance.is_some()
    }
}

/// State machine driving one minimization algorithm.
///
/// `Idle -> Configured -> Running -> Terminal`; a `Failed` terminal state
/// is surfaced to the strategy loop and never retried here.
pub struct MinimizerDriver {
    phase: Phase,
    algorithm: Option<Algorithm>,
    options: MinimizerOptions,
    set: Option<ParameterSet>,
    plan: Option<BoundPlan>,
}

impl Default for MinimizerDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MinimizerDriver {
    /// Idle driver.
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            algorithm: None,
            options: MinimizerOptions::default(),
            set: None,
            plan: None,
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Select an algorithm and its options.
    pub fn configure(&mut self, algorithm: Algorithm, options: MinimizerOptions) -> Result<()> {
        if self.phase == Phase::Running {
            return Err(Error::Config("cannot reconfigure a running minimizer".to_string()));
        }
        self.algorithm = Some(algorithm);
        self.options = options;
        self.set = None;
        self.plan = None;
        self.phase = Phase::Configured;
        Ok(())
    }

    /// Freeze the ordered parameter set the run will work over.
    pub fn bind(&mut self, mut set: ParameterSet) -> Result<()> {
        if self.phase != Phase::Configured {
            return Err(Error::Config("bind requires a configured minimizer".to_string()));
        }
        set.widen_degenerate_bounds();
        let plan = BoundPlan::from_set(&set);
        log::info!(
            "bound {} parameters ({} free) for {}",
            set.len(),
            plan.free.len(),
            self.algorithm.map(|a| a.name()).unwrap_or("?")
        );
        self.set = Some(set);
        self.plan = Some(plan);
        Ok(())
    }

    /// Execute the configured algorithm against the adapter.
    ///
    /// A zero-free-parameter bind is a no-op terminal success: nothing to
    /// optimize, no cost evaluation. A backend convergence failure becomes
    /// a `Failed` outcome; collaborator evaluation errors propagate.
    pub fn run(&mut self, adapter: &CostFunctionAdapter<'_>) -> Result<MinimizerOutcome> {
        let algorithm = self
            .algorithm
            .ok_or_else(|| Error::Config("run requires a configured minimizer".to_string()))?;
        let plan = self
            .plan
            .clone()
            .ok_or_else(|| Error::Config("run requires a bound parameter set".to_string()))?;
        self.phase = Phase::Running;

        if plan.free.is_empty() {
            log::info!("{algorithm}: no free parameters, nothing to optimize");
            let dim = plan.start.len();
            self.phase = Phase::Terminal(RunStatus::Converged);
            return Ok(MinimizerOutcome {
                algorithm,
                values: plan.start,
                errors: vec![0.0; dim],
                statistic: 0.0,
                status: RunStatus::Converged,
                n_iterations: 0,
                n_evaluations: 0,
                covariance: None,
            });
        }

        let evals_before = adapter.n_evaluations();
        let backend = match algorithm {
            Algorithm::Lbfgs | Algorithm::SteepDesc => {
                self.run_gradient(algorithm, adapter, &plan)
            }
            Algorithm::SimAn => crate::anneal::run(adapter, &plan, &self.options),
            Algorithm::Mcmc => crate::mcmc::run(adapter, &plan, &self.options),
        };

        let mut run = match backend {
            Ok(run) => run,
            Err(Error::Convergence(msg)) => {
                log::warn!("{algorithm} failed to converge: {msg}");
                let (values, statistic) =
                    adapter.best().unwrap_or((plan.start.clone(), 0.0));
                BackendRun {
                    values,
                    statistic,
                    status: RunStatus::Failed,
                    n_iterations: 0,
                    errors_free: None,
                    covariance_free: None,
                }
            }
            Err(err) => {
                self.phase = Phase::Terminal(RunStatus::Failed);
                return Err(err);
            }
        };

        // Free-space errors/covariance: the gradient family derives them
        // from the Hessian after a usable terminal state; the stochastic
        // families supplied theirs (or none) already.
        let (errors_free, covariance_free) = match algorithm {
            Algorithm::Lbfgs | Algorithm::SteepDesc if run.status != RunStatus::Failed => {
                match self.hessian_covariance(adapter, &plan, &run.values) {
                    Ok(Some((errors, cov))) => (Some(errors), Some(cov)),
                    Ok(None) => (None, None),
                    // The evaluation budget can run out mid-Hessian; the run
                    // itself still stands, so report it failed with no
                    // covariance instead of aborting the caller.
                    Err(Error::Convergence(msg)) => {
                        log::warn!("covariance pass aborted, reporting no errors: {msg}");
                        run.status = RunStatus::Failed;
                        (None, None)
                    }
                    Err(err) => {
                        self.phase = Phase::Terminal(RunStatus::Failed);
                        return Err(err);
                    }
                }
            }
            _ => (run.errors_free, run.covariance_free),
        };

        let dim = plan.start.len();
        let mut errors = vec![0.0; dim];
        if let Some(free_errors) = &errors_free {
            for (slot, &e) in plan.free.iter().zip(free_errors.iter()) {
                errors[*slot] = e;
            }
        }
        let covariance = covariance_free.map(|free_cov| {
            let mut full = DMatrix::zeros(dim, dim);
            for (fi, &i) in plan.free.iter().enumerate() {
                for (fj, &j) in plan.free.iter().enumerate() {
                    full[(i, j)] = free_cov[(fi, fj)];
                }
            }
            full
        });

        log::info!(
            "{algorithm} finished {} at statistic {:.6} after {} iterations",
            run.status,
            run.statistic,
            run.n_iterations
        );

        self.phase = Phase::Terminal(run.status);
        Ok(MinimizerOutcome {
            algorithm,
            values: run.values,
            errors,
            statistic: run.statistic,
            status: run.status,
            n_iterations: run.n_iterations,
            n_evaluations: adapter.n_evaluations() - evals_before,
            covariance,
        })
    }

    fn run_gradient(
        &self,
        algorithm: Algorithm,
        adapter: &CostFunctionAdapter<'_>,
        plan: &BoundPlan,
    ) -> Result<BackendRun> {
        let initial_cost = adapter.evaluate(&plan.start)?;
        let free_start = plan.clamp_free(&plan.extract(&plan.start));

        let stash: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));
        let problem = FreeSpaceProblem { adapter, plan, stash: stash.clone() };

        let executed = match algorithm {
            Algorithm::Lbfgs => {
                let linesearch = MoreThuenteLineSearch::new();
                // Memory grows with the configured effort level.
                let memory = 7 + 3 * self.options.strategy_level as usize;
                let solver = LBFGS::new(linesearch, memory)
                    .with_tolerance_grad(self.options.tolerance)
                    .map_err(|e| Error::Config(format!("invalid tolerance: {e}")))?;
                Executor::new(problem, solver)
                    .configure(|state| {
                        state.param(free_start.clone()).max_iters(self.options.max_iterations)
                    })
                    .run()
                    .map(|res| {
                        let state = res.state();
                        (
                            state.get_best_param().cloned(),
                            state.get_best_cost(),
                            state.get_iter(),
                            state.get_termination_status().clone(),
                        )
                    })
            }
            Algorithm::SteepDesc => {
                let linesearch = MoreThuenteLineSearch::new();
                let solver = SteepestDescent::new(linesearch);
                Executor::new(problem, solver)
                    .configure(|state| {
                        state.param(free_start.clone()).max_iters(self.options.max_iterations)
                    })
                    .run()
                    .map(|res| {
                        let state = res.state();
                        (
                            state.get_best_param().cloned(),
                            state.get_best_cost(),
                            state.get_iter(),
                            state.get_termination_status().clone(),
                        )
                    })
            }
            _ => unreachable!("gradient backend invoked for {algorithm}"),
        };

        // A collaborator failure inside the solver loop takes precedence
        // over whatever the solver made of it.
        if let Some(err) = stash.borrow_mut().take() {
            if matches!(err, Error::Evaluation(_)) {
                return Err(err);
            }
        }

        let (best_param, best_cost, n_iter, termination) = match executed {
            Ok(parts) => parts,
            Err(e) => return Err(Error::Convergence(format!("{algorithm} backend: {e}"))),
        };

        let best_free = match best_param {
            Some(p) => plan.clamp_free(&p),
            None => return Err(Error::Convergence(format!("{algorithm}: no best point"))),
        };

        let status = match termination {
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
            | TerminationStatus::Terminated(TerminationReason::TargetCostReached) => {
                RunStatus::Converged
            }
            TerminationStatus::Terminated(TerminationReason::MaxItersReached)
                if best_cost < initial_cost =>
            {
                RunStatus::PartiallyConverged
            }
            _ => RunStatus::Failed,
        };

        Ok(BackendRun {
            values: plan.embed(&best_free),
            statistic: best_cost,
            status,
            n_iterations: n_iter,
            errors_free: None,
            covariance_free: None,
        })
    }

    /// Finite-difference Hessian over the free coordinates, inverted into
    /// a covariance under the `Δstatistic = 1` error convention.
    ///
    /// Returns `Ok(None)` when the Hessian cannot be inverted into a
    /// usable covariance; the caller reports zero errors and downstream
    /// consumers see covariance-unavailable.
    fn hessian_covariance(
        &self,
        adapter: &CostFunctionAdapter<'_>,
        plan: &BoundPlan,
        best: &[f64],
    ) -> Result<Option<(Vec<f64>, DMatrix<f64>)>> {
        let n = plan.free.len();
        let grad_center = adapter.gradient(best)?;

        let mut hessian = DMatrix::zeros(n, n);
        for (jj, &j) in plan.free.iter().enumerate() {
            let eps = 1e-4 * best[j].abs().max(1.0);
            let mut plus = best.to_vec();
            plus[j] += eps;
            let grad_plus = adapter.gradient(&plus)?;
            for (ii, &i) in plan.free.iter().enumerate() {
                hessian[(ii, jj)] = (grad_plus[i] - grad_center[i]) / eps;
            }
        }
        let ht = hessian.transpose();
        hessian = (&hessian + &ht) * 0.5;

        let Some(h_inv) = invert_hessian(&hessian, n) else {
            log::warn!("Hessian is not invertible, reporting zero errors");
            return Ok(None);
        };

        // Statistic is chi-square-like: the Δstatistic = 1 contour sits at
        // 2 H^{-1}, not H^{-1}.
        let covariance = h_inv * 2.0;
        let mut errors = Vec::with_capacity(n);
        for i in 0..n {
            let var = covariance[(i, i)];
            if var.is_finite() && var > 0.0 {
                errors.push(var.sqrt());
            } else {
                log::warn!("non-positive variance on free coordinate {i}, zeroing its error");
                errors.push(0.0);
            }
        }
        Ok(Some((errors, covariance)))
    }
}

/// Invert a Hessian via damped Cholesky with an escalating ridge, falling
/// back to an LU inverse, rejecting inverses with unusable diagonals.
fn invert_hessian(hessian: &DMatrix<f64>, n: usize) -> Option<DMatrix<f64>> {
    let identity = DMatrix::identity(n, n);
    let diag_scale = (0..n).map(|i| hessian[(i, i)].abs()).fold(0.0_f64, f64::max).max(1.0);

    let mut damped = hessian.clone();
    let mut damping = 0.0_f64;
    let max_attempts = 10;

    for attempt in 0..max_attempts {
        if let Some(chol) = nalgebra::linalg::Cholesky::new(damped.clone()) {
            return Some(chol.solve(&identity));
        }
        if attempt + 1 == max_attempts {
            break;
        }
        let next = if damping == 0.0 { diag_scale * 1e-9 } else { damping * 10.0 };
        let add = next - damping;
        for i in 0..n {
            damped[(i, i)] += add;
        }
        damping = next;
    }

    let cov = damped.lu().try_inverse()?;
    for i in 0..n {
        let v = cov[(i, i)];
        if !(v.is_finite() && v > 0.0) {
            return None;
        }
    }
    Some(cov)
}

/// Free-subspace view of the adapter for argmin.
struct FreeSpaceProblem<'a, 'b> {
    adapter: &'b CostFunctionAdapter<'a>,
    plan: &'b BoundPlan,
    stash: Rc<RefCell<Option<Error>>>,
}

impl FreeSpaceProblem<'_, '_> {
    fn stash_err(&self, err: Error) -> argmin::core::Error {
        let msg = err.to_string();
        *self.stash.borrow_mut() = Some(err);
        argmin::core::Error::msg(msg)
    }
}

impl CostFunction for FreeSpaceProblem<'_, '_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        let clamped = self.plan.clamp_free(param);
        let full = self.plan.embed(&clamped);
        self.adapter.evaluate(&full).map_err(|e| self.stash_err(e))
    }
}

impl Gradient for FreeSpaceProblem<'_, '_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        param: &Self::Param,
    ) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        let clamped = self.plan.clamp_free(param);
        let full = self.plan.embed(&clamped);
        let full_grad = self.adapter.gradient(&full).map_err(|e| self.stash_err(e))?;
        let mut g = self.plan.extract(&full_grad);

        // Projected gradient: components pushing outward at an active
        // bound are zeroed so the line search does not chase the clamp.
        const EPS: f64 = 1e-12;
        for (k, (&slot, &x)) in self.plan.free.iter().zip(clamped.iter()).enumerate() {
            let (lo, hi) = self.plan.bounds[slot];
            if x <= lo + EPS && g[k] > 0.0 {
                g[k] = 0.0;
            }
            if x >= hi - EPS && g[k] < 0.0 {
                g[k] = 0.0;
            }
        }
        Ok(g)
    }
}
