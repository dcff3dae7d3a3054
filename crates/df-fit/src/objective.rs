//! Cost function adapter
//!
//! Bridges the registry and the external collaborators to the dense
//! `f(&[f64]) -> f64` surface the minimizers and engines consume. Every
//! evaluation pushes the full parameter vector (fixed dials included) into
//! the reweighting engine and commits it before asking the joint objective
//! for the statistic: a prior routine may have left the engine at a
//! different point, so the push is never skipped.

use std::cell::{Cell, RefCell};

use df_core::types::NamedSeries;
use df_core::{Error, JointObjective, Result, ReweightEngine};

use crate::params::ParameterSet;

/// The externally owned mutable state a fit runs against.
///
/// Exactly one of these is live per fit; the adapter and the resampling
/// engine borrow it, the [`crate::driver::FitDriver`] owns it.
pub struct FitContext {
    reweight: Box<dyn ReweightEngine>,
    objective: Box<dyn JointObjective>,
}

impl FitContext {
    /// Wrap the two collaborators.
    pub fn new(reweight: Box<dyn ReweightEngine>, objective: Box<dyn JointObjective>) -> Self {
        Self { reweight, objective }
    }

    /// The reweighting engine.
    pub fn reweight_mut(&mut self) -> &mut dyn ReweightEngine {
        self.reweight.as_mut()
    }

    /// The joint objective.
    pub fn objective_mut(&mut self) -> &mut dyn JointObjective {
        self.objective.as_mut()
    }

    /// The joint objective, read-only.
    pub fn objective(&self) -> &dyn JointObjective {
        self.objective.as_ref()
    }

    /// Stage one value per dial in set order and commit the batch.
    pub fn push_values(&mut self, set: &ParameterSet, values: &[f64]) -> Result<()> {
        for (param, &value) in set.iter().zip(values.iter()) {
            self.reweight.set_dial_value(&param.name, value)?;
        }
        self.reweight.reconfigure()
    }
}

/// Minimizer-facing view of the joint objective.
///
/// Holds the frozen [`ParameterSet`] for index ↔ name mapping and mirror
/// lookup. Interior mutability (the optimizer backends evaluate through
/// `&self`) follows the cached-objective pattern: single-threaded by
/// design, never shared across threads.
pub struct CostFunctionAdapter<'a> {
    set: &'a ParameterSet,
    ctx: RefCell<&'a mut FitContext>,
    n_evaluations: Cell<u64>,
    budget: Option<u64>,
    best: RefCell<Option<(Vec<f64>, f64)>>,
}

impl<'a> CostFunctionAdapter<'a> {
    /// Adapter over a frozen set and the live context.
    pub fn new(set: &'a ParameterSet, ctx: &'a mut FitContext) -> Self {
        Self {
            set,
            ctx: RefCell::new(ctx),
            n_evaluations: Cell::new(0),
            budget: None,
            best: RefCell::new(None),
        }
    }

    /// Cap the number of evaluations; exhausting the budget surfaces as a
    /// convergence failure, which the minimizer driver converts into a
    /// `Failed` outcome.
    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = Some(budget);
        self
    }

    /// The bound parameter set.
    pub fn set(&self) -> &ParameterSet {
        self.set
    }

    /// Apply each parameter's mirror transform to a candidate vector.
    pub fn mirrored(&self, values: &[f64]) -> Vec<f64> {
        self.set
            .iter()
            .zip(values.iter())
            .map(|(p, &v)| match p.mirror {
                Some(m) => m.reflect(v),
                None => v,
            })
            .collect()
    }

    /// Evaluate the joint statistic at a full-dimension parameter vector.
    ///
    /// Deterministic for identical inputs within one run: the same vector
    /// produces the same push, the same commit, and the same statistic.
    pub fn evaluate(&self, values: &[f64]) -> Result<f64> {
        if let Some(budget) = self.budget {
            if self.n_evaluations.get() >= budget {
                return Err(Error::Convergence(format!(
                    "evaluation budget of {budget} calls exhausted"
                )));
            }
        }

        let pushed = self.mirrored(values);
        let statistic = {
            let mut ctx = self.ctx.borrow_mut();
            ctx.push_values(self.set, &pushed)?;
            ctx.objective.evaluate(&pushed)?
        };
        self.n_evaluations.set(self.n_evaluations.get() + 1);

        let mut best = self.best.borrow_mut();
        let improved = best.as_ref().map(|(_, s)| statistic < *s).unwrap_or(true);
        if improved {
            *best = Some((values.to_vec(), statistic));
        }
        Ok(statistic)
    }

    /// Central-difference gradient over the free coordinates.
    ///
    /// Relative step `1e-8 * max(|x_i|, 1)`; fixed coordinates report a
    /// zero component.
    pub fn gradient(&self, values: &[f64]) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; values.len()];
        for i in self.set.free_indices() {
            let eps = 1e-8 * values[i].abs().max(1.0);

            let mut plus = values.to_vec();
            plus[i] += eps;
            let f_plus = self.evaluate(&plus)?;

            let mut minus = values.to_vec();
            minus[i] -= eps;
            let f_minus = self.evaluate(&minus)?;

            grad[i] = (f_plus - f_minus) / (2.0 * eps);
        }
        Ok(grad)
    }

    /// Evaluations performed so far through this adapter.
    pub fn n_evaluations(&self) -> u64 {
        self.n_evaluations.get()
    }

    /// Best `(vector, statistic)` seen so far, in minimizer coordinates
    /// (before the mirror fold).
    pub fn best(&self) -> Option<(Vec<f64>, f64)> {
        self.best.borrow().clone()
    }

    /// Joint bin count of the objective.
    pub fn n_bins(&self) -> usize {
        self.ctx.borrow().objective.n_bins()
    }

    /// Per-bin predictions from the most recent evaluation.
    pub fn prediction_snapshot(&self) -> Vec<NamedSeries> {
        self.ctx.borrow().objective.prediction_snapshot()
    }

    /// Resample the observed data and return the resulting statistic.
    pub fn throw_data_toy(&self) -> Result<f64> {
        self.ctx.borrow_mut().objective.throw_data_toy()
    }
}
