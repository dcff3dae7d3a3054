//! Fit driver
//!
//! Top-level strategy orchestration: owns the registry, the collaborator
//! context, the record sink, and the current covariance, and runs the
//! configured routine list in order. Each routine leaves the fit state
//! consistent for the next; the loop stops early only when a routine
//! reports `Finished` or `NoChange`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use df_core::types::{FakeDataSource, FitRecord, ParameterRecord, RunStatus};
use df_core::{Error, JointObjective, RecordSink, Result, ReweightEngine};

use crate::covariance::{CovarianceBuilder, FitCovariance};
use crate::minimizer::{Algorithm, MinimizerDriver, MinimizerOptions};
use crate::objective::{CostFunctionAdapter, FitContext};
use crate::params::{FIX_TOLERANCE, ParameterRegistry};
use crate::scan::ScanEngine;
use crate::throws::{ResamplingEngine, ThrowMode};

/// One step of a fit strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routine {
    /// Run a minimizer algorithm against the full event sample.
    Minimize(Algorithm),
    /// Run a minimizer algorithm inside a reduced-event-budget bracket.
    LowStat(Algorithm),
    /// Fix parameters sitting at their bounds; the signal is discarded.
    FixAtLim,
    /// Fix parameters sitting at their bounds; stop the strategy when
    /// nothing changed.
    FixAtLimBreak,
    /// 1-D statistic scan over every free parameter.
    Scan1D,
    /// 2-D statistic scan over every free parameter pair.
    Scan2D,
    /// Parameter throws aggregated into per-bin error bands.
    ErrorBands,
    /// Data-resampling toys under the current model.
    DataToys,
}

impl Routine {
    fn from_name(name: &str) -> Result<Self> {
        match name {
            "FixAtLim" => Ok(Self::FixAtLim),
            "FixAtLimBreak" => Ok(Self::FixAtLimBreak),
            "Chi2Scan1D" => Ok(Self::Scan1D),
            "Chi2Scan2D" => Ok(Self::Scan2D),
            "ErrorBands" => Ok(Self::ErrorBands),
            "DataToys" => Ok(Self::DataToys),
            other => {
                if let Some(wrapped) = other.strip_prefix("LowStat") {
                    // The bracket only makes sense around a minimizer run.
                    let algorithm = Algorithm::from_name(wrapped).map_err(|_| {
                        Error::Config(format!(
                            "LowStat can only wrap a minimizer algorithm, got '{wrapped}'"
                        ))
                    })?;
                    return Ok(Self::LowStat(algorithm));
                }
                Algorithm::from_name(other)
                    .map(Self::Minimize)
                    .map_err(|_| Error::Config(format!("unknown fit routine '{other}'")))
            }
        }
    }
}

/// Parse a comma-separated strategy string into its routine list.
pub fn parse_strategy(strategy: &str) -> Result<Vec<Routine>> {
    let routines: Vec<Routine> = strategy
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Routine::from_name)
        .collect::<Result<_>>()?;
    if routines.is_empty() {
        return Err(Error::Config("empty fit strategy".to_string()));
    }
    Ok(routines)
}

/// What a routine tells the strategy loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineSignal {
    /// The strategy is done; stop.
    Finished,
    /// Nothing changed; stop.
    NoChange,
    /// Parameters or state moved; continue.
    StateChange,
    /// Nothing conclusive; continue.
    Unfinished,
}

/// Where the registry's current values came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueProvenance {
    /// Values as registered or set by the embedder.
    UserSet,
    /// Values harvested from a minimizer run.
    Converged,
    /// Values are being resampled; transient during throw routines.
    Thrown,
}

/// Process-wide fit status, updated as routines run.
#[derive(Debug, Clone)]
pub struct FitState {
    /// Last minimizer algorithm that ran.
    pub algorithm: Option<Algorithm>,
    /// Terminal status of the last minimizer routine.
    pub status: Option<RunStatus>,
    /// Iterations across all minimizer routines.
    pub n_iterations: u64,
    /// Cost evaluations across all minimizer routines.
    pub n_evaluations: u64,
    /// Whether a covariance is currently available.
    pub covariance_available: bool,
    /// Provenance of the registry's current values.
    pub provenance: ValueProvenance,
}

impl Default for FitState {
    fn default() -> Self {
        Self {
            algorithm: None,
            status: None,
            n_iterations: 0,
            n_evaluations: 0,
            covariance_available: false,
            provenance: ValueProvenance::UserSet,
        }
    }
}

fn default_strategy() -> String {
    "Lbfgs,FixAtLimBreak,Lbfgs".to_string()
}

/// Fit configuration as fed by the embedder, all fields defaulted.
///
/// The engine never opens configuration files; embedders deserialize this
/// from whatever serde format they carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Comma-separated routine list.
    pub strategy: String,
    /// Iteration ceiling per minimizer routine.
    pub max_iterations: u64,
    /// Cost-evaluation budget per minimizer routine.
    pub max_evaluations: u64,
    /// Convergence tolerance on the gradient norm.
    pub tolerance: f64,
    /// Minimizer effort level.
    pub strategy_level: u8,
    /// Parameter throws per `ErrorBands` routine.
    pub n_throws: u64,
    /// How error-band throws are drawn.
    pub throw_mode: ThrowMode,
    /// Toys per `DataToys` routine.
    pub n_data_toys: u64,
    /// Seed for every stochastic component.
    pub seed: u64,
    /// Reduced event budget for `LowStat` brackets.
    pub low_stat_events: Option<u64>,
    /// Tolerance for the fix-at-limit routines.
    pub fix_tolerance: f64,
    /// Record nominal/prefit/postfit prediction snapshots.
    pub save_nominal: bool,
    /// Fake-data source; `None` fits the real dataset.
    pub fake_data: Option<FakeDataSource>,
    /// Dial overrides applied while generating fake data.
    pub fake_values: BTreeMap<String, f64>,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_iterations: 10_000,
            max_evaluations: 1_000_000,
            tolerance: 1e-6,
            strategy_level: 1,
            n_throws: 1000,
            throw_mode: ThrowMode::Correlated,
            n_data_toys: 100,
            seed: 42,
            low_stat_events: None,
            fix_tolerance: FIX_TOLERANCE,
            save_nominal: false,
            fake_data: None,
            fake_values: BTreeMap::new(),
        }
    }
}

/// Strategy orchestrator owning the whole fit.
pub struct FitDriver<S: RecordSink> {
    config: FitConfig,
    routines: Vec<Routine>,
    registry: ParameterRegistry,
    ctx: FitContext,
    sink: S,
    state: FitState,
    covariance: Option<FitCovariance>,
    resampler: ResamplingEngine,
}

impl<S: RecordSink> FitDriver<S> {
    /// Build a driver over a populated registry and its collaborators.
    ///
    /// Parses the strategy, declares every registered dial with the
    /// reweighting engine, and pushes the starting values so the model is
    /// live before the first routine.
    pub fn new(
        config: FitConfig,
        registry: ParameterRegistry,
        reweight: Box<dyn ReweightEngine>,
        objective: Box<dyn JointObjective>,
        sink: S,
    ) -> Result<Self> {
        let routines = parse_strategy(&config.strategy)?;
        log::info!("fit strategy: {}", config.strategy);

        let mut ctx = FitContext::new(reweight, objective);
        for p in registry.iter() {
            ctx.reweight_mut().include_dial(&p.name, p.kind)?;
        }
        let set = registry.parameter_set();
        ctx.push_values(&set, &registry.current_values())?;

        let resampler = ResamplingEngine::new(config.seed.wrapping_add(1));
        Ok(Self {
            config,
            routines,
            registry,
            ctx,
            sink,
            state: FitState::default(),
            covariance: None,
            resampler,
        })
    }

    /// Current fit state.
    pub fn state(&self) -> &FitState {
        &self.state
    }

    /// The parameter registry.
    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    /// Covariance from the last minimizer routine, when one produced it.
    pub fn covariance(&self) -> Option<&FitCovariance> {
        self.covariance.as_ref()
    }

    /// Borrow the joint objective (diagnostics, budget inspection).
    pub fn objective(&self) -> &dyn JointObjective {
        self.ctx.objective()
    }

    /// Take the sink back after the fit.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Run the configured strategy to completion.
    pub fn run(&mut self) -> Result<()> {
        self.apply_fake_data()?;
        if self.config.save_nominal {
            let nominal = self.registry.current_values();
            self.record_snapshot("nominal", &nominal)?;
        }

        let mut prefit_recorded = false;
        for routine in self.routines.clone() {
            log::info!("running routine {routine:?}");
            if self.config.save_nominal
                && !prefit_recorded
                && matches!(routine, Routine::Minimize(_) | Routine::LowStat(_))
            {
                let starts = self.registry.start_values();
                self.record_snapshot("prefit", &starts)?;
                prefit_recorded = true;
            }

            let signal = match routine {
                Routine::Minimize(algorithm) => self.run_minimizer(algorithm)?,
                Routine::LowStat(algorithm) => self.run_low_stat(algorithm)?,
                Routine::FixAtLim => {
                    self.registry.fix_at_boundary(self.config.fix_tolerance);
                    RoutineSignal::StateChange
                }
                Routine::FixAtLimBreak => {
                    if self.registry.fix_at_boundary(self.config.fix_tolerance) {
                        RoutineSignal::StateChange
                    } else {
                        RoutineSignal::NoChange
                    }
                }
                Routine::Scan1D => self.run_scan(false)?,
                Routine::Scan2D => self.run_scan(true)?,
                Routine::ErrorBands => self.run_error_bands()?,
                Routine::DataToys => self.run_data_toys()?,
            };

            if matches!(signal, RoutineSignal::Finished | RoutineSignal::NoChange) {
                log::info!("routine {routine:?} signalled {signal:?}, stopping strategy");
                break;
            }
        }

        if self.config.save_nominal {
            let postfit = self.registry.current_values();
            self.record_snapshot("postfit", &postfit)?;
        }
        Ok(())
    }

    fn run_minimizer(&mut self, algorithm: Algorithm) -> Result<RoutineSignal> {
        // Any previous covariance is stale the moment parameters can move.
        self.covariance = None;
        self.state.covariance_available = false;

        let set = self.registry.parameter_set();
        let options = MinimizerOptions {
            max_iterations: self.config.max_iterations,
            max_evaluations: self.config.max_evaluations,
            tolerance: self.config.tolerance,
            strategy_level: self.config.strategy_level,
            seed: self.config.seed,
        };

        let mut minimizer = MinimizerDriver::new();
        minimizer.configure(algorithm, options)?;
        minimizer.bind(set.clone())?;
        let outcome = {
            let adapter = CostFunctionAdapter::new(&set, &mut self.ctx)
                .with_budget(self.config.max_evaluations);
            minimizer.run(&adapter)?
        };

        for (i, &v) in outcome.values.iter().enumerate() {
            self.registry.set_current_at(i, v);
        }
        for (i, &e) in outcome.errors.iter().enumerate() {
            self.registry.set_error_at(i, e);
        }
        self.state.algorithm = Some(algorithm);
        self.state.status = Some(outcome.status);
        self.state.n_iterations += outcome.n_iterations;
        self.state.n_evaluations += outcome.n_evaluations;
        self.state.provenance = ValueProvenance::Converged;

        let post_set = self.registry.parameter_set();
        let covariance = CovarianceBuilder::build(&post_set, outcome.covariance.as_ref());
        covariance.emit(&mut self.sink)?;
        self.state.covariance_available = outcome.covariance_available();

        // Re-evaluate at the harvested values so the record's statistic and
        // the live model both sit at the accepted point.
        let values = post_set.current_values();
        let (statistic, n_bins) = {
            let adapter = CostFunctionAdapter::new(&post_set, &mut self.ctx);
            (adapter.evaluate(&values)?, adapter.n_bins())
        };
        let n_free = post_set.free_count();
        let record = FitRecord {
            algorithm: algorithm.name().to_string(),
            statistic,
            n_bins,
            n_dof: n_bins as i64 - n_free as i64,
            n_dim: post_set.len(),
            n_free,
            status: outcome.status,
            covariance_available: outcome.covariance_available(),
            n_iterations: outcome.n_iterations,
            n_evaluations: outcome.n_evaluations,
            max_iterations: self.config.max_iterations,
            max_evaluations: self.config.max_evaluations,
            tolerance: self.config.tolerance,
            parameters: self
                .registry
                .iter()
                .map(|p| ParameterRecord {
                    name: p.name.clone(),
                    kind: p.kind,
                    units: p.units,
                    start: p.start,
                    value: p.current,
                    error: p.error,
                    min: p.min,
                    max: p.max,
                    step: p.step,
                    fixed_at_start: p.fixed_at_start,
                    fixed: p.fixed,
                })
                .collect(),
        };
        self.sink.record_fit(&record)?;
        self.covariance = Some(covariance);

        Ok(RoutineSignal::StateChange)
    }

    /// Run a minimizer under a reduced event budget, restoring the
    /// original budget whether or not the routine succeeded. A restore
    /// failure supersedes the routine's own error.
    fn run_low_stat(&mut self, algorithm: Algorithm) -> Result<RoutineSignal> {
        let budget = self.config.low_stat_events.ok_or_else(|| {
            Error::Config("LowStat routine configured without low_stat_events".to_string())
        })?;
        let original = self.ctx.objective().event_budget();
        log::info!("swapping in reduced event budget {budget} (was {original:?})");
        self.ctx.objective_mut().set_event_budget(Some(budget))?;

        let result = self.run_minimizer(algorithm);

        match self.ctx.objective_mut().set_event_budget(original) {
            Ok(()) => result,
            Err(err) => {
                Err(Error::ResourceSwap(format!("failed to restore event budget: {err}")))
            }
        }
    }

    // Scans restore the registry bit-identically, so the covariance from
    // the preceding fit stays valid across them.
    fn run_scan(&mut self, two_dim: bool) -> Result<RoutineSignal> {
        let set = self.registry.parameter_set();
        {
            let adapter = CostFunctionAdapter::new(&set, &mut self.ctx);
            if two_dim {
                ScanEngine::scan_2d(&mut self.registry, &adapter, &mut self.sink)?;
            } else {
                ScanEngine::scan_1d(&mut self.registry, &adapter, &mut self.sink)?;
            }
        }
        // The last scan point is still staged in the model.
        self.ctx.push_values(&set, &self.registry.current_values())?;
        Ok(RoutineSignal::Unfinished)
    }

    fn run_error_bands(&mut self) -> Result<RoutineSignal> {
        let set = self.registry.parameter_set();
        let fallback;
        let covariance = match self.covariance.as_ref() {
            Some(c) => c,
            None => {
                log::warn!("error bands requested without a fit covariance");
                fallback = CovarianceBuilder::build(&set, None);
                &fallback
            }
        };

        let previous = self.state.provenance;
        self.state.provenance = ValueProvenance::Thrown;
        {
            let adapter = CostFunctionAdapter::new(&set, &mut self.ctx);
            self.resampler.generate_error_bands(
                self.config.n_throws,
                self.config.throw_mode,
                &self.registry,
                &adapter,
                covariance,
                &mut self.sink,
            )?;
        }
        self.ctx.push_values(&set, &self.registry.current_values())?;
        self.state.provenance = previous;
        Ok(RoutineSignal::Unfinished)
    }

    fn run_data_toys(&mut self) -> Result<RoutineSignal> {
        let set = self.registry.parameter_set();
        let adapter = CostFunctionAdapter::new(&set, &mut self.ctx);
        self.resampler.throw_data_toys(self.config.n_data_toys, &adapter, &mut self.sink)?;
        Ok(RoutineSignal::Unfinished)
    }

    /// Stage fake data: push the override vector, adopt the resulting
    /// prediction (or a named source) as the dataset, then push the
    /// registry's values back.
    fn apply_fake_data(&mut self) -> Result<()> {
        let Some(source) = self.config.fake_data.clone() else {
            return Ok(());
        };
        log::info!("setting fake data from {source:?}");

        let set = self.registry.parameter_set();
        let mut values = self.registry.current_values();
        for (name, &value) in &self.config.fake_values {
            let idx = set.index_of(name).ok_or_else(|| {
                Error::Config(format!("fake value for unregistered parameter '{name}'"))
            })?;
            values[idx] = value;
        }
        self.ctx.push_values(&set, &values)?;
        // Full event re-propagation so the prediction the fake data is
        // drawn from reflects the override values, not cached weights.
        self.ctx.objective_mut().reconfigure_all_events()?;
        self.ctx.objective_mut().set_fake_data(&source)?;
        self.ctx.push_values(&set, &self.registry.current_values())?;
        Ok(())
    }

    /// Record the prediction at `values` as `<label>_<series>` series,
    /// leaving the model back at the registry's current values.
    fn record_snapshot(&mut self, label: &str, values: &[f64]) -> Result<()> {
        let set = self.registry.parameter_set();
        {
            let adapter = CostFunctionAdapter::new(&set, &mut self.ctx);
            adapter.evaluate(values)?;
        }
        // Re-propagate every event before snapshotting, matching the
        // fake-data path: the saved prediction must not carry stale weights.
        self.ctx.objective_mut().reconfigure_all_events()?;
        for series in self.ctx.objective().prediction_snapshot() {
            self.sink.record_series(&format!("{label}_{}", series.name), &series.values)?;
        }
        self.ctx.push_values(&set, &self.registry.current_values())?;
        Ok(())
    }
}
