//! End-to-end strategy runs against in-memory collaborators.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use approx::assert_relative_eq;
use df_core::types::{DialKind, DialUnits, FakeDataSource, NamedSeries, RunStatus, UnitDirection};
use df_core::{JointObjective, MemorySink, Result, ReweightEngine};
use df_fit::{FitConfig, FitDriver, ParameterRegistry, ParameterSpec, ThrowMode};

/// Committed dial values plus the full push history, shared between the
/// reweight double and the objective double.
#[derive(Debug, Default)]
struct ModelState {
    committed: BTreeMap<String, f64>,
    history: Vec<(String, f64)>,
}

type SharedState = Rc<RefCell<ModelState>>;

struct RecordingReweight {
    state: SharedState,
    staged: BTreeMap<String, f64>,
}

impl RecordingReweight {
    fn new(state: SharedState) -> Self {
        Self { state, staged: BTreeMap::new() }
    }
}

impl ReweightEngine for RecordingReweight {
    fn include_dial(&mut self, _name: &str, _kind: DialKind) -> Result<()> {
        Ok(())
    }

    fn set_dial_value(&mut self, name: &str, value: f64) -> Result<()> {
        self.staged.insert(name.to_string(), value);
        self.state.borrow_mut().history.push((name.to_string(), value));
        Ok(())
    }

    fn reconfigure(&mut self) -> Result<()> {
        self.state.borrow_mut().committed.extend(self.staged.clone());
        Ok(())
    }

    fn convert_units(
        &self,
        _kind: DialKind,
        _name: &str,
        value: f64,
        _direction: UnitDirection,
        _units: DialUnits,
    ) -> Result<f64> {
        Ok(value)
    }
}

/// Quadratic statistic over the committed dial values, 10 joint bins.
struct QuadraticModel {
    state: SharedState,
    targets: BTreeMap<String, f64>,
    budget: Option<u64>,
    toy_state: u64,
}

impl QuadraticModel {
    fn new(state: SharedState, targets: &[(&str, f64)]) -> Self {
        Self {
            state,
            targets: targets.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
            budget: None,
            toy_state: 0x2545f4914f6cdd1d,
        }
    }
}

impl JointObjective for QuadraticModel {
    fn evaluate(&mut self, _params: &[f64]) -> Result<f64> {
        let state = self.state.borrow();
        let mut stat = 0.0;
        for (name, target) in &self.targets {
            let v = state.committed.get(name).copied().unwrap_or(0.0);
            stat += (v - target) * (v - target);
        }
        Ok(stat)
    }

    fn n_bins(&self) -> usize {
        10
    }

    fn reconfigure_all_events(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_fake_data(&mut self, _source: &FakeDataSource) -> Result<()> {
        Ok(())
    }

    fn throw_data_toy(&mut self) -> Result<f64> {
        self.toy_state ^= self.toy_state << 13;
        self.toy_state ^= self.toy_state >> 7;
        self.toy_state ^= self.toy_state << 17;
        Ok(8.0 + (self.toy_state % 1000) as f64 / 125.0)
    }

    fn prediction_snapshot(&self) -> Vec<NamedSeries> {
        let state = self.state.borrow();
        let values = self
            .targets
            .keys()
            .map(|n| state.committed.get(n).copied().unwrap_or(0.0))
            .collect();
        vec![NamedSeries::new("prediction", values)]
    }

    fn set_event_budget(&mut self, budget: Option<u64>) -> Result<()> {
        self.budget = budget;
        Ok(())
    }

    fn event_budget(&self) -> Option<u64> {
        self.budget
    }
}

fn driver_for(
    config: FitConfig,
    registry: ParameterRegistry,
    targets: &[(&str, f64)],
) -> (FitDriver<MemorySink>, SharedState) {
    let state: SharedState = Rc::new(RefCell::new(ModelState::default()));
    let driver = FitDriver::new(
        config,
        registry,
        Box::new(RecordingReweight::new(state.clone())),
        Box::new(QuadraticModel::new(state.clone(), targets)),
        MemorySink::new(),
    )
    .unwrap();
    (driver, state)
}

/// A free over [0, 2], B fixed at 1, C mirrored at 1 from above.
fn registry_abc() -> ParameterRegistry {
    let mut reg = ParameterRegistry::new();
    reg.register(
        ParameterSpec::new("A", DialKind::Interaction, 1.0).with_bounds(0.0, 2.0).with_step(0.5),
    )
    .unwrap();
    reg.register(ParameterSpec::new("B", DialKind::Flux, 1.0).with_bounds(0.0, 2.0).fixed())
        .unwrap();
    reg.register(
        ParameterSpec::new("C", DialKind::Detector, 1.0)
            .with_bounds(0.0, 2.0)
            .with_step(0.5)
            .with_mirror(1.0, true),
    )
    .unwrap();
    reg
}

#[test]
fn default_strategy_converges_and_records_the_fit() {
    let mut reg = ParameterRegistry::new();
    reg.register(ParameterSpec::new("x", DialKind::Interaction, 0.0).with_bounds(-5.0, 5.0))
        .unwrap();
    reg.register(ParameterSpec::new("y", DialKind::Oscillation, 0.0).with_bounds(-5.0, 5.0))
        .unwrap();

    let (mut driver, _) = driver_for(FitConfig::default(), reg, &[("x", 1.5), ("y", -2.0)]);
    driver.run().unwrap();

    assert_relative_eq!(driver.registry().get("x").unwrap().current, 1.5, epsilon = 1e-4);
    assert_relative_eq!(driver.registry().get("y").unwrap().current, -2.0, epsilon = 1e-4);
    assert_eq!(driver.state().status, Some(RunStatus::Converged));
    // Quadratic statistic: the one-unit contour gives unit errors.
    assert_relative_eq!(driver.registry().get("x").unwrap().error, 1.0, epsilon = 1e-3);

    let sink = driver.into_sink();
    // Interior minimum: FixAtLimBreak stopped the strategy after one fit.
    assert_eq!(sink.fits.len(), 1);
    let record = &sink.fits[0];
    assert_eq!(record.algorithm, "Lbfgs");
    assert_eq!(record.status, RunStatus::Converged);
    assert_eq!(record.n_dof, 8);
    assert!(record.covariance_available);
    assert!(sink.matrix("covariance").is_some());
    assert!(sink.matrix("covariance_free").is_some());
    assert!(sink.matrix("decomposition_free").is_some());
}

#[test]
fn scan_grid_and_restore_semantics() {
    let config = FitConfig { strategy: "Chi2Scan1D".to_string(), ..FitConfig::default() };
    let (mut driver, state) = driver_for(config, registry_abc(), &[
        ("A", 1.0),
        ("B", 1.0),
        ("C", 0.5),
    ]);
    let a_before = driver.registry().get("A").unwrap().current;
    driver.run().unwrap();

    // A's value after the scan equals its value before, bit for bit.
    assert_eq!(driver.registry().get("A").unwrap().current, a_before);

    let sink = driver.into_sink();
    // [0, 2] with step 0.5: exactly the 4 points below the upper edge.
    let grid = sink.series("scan1d_A_grid").unwrap();
    assert_eq!(grid.values, vec![0.0, 0.5, 1.0, 1.5]);
    assert_eq!(sink.series("scan1d_A").unwrap().values.len(), 4);

    // B is fixed: no scan curve, and every push of B was its fixed value.
    assert!(sink.series("scan1d_B").is_none());
    let state = state.borrow();
    assert!(state.history.iter().filter(|(n, _)| n == "B").all(|(_, v)| *v == 1.0));

    // C is mirrored at 1 from above: the 1.5 grid point evaluates at 0.5,
    // so its curve is symmetric about the pivot.
    let c_curve = &sink.series("scan1d_C").unwrap().values;
    assert_eq!(c_curve.len(), 4);
    assert_relative_eq!(c_curve[1], c_curve[3]);
    assert!(state.history.iter().filter(|(n, _)| n == "C").all(|(_, v)| *v <= 1.0));
}

#[test]
fn two_dimensional_scan_includes_the_upper_edge() {
    let config = FitConfig { strategy: "Chi2Scan2D".to_string(), ..FitConfig::default() };
    let (mut driver, _) = driver_for(config, registry_abc(), &[
        ("A", 1.0),
        ("B", 1.0),
        ("C", 0.5),
    ]);
    driver.run().unwrap();

    let sink = driver.into_sink();
    // One free pair (C, A), 5 points per axis with the edge included.
    let surface = sink.matrix("scan2d_C_A").unwrap();
    assert_eq!((surface.n_rows, surface.n_cols), (5, 5));
    assert_eq!(sink.series("scan2d_C_A_xgrid").unwrap().values.len(), 5);
}

#[test]
fn full_pipeline_with_bound_pinned_refit_bands_and_toys() {
    let config = FitConfig {
        strategy: "Lbfgs,FixAtLimBreak,Lbfgs,Chi2Scan1D,ErrorBands,DataToys".to_string(),
        n_throws: 50,
        n_data_toys: 20,
        throw_mode: ThrowMode::Correlated,
        ..FitConfig::default()
    };
    let mut reg = ParameterRegistry::new();
    // Target outside the box: x pins at 2.0 and gets fixed by the break.
    reg.register(ParameterSpec::new("x", DialKind::Interaction, 1.0).with_bounds(0.0, 2.0))
        .unwrap();
    reg.register(
        ParameterSpec::new("y", DialKind::Flux, 0.0).with_bounds(-5.0, 5.0).with_step(0.5),
    )
    .unwrap();

    let (mut driver, _) = driver_for(config, reg, &[("x", 3.0), ("y", 0.5)]);
    driver.run().unwrap();

    let x = driver.registry().get("x").unwrap();
    assert_eq!(x.current, 2.0);
    assert!(x.fixed);
    assert_relative_eq!(driver.registry().get("y").unwrap().current, 0.5, epsilon = 1e-4);
    assert!(driver.covariance().is_some());

    let sink = driver.into_sink();
    assert_eq!(sink.fits.len(), 2);
    assert_eq!(sink.fits[1].n_free, 1);

    // Scans ran only over the surviving free parameter.
    assert!(sink.series("scan1d_y").is_some());
    assert!(sink.series("scan1d_x").is_none());

    // Bands and toys came out with the configured counts.
    assert_eq!(sink.series("throw_statistics").unwrap().values.len(), 50);
    assert_eq!(sink.series("throws_y").unwrap().values.len(), 50);
    assert!(sink.series("band_prediction_center").is_some());
    assert_eq!(sink.series("toy_statistics").unwrap().values.len(), 20);
}

#[test]
fn mcmc_strategy_produces_a_chain_covariance() {
    let config = FitConfig {
        strategy: "Mcmc".to_string(),
        max_evaluations: 4000,
        ..FitConfig::default()
    };
    let mut reg = ParameterRegistry::new();
    reg.register(ParameterSpec::new("x", DialKind::Interaction, 0.0).with_bounds(-4.0, 4.0))
        .unwrap();

    let (mut driver, _) = driver_for(config, reg, &[("x", 1.0)]);
    driver.run().unwrap();

    assert_relative_eq!(driver.registry().get("x").unwrap().current, 1.0, epsilon = 0.2);
    // The chain supplies marginal errors and a sample covariance.
    assert!(driver.state().covariance_available);
    assert!(driver.registry().get("x").unwrap().error > 0.0);
}

#[test]
fn annealing_strategy_reports_no_covariance() {
    let config = FitConfig {
        strategy: "SimAn".to_string(),
        max_evaluations: 20_000,
        ..FitConfig::default()
    };
    let mut reg = ParameterRegistry::new();
    reg.register(ParameterSpec::new("x", DialKind::Interaction, 0.0).with_bounds(-4.0, 4.0))
        .unwrap();

    let (mut driver, _) = driver_for(config, reg, &[("x", -1.5)]);
    driver.run().unwrap();

    assert_relative_eq!(driver.registry().get("x").unwrap().current, -1.5, epsilon = 0.3);
    assert!(!driver.state().covariance_available);
    assert_eq!(driver.registry().get("x").unwrap().error, 0.0);

    let sink = driver.into_sink();
    // A zero-filled covariance is still recorded for the outward layout.
    let cov = sink.matrix("covariance").unwrap();
    assert!(cov.values.iter().all(|v| *v == 0.0));
}

#[test]
fn zero_free_fit_is_a_noop_success() {
    let config = FitConfig { strategy: "Lbfgs".to_string(), ..FitConfig::default() };
    let mut reg = ParameterRegistry::new();
    reg.register(ParameterSpec::new("x", DialKind::Interaction, 0.7).fixed()).unwrap();

    let (mut driver, _) = driver_for(config, reg, &[("x", 0.0)]);
    driver.run().unwrap();

    assert_eq!(driver.state().status, Some(RunStatus::Converged));
    assert_eq!(driver.registry().get("x").unwrap().current, 0.7);

    let sink = driver.into_sink();
    assert_eq!(sink.fits[0].n_free, 0);
    assert_eq!(sink.fits[0].n_iterations, 0);
}
