//! Shared test doubles for the engine's collaborator traits.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use df_core::types::{DialKind, DialUnits, FakeDataSource, NamedSeries, UnitDirection};
use df_core::{Error, JointObjective, Result, ReweightEngine};

/// Record of everything pushed through a [`LoggingReweight`].
#[derive(Debug, Default)]
pub struct DialLog {
    /// Last committed value per dial.
    pub committed: BTreeMap<String, f64>,
    /// Values staged since the last `reconfigure`.
    pub staged: BTreeMap<String, f64>,
    /// Every `(dial, value)` push in call order.
    pub history: Vec<(String, f64)>,
    /// Number of `reconfigure` calls.
    pub reconfigures: u64,
    /// Number of `reconfigure_all_events` calls on the objective.
    pub full_reconfigures: u64,
    /// Dials declared through `include_dial`.
    pub included: Vec<String>,
}

/// Shared handle to a [`DialLog`]; the tests are single-threaded.
pub type SharedDialLog = Rc<RefCell<DialLog>>;

/// Fresh shared dial log.
pub fn shared_log() -> SharedDialLog {
    Rc::new(RefCell::new(DialLog::default()))
}

/// Reweight engine double that records every staged value and commit.
pub struct LoggingReweight {
    log: SharedDialLog,
}

impl LoggingReweight {
    pub fn new(log: SharedDialLog) -> Self {
        Self { log }
    }
}

impl ReweightEngine for LoggingReweight {
    fn include_dial(&mut self, name: &str, _kind: DialKind) -> Result<()> {
        self.log.borrow_mut().included.push(name.to_string());
        Ok(())
    }

    fn set_dial_value(&mut self, name: &str, value: f64) -> Result<()> {
        let mut log = self.log.borrow_mut();
        log.staged.insert(name.to_string(), value);
        log.history.push((name.to_string(), value));
        Ok(())
    }

    fn reconfigure(&mut self) -> Result<()> {
        let mut log = self.log.borrow_mut();
        let staged = log.staged.clone();
        log.committed.extend(staged);
        log.reconfigures += 1;
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

/// Reweight engine whose unit transform multiplies by a scale factor.
pub struct ScalingEngine {
    scale: f64,
}

impl ScalingEngine {
    pub fn new(scale: f64) -> Self {
        Self { scale }
    }
}

impl ReweightEngine for ScalingEngine {
    fn include_dial(&mut self, _name: &str, _kind: DialKind) -> Result<()> {
        Ok(())
    }

    fn set_dial_value(&mut self, _name: &str, _value: f64) -> Result<()> {
        Ok(())
    }

    fn reconfigure(&mut self) -> Result<()> {
        Ok(())
    }

    fn convert_units(
        &self,
        _kind: DialKind,
        _name: &str,
        value: f64,
        direction: UnitDirection,
        _units: DialUnits,
    ) -> Result<f64> {
        Ok(match direction {
            UnitDirection::ToSigma => value * self.scale,
            UnitDirection::FromSigma => value / self.scale,
        })
    }
}

/// Quadratic joint objective evaluating the *committed* dial values.
///
/// Statistic: `sum_i (committed[name_i] - target_i)^2`. Reading from the
/// shared dial log rather than the parameter slice makes the tests fail
/// if the adapter forgets the push-then-reconfigure ordering.
pub struct QuadraticObjective {
    log: SharedDialLog,
    targets: BTreeMap<String, f64>,
    budget: Option<u64>,
    /// When set, `set_event_budget(None)` fails (resource-swap tests).
    pub refuse_restore: bool,
    /// When set, evaluation fails while a budget is active.
    pub fail_under_budget: bool,
    /// Every `set_fake_data` call.
    pub fake_data_calls: Vec<FakeDataSource>,
    toy_state: u64,
}

impl QuadraticObjective {
    pub fn new(log: SharedDialLog, targets: &[(&str, f64)]) -> Self {
        Self {
            log,
            targets: targets.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
            budget: None,
            refuse_restore: false,
            fail_under_budget: false,
            fake_data_calls: Vec::new(),
            toy_state: 0x9e3779b97f4a7c15,
        }
    }
}

impl JointObjective for QuadraticObjective {
    fn evaluate(&mut self, _params: &[f64]) -> Result<f64> {
        if self.fail_under_budget && self.budget.is_some() {
            return Err(Error::Evaluation("low-stat sample unusable".to_string()));
        }
        let log = self.log.borrow();
        let mut stat = 0.0;
        for (name, target) in &self.targets {
            let v = log.committed.get(name).copied().unwrap_or(0.0);
            stat += (v - target) * (v - target);
        }
        Ok(stat)
    }

    fn n_bins(&self) -> usize {
        10
    }

    fn reconfigure_all_events(&mut self) -> Result<()> {
        self.log.borrow_mut().full_reconfigures += 1;
        Ok(())
    }

    fn set_fake_data(&mut self, source: &FakeDataSource) -> Result<()> {
        self.fake_data_calls.push(source.clone());
        Ok(())
    }

    fn throw_data_toy(&mut self) -> Result<f64> {
        // xorshift so successive toys differ deterministically
        self.toy_state ^= self.toy_state << 13;
        self.toy_state ^= self.toy_state >> 7;
        self.toy_state ^= self.toy_state << 17;
        Ok(10.0 + (self.toy_state % 1000) as f64 / 100.0)
    }

    fn prediction_snapshot(&self) -> Vec<NamedSeries> {
        let log = self.log.borrow();
        let values: Vec<f64> =
            self.targets.keys().map(|n| log.committed.get(n).copied().unwrap_or(0.0)).collect();
        vec![NamedSeries::new("prediction", values)]
    }

    fn set_event_budget(&mut self, budget: Option<u64>) -> Result<()> {
        if self.refuse_restore && budget.is_none() && self.budget.is_some() {
            return Err(Error::Evaluation("cannot reload full event sample".to_string()));
        }
        self.budget = budget;
        Ok(())
    }

    fn event_budget(&self) -> Option<u64> {
        self.budget
    }
}
