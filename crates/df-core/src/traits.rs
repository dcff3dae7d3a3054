//! Collaborator contracts for the fit engine
//!
//! The engine never talks to a concrete reweighting library, event sample,
//! or storage backend. It drives the three traits below, which embedders
//! implement on top of whatever generator/reweighting stack they use. All
//! three are consumed single-threaded behind `&mut`; implementations do not
//! need to be `Send` or `Sync`.

use crate::Result;
use crate::types::{DialKind, DialUnits, FakeDataSource, FitRecord, MatrixRecord, NamedSeries, UnitDirection};

/// Handle to the live reweighting machinery.
///
/// The engine stages one value per dial and then commits the whole batch
/// with a single [`ReweightEngine::reconfigure`]; implementations are free
/// to defer expensive work to the commit.
pub trait ReweightEngine {
    /// Declare a dial before its first use. Called once per parameter
    /// during setup.
    fn include_dial(&mut self, name: &str, kind: DialKind) -> Result<()>;

    /// Stage a value for a declared dial.
    fn set_dial_value(&mut self, name: &str, value: f64) -> Result<()>;

    /// Commit all staged dial values to the underlying engines.
    fn reconfigure(&mut self) -> Result<()>;

    /// Convert `value` between the engine-internal sigma scale and the
    /// declared `units` for one dial, in the given `direction`.
    fn convert_units(
        &self,
        kind: DialKind,
        name: &str,
        value: f64,
        direction: UnitDirection,
        units: DialUnits,
    ) -> Result<f64>;
}

/// Joint goodness-of-fit objective over all event samples.
///
/// [`JointObjective::evaluate`] is called after the reweighting engine has
/// been reconfigured for the candidate parameter vector; it must be
/// deterministic for identical inputs within one run.
pub trait JointObjective {
    /// Compute the goodness-of-fit statistic for the current model state.
    /// The parameter vector is passed through for implementations that
    /// evaluate without a reweighting engine (sample norms, tests).
    fn evaluate(&mut self, params: &[f64]) -> Result<f64>;

    /// Total bin count across all samples (for degrees-of-freedom).
    fn n_bins(&self) -> usize;

    /// Re-propagate staged weights through every stored event.
    fn reconfigure_all_events(&mut self) -> Result<()>;

    /// Replace the dataset: the current prediction (`MonteCarlo`) or a
    /// named external source.
    fn set_fake_data(&mut self, source: &FakeDataSource) -> Result<()>;

    /// Statistically resample the observed dataset under the current model
    /// and return the resulting statistic. The toy dataset stays in place
    /// afterwards; restoring the original data is the implementation's
    /// concern.
    fn throw_data_toy(&mut self) -> Result<f64>;

    /// Named per-bin predictions from the most recent evaluation.
    fn prediction_snapshot(&self) -> Vec<NamedSeries>;

    /// Cap the number of events used per evaluation (`None` = all events).
    /// Used by the low-statistics bracket.
    fn set_event_budget(&mut self, budget: Option<u64>) -> Result<()>;

    /// Currently active event budget.
    fn event_budget(&self) -> Option<u64>;
}

/// Destination for fit products.
///
/// The engine emits named series, named matrices, and structured fit
/// records; what "persist" means (files, databases, in-memory piles) is
/// the sink's business.
pub trait RecordSink {
    /// Record a named series of values.
    fn record_series(&mut self, name: &str, values: &[f64]) -> Result<()>;

    /// Record a named matrix.
    fn record_matrix(&mut self, name: &str, matrix: &MatrixRecord) -> Result<()>;

    /// Record a structured fit result.
    fn record_fit(&mut self, record: &FitRecord) -> Result<()>;
}

/// In-memory [`RecordSink`] that keeps everything in insertion order.
///
/// Used by the test suites and by embedders that aggregate products before
/// persisting them elsewhere.
#[derive(Debug, Default)]
pub struct MemorySink {
    /// Recorded series in insertion order.
    pub series: Vec<NamedSeries>,
    /// Recorded matrices in insertion order.
    pub matrices: Vec<(String, MatrixRecord)>,
    /// Recorded fit records in insertion order.
    pub fits: Vec<FitRecord>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// First recorded series with the given name.
    pub fn series(&self, name: &str) -> Option<&NamedSeries> {
        self.series.iter().find(|s| s.name == name)
    }

    /// First recorded matrix with the given name.
    pub fn matrix(&self, name: &str) -> Option<&MatrixRecord> {
        self.matrices.iter().find(|(n, _)| n == name).map(|(_, m)| m)
    }
}

impl RecordSink for MemorySink {
    fn record_series(&mut self, name: &str, values: &[f64]) -> Result<()> {
        self.series.push(NamedSeries::new(name, values.to_vec()));
        Ok(())
    }

    fn record_matrix(&mut self, name: &str, matrix: &MatrixRecord) -> Result<()> {
        self.matrices.push((name.to_string(), matrix.clone()));
        Ok(())
    }

    fn record_fit(&mut self, record: &FitRecord) -> Result<()> {
        self.fits.push(record.clone());
        Ok(())
    }
}
