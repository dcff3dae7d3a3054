//! Shared data types and outward record layouts
//!
//! Everything the engine hands to a [`crate::traits::RecordSink`] lives
//! here as plain serde-friendly data: no matrix library types leak out of
//! the core contract.

use serde::{Deserialize, Serialize};

/// Category tag for a fit dial.
///
/// Reweighting collaborators dispatch on this to decide which underlying
/// engine owns the dial; `SampleNorm` marks a per-sample normalization
/// factor that never reaches a reweighting engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialKind {
    /// Interaction-model systematic.
    Interaction,
    /// Flux systematic.
    Flux,
    /// Detector-response systematic.
    Detector,
    /// Oscillation parameter.
    Oscillation,
    /// User-defined dial routed to a custom engine.
    Custom,
    /// Per-sample normalization factor.
    SampleNorm,
}

/// Units a parameter was declared in.
///
/// The registry converts `Absolute` and `Fractional` declarations into the
/// engine-internal `Sigma` scale at registration time; after that the whole
/// engine works in sigma units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialUnits {
    /// Engine-internal scale; no conversion applied.
    Sigma,
    /// Absolute physical value.
    Absolute,
    /// Fraction of the nominal physical value.
    Fractional,
}

/// Direction of a unit conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitDirection {
    /// From declared units into the engine-internal sigma scale.
    ToSigma,
    /// From the sigma scale back into declared units (display, records).
    FromSigma,
}

/// Source of a fake dataset for closure studies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FakeDataSource {
    /// Use the current model prediction as the dataset.
    MonteCarlo,
    /// Use a named external source; interpretation is the collaborator's.
    Named(String),
}

/// Terminal status of a minimizer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// The algorithm satisfied its convergence criterion.
    Converged,
    /// The algorithm stopped on a budget limit after improving the statistic.
    PartiallyConverged,
    /// The algorithm failed to improve or aborted.
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Converged => "converged",
            RunStatus::PartiallyConverged => "partially converged",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A named vector of values (per-bin predictions, scan curves, throw series).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedSeries {
    /// Series name, unique within one producer.
    pub name: String,
    /// Series values.
    pub values: Vec<f64>,
}

impl NamedSeries {
    /// Create a named series.
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self { name: name.into(), values }
    }
}

/// A dense matrix in row-major order with optional row/column labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixRecord {
    /// Row/column labels (parameter names for square parameter matrices,
    /// axis names for scan surfaces). May be empty.
    pub labels: Vec<String>,
    /// Number of rows.
    pub n_rows: usize,
    /// Number of columns.
    pub n_cols: usize,
    /// Row-major values, `n_rows * n_cols` long.
    pub values: Vec<f64>,
}

impl MatrixRecord {
    /// Create a matrix record. `values` must be `n_rows * n_cols` long.
    pub fn new(labels: Vec<String>, n_rows: usize, n_cols: usize, values: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), n_rows * n_cols);
        Self { labels, n_rows, n_cols, values }
    }

    /// Element at `(row, col)`.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.n_cols + col]
    }
}

/// Per-parameter slice of a fit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    /// Parameter name.
    pub name: String,
    /// Dial category.
    pub kind: DialKind,
    /// Units the parameter was declared in.
    pub units: DialUnits,
    /// Start value (sigma units).
    pub start: f64,
    /// Fitted/current value (sigma units).
    pub value: f64,
    /// Symmetric error estimate; zero when unavailable.
    pub error: f64,
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
    /// Initial step size.
    pub step: f64,
    /// Whether the parameter was fixed when it was registered.
    pub fixed_at_start: bool,
    /// Whether the parameter is fixed now.
    pub fixed: bool,
}

/// Structured result record for one minimizer routine.
///
/// Matrices (covariance, correlation, decomposition) travel separately
/// through [`crate::traits::RecordSink::record_matrix`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRecord {
    /// Algorithm name that produced this record.
    pub algorithm: String,
    /// Goodness-of-fit statistic at the recorded values.
    pub statistic: f64,
    /// Joint bin count of the objective.
    pub n_bins: usize,
    /// Degrees of freedom: `n_bins - n_free`.
    pub n_dof: i64,
    /// Full parameter dimension.
    pub n_dim: usize,
    /// Free parameter count at the end of the routine.
    pub n_free: usize,
    /// Terminal run status.
    pub status: RunStatus,
    /// Whether a covariance matrix was available from the run.
    pub covariance_available: bool,
    /// Iterations used by the routine.
    pub n_iterations: u64,
    /// Cost evaluations used by the routine.
    pub n_evaluations: u64,
    /// Configured iteration ceiling.
    pub max_iterations: u64,
    /// Configured evaluation ceiling.
    pub max_evaluations: u64,
    /// Configured convergence tolerance.
    pub tolerance: f64,
    /// Per-parameter records in registry order.
    pub parameters: Vec<ParameterRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> FitRecord {
        FitRecord {
            algorithm: "Lbfgs".to_string(),
            statistic: 12.5,
            n_bins: 20,
            n_dof: 18,
            n_dim: 3,
            n_free: 2,
            status: RunStatus::Converged,
            covariance_available: true,
            n_iterations: 41,
            n_evaluations: 207,
            max_iterations: 10_000,
            max_evaluations: 1_000_000,
            tolerance: 1e-6,
            parameters: vec![ParameterRecord {
                name: "dial_a".to_string(),
                kind: DialKind::Interaction,
                units: DialUnits::Sigma,
                start: 0.0,
                value: 0.37,
                error: 0.12,
                min: -3.0,
                max: 3.0,
                step: 1.0,
                fixed_at_start: false,
                fixed: false,
            }],
        }
    }

    #[test]
    fn fit_record_round_trips_through_json() {
        let record = sample_record();
        let json = serde_json::to_string(&record).unwrap();
        let back: FitRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn matrix_record_indexing_is_row_major() {
        let m = MatrixRecord::new(
            vec!["a".to_string(), "b".to_string()],
            2,
            2,
            vec![1.0, 2.0, 3.0, 4.0],
        );
        assert_eq!(m.get(0, 1), 2.0);
        assert_eq!(m.get(1, 0), 3.0);
    }

    #[test]
    fn run_status_displays() {
        assert_eq!(RunStatus::PartiallyConverged.to_string(), "partially converged");
    }
}
