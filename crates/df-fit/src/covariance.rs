//! Covariance construction
//!
//! Builds the full and free-only covariance matrices from a minimizer
//! outcome, their correlations, and the Cholesky factors used to map
//! independent unit-Gaussian draws into correlated displacements. Always
//! rebuilt from scratch after a fit; never patched incrementally.

use nalgebra::DMatrix;

use df_core::types::MatrixRecord;
use df_core::{Error, RecordSink, Result};

use crate::params::ParameterSet;

/// Post-fit covariance products over one frozen parameter set.
#[derive(Debug, Clone)]
pub struct FitCovariance {
    labels: Vec<String>,
    free_labels: Vec<String>,
    free_indices: Vec<usize>,
    full: DMatrix<f64>,
    free: DMatrix<f64>,
    correlation_full: DMatrix<f64>,
    correlation_free: DMatrix<f64>,
    decomposition_full: Option<DMatrix<f64>>,
    decomposition_free: Option<DMatrix<f64>>,
}

/// Builds [`FitCovariance`] from a minimizer's full-dimension matrix, or
/// from nothing when the fit reported covariance unavailable.
pub struct CovarianceBuilder;

impl CovarianceBuilder {
    /// Construct all covariance products for `set`.
    ///
    /// With no `source` (non-converged fit, stochastic backend without a
    /// chain) every matrix is zero-filled so downstream consumers need not
    /// special-case missing covariance; the decompositions come out
    /// unavailable.
    pub fn build(set: &ParameterSet, source: Option<&DMatrix<f64>>) -> FitCovariance {
        let dim = set.len();
        let free_indices = set.free_indices();
        let free_dim = free_indices.len();

        let labels = set.names();
        let free_labels: Vec<String> =
            free_indices.iter().map(|&i| labels[i].clone()).collect();

        let full = match source {
            Some(m) => {
                debug_assert_eq!(m.nrows(), dim);
                m.clone()
            }
            None => {
                log::debug!("no covariance source, zero-filling {dim}x{dim}");
                DMatrix::zeros(dim, dim)
            }
        };

        // Free block omits fixed rows/columns, preserving set order.
        let mut free = DMatrix::zeros(free_dim, free_dim);
        for (fi, &i) in free_indices.iter().enumerate() {
            for (fj, &j) in free_indices.iter().enumerate() {
                free[(fi, fj)] = full[(i, j)];
            }
        }

        let correlation_full = correlation_of(&full);
        let correlation_free = correlation_of(&free);
        let decomposition_full = cholesky_factor(&full);
        let decomposition_free = cholesky_factor(&free);
        if source.is_some() && decomposition_free.is_none() {
            log::warn!("free covariance is not positive-definite, decomposition unavailable");
        }

        FitCovariance {
            labels,
            free_labels,
            free_indices,
            full,
            free,
            correlation_full,
            correlation_free,
            decomposition_full,
            decomposition_free,
        }
    }
}

impl FitCovariance {
    /// Full parameter dimension.
    pub fn dim(&self) -> usize {
        self.full.nrows()
    }

    /// Free parameter dimension.
    pub fn free_dim(&self) -> usize {
        self.free.nrows()
    }

    /// Indices of the free parameters within the full set.
    pub fn free_indices(&self) -> &[usize] {
        &self.free_indices
    }

    /// Full covariance matrix.
    pub fn full(&self) -> &DMatrix<f64> {
        &self.full
    }

    /// Free-only covariance matrix.
    pub fn free(&self) -> &DMatrix<f64> {
        &self.free
    }

    /// Full correlation matrix.
    pub fn correlation_full(&self) -> &DMatrix<f64> {
        &self.correlation_full
    }

    /// Free-only correlation matrix.
    pub fn correlation_free(&self) -> &DMatrix<f64> {
        &self.correlation_free
    }

    /// Lower-triangular factor of the free covariance, if available.
    pub fn decomposition_free_opt(&self) -> Option<&DMatrix<f64>> {
        self.decomposition_free.as_ref()
    }

    /// Checked accessor for the free decomposition.
    ///
    /// Callers that can degrade (resampling) should use
    /// [`Self::decomposition_free_opt`] and warn instead.
    pub fn decomposition_free(&self) -> Result<&DMatrix<f64>> {
        self.decomposition_free.as_ref().ok_or_else(|| {
            Error::SingularCovariance(
                "free covariance has no Cholesky decomposition".to_string(),
            )
        })
    }

    /// Emit every product through the sink under its conventional name.
    pub fn emit(&self, sink: &mut dyn RecordSink) -> Result<()> {
        sink.record_matrix("covariance", &to_record(&self.labels, &self.full))?;
        sink.record_matrix("correlation", &to_record(&self.labels, &self.correlation_full))?;
        sink.record_matrix("covariance_free", &to_record(&self.free_labels, &self.free))?;
        sink.record_matrix(
            "correlation_free",
            &to_record(&self.free_labels, &self.correlation_free),
        )?;
        if let Some(dec) = &self.decomposition_full {
            sink.record_matrix("decomposition", &to_record(&self.labels, dec))?;
        }
        if let Some(dec) = &self.decomposition_free {
            sink.record_matrix("decomposition_free", &to_record(&self.free_labels, dec))?;
        }
        Ok(())
    }
}

/// Correlation with defined fallbacks: unit diagonal for positive
/// variance, zero anywhere a non-positive diagonal is involved.
fn correlation_of(cov: &DMatrix<f64>) -> DMatrix<f64> {
    let n = cov.nrows();
    let mut corr = DMatrix::zeros(n, n);
    for i in 0..n {
        let vi = cov[(i, i)];
        if vi > 0.0 {
            corr[(i, i)] = 1.0;
        }
        for j in 0..i {
            let vj = cov[(j, j)];
            let value = if vi > 0.0 && vj > 0.0 { cov[(i, j)] / (vi * vj).sqrt() } else { 0.0 };
            corr[(i, j)] = value;
            corr[(j, i)] = value;
        }
    }
    corr
}

/// Lower-triangular Cholesky factor, `None` when not positive-definite.
fn cholesky_factor(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if m.nrows() == 0 {
        return None;
    }
    nalgebra::linalg::Cholesky::new(m.clone()).map(|c| c.l())
}

fn to_record(labels: &[String], m: &DMatrix<f64>) -> MatrixRecord {
    let (rows, cols) = m.shape();
    let mut values = Vec::with_capacity(rows * cols);
    for i in 0..rows {
        for j in 0..cols {
            values.push(m[(i, j)]);
        }
    }
    MatrixRecord::new(labels.to_vec(), rows, cols, values)
}
