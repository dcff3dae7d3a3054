//! Parameter resampling and error bands
//!
//! Monte-Carlo machinery over the post-fit state: correlated throws
//! through the covariance decomposition, uniform throws over the bounds,
//! per-bin error bands aggregated across throws, and data toys for
//! null-hypothesis statistic distributions. All randomness flows from one
//! seeded generator; derived use sites take the seed explicitly.

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use df_core::{RecordSink, Result};

use crate::covariance::FitCovariance;
use crate::objective::CostFunctionAdapter;
use crate::params::ParameterRegistry;

/// How parameter vectors are drawn for error bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThrowMode {
    /// Unit-Gaussian draws mapped through the covariance decomposition.
    Correlated,
    /// Independent uniform draws over each free parameter's bounds.
    Uniform,
}

/// One resampling realization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrowRecord {
    /// Full parameter vector used for the throw.
    pub values: Vec<f64>,
    /// Statistic at the thrown vector.
    pub statistic: f64,
}

/// One per-bin uncertainty band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBand {
    /// Prediction series the band belongs to.
    pub name: String,
    /// Band centers per bin.
    pub centers: Vec<f64>,
    /// Band half-widths per bin.
    pub half_widths: Vec<f64>,
}

/// Error-band generation output.
#[derive(Debug, Clone)]
pub struct ErrorBandReport {
    /// One band per prediction series.
    pub bands: Vec<ErrorBand>,
    /// Every throw, in draw order.
    pub throws: Vec<ThrowRecord>,
}

/// Seeded Monte-Carlo engine over the post-fit registry.
pub struct ResamplingEngine {
    rng: StdRng,
}

impl ResamplingEngine {
    /// Engine with a deterministic seed.
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    /// One correlated throw: unit-Gaussian vector over the free
    /// coordinates, mapped through the free decomposition, added to the
    /// current values, clamped into bounds.
    ///
    /// Degrades to the unchanged current vector (with a warning) when the
    /// decomposition is unavailable or nothing is free.
    pub fn draw_correlated(
        &mut self,
        registry: &ParameterRegistry,
        covariance: &FitCovariance,
    ) -> Vec<f64> {
        let mut values = registry.current_values();
        let free = registry.free_indices();
        if free.is_empty() {
            log::warn!("correlated throw requested with zero free parameters");
            return values;
        }
        let Some(decomposition) = covariance.decomposition_free_opt() else {
            log::warn!("correlated throw requested without a usable decomposition");
            return values;
        };
        if decomposition.nrows() != free.len() {
            log::warn!(
                "covariance free dimension {} does not match registry free count {}",
                decomposition.nrows(),
                free.len()
            );
            return values;
        }

        let z = DVector::from_fn(free.len(), |_, _| self.rng.sample::<f64, _>(StandardNormal));
        let displacement = decomposition * z;

        let params: Vec<_> = registry.iter().collect();
        for (k, &slot) in free.iter().enumerate() {
            let p = params[slot];
            values[slot] = (values[slot] + displacement[k]).clamp(p.min, p.max);
        }
        values
    }

    /// One uniform throw over each free parameter's bounds, ignoring the
    /// covariance entirely.
    pub fn draw_uniform(&mut self, registry: &ParameterRegistry) -> Vec<f64> {
        let mut values = registry.current_values();
        let free = registry.free_indices();
        if free.is_empty() {
            log::warn!("uniform throw requested with zero free parameters");
            return values;
        }
        for (slot, p) in registry.iter().enumerate() {
            if !p.fixed {
                values[slot] = self.rng.gen_range(p.min..=p.max);
            }
        }
        values
    }

    /// Draw `n_throws` parameter vectors, evaluate the prediction for
    /// each, and aggregate per-bin statistics into bands.
    ///
    /// Correlated mode: band center is the per-bin mean, half-width the
    /// per-bin RMS across throws. Uniform mode: center `(lo + hi)/2`,
    /// half-width `(hi - lo)/2` of the observed envelope. With zero
    /// throws the bands are zero-width around the nominal prediction.
    pub fn generate_error_bands(
        &mut self,
        n_throws: u64,
        mode: ThrowMode,
        registry: &ParameterRegistry,
        adapter: &CostFunctionAdapter<'_>,
        covariance: &FitCovariance,
        sink: &mut dyn RecordSink,
    ) -> Result<ErrorBandReport> {
        log::info!("generating error bands from {n_throws} {mode:?} throws");

        // Nominal prediction defines the band layout.
        adapter.evaluate(&registry.current_values())?;
        let nominal = adapter.prediction_snapshot();

        let mut aggregates: Vec<BinAggregate> =
            nominal.iter().map(|s| BinAggregate::new(s.values.len())).collect();

        let names = registry.iter().map(|p| p.name.clone()).collect::<Vec<_>>();
        let mut thrown_series: Vec<Vec<f64>> = vec![Vec::new(); names.len()];
        let mut statistics = Vec::with_capacity(n_throws as usize);
        let mut throws = Vec::with_capacity(n_throws as usize);

        for _ in 0..n_throws {
            let values = match mode {
                ThrowMode::Correlated => self.draw_correlated(registry, covariance),
                ThrowMode::Uniform => self.draw_uniform(registry),
            };
            let statistic = adapter.evaluate(&values)?;
            let prediction = adapter.prediction_snapshot();

            for (agg, series) in aggregates.iter_mut().zip(prediction.iter()) {
                agg.add(&series.values);
            }
            for (slot, &v) in values.iter().enumerate() {
                thrown_series[slot].push(v);
            }
            statistics.push(statistic);
            throws.push(ThrowRecord { values, statistic });
        }

        let bands: Vec<ErrorBand> = nominal
            .iter()
            .zip(aggregates.iter())
            .map(|(series, agg)| agg.band(&series.name, &series.values, mode))
            .collect();

        for (name, series) in names.iter().zip(thrown_series.iter()) {
            sink.record_series(&format!("throws_{name}"), series)?;
        }
        sink.record_series("throw_statistics", &statistics)?;
        for band in &bands {
            sink.record_series(&format!("band_{}_center", band.name), &band.centers)?;
            sink.record_series(&format!("band_{}_width", band.name), &band.half_widths)?;
        }

        Ok(ErrorBandReport { bands, throws })
    }

    /// Resample the observed data `n` times under the current model and
    /// collect the statistic distribution (null hypothesis, not parameter
    /// uncertainty). The collaborator owns any data-restoration semantics.
    pub fn throw_data_toys(
        &mut self,
        n: u64,
        adapter: &CostFunctionAdapter<'_>,
        sink: &mut dyn RecordSink,
    ) -> Result<Vec<f64>> {
        log::info!("throwing {n} data toys");
        let mut statistics = Vec::with_capacity(n as usize);
        for _ in 0..n {
            statistics.push(adapter.throw_data_toy()?);
        }

        sink.record_series("toy_statistics", &statistics)?;
        if !statistics.is_empty() {
            let lo = statistics.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = statistics.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let mean = statistics.iter().sum::<f64>() / statistics.len() as f64;
            sink.record_series("toy_statistics_summary", &[lo, hi, mean])?;
        }
        Ok(statistics)
    }
}

/// Streaming per-bin aggregation across throws.
struct BinAggregate {
    n: u64,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
    lo: Vec<f64>,
    hi: Vec<f64>,
}

impl BinAggregate {
    fn new(n_bins: usize) -> Self {
        Self {
            n: 0,
            sum: vec![0.0; n_bins],
            sum_sq: vec![0.0; n_bins],
            lo: vec![0.0; n_bins],
            hi: vec![0.0; n_bins],
        }
    }

    fn add(&mut self, bins: &[f64]) {
        let first = self.n == 0;
        for (i, &v) in bins.iter().enumerate() {
            self.sum[i] += v;
            self.sum_sq[i] += v * v;
            if first || v < self.lo[i] {
                self.lo[i] = v;
            }
            if first || v > self.hi[i] {
                self.hi[i] = v;
            }
        }
        self.n += 1;
    }

    fn band(&self, name: &str, nominal: &[f64], mode: ThrowMode) -> ErrorBand {
        let n_bins = self.sum.len();
        if self.n == 0 {
            return ErrorBand {
                name: name.to_string(),
                centers: nominal.to_vec(),
                half_widths: vec![0.0; n_bins],
            };
        }

        let n = self.n as f64;
        let (centers, half_widths) = match mode {
            ThrowMode::Correlated => {
                let centers: Vec<f64> = self.sum.iter().map(|s| s / n).collect();
                // Population RMS across throws.
                let widths = self
                    .sum_sq
                    .iter()
                    .zip(centers.iter())
                    .map(|(sq, m)| (sq / n - m * m).max(0.0).sqrt())
                    .collect();
                (centers, widths)
            }
            ThrowMode::Uniform => {
                let centers =
                    self.lo.iter().zip(self.hi.iter()).map(|(l, h)| (l + h) / 2.0).collect();
                let widths =
                    self.lo.iter().zip(self.hi.iter()).map(|(l, h)| (h - l) / 2.0).collect();
                (centers, widths)
            }
        };
        ErrorBand { name: name.to_string(), centers, half_widths }
    }
}
