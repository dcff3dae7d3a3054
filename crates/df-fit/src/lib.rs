//! # df-fit
//!
//! Parameter-fit orchestration over the collaborator contracts defined in
//! `df-core`: a registry of named dials is fitted against data by
//! iterative minimization of a goodness-of-fit statistic, with post-fit
//! covariance construction, 1-D/2-D statistic scans, and Monte-Carlo
//! resampling (correlated and uniform parameter throws, per-bin error
//! bands, data toys).
//!
//! The entry point is [`FitDriver`]: feed it a [`FitConfig`], a populated
//! [`ParameterRegistry`], the reweighting and objective collaborators, and
//! a record sink, then call [`FitDriver::run`] to execute the configured
//! routine strategy. The individual engines (minimizer driver, covariance
//! builder, scan and resampling engines) are public for embedders that
//! need finer control.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod anneal;
/// Covariance, correlation, and decomposition construction.
pub mod covariance;
/// Strategy orchestration and fit configuration.
pub mod driver;
mod mcmc;
/// Minimizer state machine and algorithm backends.
pub mod minimizer;
/// Cost-function adapter bridging the registry to the minimizers.
pub mod objective;
/// Parameter registry, specs, and the frozen parameter set.
pub mod params;
/// 1-D and 2-D statistic scans.
pub mod scan;
/// Parameter throws, error bands, and data toys.
pub mod throws;

#[cfg(test)]
mod testutil;

pub use covariance::{CovarianceBuilder, FitCovariance};
pub use driver::{
    FitConfig, FitDriver, FitState, Routine, RoutineSignal, ValueProvenance, parse_strategy,
};
pub use minimizer::{Algorithm, MinimizerDriver, MinimizerOptions, MinimizerOutcome, Phase};
pub use objective::{CostFunctionAdapter, FitContext};
pub use params::{
    FIX_TOLERANCE, Mirror, Parameter, ParameterRegistry, ParameterSet, ParameterSpec,
};
pub use scan::{Scan1D, Scan2D, ScanEngine};
pub use throws::{ErrorBand, ErrorBandReport, ResamplingEngine, ThrowMode, ThrowRecord};
