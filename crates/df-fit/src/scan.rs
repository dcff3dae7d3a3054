//! Statistic scans
//!
//! Deterministic grid evaluation of the cost function over one or two
//! free parameters at a time, bypassing the minimizer. Scans step through
//! the registry's current values (not the start values), and the registry
//! is bit-identical before and after a scan.

use serde::{Deserialize, Serialize};

use df_core::types::MatrixRecord;
use df_core::{RecordSink, Result};

use crate::objective::CostFunctionAdapter;
use crate::params::ParameterRegistry;

/// One-dimensional scan curve for a single free parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan1D {
    /// Scanned parameter.
    pub parameter: String,
    /// Evaluation grid, `floor((max - min)/step)` points from `min`.
    pub grid: Vec<f64>,
    /// Statistic at each grid point.
    pub statistics: Vec<f64>,
}

/// Two-dimensional scan surface for a pair of free parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan2D {
    /// Outer scanned parameter.
    pub x: String,
    /// Inner scanned parameter.
    pub y: String,
    /// Outer grid, `floor((max - min)/step) + 1` points (upper edge in).
    pub x_grid: Vec<f64>,
    /// Inner grid, same construction.
    pub y_grid: Vec<f64>,
    /// Statistics in row-major order, `x_grid.len() * y_grid.len()`.
    pub statistics: Vec<f64>,
}

/// Grid scanner over the free parameters of a registry.
pub struct ScanEngine;

impl ScanEngine {
    /// Scan every free parameter over its own `[min, max]` with its step.
    ///
    /// Each curve is emitted through the sink as `scan1d_<name>` with its
    /// grid as `scan1d_<name>_grid`. Parameters with a non-positive or
    /// non-finite step are skipped with a warning.
    pub fn scan_1d(
        registry: &mut ParameterRegistry,
        adapter: &CostFunctionAdapter<'_>,
        sink: &mut dyn RecordSink,
    ) -> Result<Vec<Scan1D>> {
        let mut scans = Vec::new();
        let names: Vec<String> =
            registry.iter().filter(|p| !p.fixed).map(|p| p.name.clone()).collect();

        for name in names {
            let param = registry.get(&name)?;
            let Some(grid) = grid_points(param.min, param.max, param.step, false) else {
                log::warn!("skipping 1-D scan of '{name}': unusable step {}", param.step);
                continue;
            };
            log::info!("running 1-D scan for '{name}' over {} points", grid.len());

            let pre_scan = param.current;
            let mut statistics = Vec::with_capacity(grid.len());
            for &point in &grid {
                registry.set_current(&name, point)?;
                statistics.push(adapter.evaluate(&registry.current_values())?);
            }
            registry.set_current(&name, pre_scan)?;

            sink.record_series(&format!("scan1d_{name}_grid"), &grid)?;
            sink.record_series(&format!("scan1d_{name}"), &statistics)?;
            scans.push(Scan1D { parameter: name, grid, statistics });
        }
        Ok(scans)
    }

    /// Scan every unordered pair of distinct free parameters.
    ///
    /// The inner parameter is restored after each inner sweep; both are
    /// restored after the pair's surface is complete. Surfaces are emitted
    /// as `scan2d_<x>_<y>` matrices with their axis grids.
    pub fn scan_2d(
        registry: &mut ParameterRegistry,
        adapter: &CostFunctionAdapter<'_>,
        sink: &mut dyn RecordSink,
    ) -> Result<Vec<Scan2D>> {
        let mut scans = Vec::new();
        let names: Vec<String> =
            registry.iter().filter(|p| !p.fixed).map(|p| p.name.clone()).collect();

        for (xi, x_name) in names.iter().enumerate() {
            for y_name in names.iter().take(xi) {
                let x = registry.get(x_name)?;
                let y = registry.get(y_name)?;

                let Some(x_grid) = grid_points(x.min, x.max, x.step, true) else {
                    log::warn!("skipping 2-D scan of '{x_name}': unusable step {}", x.step);
                    continue;
                };
                let Some(y_grid) = grid_points(y.min, y.max, y.step, true) else {
                    log::warn!("skipping 2-D scan of '{y_name}': unusable step {}", y.step);
                    continue;
                };
                log::info!(
                    "running 2-D scan for '{x_name}' x '{y_name}' over {}x{} points",
                    x_grid.len(),
                    y_grid.len()
                );

                let pre_x = x.current;
                let pre_y = y.current;
                let mut statistics = Vec::with_capacity(x_grid.len() * y_grid.len());

                for &xv in &x_grid {
                    registry.set_current(x_name, xv)?;
                    for &yv in &y_grid {
                        registry.set_current(y_name, yv)?;
                        statistics.push(adapter.evaluate(&registry.current_values())?);
                    }
                    registry.set_current(y_name, pre_y)?;
                }
                registry.set_current(x_name, pre_x)?;
                registry.set_current(y_name, pre_y)?;

                sink.record_series(&format!("scan2d_{x_name}_{y_name}_xgrid"), &x_grid)?;
                sink.record_series(&format!("scan2d_{x_name}_{y_name}_ygrid"), &y_grid)?;
                sink.record_matrix(
                    &format!("scan2d_{x_name}_{y_name}"),
                    &MatrixRecord::new(
                        vec![x_name.clone(), y_name.clone()],
                        x_grid.len(),
                        y_grid.len(),
                        statistics.clone(),
                    ),
                )?;
                scans.push(Scan2D {
                    x: x_name.clone(),
                    y: y_name.clone(),
                    x_grid,
                    y_grid,
                    statistics,
                });
            }
        }
        Ok(scans)
    }
}

/// Grid from `min` with `step` spacing: `floor((max - min)/step)` points,
/// plus the upper edge when `include_edge`.
fn grid_points(min: f64, max: f64, step: f64, include_edge: bool) -> Option<Vec<f64>> {
    if !step.is_finite() || step <= 0.0 || !(max - min).is_finite() {
        return None;
    }
    let mut n = ((max - min) / step).floor() as usize;
    if include_edge {
        n += 1;
    }
    Some((0..n).map(|i| min + i as f64 * step).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objective::FitContext;
    use crate::params::{ParameterRegistry, ParameterSpec};
    use crate::testutil::{LoggingReweight, QuadraticObjective, shared_log};
    use df_core::MemorySink;
    use df_core::types::DialKind;

    fn scan_registry() -> ParameterRegistry {
        let mut reg = ParameterRegistry::new();
        reg.register(
            ParameterSpec::new("a", DialKind::Interaction, 1.0)
                .with_bounds(0.0, 2.0)
                .with_step(0.5),
        )
        .unwrap();
        reg.register(ParameterSpec::new("b", DialKind::Flux, 1.0).with_bounds(0.0, 2.0).fixed())
            .unwrap();
        reg.register(
            ParameterSpec::new("c", DialKind::Detector, 1.0)
                .with_bounds(0.0, 2.0)
                .with_step(0.5),
        )
        .unwrap();
        reg
    }

    fn context(log: &crate::testutil::SharedDialLog) -> FitContext {
        FitContext::new(
            Box::new(LoggingReweight::new(log.clone())),
            Box::new(QuadraticObjective::new(log.clone(), &[("a", 0.5), ("b", 1.0), ("c", 0.5)])),
        )
    }

    #[test]
    fn one_dimensional_grid_and_restore() {
        let log = shared_log();
        let mut ctx = context(&log);
        let mut registry = scan_registry();
        // Current values off the start to prove scans step around current.
        registry.set_current("a", 0.75).unwrap();
        let before = registry.current_values();

        let set = registry.parameter_set();
        let adapter = CostFunctionAdapter::new(&set, &mut ctx);
        let mut sink = MemorySink::new();
        let scans = ScanEngine::scan_1d(&mut registry, &adapter, &mut sink).unwrap();

        // Two free parameters scanned, 4 points each: floor(2.0/0.5).
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0].parameter, "a");
        assert_eq!(scans[0].grid, vec![0.0, 0.5, 1.0, 1.5]);
        assert_eq!(scans[0].statistics.len(), 4);

        // Registry restored bit-identically.
        assert_eq!(registry.current_values(), before);

        // Minimum of the 'a' curve is at a = 0.5.
        let min_idx = scans[0]
            .statistics
            .iter()
            .enumerate()
            .min_by(|(_, s), (_, t)| s.partial_cmp(t).unwrap())
            .unwrap()
            .0;
        assert_eq!(scans[0].grid[min_idx], 0.5);

        assert_eq!(sink.series("scan1d_a").unwrap().values.len(), 4);
        assert_eq!(sink.series("scan1d_a_grid").unwrap().values, vec![0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn fixed_parameter_is_never_scanned_and_never_moves() {
        let log = shared_log();
        let mut ctx = context(&log);
        let mut registry = scan_registry();
        let set = registry.parameter_set();
        let adapter = CostFunctionAdapter::new(&set, &mut ctx);
        let mut sink = MemorySink::new();

        let scans = ScanEngine::scan_1d(&mut registry, &adapter, &mut sink).unwrap();
        assert!(scans.iter().all(|s| s.parameter != "b"));

        // Every evaluation pushed b at exactly 1.0.
        let log = log.borrow();
        assert!(log.history.iter().filter(|(n, _)| n == "b").all(|(_, v)| *v == 1.0));
    }

    #[test]
    fn two_dimensional_grid_counts_include_upper_edge() {
        let log = shared_log();
        let mut ctx = context(&log);
        let mut registry = scan_registry();
        let before = registry.current_values();

        let set = registry.parameter_set();
        let adapter = CostFunctionAdapter::new(&set, &mut ctx);
        let mut sink = MemorySink::new();
        let scans = ScanEngine::scan_2d(&mut registry, &adapter, &mut sink).unwrap();

        // One unordered pair (c, a).
        assert_eq!(scans.len(), 1);
        let scan = &scans[0];
        // floor(2.0/0.5) + 1 = 5 points per axis.
        assert_eq!(scan.x_grid.len(), 5);
        assert_eq!(scan.y_grid.len(), 5);
        assert_eq!(scan.statistics.len(), 25);
        assert_eq!(*scan.x_grid.last().unwrap(), 2.0);

        assert_eq!(registry.current_values(), before);

        let m = sink.matrix("scan2d_c_a").unwrap();
        assert_eq!((m.n_rows, m.n_cols), (5, 5));
    }

    #[test]
    fn unusable_step_skips_the_parameter() {
        let log = shared_log();
        let mut ctx = context(&log);
        let mut registry = ParameterRegistry::new();
        registry
            .register(
                ParameterSpec::new("a", DialKind::Interaction, 0.0)
                    .with_bounds(0.0, 1.0)
                    .with_step(0.0),
            )
            .unwrap();
        let set = registry.parameter_set();
        let adapter = CostFunctionAdapter::new(&set, &mut ctx);
        let mut sink = MemorySink::new();

        let scans = ScanEngine::scan_1d(&mut registry, &adapter, &mut sink).unwrap();
        assert!(scans.is_empty());
        assert_eq!(adapter.n_evaluations(), 0);
    }
}
