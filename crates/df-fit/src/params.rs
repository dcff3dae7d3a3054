//! Fit parameter registry
//!
//! Every dial the fit can move is registered here once at startup. The
//! registry is the single source of truth for values, bounds, and
//! fixed/free state: accessors hand out copies, and all mutation goes
//! through its methods. Vector indexing throughout the engine follows the
//! registration order, frozen into a [`ParameterSet`] when a fit binds.

use std::collections::HashMap;

use df_core::types::{DialKind, DialUnits, UnitDirection};
use df_core::{Error, ReweightEngine, Result};
use serde::{Deserialize, Serialize};

/// Default tolerance for [`ParameterRegistry::fix_at_boundary`].
pub const FIX_TOLERANCE: f64 = 1e-4;

/// A reflection boundary for a parameter.
///
/// Some dials are only meaningful on one side of a pivot (a response curve
/// symmetric about its nominal, say). Instead of bounding the minimizer,
/// the cost function reflects values that cross the pivot back onto the
/// kept side, so the minimizer sees a smooth surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mirror {
    /// Reflection pivot.
    pub value: f64,
    /// `true` reflects values above the pivot down; `false` reflects
    /// values below it up.
    pub above: bool,
}

impl Mirror {
    /// Reflect `v` across the pivot when it lies on the folded side.
    ///
    /// A single reflection only: values already on the kept side pass
    /// through unchanged, so reflecting a reflected value is idempotent.
    pub fn reflect(&self, v: f64) -> f64 {
        if (self.above && v > self.value) || (!self.above && v < self.value) {
            2.0 * self.value - v
        } else {
            v
        }
    }
}

/// Declaration of one fit parameter, as read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Unique parameter name.
    pub name: String,
    /// Dial category.
    pub kind: DialKind,
    /// Start value in the declared units.
    pub start: f64,
    /// Lower bound; defaults to `start - 1.0`.
    #[serde(default)]
    pub min: Option<f64>,
    /// Upper bound; defaults to `start + 1.0`.
    #[serde(default)]
    pub max: Option<f64>,
    /// Initial step size; defaults to `1.0`.
    #[serde(default)]
    pub step: Option<f64>,
    /// Whether the parameter starts fixed.
    #[serde(default)]
    pub fixed: bool,
    /// Units the values above are declared in.
    #[serde(default = "default_units")]
    pub units: DialUnits,
    /// Optional reflection boundary (raw sigma units only).
    #[serde(default)]
    pub mirror: Option<Mirror>,
}

fn default_units() -> DialUnits {
    DialUnits::Sigma
}

impl ParameterSpec {
    /// Spec with defaulted bounds, step, and units.
    pub fn new(name: impl Into<String>, kind: DialKind, start: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            start,
            min: None,
            max: None,
            step: None,
            fixed: false,
            units: DialUnits::Sigma,
            mirror: None,
        }
    }

    /// Set explicit bounds.
    pub fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Set an explicit step size.
    pub fn with_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    /// Mark the parameter fixed from the start.
    pub fn fixed(mut self) -> Self {
        self.fixed = true;
        self
    }

    /// Declare the values in non-sigma units.
    pub fn with_units(mut self, units: DialUnits) -> Self {
        self.units = units;
        self
    }

    /// Attach a reflection boundary.
    pub fn with_mirror(mut self, value: f64, above: bool) -> Self {
        self.mirror = Some(Mirror { value, above });
        self
    }
}

/// One registered fit parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Unique name.
    pub name: String,
    /// Dial category.
    pub kind: DialKind,
    /// Units the parameter was declared in.
    pub units: DialUnits,
    /// Start value (sigma units after setup).
    pub start: f64,
    /// Current value.
    pub current: f64,
    /// Symmetric error estimate; zero until a fit fills it.
    pub error: f64,
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
    /// Initial step size.
    pub step: f64,
    /// Whether the parameter is currently fixed.
    pub fixed: bool,
    /// Whether the parameter was fixed at registration.
    pub fixed_at_start: bool,
    /// Optional reflection boundary.
    pub mirror: Option<Mirror>,
}

/// Frozen ordered snapshot of the registry, taken when a fit binds.
///
/// The index ↔ name mapping must not change mid-run; everything that
/// works with dense vectors (minimizers, the cost adapter, covariance)
/// indexes through one of these.
#[derive(Debug, Clone)]
pub struct ParameterSet {
    params: Vec<Parameter>,
}

impl ParameterSet {
    /// Number of parameters (full dimension).
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameter at `index`.
    pub fn get(&self, index: usize) -> Option<&Parameter> {
        self.params.get(index)
    }

    /// Iterate in set order.
    pub fn iter(&self) -> std::slice::Iter<'_, Parameter> {
        self.params.iter()
    }

    /// Index of a parameter by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    /// Parameter names in set order.
    pub fn names(&self) -> Vec<String> {
        self.params.iter().map(|p| p.name.clone()).collect()
    }

    /// Indices of free parameters, in set order.
    pub fn free_indices(&self) -> Vec<usize> {
        self.params.iter().enumerate().filter(|(_, p)| !p.fixed).map(|(i, _)| i).collect()
    }

    /// Number of free parameters.
    pub fn free_count(&self) -> usize {
        self.params.iter().filter(|p| !p.fixed).count()
    }

    /// Current values in set order.
    pub fn current_values(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.current).collect()
    }

    /// Start values in set order.
    pub fn start_values(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.start).collect()
    }

    /// `(min, max)` bounds in set order.
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.params.iter().map(|p| (p.min, p.max)).collect()
    }

    /// Initial step sizes in set order.
    pub fn steps(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.step).collect()
    }

    /// Widen any degenerate `min == max` interval by one unit.
    pub(crate) fn widen_degenerate_bounds(&mut self) {
        for p in &mut self.params {
            if p.max == p.min {
                p.max += 1.0;
            }
        }
    }
}

/// Owner of every fit parameter.
#[derive(Debug, Default)]
pub struct ParameterRegistry {
    params: Vec<Parameter>,
    index: HashMap<String, usize>,
}

impl ParameterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter from its declaration.
    ///
    /// Bounds default to `start ± 1.0` and the step to `1.0` when not
    /// given; equal bounds are widened (`max += 1.0`). Duplicate names
    /// and inverted bounds are configuration errors.
    pub fn register(&mut self, spec: ParameterSpec) -> Result<()> {
        if self.index.contains_key(&spec.name) {
            return Err(Error::Config(format!("parameter '{}' already registered", spec.name)));
        }
        if spec.name.is_empty() {
            return Err(Error::Config("parameter with empty name".to_string()));
        }

        let min = spec.min.unwrap_or(spec.start - 1.0);
        let mut max = spec.max.unwrap_or(spec.start + 1.0);
        let step = spec.step.unwrap_or(1.0);

        if max < min {
            return Err(Error::Config(format!(
                "parameter '{}': inverted bounds {min} > {max}",
                spec.name
            )));
        }
        if max == min {
            max += 1.0;
        }

        log::info!(
            "registered {:?} parameter '{}': start {} in [{}, {}] step {}{}",
            spec.kind,
            spec.name,
            spec.start,
            min,
            max,
            step,
            if spec.fixed { " (fixed)" } else { "" }
        );
        if let Some(m) = spec.mirror {
            log::info!(
                "  '{}' is mirrored at {} from {}",
                spec.name,
                m.value,
                if m.above { "above" } else { "below" }
            );
        }

        self.index.insert(spec.name.clone(), self.params.len());
        self.params.push(Parameter {
            name: spec.name,
            kind: spec.kind,
            units: spec.units,
            start: spec.start,
            current: spec.start,
            error: 0.0,
            min,
            max,
            step,
            fixed: spec.fixed,
            fixed_at_start: spec.fixed,
            mirror: spec.mirror,
        });
        Ok(())
    }

    /// Convert a parameter's start/bounds/step from its declared units
    /// into the engine-internal sigma scale.
    ///
    /// A no-op for parameters declared in sigma units. Mirrored parameters
    /// must be declared in sigma units; the reflection assumes raw-sigma
    /// symmetry. Absolute steps convert as a delta about the start value,
    /// fractional steps convert directly.
    pub fn apply_unit_transform(&mut self, name: &str, engine: &dyn ReweightEngine) -> Result<()> {
        let idx = self.lookup(name)?;
        let p = &self.params[idx];
        let units = p.units;
        if units == DialUnits::Sigma {
            return Ok(());
        }
        if p.mirror.is_some() {
            return Err(Error::Config(format!(
                "parameter '{name}': cannot combine a mirror with {units:?} units"
            )));
        }

        let kind = p.kind;
        let convert =
            |v: f64| engine.convert_units(kind, name, v, UnitDirection::ToSigma, units);

        let start_declared = self.params[idx].start;
        let step_declared = self.params[idx].step;

        let start = convert(start_declared)?;
        let mut min = convert(self.params[idx].min)?;
        let mut max = convert(self.params[idx].max)?;
        let step = match units {
            DialUnits::Absolute => convert(start_declared + step_declared)? - start,
            DialUnits::Fractional => convert(step_declared)?,
            DialUnits::Sigma => unreachable!(),
        };

        // A decreasing transform inverts the bounds.
        if min > max {
            std::mem::swap(&mut min, &mut max);
        }
        if min == max {
            max += 1.0;
        }

        log::debug!(
            "unit transform '{name}' ({units:?} -> sigma): start {start_declared} -> {start}, \
             step {step_declared} -> {step}"
        );

        let p = &mut self.params[idx];
        p.start = start;
        p.current = start;
        p.min = min;
        p.max = max;
        p.step = step;
        Ok(())
    }

    /// Snap every free parameter sitting within `tolerance` of its lower
    /// or upper bound onto that bound and fix it there.
    ///
    /// Returns whether any parameter changed state; the strategy loop uses
    /// this as its no-further-progress signal.
    pub fn fix_at_boundary(&mut self, tolerance: f64) -> bool {
        let mut changed = false;
        for p in &mut self.params {
            if p.fixed {
                continue;
            }
            if (p.current - p.min).abs() <= tolerance {
                log::info!("fixing '{}' at lower bound {}", p.name, p.min);
                p.current = p.min;
                p.fixed = true;
                changed = true;
            } else if (p.max - p.current).abs() <= tolerance {
                log::info!("fixing '{}' at upper bound {}", p.name, p.max);
                p.current = p.max;
                p.fixed = true;
                changed = true;
            }
        }
        if !changed {
            log::info!("no dials needed fixing");
        }
        changed
    }

    /// Copy of a parameter by name.
    pub fn get(&self, name: &str) -> Result<Parameter> {
        Ok(self.params[self.lookup(name)?].clone())
    }

    /// Index of a parameter by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Number of registered parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Number of free parameters.
    pub fn free_count(&self) -> usize {
        self.params.iter().filter(|p| !p.fixed).count()
    }

    /// Indices of free parameters, in registration order.
    pub fn free_indices(&self) -> Vec<usize> {
        self.params.iter().enumerate().filter(|(_, p)| !p.fixed).map(|(i, _)| i).collect()
    }

    /// Current values in registration order.
    pub fn current_values(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.current).collect()
    }

    /// Start values in registration order.
    pub fn start_values(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.start).collect()
    }

    /// Error estimates in registration order.
    pub fn errors(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.error).collect()
    }

    /// Set a parameter's current value by name.
    pub fn set_current(&mut self, name: &str, value: f64) -> Result<()> {
        let idx = self.lookup(name)?;
        self.params[idx].current = value;
        Ok(())
    }

    /// Set a parameter's current value by registration index.
    pub fn set_current_at(&mut self, index: usize, value: f64) {
        if let Some(p) = self.params.get_mut(index) {
            p.current = value;
        }
    }

    /// Set a parameter's error estimate by registration index.
    pub fn set_error_at(&mut self, index: usize, error: f64) {
        if let Some(p) = self.params.get_mut(index) {
            p.error = error;
        }
    }

    /// Fix or free a parameter by name.
    pub fn set_fixed(&mut self, name: &str, fixed: bool) -> Result<()> {
        let idx = self.lookup(name)?;
        self.params[idx].fixed = fixed;
        Ok(())
    }

    /// Iterate over the parameters in registration order.
    pub fn iter(&self) -> std::slice::Iter<'_, Parameter> {
        self.params.iter()
    }

    /// Frozen ordered snapshot for binding a fit.
    pub fn parameter_set(&self) -> ParameterSet {
        ParameterSet { params: self.params.clone() }
    }

    fn lookup(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::Config(format!("unknown parameter '{name}'")))
    }
}
