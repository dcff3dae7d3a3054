//! # df-core
//!
//! Core types, errors, and collaborator contracts for the dialfit engine.
//!
//! The fit orchestration in `df-fit` talks to the outside world — the
//! reweighting machinery, the joint objective built from event samples,
//! and the record sink — exclusively through the traits defined here, so
//! the engine never depends on a concrete generator stack or storage
//! format.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error type and crate-wide Result alias.
pub mod error;
/// Collaborator contracts: reweighting engine, joint objective, record sink.
pub mod traits;
/// Shared data types and outward record layouts.
pub mod types;

pub use error::{Error, Result};
pub use traits::{JointObjective, MemorySink, RecordSink, ReweightEngine};
pub use types::{
    DialKind, DialUnits, FakeDataSource, FitRecord, MatrixRecord, NamedSeries, ParameterRecord,
    RunStatus, UnitDirection,
};
