//! Error types for dialfit

use thiserror::Error;

/// Error type for all dialfit operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration: unknown routine or algorithm names, duplicate
    /// parameter registration, incompatible parameter options.
    #[error("configuration error: {0}")]
    Config(String),

    /// A minimizer backend failed to reach a usable terminal state. The fit
    /// driver converts this into a `Failed` run status instead of aborting.
    #[error("convergence failure: {0}")]
    Convergence(String),

    /// A covariance decomposition was requested but the matrix is not
    /// positive-definite. Resampling callers degrade to a no-op on this.
    #[error("singular covariance: {0}")]
    SingularCovariance(String),

    /// A temporarily swapped resource (reduced event budget) could not be
    /// restored. Fatal: the process state is no longer trustworthy.
    #[error("resource swap failure: {0}")]
    ResourceSwap(String),

    /// A collaborator failed during evaluation or reconfiguration.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// I/O error from a record sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for dialfit operations
pub type Result<T> = std::result::Result<T, Error>;
