use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors surfaced by bijections and distributions.
///
/// All failures are detected eagerly at call or construction boundaries;
/// no numeric computation is attempted once a mismatch is found, and no
/// partial results are ever returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowError {
    /// The trailing dimensions of an input do not match the declared shape.
    #[error("shape mismatch: expected trailing shape {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// A condition was given to an unconditional object, omitted for a
    /// conditional one, or had the wrong trailing shape.
    #[error("condition mismatch: {0}")]
    ConditionMismatch(String),

    /// Invalid or contradictory construction arguments.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The requested direction has no analytic form for this bijection.
    #[error("no analytic inverse available for this bijection")]
    NoAnalyticInverse,

    /// Parameters describe a degenerate (non-invertible) transform.
    #[error("bijection is not invertible: {0}")]
    NonInvertible(String),

    /// A parameter array had an unexpected rank for the requested operation.
    #[error("internal error: {0}")]
    Internal(String),
}
