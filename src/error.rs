use thiserror::Error;

/// Unified error type for `surplusinv` operations.
#[derive(Debug, Error)]
pub enum SurplusError {
    /// Raised when provided vectors or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, often the model-implied value.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when a shock sample or integration rule carries no draws or nodes.
    #[error("{context} must contain at least one draw or node")]
    EmptySample { context: &'static str },

    /// Raised when integration weights are negative, non-finite or do not sum to one.
    #[error("integration weights must be finite, non-negative and sum to one (slack {slack})")]
    InvalidWeights { slack: f64 },

    /// Raised when a target probability is missing or non-positive.
    #[error("target probability at index {index} must be positive, found {share}")]
    NonPositiveShare { index: usize, share: f64 },

    /// Raised when the implied outside option share becomes non-positive.
    #[error("outside share must be positive when an outside good is modelled, found {share}")]
    NonPositiveOutsideShare { share: f64 },

    /// Raised when inside probabilities exceed one without an outside good.
    #[error("target probabilities sum to {total}, which exceeds one")]
    SharesExceedOne { total: f64 },

    /// Raised when a covariance or correlation matrix admits no Cholesky factor.
    #[error("matrix in {context} is not positive definite")]
    NotPositiveDefinite { context: &'static str },

    /// Raised when a configuration combination is not supported.
    #[error("invalid option `{option}`: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },

    /// Raised when a caller requires convergence and the optimizer stopped early.
    #[error("inversion did not converge after {iterations} iterations ({reason})")]
    ConvergenceFailure { iterations: u64, reason: String },

    /// Raised when numerical routines produce NaN or infinite values.
    #[error("encountered non-finite value {value} during {context}")]
    NumericalDegeneracy { context: &'static str, value: f64 },

    /// Raised for optimizer failures that do not originate from this crate.
    #[error("optimizer failed: {message}")]
    Optimizer { message: String },
}

/// Coarse classification of [`SurplusError`] values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed inputs: the run cannot start.
    InvalidInput,
    /// The optimizer stopped without meeting its tolerance. Recoverable.
    ConvergenceFailure,
    /// Non-finite values appeared during evaluation.
    NumericalDegeneracy,
    /// The optimization backend failed for reasons of its own.
    Backend,
}

impl SurplusError {
    /// Helper to format a [`DimensionMismatch`](SurplusError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for unsupported configuration combinations.
    pub fn invalid_option(option: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option,
            reason: reason.into(),
        }
    }

    /// Helper to raise when an evaluation leaves the finite range.
    pub fn degenerate(context: &'static str, value: f64) -> Self {
        Self::NumericalDegeneracy { context, value }
    }

    /// Classifies the error according to how callers are expected to react.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConvergenceFailure { .. } => ErrorKind::ConvergenceFailure,
            Self::NumericalDegeneracy { .. } => ErrorKind::NumericalDegeneracy,
            Self::Optimizer { .. } => ErrorKind::Backend,
            _ => ErrorKind::InvalidInput,
        }
    }

    /// Whether the current run may be retried with a different budget or start.
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::ConvergenceFailure
    }
}

impl From<argmin::core::Error> for SurplusError {
    fn from(err: argmin::core::Error) -> Self {
        // Errors raised inside our cost/gradient callbacks travel through argmin boxed.
        match err.downcast::<SurplusError>() {
            Ok(inner) => inner,
            Err(other) => Self::Optimizer {
                message: other.to_string(),
            },
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, SurplusError>;
