use thiserror::Error;

/// Unified error type for `bift` operations.
///
/// Cancellation and minimizer failure are not errors: they are reported through
/// the progress sink and an empty result from [`run_bift`](crate::run_bift).
#[derive(Debug, Error)]
pub enum BiftError {
    /// Raised when provided arrays have incompatible lengths.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required length, usually the length of `q`.
        expected: usize,
        /// The length that was actually supplied.
        found: usize,
    },

    /// Raised when a profile or grid is too short for the transform.
    #[error("{context} needs at least {minimum} points, found {found}")]
    TooFewPoints {
        context: &'static str,
        minimum: usize,
        found: usize,
    },

    /// Raised when the scattering vector is not strictly increasing.
    #[error("q must be strictly increasing; q[{index}] = {value} follows {previous}")]
    NonIncreasingQ {
        index: usize,
        previous: f64,
        value: f64,
    },

    /// Raised when a measurement error is zero or negative.
    #[error("measurement error at index {index} must be positive, found {error}")]
    NonPositiveError { index: usize, error: f64 },

    /// Raised when an input array holds NaN or an infinity.
    #[error("{context} at index {index} is not finite")]
    NonFiniteValue { context: &'static str, index: usize },

    /// Raised when the lower bound of a search range exceeds the upper bound.
    #[error("{context} range is inverted: min {min} > max {max}")]
    InvalidRange {
        context: &'static str,
        min: f64,
        max: f64,
    },

    /// Raised when a scalar option is outside its admissible domain.
    #[error("invalid value for {name}: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: &'static str,
    },

    /// Raised when numerical routines produce NaN or fail to converge.
    #[error("encountered a numerical failure during {context}")]
    NumericalError { context: &'static str },
}

impl BiftError {
    /// Helper to format a [`DimensionMismatch`](BiftError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for options that fail validation.
    pub fn invalid_parameter(name: &'static str, reason: &'static str) -> Self {
        Self::InvalidParameter { name, reason }
    }

    /// Helper for inverted `[min, max]` bounds.
    pub fn invalid_range(context: &'static str, min: f64, max: f64) -> Self {
        Self::InvalidRange { context, min, max }
    }

    /// Helper for numerical failures inside a single evaluation.
    pub fn numerical(context: &'static str) -> Self {
        Self::NumericalError { context }
    }

    /// Returns `true` for the input-validation kinds of error.
    pub fn is_validation(&self) -> bool {
        !matches!(self, Self::NumericalError { .. })
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, BiftError>;
