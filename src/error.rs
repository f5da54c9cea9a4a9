use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::Year;

/// Unified error type for `qsmrs` operations.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum InversionError {
    /// Raised when provided vectors or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, usually the number of locations.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when a population or wage value is absent for a location in the run.
    #[error("missing {field} for location `{location}`")]
    MissingObservation {
        /// Either `"population"` or `"wage"`.
        field: &'static str,
        /// Identifier of the location lacking the value.
        location: String,
    },

    /// Raised when the distance table does not cover a location pair.
    #[error("no distance between `{from}` and `{to}`")]
    MissingDistance {
        /// Origin location of the missing pair.
        from: String,
        /// Destination location of the missing pair.
        to: String,
    },

    /// Raised when a precomputed friction matrix has no row for a location of the year.
    #[error("location `{location}` is absent from the friction matrix")]
    LocationNotInFriction {
        /// Identifier of the uncovered location.
        location: String,
    },

    /// Raised when a year has no usable observations at all.
    #[error("no usable observations for year {year}")]
    NoObservations {
        /// The year that could not be assembled.
        year: Year,
    },

    /// Raised when an observed value is present but outside its valid domain.
    #[error("{field} for location `{location}` must be positive and finite, found {value}")]
    InvalidObservation {
        /// Either `"population"` or `"wage"`.
        field: &'static str,
        /// Identifier of the offending location.
        location: String,
        /// The rejected value.
        value: f64,
    },

    /// Raised when a calibration constant or option is malformed.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        /// Name of the offending setting.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// Raised when a friction matrix violates positivity, symmetry or diagonal dominance.
    #[error("invalid friction matrix: {reason}")]
    InvalidFriction {
        /// The violated condition, naming the entries involved.
        reason: String,
    },

    /// Raised when the observed population does not add up to the reported total.
    #[error("population sums to {observed} but the reported total is {reported}")]
    PopulationTotalMismatch {
        /// Sum of the observed populations.
        observed: f64,
        /// Externally reported total for the year.
        reported: f64,
    },

    /// Raised when the reference location is not part of a year's location set.
    #[error("reference location `{location}` is absent from year {year}")]
    ReferenceLocationAbsent {
        /// Identifier of the reference location.
        location: String,
        /// The year lacking it.
        year: Year,
    },

    /// Raised when two observations share the same `(location, year)` key.
    #[error("duplicate observation for location `{location}` in year {year}")]
    DuplicateObservation {
        /// Identifier of the duplicated location.
        location: String,
        /// Year of the duplicated key.
        year: Year,
    },

    /// Raised when a `(location, year)` row would be written twice.
    #[error("panel already holds a row for location `{location}` in year {year}")]
    DuplicatePanelRow {
        /// Identifier of the duplicated location.
        location: String,
        /// Year of the duplicated row.
        year: Year,
    },

    /// Raised when a year is folded into the panel twice.
    #[error("panel already holds year {year}")]
    DuplicatePanelYear {
        /// The repeated year.
        year: Year,
    },

    /// Raised when the fixed point misses the tolerance within the iteration budget.
    #[error(
        "equilibrium inversion did not converge after {iterations} iterations; residual {residual}"
    )]
    NonConvergence {
        /// Number of iterations performed before termination.
        iterations: usize,
        /// Maximum relative error at the last iterate.
        residual: f64,
    },

    /// Raised when the iteration produces NaN or infinite values.
    #[error("non-finite value in {context} at iteration {iteration}")]
    NumericalInstability {
        /// Iteration at which the value appeared.
        iteration: usize,
        /// The quantity that became non-finite.
        context: &'static str,
    },

    /// Raised when a cancellation request is observed between iterations.
    #[error("inversion cancelled at iteration {iteration}")]
    Cancelled {
        /// Iterations completed before the request was seen.
        iteration: usize,
    },

    /// Raised when the worker pool cannot be constructed.
    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
}

/// Coarse classification of [`InversionError`] reported alongside panel rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    MissingData,
    InvalidParameter,
    NonConvergence,
    NumericalInstability,
    Cancelled,
}

impl InversionError {
    /// Helper to format a [`DimensionMismatch`](InversionError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for rejecting a malformed parameter.
    pub fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    /// Helper for rejecting a friction matrix.
    pub fn invalid_friction(reason: impl Into<String>) -> Self {
        Self::InvalidFriction {
            reason: reason.into(),
        }
    }

    /// Helper for non-finite intermediate values.
    pub fn unstable(iteration: usize, context: &'static str) -> Self {
        Self::NumericalInstability { iteration, context }
    }

    /// Maps the error onto the taxonomy exposed to panel consumers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingObservation { .. }
            | Self::MissingDistance { .. }
            | Self::LocationNotInFriction { .. }
            | Self::NoObservations { .. } => ErrorKind::MissingData,
            Self::NonConvergence { .. } => ErrorKind::NonConvergence,
            Self::NumericalInstability { .. } => ErrorKind::NumericalInstability,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::DimensionMismatch { .. }
            | Self::InvalidObservation { .. }
            | Self::InvalidParameter { .. }
            | Self::InvalidFriction { .. }
            | Self::PopulationTotalMismatch { .. }
            | Self::ReferenceLocationAbsent { .. }
            | Self::DuplicateObservation { .. }
            | Self::DuplicatePanelRow { .. }
            | Self::DuplicatePanelYear { .. }
            | Self::WorkerPool(_) => ErrorKind::InvalidParameter,
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, InversionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let missing = InversionError::MissingDistance {
            from: "a".into(),
            to: "b".into(),
        };
        assert_eq!(missing.kind(), ErrorKind::MissingData);

        let stalled = InversionError::NonConvergence {
            iterations: 1,
            residual: 0.5,
        };
        assert_eq!(stalled.kind(), ErrorKind::NonConvergence);
        assert_eq!(
            InversionError::unstable(3, "price index").kind(),
            ErrorKind::NumericalInstability
        );
        assert_eq!(
            InversionError::invalid_friction("asymmetric").kind(),
            ErrorKind::InvalidParameter
        );
    }

    #[test]
    fn messages_carry_diagnostics() {
        let err = InversionError::unstable(7, "wage update");
        assert_eq!(err.to_string(), "non-finite value in wage update at iteration 7");
    }
}
