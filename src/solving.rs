//! Fixed-point solver state, diagnostics and cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{InversionError, Result};

/// Phase of the equilibrium iteration.
///
/// `Initialized -> Iterating -> {Converged | Diverged | Unstable}`, with
/// `Cancelled` reachable from any iteration boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverPhase {
    Initialized,
    Iterating,
    Converged,
    /// Iteration budget exhausted before meeting the tolerance.
    Diverged,
    /// A non-finite value appeared.
    Unstable,
    Cancelled,
}

impl SolverPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Initialized | Self::Iterating)
    }
}

/// Diagnostics attached to every year's result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceRecord {
    /// Number of iterations performed.
    pub iterations: usize,
    /// Maximum relative error of implied wages and populations at termination.
    pub final_residual: Option<f64>,
    pub converged: bool,
    /// Damping in effect when the solver stopped.
    pub final_damping: Option<f64>,
    /// How many times divergence forced the damping down.
    pub damping_halvings: usize,
    pub phase: SolverPhase,
}

impl ConvergenceRecord {
    /// Record describing a year that terminated with `error`.
    pub fn from_error(error: &InversionError) -> Self {
        let (iterations, final_residual, phase) = match error {
            InversionError::NonConvergence {
                iterations,
                residual,
            } => (*iterations, Some(*residual), SolverPhase::Diverged),
            InversionError::NumericalInstability { iteration, .. } => {
                (*iteration, None, SolverPhase::Unstable)
            }
            InversionError::Cancelled { iteration } => (*iteration, None, SolverPhase::Cancelled),
            _ => (0, None, SolverPhase::Initialized),
        };
        Self {
            iterations,
            final_residual,
            converged: false,
            final_damping: None,
            damping_halvings: 0,
            phase,
        }
    }
}

/// Starting point of the iteration.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum InitialGuess {
    /// `A = B = 1` everywhere.
    #[default]
    Unit,
    /// `A = B = c` everywhere.
    Uniform(f64),
    /// Explicit vectors, e.g. a previous year's normalized solution.
    Provided {
        productivity: DVector<f64>,
        amenity: DVector<f64>,
    },
}

impl InitialGuess {
    /// Materializes the guess for `n` locations.
    pub fn resolve(&self, n: usize) -> Result<(DVector<f64>, DVector<f64>)> {
        let (productivity, amenity) = match self {
            Self::Unit => (DVector::from_element(n, 1.0), DVector::from_element(n, 1.0)),
            Self::Uniform(scale) => (
                DVector::from_element(n, *scale),
                DVector::from_element(n, *scale),
            ),
            Self::Provided {
                productivity,
                amenity,
            } => (productivity.clone(), amenity.clone()),
        };
        if productivity.len() != n {
            return Err(InversionError::dimension_mismatch(
                "initial productivity",
                n,
                productivity.len(),
            ));
        }
        if amenity.len() != n {
            return Err(InversionError::dimension_mismatch(
                "initial amenity",
                n,
                amenity.len(),
            ));
        }
        if productivity
            .iter()
            .chain(amenity.iter())
            .any(|v| !(*v > 0.0 && v.is_finite()))
        {
            return Err(InversionError::invalid_parameter(
                "initial_guess",
                "values must be positive and finite",
            ));
        }
        Ok((productivity, amenity))
    }
}

/// Shared flag that asks running inversions to stop at the next iteration boundary.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_from_non_convergence_keeps_residual() {
        let record = ConvergenceRecord::from_error(&InversionError::NonConvergence {
            iterations: 12,
            residual: 0.25,
        });
        assert_eq!(record.iterations, 12);
        assert_eq!(record.final_residual, Some(0.25));
        assert!(!record.converged);
        assert_eq!(record.phase, SolverPhase::Diverged);
        assert!(record.phase.is_terminal());
    }

    #[test]
    fn provided_guess_is_validated() {
        let guess = InitialGuess::Provided {
            productivity: DVector::from_vec(vec![1.0, -1.0]),
            amenity: DVector::from_vec(vec![1.0, 1.0]),
        };
        assert!(guess.resolve(2).is_err());
        assert!(InitialGuess::Uniform(2.0).resolve(3).is_ok());
        assert!(InitialGuess::Unit.resolve(3).is_ok());
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
