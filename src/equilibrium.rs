//! Structural equations of the spatial model and the fixed point that inverts them.
//!
//! For observed wages `w`, populations `L` and gravity weights `K = 1 / friction`,
//! the model implies
//!
//! ```text
//! P_j^-theta = sum_k K_kj (w_k / A_k)^-theta          price index
//! MA_i       = sum_j K_ij P_j^theta w_j L_j           market access
//! w_i        = (A_i^theta MA_i / L_i)^(1 / (1 + theta))
//! L_i / L    = B_i (w_i / P_i)^kappa                   welfare level pinned to one
//! ```
//!
//! The inverter searches for productivities `A` and amenities `B` under which the
//! implied wages and populations reproduce the observed ones. The system is
//! unchanged by `A -> cA, B -> c^-kappa B`, which the
//! [`normalize`](crate::normalize) module resolves.

use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::cost::FrictionMatrix;
use crate::data::{Year, YearData};
use crate::error::{InversionError, Result};
use crate::options::ModelParameters;
use crate::solving::{CancellationToken, ConvergenceRecord, InitialGuess, SolverPhase};

/// Wages, population shares and price indices implied by a candidate `(A, B)`.
#[derive(Clone, Debug)]
pub struct ImpliedOutcomes {
    pub wages: DVector<f64>,
    pub shares: DVector<f64>,
    pub price_index: DVector<f64>,
}

/// Observed data of one year arranged for repeated evaluation of the structural equations.
#[derive(Clone, Debug)]
pub struct GravitySystem<'a> {
    data: &'a YearData,
    weights: DMatrix<f64>,
    income: DVector<f64>,
    shares: DVector<f64>,
    trade_elasticity: f64,
    mobility_elasticity: f64,
}

impl<'a> GravitySystem<'a> {
    /// Pairs a year's data with a friction matrix whose rows follow the same location order.
    pub fn new(
        data: &'a YearData,
        friction: &FrictionMatrix,
        parameters: &ModelParameters,
    ) -> Result<Self> {
        if friction.len() != data.len() {
            return Err(InversionError::dimension_mismatch(
                "friction matrix",
                data.len(),
                friction.len(),
            ));
        }
        if !friction.is_aligned_with(&data.ids()) {
            return Err(InversionError::invalid_friction(
                "location order differs from the year's location set",
            ));
        }

        Ok(Self {
            data,
            weights: friction.gravity_weights(),
            income: data.wage().component_mul(data.population()),
            shares: data.shares(),
            trade_elasticity: parameters.trade_elasticity,
            mobility_elasticity: parameters.mobility_elasticity,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Evaluates the structural equations at `(productivity, amenity)`.
    ///
    /// `iteration` only labels a [`NumericalInstability`](InversionError::NumericalInstability).
    pub fn implied(
        &self,
        productivity: &DVector<f64>,
        amenity: &DVector<f64>,
        iteration: usize,
    ) -> Result<ImpliedOutcomes> {
        let n = self.len();
        if productivity.len() != n {
            return Err(InversionError::dimension_mismatch(
                "productivity length",
                n,
                productivity.len(),
            ));
        }
        if amenity.len() != n {
            return Err(InversionError::dimension_mismatch(
                "amenity length",
                n,
                amenity.len(),
            ));
        }

        let theta = self.trade_elasticity;
        let kappa = self.mobility_elasticity;
        let wage = self.data.wage();
        let population = self.data.population();

        let unit_cost = wage.zip_map(productivity, |w, a| (w / a).powf(-theta));
        let resistance = self.weights.tr_mul(&unit_cost);
        ensure_positive(&resistance, "price index", iteration)?;

        let market_access = &self.weights * self.income.component_div(&resistance);
        let wages = DVector::from_fn(n, |i, _| {
            (productivity[i].powf(theta) * market_access[i] / population[i])
                .powf(1.0 / (1.0 + theta))
        });
        ensure_positive(&wages, "implied wage", iteration)?;

        let price_index = resistance.map(|r| r.powf(-1.0 / theta));
        ensure_positive(&price_index, "price index", iteration)?;

        let shares = DVector::from_fn(n, |i, _| {
            amenity[i] * (wage[i] / price_index[i]).powf(kappa)
        });
        ensure_positive(&shares, "implied population", iteration)?;

        Ok(ImpliedOutcomes {
            wages,
            shares,
            price_index,
        })
    }

    /// Maximum relative error of implied wages and populations against the data.
    pub fn residual(&self, implied: &ImpliedOutcomes) -> f64 {
        let wage = self.data.wage();
        let mut residual = 0.0_f64;
        for i in 0..self.len() {
            let wage_gap = (implied.wages[i] - wage[i]).abs() / wage[i];
            let population_gap = (implied.shares[i] - self.shares[i]).abs() / self.shares[i];
            residual = residual.max(wage_gap).max(population_gap);
        }
        residual
    }

    /// Observed population shares.
    pub fn observed_shares(&self) -> &DVector<f64> {
        &self.shares
    }
}

fn ensure_positive(values: &DVector<f64>, context: &'static str, iteration: usize) -> Result<()> {
    if values.iter().all(|v| v.is_finite() && *v > 0.0) {
        Ok(())
    } else {
        Err(InversionError::unstable(iteration, context))
    }
}

/// Computes the outcomes implied by `(productivity, amenity)` for one year.
pub fn implied_outcomes(
    data: &YearData,
    friction: &FrictionMatrix,
    parameters: &ModelParameters,
    productivity: &DVector<f64>,
    amenity: &DVector<f64>,
) -> Result<ImpliedOutcomes> {
    GravitySystem::new(data, friction, parameters)?.implied(productivity, amenity, 0)
}

/// Recovered fundamentals of one year.
#[derive(Clone, Debug, Serialize)]
pub struct EquilibriumState {
    pub year: Year,
    pub location_ids: Vec<String>,
    pub productivity: DVector<f64>,
    pub amenity: DVector<f64>,
    pub record: ConvergenceRecord,
}

#[derive(Clone, Debug)]
struct StablePoint {
    productivity: DVector<f64>,
    amenity: DVector<f64>,
    residual: f64,
}

/// Mutable state of one year's iteration; damping is part of the state.
#[derive(Clone, Debug)]
struct Iteration {
    productivity: DVector<f64>,
    amenity: DVector<f64>,
    phase: SolverPhase,
    iteration: usize,
    residual: f64,
    damping: f64,
    halvings: usize,
    stable: Option<StablePoint>,
}

impl Iteration {
    fn new(productivity: DVector<f64>, amenity: DVector<f64>, damping: f64) -> Self {
        Self {
            productivity,
            amenity,
            phase: SolverPhase::Initialized,
            iteration: 0,
            residual: f64::INFINITY,
            damping,
            halvings: 0,
            stable: None,
        }
    }

    /// Evaluates the current iterate and either terminates or moves to the next one.
    fn advance(&mut self, system: &GravitySystem<'_>, parameters: &ModelParameters) -> Result<SolverPhase> {
        let implied = match system.implied(&self.productivity, &self.amenity, self.iteration) {
            Ok(implied) => implied,
            Err(err) => {
                self.phase = SolverPhase::Unstable;
                return Err(err);
            }
        };
        self.residual = system.residual(&implied);
        if !self.residual.is_finite() {
            self.phase = SolverPhase::Unstable;
            return Err(InversionError::unstable(self.iteration, "residual"));
        }

        if self.residual < parameters.tolerance {
            self.phase = SolverPhase::Converged;
            return Ok(self.phase);
        }
        if self.iteration >= parameters.max_iterations {
            self.phase = SolverPhase::Diverged;
            return Ok(self.phase);
        }
        self.phase = SolverPhase::Iterating;

        if let Some(stable) = &self.stable {
            if self.residual > stable.residual && self.damping > parameters.min_damping {
                self.damping = (self.damping / 2.0).max(parameters.min_damping);
                self.halvings += 1;
                log::warn!(
                    "residual rose from {:.3e} to {:.3e} at iteration {}; damping lowered to {}",
                    stable.residual,
                    self.residual,
                    self.iteration,
                    self.damping
                );
                self.productivity = stable.productivity.clone();
                self.amenity = stable.amenity.clone();
                self.iteration += 1;
                return Ok(self.phase);
            }
        }

        self.stable = Some(StablePoint {
            productivity: self.productivity.clone(),
            amenity: self.amenity.clone(),
            residual: self.residual,
        });

        let wage = system.data.wage();
        let shares = system.observed_shares();
        let gamma = self.damping;
        for i in 0..system.len() {
            self.productivity[i] *= (wage[i] / implied.wages[i]).powf(gamma);
            self.amenity[i] *= (shares[i] / implied.shares[i]).powf(gamma);
        }
        if let Err(err) = ensure_positive(&self.productivity, "productivity update", self.iteration)
            .and_then(|_| ensure_positive(&self.amenity, "amenity update", self.iteration))
        {
            self.phase = SolverPhase::Unstable;
            return Err(err);
        }

        self.iteration += 1;
        if self.iteration % 100 == 0 {
            log::debug!(
                "iteration {}: residual {:.3e}, damping {}",
                self.iteration,
                self.residual,
                self.damping
            );
        }
        Ok(self.phase)
    }

    fn record(&self) -> ConvergenceRecord {
        ConvergenceRecord {
            iterations: self.iteration,
            final_residual: Some(self.residual),
            converged: self.phase == SolverPhase::Converged,
            final_damping: Some(self.damping),
            damping_halvings: self.halvings,
            phase: self.phase,
        }
    }
}

/// Recovers productivity and amenity vectors for one year by damped fixed-point iteration.
#[derive(Clone, Debug)]
pub struct EquilibriumInverter {
    parameters: ModelParameters,
}

impl EquilibriumInverter {
    /// Creates an inverter after validating `parameters`.
    pub fn new(parameters: ModelParameters) -> Result<Self> {
        parameters.validate()?;
        Ok(Self { parameters })
    }

    pub fn parameters(&self) -> &ModelParameters {
        &self.parameters
    }

    /// Solves from `A = B = 1` without cancellation.
    pub fn solve(&self, data: &YearData, friction: &FrictionMatrix) -> Result<EquilibriumState> {
        self.solve_with(data, friction, &InitialGuess::Unit, None)
    }

    /// Solves from `guess`, checking `cancel` at every iteration boundary.
    pub fn solve_with(
        &self,
        data: &YearData,
        friction: &FrictionMatrix,
        guess: &InitialGuess,
        cancel: Option<&CancellationToken>,
    ) -> Result<EquilibriumState> {
        let system = GravitySystem::new(data, friction, &self.parameters)?;
        let (productivity, amenity) = guess.resolve(data.len())?;
        let mut state = Iteration::new(productivity, amenity, self.parameters.damping);

        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                log::info!("year {}: cancelled at iteration {}", data.year(), state.iteration);
                return Err(InversionError::Cancelled {
                    iteration: state.iteration,
                });
            }

            let phase = state.advance(&system, &self.parameters).map_err(|err| {
                log::warn!("year {}: {err}", data.year());
                err
            })?;

            match phase {
                SolverPhase::Converged => {
                    log::info!(
                        "year {}: converged after {} iterations (residual {:.3e})",
                        data.year(),
                        state.iteration,
                        state.residual
                    );
                    let record = state.record();
                    return Ok(EquilibriumState {
                        year: data.year(),
                        location_ids: data.ids().into_iter().map(String::from).collect(),
                        productivity: state.productivity,
                        amenity: state.amenity,
                        record,
                    });
                }
                SolverPhase::Diverged => {
                    log::warn!(
                        "year {}: no convergence within {} iterations (residual {:.3e})",
                        data.year(),
                        state.iteration,
                        state.residual
                    );
                    return Err(InversionError::NonConvergence {
                        iterations: state.iteration,
                        residual: state.residual,
                    });
                }
                _ => {}
            }
        }
    }
}
