//! Seeded synthetic economies with known fundamentals.
//!
//! A synthetic economy draws locations on a square, log-normal productivities and
//! amenities, and then solves the forward equilibrium for the wages and
//! populations those fundamentals imply. Feeding the result back through the
//! inverter must recover the fundamentals up to the normalization scale.

use nalgebra::DVector;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal};

use crate::cost::{CostModel, FrictionMatrix};
use crate::data::{DistanceTable, Observation, ObservationTable, Year, YearData, YearDataBuilder};
use crate::error::{InversionError, Result};
use crate::options::ModelParameters;

const FORWARD_TOLERANCE: f64 = 1e-13;
const FORWARD_MAX_ITERATIONS: usize = 20_000;

/// Shape of a synthetic economy.
#[derive(Clone, Debug)]
pub struct SyntheticOptions {
    pub locations: usize,
    /// Side of the square on which locations are placed.
    pub extent: f64,
    /// Log standard deviation of productivity and amenity draws.
    pub dispersion: f64,
    pub total_population: f64,
    pub seed: u64,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            locations: 8,
            extent: 30.0,
            dispersion: 0.3,
            total_population: 1_000.0,
            seed: 0,
        }
    }
}

/// Wages and populations consistent with given fundamentals.
#[derive(Clone, Debug)]
pub struct ForwardEquilibrium {
    /// Wages normalized to a mean of one.
    pub wages: DVector<f64>,
    pub populations: DVector<f64>,
    /// Amenities rescaled so that the welfare level equals one.
    pub amenity: DVector<f64>,
    pub iterations: usize,
}

/// Solves for the wages and populations implied by `(productivity, amenity)`.
pub fn solve_forward(
    productivity: &DVector<f64>,
    amenity: &DVector<f64>,
    friction: &FrictionMatrix,
    parameters: &ModelParameters,
    total_population: f64,
) -> Result<ForwardEquilibrium> {
    let n = friction.len();
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

    let theta = parameters.trade_elasticity;
    let kappa = parameters.mobility_elasticity;
    let weights = friction.gravity_weights();
    let resistance_at = |wage: &DVector<f64>| {
        let unit_cost = wage.zip_map(productivity, |w, a| (w / a).powf(-theta));
        weights.tr_mul(&unit_cost)
    };

    let mut wage = DVector::from_element(n, 1.0);
    let mut population = DVector::from_element(n, total_population / n as f64);
    let mut change = f64::INFINITY;

    for iteration in 0..FORWARD_MAX_ITERATIONS {
        let resistance = resistance_at(&wage);
        let income = wage.component_mul(&population);
        let market_access = &weights * income.component_div(&resistance);
        let mut next_wage = DVector::from_fn(n, |i, _| {
            (productivity[i].powf(theta) * market_access[i] / population[i])
                .powf(1.0 / (1.0 + theta))
        });
        let mean = next_wage.mean();
        next_wage /= mean;

        let utility = DVector::from_fn(n, |i, _| {
            amenity[i] * (wage[i] * resistance[i].powf(1.0 / theta)).powf(kappa)
        });
        let next_population = &utility * (total_population / utility.sum());

        if next_wage
            .iter()
            .chain(next_population.iter())
            .any(|v| !(v.is_finite() && *v > 0.0))
        {
            return Err(InversionError::unstable(iteration, "forward equilibrium"));
        }

        change = wage
            .iter()
            .zip(next_wage.iter())
            .chain(population.iter().zip(next_population.iter()))
            .map(|(current, next)| (next / current).ln().abs())
            .fold(0.0, f64::max);

        wage = wage.zip_map(&next_wage, |a, b| (a * b).sqrt());
        population = population.zip_map(&next_population, |a, b| (a * b).sqrt());
        let scale = total_population / population.sum();
        population *= scale;

        if change < FORWARD_TOLERANCE {
            let resistance = resistance_at(&wage);
            let welfare: f64 = (0..n)
                .map(|i| amenity[i] * (wage[i] * resistance[i].powf(1.0 / theta)).powf(kappa))
                .sum();
            return Ok(ForwardEquilibrium {
                wages: wage,
                populations: population,
                amenity: amenity / welfare,
                iterations: iteration + 1,
            });
        }
    }

    Err(InversionError::NonConvergence {
        iterations: FORWARD_MAX_ITERATIONS,
        residual: change,
    })
}

/// A fully specified economy whose fundamentals are known.
#[derive(Clone, Debug)]
pub struct SyntheticEconomy {
    pub ids: Vec<String>,
    pub coordinates: Vec<(f64, f64)>,
    pub distances: DistanceTable,
    pub friction: FrictionMatrix,
    pub productivity: DVector<f64>,
    /// Amenities on the scale the inverter recovers (welfare level one).
    pub amenity: DVector<f64>,
    pub wages: DVector<f64>,
    pub populations: DVector<f64>,
}

impl SyntheticEconomy {
    /// Draws fundamentals from `options.seed` and solves for the implied equilibrium.
    pub fn generate(options: &SyntheticOptions, parameters: &ModelParameters) -> Result<Self> {
        if options.locations == 0 {
            return Err(InversionError::invalid_parameter(
                "locations",
                "at least one location is required",
            ));
        }
        if !(options.extent > 0.0 && options.extent.is_finite()) {
            return Err(InversionError::invalid_parameter(
                "extent",
                format!("must be positive and finite, found {}", options.extent),
            ));
        }
        if !(options.total_population > 0.0 && options.total_population.is_finite()) {
            return Err(InversionError::invalid_parameter(
                "total_population",
                format!("must be positive and finite, found {}", options.total_population),
            ));
        }
        if !(options.dispersion >= 0.0 && options.dispersion.is_finite()) {
            return Err(InversionError::invalid_parameter(
                "dispersion",
                format!("must be finite and non-negative, found {}", options.dispersion),
            ));
        }
        let fundamentals = LogNormal::new(0.0, options.dispersion).map_err(|err| {
            InversionError::invalid_parameter("dispersion", err.to_string())
        })?;

        let mut rng = SmallRng::seed_from_u64(options.seed);
        let n = options.locations;
        let ids: Vec<String> = (0..n).map(|i| format!("loc{i:03}")).collect();
        let coordinates: Vec<(f64, f64)> = (0..n)
            .map(|_| {
                (
                    rng.gen_range(0.0..options.extent),
                    rng.gen_range(0.0..options.extent),
                )
            })
            .collect();
        let productivity = DVector::from_fn(n, |_, _| fundamentals.sample(&mut rng));
        let amenity = DVector::from_fn(n, |_, _| fundamentals.sample(&mut rng));

        let distances = DistanceTable::from_coordinates(
            ids.iter().map(String::as_str).zip(coordinates.iter().copied()),
            1.0,
        )?;
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let friction = CostModel::from_parameters(parameters)?.build(&distances, &id_refs)?;

        let forward = solve_forward(
            &productivity,
            &amenity,
            &friction,
            parameters,
            options.total_population,
        )?;

        Ok(Self {
            ids,
            coordinates,
            distances,
            friction,
            productivity,
            amenity: forward.amenity,
            wages: forward.wages,
            populations: forward.populations,
        })
    }

    /// The economy's wages and populations as a validated year.
    pub fn year_data(&self, year: Year) -> Result<YearData> {
        YearDataBuilder::new(
            year,
            self.ids.clone(),
            self.populations.clone(),
            self.wages.clone(),
        )
        .coordinates(self.coordinates.iter().copied().map(Some).collect())
        .build()
    }

    /// The economy's data as raw observations for `year`.
    pub fn observations(&self, year: Year) -> Result<ObservationTable> {
        ObservationTable::from_observations((0..self.ids.len()).map(|i| {
            let (x, y) = self.coordinates[i];
            Observation::new(self.ids[i].clone(), year)
                .population(self.populations[i])
                .wage(self.wages[i])
                .coordinates(x, y)
        }))
    }
}
