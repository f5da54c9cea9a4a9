//! Multi-year inversion pipeline: frictions, per-year fixed points, normalization, panel.

use std::collections::HashMap;

use nalgebra::DVector;
use rayon::prelude::*;

use crate::cost::{CostModel, FrictionMatrix};
use crate::data::{DistanceSource, ObservationTable, Year, YearData};
use crate::equilibrium::EquilibriumInverter;
use crate::error::{InversionError, Result};
use crate::normalize::{NormalizedEquilibrium, Normalizer};
use crate::options::{PipelineOptions, Stage};
use crate::panel::{Panel, PanelAssembler, YearOutcome};
use crate::solving::{CancellationToken, InitialGuess};

/// Where bilateral frictions come from.
#[derive(Clone, Debug)]
pub enum FrictionInput {
    /// Distances turned into frictions by the [`CostModel`] stage.
    Distances(DistanceSource),
    /// A matrix covering every location of every requested year.
    Precomputed(FrictionMatrix),
}

#[derive(Clone, Debug)]
enum FrictionStep {
    Build(CostModel),
    Precomputed,
}

#[derive(Clone, Copy, Debug)]
enum NormalizationStep {
    Pin,
    Skip,
}

/// Friction source of a run, checked against the stage plan.
#[derive(Clone, Copy, Debug)]
enum YearFriction<'a> {
    Build(&'a CostModel, &'a DistanceSource),
    Precomputed(&'a FrictionMatrix),
}

impl YearFriction<'_> {
    fn for_year(&self, data: &YearData) -> Result<FrictionMatrix> {
        let ids = data.ids();
        match self {
            Self::Build(model, source) => model.build(source.for_year(data.year()), &ids),
            Self::Precomputed(matrix) => matrix.restrict(&ids),
        }
    }
}

/// Runs the inversion over many years on a bounded worker pool.
#[derive(Clone, Debug)]
pub struct Pipeline {
    options: PipelineOptions,
    inverter: EquilibriumInverter,
    friction: FrictionStep,
    normalization: NormalizationStep,
}

impl Pipeline {
    /// Validates the configuration and fixes the stage plan.
    pub fn new(options: PipelineOptions) -> Result<Self> {
        let inverter = EquilibriumInverter::new(options.model.clone())?;
        let friction = if options.stages.is_enabled(Stage::Friction) {
            FrictionStep::Build(CostModel::from_parameters(&options.model)?)
        } else {
            FrictionStep::Precomputed
        };
        let normalization = if options.stages.is_enabled(Stage::Normalization) {
            NormalizationStep::Pin
        } else {
            NormalizationStep::Skip
        };

        Ok(Self {
            options,
            inverter,
            friction,
            normalization,
        })
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn inverter(&self) -> &EquilibriumInverter {
        &self.inverter
    }

    /// Inverts every year in `years` and assembles the panel.
    ///
    /// Only configuration problems are returned as errors; failures of
    /// individual years are recorded in the panel.
    pub fn run(
        &self,
        observations: &ObservationTable,
        friction: &FrictionInput,
        years: &[Year],
    ) -> Result<Panel> {
        self.run_with_cancellation(observations, friction, years, &CancellationToken::new())
    }

    /// Like [`run`](Self::run), stopping each year at its next iteration boundary once
    /// `cancel` fires.
    pub fn run_with_cancellation(
        &self,
        observations: &ObservationTable,
        friction: &FrictionInput,
        years: &[Year],
        cancel: &CancellationToken,
    ) -> Result<Panel> {
        let year_friction = match (&self.friction, friction) {
            (FrictionStep::Build(model), FrictionInput::Distances(source)) => {
                YearFriction::Build(model, source)
            }
            (FrictionStep::Precomputed, FrictionInput::Precomputed(matrix)) => {
                YearFriction::Precomputed(matrix)
            }
            (FrictionStep::Build(_), FrictionInput::Precomputed(_)) => {
                return Err(InversionError::invalid_parameter(
                    "stages",
                    "friction stage is enabled but a precomputed matrix was supplied",
                ));
            }
            (FrictionStep::Precomputed, FrictionInput::Distances(_)) => {
                return Err(InversionError::invalid_parameter(
                    "stages",
                    "friction stage is disabled but no precomputed matrix was supplied",
                ));
            }
        };

        let mut years = years.to_vec();
        years.sort_unstable();
        years.dedup();
        if years.is_empty() {
            return Err(InversionError::invalid_parameter("years", "no years requested"));
        }

        let normalizer = match self.normalization {
            NormalizationStep::Pin => Some(Normalizer::from_policy(
                &self.options.model,
                observations,
                &years,
            )?),
            NormalizationStep::Skip => None,
        };

        let outcomes = if self.options.warm_start {
            let mut previous: Option<NormalizedEquilibrium> = None;
            let mut outcomes = Vec::with_capacity(years.len());
            for &year in &years {
                let outcome = self.run_year(
                    year,
                    observations,
                    year_friction,
                    normalizer.as_ref(),
                    previous.as_ref(),
                    cancel,
                );
                if let Ok(normalized) = &outcome.result {
                    previous = Some(normalized.clone());
                }
                outcomes.push(outcome);
            }
            outcomes
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.options.workers.unwrap_or(0))
                .build()
                .map_err(|err| InversionError::WorkerPool(err.to_string()))?;
            pool.install(|| {
                years
                    .par_iter()
                    .map(|&year| {
                        self.run_year(
                            year,
                            observations,
                            year_friction,
                            normalizer.as_ref(),
                            None,
                            cancel,
                        )
                    })
                    .collect::<Vec<_>>()
            })
        };

        let mut assembler = PanelAssembler::new();
        let mut converged = 0usize;
        for outcome in outcomes {
            if outcome.result.is_ok() {
                converged += 1;
            }
            assembler.append(outcome)?;
        }
        log::info!("{converged} of {} years converged", years.len());
        Ok(assembler.finish())
    }

    fn run_year(
        &self,
        year: Year,
        observations: &ObservationTable,
        friction: YearFriction<'_>,
        normalizer: Option<&Normalizer>,
        previous: Option<&NormalizedEquilibrium>,
        cancel: &CancellationToken,
    ) -> YearOutcome {
        log::info!("year {year}: starting inversion");
        let input = observations.year_input(year);
        let result = match &input.data {
            Ok(data) => {
                let guess = warm_guess(previous, data);
                friction
                    .for_year(data)
                    .and_then(|matrix| {
                        self.inverter
                            .solve_with(data, &matrix, &guess, Some(cancel))
                    })
                    .and_then(|state| match normalizer {
                        Some(normalizer) => normalizer.normalize(state, data),
                        None => Ok(NormalizedEquilibrium::unpinned(state)),
                    })
            }
            Err(err) => Err(err.clone()),
        };
        if let Err(err) = &result {
            log::warn!("year {year}: {err}");
        }

        YearOutcome::new(&input, result)
    }
}

/// Starting point taken from the previous year; new locations start at one.
fn warm_guess(previous: Option<&NormalizedEquilibrium>, data: &YearData) -> InitialGuess {
    let Some(previous) = previous else {
        return InitialGuess::Unit;
    };
    let index: HashMap<&str, usize> = previous
        .location_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let carry = |values: &DVector<f64>| {
        DVector::from_iterator(
            data.len(),
            data.locations()
                .iter()
                .map(|location| index.get(location.id.as_str()).map_or(1.0, |&i| values[i])),
        )
    };

    InitialGuess::Provided {
        productivity: carry(&previous.productivity),
        amenity: carry(&previous.amenity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DistanceTable, Observation};
    use crate::error::ErrorKind;
    use crate::options::{ModelParameters, StageSet};
    use crate::panel::RowStatus;

    fn observations() -> ObservationTable {
        let rows = [
            ("a", 100.0, 1.0),
            ("b", 50.0, 0.9),
            ("c", 20.0, 1.2),
        ];
        let mut table = ObservationTable::new();
        for year in [2000, 2005] {
            for (id, population, wage) in rows {
                let scale = if year == 2005 { 1.1 } else { 1.0 };
                table
                    .insert(
                        Observation::new(id, year)
                            .population(population * scale)
                            .wage(wage),
                    )
                    .unwrap();
            }
        }
        table
    }

    fn distances() -> FrictionInput {
        FrictionInput::Distances(DistanceSource::new(
            DistanceTable::new()
                .with("a", "b", 10.0)
                .with("a", "c", 20.0)
                .with("b", "c", 15.0),
        ))
    }

    fn params() -> ModelParameters {
        ModelParameters::new(4.0, 2.0, 1.0).with_tolerance(1e-8)
    }

    #[test]
    fn every_requested_year_is_reported() {
        let pipeline = Pipeline::new(PipelineOptions::new(params()).with_workers(2)).unwrap();
        let panel = pipeline
            .run(&observations(), &distances(), &[2005, 2000, 1995])
            .unwrap();

        assert_eq!(panel.years(), vec![1995, 2000, 2005]);
        assert_eq!(
            panel.summary(1995).unwrap().error,
            Some(ErrorKind::MissingData)
        );
        for year in [2000, 2005] {
            let row = panel.row("a", year).unwrap();
            assert!(row.converged);
            assert_eq!(row.productivity, Some(1.0));
        }
    }

    #[test]
    fn warm_start_matches_cold_start() {
        let cold = Pipeline::new(PipelineOptions::new(params()))
            .unwrap()
            .run(&observations(), &distances(), &[2000, 2005])
            .unwrap();
        let warm = Pipeline::new(PipelineOptions::new(params()).with_warm_start(true))
            .unwrap()
            .run(&observations(), &distances(), &[2000, 2005])
            .unwrap();

        let cold_row = cold.row("b", 2005).unwrap();
        let warm_row = warm.row("b", 2005).unwrap();
        let (cold_a, warm_a) = (cold_row.productivity.unwrap(), warm_row.productivity.unwrap());
        assert!((cold_a - warm_a).abs() < 1e-6);
        assert!(warm_row.iterations < cold_row.iterations);
    }

    #[test]
    fn stage_plan_must_match_friction_input() {
        let stages = StageSet::default().disable(Stage::Friction);
        let pipeline = Pipeline::new(PipelineOptions::new(params()).with_stages(stages)).unwrap();
        let result = pipeline.run(&observations(), &distances(), &[2000]);
        assert!(matches!(
            result,
            Err(InversionError::InvalidParameter { name: "stages", .. })
        ));
    }

    #[test]
    fn precomputed_friction_without_normalization() {
        let friction = CostModel::new(1.0, Default::default())
            .unwrap()
            .build(
                &DistanceTable::new()
                    .with("a", "b", 10.0)
                    .with("a", "c", 20.0)
                    .with("b", "c", 15.0),
                &["c", "b", "a"],
            )
            .unwrap();
        let stages = StageSet::none();
        let pipeline = Pipeline::new(PipelineOptions::new(params()).with_stages(stages)).unwrap();
        let panel = pipeline
            .run(&observations(), &FrictionInput::Precomputed(friction), &[2000])
            .unwrap();

        let summary = panel.summary(2000).unwrap();
        assert!(summary.record.converged);
        assert_eq!(summary.reference, None);
        assert!(panel.rows().iter().all(|row| row.productivity.unwrap() > 0.0));
    }

    #[test]
    fn cancelled_run_still_lists_years() {
        let token = CancellationToken::new();
        token.cancel();
        let pipeline = Pipeline::new(PipelineOptions::new(params())).unwrap();
        let panel = pipeline
            .run_with_cancellation(&observations(), &distances(), &[2000, 2005], &token)
            .unwrap();

        assert_eq!(panel.years(), vec![2000, 2005]);
        for row in panel.rows() {
            assert_eq!(row.status, RowStatus::Failed);
            assert_eq!(row.error, Some(ErrorKind::Cancelled));
        }
    }

    #[test]
    fn years_failing_validation_keep_their_rows() {
        let mut table = observations().with_reported_total(2005, 250.0);
        for id in ["a", "b", "c"] {
            table
                .insert(Observation::new(id, 2020).population(0.0).wage(1.0))
                .unwrap();
        }
        let pipeline = Pipeline::new(PipelineOptions::new(params())).unwrap();
        let panel = pipeline
            .run(&table, &distances(), &[2000, 2005, 2020])
            .unwrap();

        assert_eq!(panel.rows_for_year(2005).count(), 3);
        for row in panel.rows_for_year(2005) {
            assert_eq!(row.status, RowStatus::Failed);
            assert_eq!(row.productivity, None);
            assert_eq!(row.error, Some(ErrorKind::InvalidParameter));
        }

        assert_eq!(panel.rows_for_year(2020).count(), 3);
        for row in panel.rows_for_year(2020) {
            assert_eq!(row.status, RowStatus::Excluded);
            assert!(!row.converged);
        }
        let summary = panel.summary(2020).unwrap();
        assert_eq!(summary.error, Some(ErrorKind::MissingData));
        assert_eq!(summary.excluded, 3);
    }

    #[test]
    fn numerical_instability_is_recorded_per_row() {
        let table = ObservationTable::from_observations(vec![
            Observation::new("a", 2000).population(100.0).wage(1e-100),
            Observation::new("b", 2000).population(50.0).wage(1.0),
        ])
        .unwrap();
        let pipeline = Pipeline::new(PipelineOptions::new(params())).unwrap();
        let panel = pipeline.run(&table, &distances(), &[2000]).unwrap();

        let summary = panel.summary(2000).unwrap();
        assert_eq!(summary.error, Some(ErrorKind::NumericalInstability));
        assert_eq!(summary.record.phase, crate::solving::SolverPhase::Unstable);
        assert_eq!(panel.rows_for_year(2000).count(), 2);
        for row in panel.rows_for_year(2000) {
            assert_eq!(row.status, RowStatus::Failed);
            assert_eq!(row.error, Some(ErrorKind::NumericalInstability));
            assert_eq!(row.iterations, 0);
            assert!(row.diagnostic.as_deref().unwrap().contains("iteration 0"));
        }
    }

    #[test]
    fn invalid_configuration_is_fatal() {
        let result = Pipeline::new(PipelineOptions::new(ModelParameters::new(-4.0, 2.0, 1.0)));
        assert!(matches!(result, Err(InversionError::InvalidParameter { .. })));
    }
}
