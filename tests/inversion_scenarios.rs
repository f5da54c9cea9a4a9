use approx::assert_relative_eq;
use qsmrs::data::{DistanceSource, DistanceTable, Observation, ObservationTable};
use qsmrs::normalize::Normalizer;
use qsmrs::synthetic::{SyntheticEconomy, SyntheticOptions};
use qsmrs::{
    CancellationToken, CostModel, DecayForm, EquilibriumInverter, ErrorKind, FrictionInput,
    InitialGuess, ModelParameters, Pipeline, PipelineOptions, ReferenceFallback, RowStatus,
};

fn three_locations(year: i32) -> Vec<Observation> {
    vec![
        Observation::new("a", year).name("Alpha").population(100.0).wage(1.0),
        Observation::new("b", year).name("Beta").population(50.0).wage(0.9),
        Observation::new("c", year).name("Gamma").population(20.0).wage(1.2),
    ]
}

fn three_distances() -> DistanceTable {
    DistanceTable::new()
        .with("a", "b", 10.0)
        .with("a", "c", 20.0)
        .with("b", "c", 15.0)
}

fn parameters() -> ModelParameters {
    ModelParameters::new(4.0, 2.0, 1.0)
        .with_tolerance(1e-8)
        .with_max_iterations(500)
}

fn pipeline(params: ModelParameters) -> Pipeline {
    Pipeline::new(PipelineOptions::new(params).with_workers(2)).unwrap()
}

/// Three locations with distinct populations and wages invert to a pinned equilibrium.
#[test]
fn three_location_economy_is_inverted_and_pinned() {
    let observations = ObservationTable::from_observations(three_locations(2000)).unwrap();
    let friction = FrictionInput::Distances(DistanceSource::new(three_distances()));
    let panel = pipeline(parameters())
        .run(&observations, &friction, &[2000])
        .unwrap();

    assert_eq!(panel.len(), 3);
    let summary = panel.summary(2000).unwrap();
    assert!(summary.record.converged);
    assert!(summary.record.final_residual.unwrap() < 1e-8);
    assert_eq!(summary.reference.as_deref(), Some("a"));

    for row in panel.rows() {
        assert!(row.converged);
        assert_eq!(row.status, RowStatus::Converged);
        assert!(row.productivity.unwrap() > 0.0);
        assert!(row.amenity.unwrap() > 0.0);
    }
    assert_eq!(panel.row("a", 2000).unwrap().productivity, Some(1.0));
    assert_eq!(
        panel.row("c", 2000).unwrap().location_name.as_deref(),
        Some("Gamma")
    );
}

/// An iteration budget of one marks every row as not converged and withholds values.
#[test]
fn exhausted_budget_is_reported_per_row() {
    let observations = ObservationTable::from_observations(three_locations(2000)).unwrap();
    let friction = FrictionInput::Distances(DistanceSource::new(three_distances()));
    let panel = pipeline(parameters().with_max_iterations(1))
        .run(&observations, &friction, &[2000])
        .unwrap();

    let summary = panel.summary(2000).unwrap();
    assert!(!summary.record.converged);
    assert_eq!(summary.error, Some(ErrorKind::NonConvergence));
    for row in panel.rows() {
        assert!(!row.converged);
        assert_eq!(row.iterations, 1);
        assert_eq!(row.productivity, None);
        assert_eq!(row.error, Some(ErrorKind::NonConvergence));
        assert!(row.final_residual.unwrap() >= 1e-8);
    }
}

/// Fundamentals drawn at random are recovered from the wages and populations they imply.
#[test]
fn synthetic_fundamentals_are_recovered() {
    let params = ModelParameters::new(4.0, 2.0, 1.0)
        .with_tolerance(1e-10)
        .with_max_iterations(5_000);
    let economy = SyntheticEconomy::generate(
        &SyntheticOptions {
            locations: 8,
            seed: 3,
            ..SyntheticOptions::default()
        },
        &params,
    )
    .unwrap();
    let observations = economy.observations(2000).unwrap();
    let friction = FrictionInput::Distances(DistanceSource::new(economy.distances.clone()));
    let panel = pipeline(params).run(&observations, &friction, &[2000]).unwrap();

    let reference = panel.summary(2000).unwrap().reference.clone().unwrap();
    let r = economy.ids.iter().position(|id| *id == reference).unwrap();
    let anchor = economy.productivity[r];
    for (i, id) in economy.ids.iter().enumerate() {
        let row = panel.row(id, 2000).unwrap();
        assert!(row.converged);
        assert_relative_eq!(
            row.productivity.unwrap(),
            economy.productivity[i] / anchor,
            max_relative = 1e-6
        );
        assert_relative_eq!(
            row.amenity.unwrap(),
            economy.amenity[i] * anchor.powi(2),
            max_relative = 1e-6
        );
    }
}

/// Repeated runs on the same inputs give bit-identical panels.
#[test]
fn runs_are_deterministic() {
    let observations = ObservationTable::from_observations(
        three_locations(2000)
            .into_iter()
            .chain(three_locations(2005))
            .chain(three_locations(2010)),
    )
    .unwrap();
    let friction = FrictionInput::Distances(DistanceSource::new(three_distances()));
    let first = pipeline(parameters())
        .run(&observations, &friction, &[2000, 2005, 2010])
        .unwrap();
    let second = Pipeline::new(PipelineOptions::new(parameters()).with_workers(1))
        .unwrap()
        .run(&observations, &friction, &[2010, 2005, 2000])
        .unwrap();

    assert_eq!(first.rows(), second.rows());
}

/// Different starting scales reach the same normalized fundamentals.
#[test]
fn normalized_solution_does_not_depend_on_starting_scale() {
    let params = parameters();
    let observations = ObservationTable::from_observations(three_locations(2000)).unwrap();
    let data = observations.year_input(2000).data.unwrap();
    let friction = CostModel::new(1.0, DecayForm::PowerLaw)
        .unwrap()
        .build(&three_distances(), &data.ids())
        .unwrap();
    let inverter = EquilibriumInverter::new(params.clone()).unwrap();
    let normalizer = Normalizer::new("a", &params);

    let unit = inverter
        .solve_with(&data, &friction, &InitialGuess::Unit, None)
        .unwrap();
    let scaled = inverter
        .solve_with(&data, &friction, &InitialGuess::Uniform(3.0), None)
        .unwrap();
    let unit = normalizer.normalize(unit, &data).unwrap();
    let scaled = normalizer.normalize(scaled, &data).unwrap();

    assert_eq!(unit.productivity[0], 1.0);
    assert_eq!(scaled.productivity[0], 1.0);
    assert_relative_eq!(unit.productivity, scaled.productivity, max_relative = 1e-6);
    assert_relative_eq!(unit.amenity, scaled.amenity, max_relative = 1e-6);
}

/// Bad rows are excluded, bad years fail, and every requested year is still enumerated.
#[test]
fn failures_are_recorded_without_aborting_the_run() {
    let mut rows = three_locations(2000);
    rows.extend(vec![
        Observation::new("a", 2005).population(100.0).wage(1.0),
        Observation::new("b", 2005).population(50.0).wage(0.9),
        Observation::new("c", 2005).population(0.0).wage(1.2),
    ]);
    rows.extend(three_locations(2010));
    rows.extend(vec![
        Observation::new("b", 2015).population(50.0).wage(0.9),
        Observation::new("c", 2015).population(20.0).wage(1.2),
    ]);
    rows.extend(
        ["a", "b", "c"]
            .into_iter()
            .map(|id| Observation::new(id, 2020).population(0.0).wage(1.0)),
    );
    let observations = ObservationTable::from_observations(rows)
        .unwrap()
        .with_reported_total(2010, 250.0);
    let friction = FrictionInput::Distances(DistanceSource::new(three_distances()));
    let panel = pipeline(parameters())
        .run(&observations, &friction, &[2000, 2005, 2010, 2015, 2020])
        .unwrap();

    assert_eq!(panel.years(), vec![2000, 2005, 2010, 2015, 2020]);
    for year in [2000, 2005, 2010, 2020] {
        assert_eq!(panel.rows_for_year(year).count(), 3);
    }
    assert!(panel.summary(2000).unwrap().record.converged);

    let excluded = panel.row("c", 2005).unwrap();
    assert_eq!(excluded.status, RowStatus::Excluded);
    assert_eq!(excluded.productivity, None);
    assert_eq!(excluded.error, Some(ErrorKind::InvalidParameter));
    assert!(panel.row("b", 2005).unwrap().converged);
    assert_eq!(panel.summary(2005).unwrap().excluded, 1);

    let mismatch = panel.summary(2010).unwrap();
    assert_eq!(mismatch.error, Some(ErrorKind::InvalidParameter));
    assert!(mismatch
        .diagnostic
        .as_deref()
        .unwrap()
        .contains("reported total"));
    assert!(panel
        .rows_for_year(2010)
        .all(|row| row.status == RowStatus::Failed && row.amenity.is_none()));

    let emptied = panel.summary(2020).unwrap();
    assert_eq!(emptied.error, Some(ErrorKind::MissingData));
    assert!(panel
        .rows_for_year(2020)
        .all(|row| row.status == RowStatus::Excluded));

    let absent = panel.summary(2015).unwrap();
    assert!(!absent.record.converged);
    assert!(absent.diagnostic.as_deref().unwrap().contains("reference location"));
    assert_eq!(panel.row("b", 2015).unwrap().status, RowStatus::Failed);
}

/// With the fallback approved, a year missing the reference is pinned to its largest location.
#[test]
fn approved_fallback_pins_to_largest_location_of_the_year() {
    let mut rows = three_locations(2000);
    rows.extend(vec![
        Observation::new("b", 2015).population(50.0).wage(0.9),
        Observation::new("c", 2015).population(20.0).wage(1.2),
    ]);
    let observations = ObservationTable::from_observations(rows).unwrap();
    let friction = FrictionInput::Distances(DistanceSource::new(three_distances()));
    let params = parameters().with_reference_fallback(ReferenceFallback::LargestPopulationInYear);
    let panel = pipeline(params)
        .run(&observations, &friction, &[2000, 2015])
        .unwrap();

    assert_eq!(panel.summary(2000).unwrap().reference.as_deref(), Some("a"));
    assert_eq!(panel.summary(2015).unwrap().reference.as_deref(), Some("b"));
    assert_eq!(panel.row("b", 2015).unwrap().productivity, Some(1.0));
}

/// The panel serializes with its diagnostics.
#[test]
fn panel_serializes_to_json() {
    let observations = ObservationTable::from_observations(three_locations(2000)).unwrap();
    let friction = FrictionInput::Distances(DistanceSource::new(three_distances()));
    let panel = pipeline(parameters())
        .run(&observations, &friction, &[2000, 1990])
        .unwrap();

    let json = serde_json::to_value(&panel).unwrap();
    let rows = json["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["location_id"], "a");
    assert_eq!(rows[0]["productivity"], 1.0);
    assert_eq!(rows[0]["converged"], true);
    assert_eq!(json["summaries"]["1990"]["error"], "MissingData");
}

/// A cancelled run reports every year as cancelled.
#[test]
fn cancellation_is_recorded_for_every_year() {
    let observations = ObservationTable::from_observations(
        three_locations(2000).into_iter().chain(three_locations(2005)),
    )
    .unwrap();
    let friction = FrictionInput::Distances(DistanceSource::new(three_distances()));
    let token = CancellationToken::new();
    token.cancel();
    let panel = pipeline(parameters())
        .run_with_cancellation(&observations, &friction, &[2000, 2005], &token)
        .unwrap();

    for summary in panel.summaries() {
        assert_eq!(summary.error, Some(ErrorKind::Cancelled));
        assert!(!summary.record.converged);
    }
}
