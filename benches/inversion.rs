use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use qsmrs::synthetic::{SyntheticEconomy, SyntheticOptions};
use qsmrs::{DistanceSource, EquilibriumInverter, FrictionInput, ModelParameters, Pipeline, PipelineOptions};

fn single_year(c: &mut Criterion) {
    let params = ModelParameters::new(4.0, 2.0, 1.0).with_max_iterations(5_000);
    let inverter = EquilibriumInverter::new(params.clone()).unwrap();
    let mut group = c.benchmark_group("solve");
    for locations in [8, 32, 96] {
        let economy = SyntheticEconomy::generate(
            &SyntheticOptions {
                locations,
                seed: 7,
                ..SyntheticOptions::default()
            },
            &params,
        )
        .unwrap();
        let data = economy.year_data(2000).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(locations), &data, |b, data| {
            b.iter(|| inverter.solve(black_box(data), &economy.friction).unwrap())
        });
    }
    group.finish();
}

fn panel_run(c: &mut Criterion) {
    let params = ModelParameters::new(4.0, 2.0, 1.0).with_max_iterations(5_000);
    let economy = SyntheticEconomy::generate(
        &SyntheticOptions {
            locations: 32,
            seed: 7,
            ..SyntheticOptions::default()
        },
        &params,
    )
    .unwrap();
    let years: Vec<i32> = (0..8).map(|k| 1980 + 5 * k).collect();
    let mut observations = economy.observations(years[0]).unwrap();
    for &year in &years[1..] {
        for observation in economy.observations(year).unwrap().observations(year) {
            observations.insert(observation.clone()).unwrap();
        }
    }
    let friction = FrictionInput::Distances(DistanceSource::new(economy.distances.clone()));
    let pipeline = Pipeline::new(PipelineOptions::new(params)).unwrap();

    c.bench_function("pipeline_8_years", |b| {
        b.iter(|| {
            pipeline
                .run(black_box(&observations), &friction, &years)
                .unwrap()
        })
    });
}

criterion_group!(benches, single_year, panel_run);
criterion_main!(benches);
