use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use loanwise::batch::predict_records;
use loanwise::forest::ForestConfig;
use loanwise::model::{NoopTrainingObserver, TrainingConfig};
use loanwise::{ApplicationRecord, FittedPipeline, TrainingSet};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const AREAS: [&str; 3] = ["Urban", "Rural", "Semiurban"];

fn random_application(rng: &mut StdRng) -> ApplicationRecord {
    ApplicationRecord {
        gender: Some(if rng.gen_bool(0.8) { "Male" } else { "Female" }.to_string()),
        married: Some(if rng.gen_bool(0.65) { "Yes" } else { "No" }.to_string()),
        education: Some(if rng.gen_bool(0.78) { "Graduate" } else { "Not Graduate" }.to_string()),
        applicant_income: Some(rng.gen_range(1500.0..20000.0)),
        coapplicant_income: Some(rng.gen_range(0.0..5000.0)),
        loan_amount: Some(rng.gen_range(30.0..600.0)),
        loan_amount_term: Some(360.0),
        credit_history: Some(if rng.gen_bool(0.85) { 1.0 } else { 0.0 }),
        property_area: Some(AREAS[rng.gen_range(0..AREAS.len())].to_string()),
        ..ApplicationRecord::default()
    }
}

fn training_set(n: usize, rng: &mut StdRng) -> TrainingSet {
    let records: Vec<ApplicationRecord> = (0..n).map(|_| random_application(rng)).collect();
    let labels = records
        .iter()
        .map(|record| {
            let approve = record.credit_history == Some(1.0);
            u8::from(if rng.gen_bool(0.1) { !approve } else { approve })
        })
        .collect::<Array1<u8>>();
    TrainingSet { records, labels }
}

fn trained_pipeline(n_trees: usize) -> FittedPipeline {
    let mut rng = StdRng::seed_from_u64(0x10A2_5EED);
    let data = training_set(600, &mut rng);
    let config = TrainingConfig {
        forest: ForestConfig {
            n_trees,
            ..ForestConfig::default()
        },
        ..TrainingConfig::default()
    };
    match FittedPipeline::fit(&data, &config, &mut NoopTrainingObserver) {
        Ok(pipeline) => pipeline,
        Err(e) => panic!("benchmark model failed to train: {e}"),
    }
}

fn benchmark_single_prediction(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let record = random_application(&mut rng);

    let mut group = c.benchmark_group("single_prediction");
    for n_trees in [10_usize, 100] {
        let pipeline = trained_pipeline(n_trees);
        group.bench_with_input(BenchmarkId::new("trees", n_trees), &record, |b, input| {
            b.iter(|| {
                let prediction = pipeline.predict(black_box(input));
                black_box(prediction).ok();
            });
        });
    }
    group.finish();
}

fn benchmark_batch_prediction(c: &mut Criterion) {
    let pipeline = trained_pipeline(100);
    let mut rng = StdRng::seed_from_u64(11);

    let mut group = c.benchmark_group("batch_prediction");
    for size in [64_usize, 512] {
        let records: Vec<ApplicationRecord> =
            (0..size).map(|_| random_application(&mut rng)).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("records", size), &records, |b, input| {
            b.iter(|| {
                let entries = predict_records(&pipeline, black_box(input));
                black_box(entries);
            });
        });
    }
    group.finish();
}

criterion_group!(
    predict_benchmark,
    benchmark_single_prediction,
    benchmark_batch_prediction
);
criterion_main!(predict_benchmark);
