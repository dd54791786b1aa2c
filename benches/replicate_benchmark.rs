// ========================================================================================
//
//                 EPISIM REPLICATE PERFORMANCE BENCHMARK
//
// ========================================================================================
//
// Measures the cost of one simulate-and-fit replicate for the fixed-effects and
// random-intercept paths across cohort sizes. The mixed path is dominated by the
// repeated inner P-IRLS fits of the variance-component search.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use episim::fit::Family;
use episim::montecarlo::{FitModelChoice, MonteCarloConfig, run_replicate};
use episim::types::{ClusterConfig, SimulationConfig};

// --- Benchmark Tuning Parameters ---

const SAMPLE_SIZES: [usize; 3] = [500, 2_000, 8_000];
const BASE_SEED: u64 = 0x5EED;

fn study(sample_size: usize) -> SimulationConfig {
    SimulationConfig {
        sample_size,
        male_probability: 0.5,
        odds_ratio_sex: 1.05,
        odds_ratio_age: 1.10,
        age_delta: 15.0,
        reference_prevalence: 0.25,
        reference_age: 50.0,
        age_range: (48.0, 80.0),
        outcome_family: Family::Logistic,
        clustering: Some(ClusterConfig {
            labels: (1..=5).map(|i| format!("city{i}")).collect(),
            weights: Some(vec![1.0, 2.0, 2.0, 3.0, 3.0]),
            intercept_sd: 2.0,
        }),
        seed: Some(BASE_SEED),
    }
}

fn bench_replicate(c: &mut Criterion) {
    let mut group = c.benchmark_group("replicate");
    group.sample_size(20);

    for (name, model) in [
        ("fixed_only", FitModelChoice::FixedOnly),
        ("random_intercept", FitModelChoice::Matched),
    ] {
        let monte_carlo = MonteCarloConfig {
            model,
            ..MonteCarloConfig::default()
        };
        for &n in &SAMPLE_SIZES {
            let config = study(n);
            group.throughput(Throughput::Elements(n as u64));
            group.bench_with_input(BenchmarkId::new(name, n), &config, |b, config| {
                let mut index = 0usize;
                b.iter(|| {
                    index += 1;
                    black_box(run_replicate(config, &monte_carlo, BASE_SEED, index).ok())
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_replicate);
criterion_main!(benches);
