//! # Monte-Carlo Driver
//!
//! Repeats simulate-then-fit under independent sub-seeds and summarizes the
//! estimates against the generating values. Replicates share nothing
//! mutable: each one owns an RNG seeded from `replicate_seed(base, index)`,
//! so replicate `i` is the same whether it runs alone, in a batch, or on
//! any number of threads.

use crate::fit::data::FitData;
use crate::fit::estimate::{FitError, fit_model};
use crate::fit::model::{FitOptions, FitResult, ModelSpec};
use crate::montecarlo::summary::{ReplicateSummary, TrueValues};
use crate::outcome::SimulationPlan;
use crate::seeding::{replicate_seed, resolve_seed, seeded_rng};
use crate::types::{SimulationConfig, SimulationError};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::time::Instant;
use thiserror::Error;

/// Which model each replicate is fitted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitModelChoice {
    /// The generating model: a random intercept exactly when the
    /// simulation is clustered.
    #[default]
    Matched,
    /// Fixed effects only, even for clustered data.
    FixedOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonteCarloConfig {
    pub replicates: usize,
    /// Largest tolerated share of replicates excluded for fit failures.
    pub max_failure_fraction: f64,
    pub lower_quantile: f64,
    pub upper_quantile: f64,
    /// Worker threads; 0 uses the global rayon pool.
    pub threads: usize,
    pub model: FitModelChoice,
    pub fit: FitOptions,
    pub show_progress: bool,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            replicates: 500,
            max_failure_fraction: 0.1,
            lower_quantile: 0.025,
            upper_quantile: 0.975,
            threads: 0,
            model: FitModelChoice::Matched,
            fit: FitOptions::default(),
            show_progress: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum MonteCarloError {
    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error("Invalid Monte-Carlo configuration: {0}")]
    InvalidConfig(String),

    #[error("Replicate {index} could not be fitted: {source}")]
    Fit { index: usize, source: FitError },

    #[error(
        "{failed} of {attempted} replicates failed to fit, above the tolerated fraction {max_fraction}."
    )]
    ExcessiveFitFailure {
        failed: usize,
        attempted: usize,
        max_fraction: f64,
    },

    #[error("None of the {attempted} replicates produced a fit.")]
    NoSuccessfulReplicates { attempted: usize },

    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// One successfully fitted replicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateRecord {
    pub index: usize,
    pub seed: u64,
    pub fit: FitResult,
    /// The random intercepts actually drawn, in label order.
    pub true_cluster_intercepts: Option<Vec<(String, f64)>>,
}

/// A replicate dropped because its fit did not converge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedReplicate {
    pub index: usize,
    pub seed: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloRun {
    /// Seed the replicate sub-seeds were derived from.
    pub base_seed: u64,
    pub truth: TrueValues,
    pub summary: ReplicateSummary,
    /// Successful replicates in index order.
    pub replicates: Vec<ReplicateRecord>,
    pub excluded: Vec<ExcludedReplicate>,
}

/// Runs `monte_carlo.replicates` simulate-and-fit replicates of `config`.
///
/// The base seed is `config.seed` or, when absent, an entropy draw recorded
/// in the returned run. Replicates whose fit fails to converge are excluded
/// and logged; any other error aborts the run.
pub fn run_monte_carlo(
    config: &SimulationConfig,
    monte_carlo: &MonteCarloConfig,
) -> Result<MonteCarloRun, MonteCarloError> {
    validate(monte_carlo)?;
    let plan = SimulationPlan::new(config)?;
    let spec = model_spec(config, monte_carlo);
    validate_clusters(config, &spec)?;
    let base_seed = resolve_seed(config.seed)?;
    let truth = true_values(config, &plan, &spec);

    log::info!(
        "Running {} replicates (n = {}, {:?}, random intercept: {}) from base seed {base_seed}.",
        monte_carlo.replicates,
        config.sample_size,
        spec.family,
        spec.random_intercept
    );
    let start = Instant::now();
    let progress = create_progress_bar(monte_carlo.replicates as u64, monte_carlo.show_progress);

    let run_all = || -> Vec<Result<ReplicateRecord, MonteCarloError>> {
        (0..monte_carlo.replicates)
            .into_par_iter()
            .map(|index| {
                let outcome = run_with_plan(&plan, &spec, &monte_carlo.fit, base_seed, index);
                progress.inc(1);
                outcome
            })
            .collect()
    };
    let outcomes = if monte_carlo.threads > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(monte_carlo.threads)
            .build()?;
        pool.install(run_all)
    } else {
        run_all()
    };
    progress.finish_and_clear();

    let mut replicates = Vec::with_capacity(outcomes.len());
    let mut excluded = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(record) => replicates.push(record),
            Err(MonteCarloError::Fit { index, source }) if source.is_convergence_failure() => {
                excluded.push(ExcludedReplicate {
                    index,
                    seed: replicate_seed(base_seed, index),
                    reason: source.to_string(),
                });
                log::warn!(
                    "Replicate {index} excluded: {source} ({} excluded so far).",
                    excluded.len()
                );
            }
            Err(e) => return Err(e),
        }
    }

    let attempted = monte_carlo.replicates;
    if excluded.len() as f64 > monte_carlo.max_failure_fraction * attempted as f64 {
        return Err(MonteCarloError::ExcessiveFitFailure {
            failed: excluded.len(),
            attempted,
            max_fraction: monte_carlo.max_failure_fraction,
        });
    }
    if replicates.is_empty() {
        return Err(MonteCarloError::NoSuccessfulReplicates { attempted });
    }

    let summary = ReplicateSummary::from_fits(
        &truth,
        replicates.iter().map(|r| &r.fit),
        config.age_delta,
        excluded.len(),
        (monte_carlo.lower_quantile, monte_carlo.upper_quantile),
    );
    log::info!(
        "Finished {} replicates in {:.2}s ({} excluded). Mean sex effect {:.4} (true {:.4}), mean age effect {:.4} (true {:.4}).",
        attempted,
        start.elapsed().as_secs_f64(),
        excluded.len(),
        summary.sex_effect.empirical_mean,
        truth.sex_effect,
        summary.age_effect.empirical_mean,
        truth.age_effect
    );

    Ok(MonteCarloRun {
        base_seed,
        truth,
        summary,
        replicates,
        excluded,
    })
}

/// Runs replicate `index` of a run with base seed `base_seed` on its own.
/// The result is identical to the record `run_monte_carlo` produces for it.
/// A fit failure is returned as `MonteCarloError::Fit` whatever its class.
pub fn run_replicate(
    config: &SimulationConfig,
    monte_carlo: &MonteCarloConfig,
    base_seed: u64,
    index: usize,
) -> Result<ReplicateRecord, MonteCarloError> {
    let plan = SimulationPlan::new(config)?;
    let spec = model_spec(config, monte_carlo);
    run_with_plan(&plan, &spec, &monte_carlo.fit, base_seed, index)
}

fn run_with_plan(
    plan: &SimulationPlan,
    spec: &ModelSpec,
    options: &FitOptions,
    base_seed: u64,
    index: usize,
) -> Result<ReplicateRecord, MonteCarloError> {
    let seed = replicate_seed(base_seed, index);
    let mut rng = seeded_rng(seed);
    let dataset = plan.draw(&mut rng)?;

    let fit = FitData::from_individuals(&dataset.individuals)
        .and_then(|data| fit_model(&data, spec, options))
        .map_err(|source| MonteCarloError::Fit { index, source })?;
    log::debug!(
        "Replicate {index} (seed {seed}): sex effect {:.4}, age effect {:.5}.",
        fit.sex_effect,
        fit.age_effect
    );
    Ok(ReplicateRecord {
        index,
        seed,
        fit,
        true_cluster_intercepts: dataset.cluster_intercepts,
    })
}

fn validate(monte_carlo: &MonteCarloConfig) -> Result<(), MonteCarloError> {
    if monte_carlo.replicates == 0 {
        return Err(MonteCarloError::InvalidConfig(
            "replicates must be at least 1".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&monte_carlo.max_failure_fraction) {
        return Err(MonteCarloError::InvalidConfig(format!(
            "max_failure_fraction must be in [0, 1], got {}",
            monte_carlo.max_failure_fraction
        )));
    }
    let (lower, upper) = (monte_carlo.lower_quantile, monte_carlo.upper_quantile);
    if !(0.0..=1.0).contains(&lower) || !(0.0..=1.0).contains(&upper) || lower >= upper {
        return Err(MonteCarloError::InvalidConfig(format!(
            "quantiles must satisfy 0 <= lower < upper <= 1, got {lower} and {upper}"
        )));
    }
    Ok(())
}

/// A fitted random intercept needs at least two clusters that can be drawn.
fn validate_clusters(config: &SimulationConfig, spec: &ModelSpec) -> Result<(), MonteCarloError> {
    let Some(clustering) = config.clustering.as_ref().filter(|_| spec.random_intercept) else {
        return Ok(());
    };
    let drawable = match &clustering.weights {
        Some(weights) => weights.iter().filter(|&&w| w > 0.0).count(),
        None => clustering.labels.len(),
    };
    if drawable < 2 {
        return Err(MonteCarloError::InvalidConfig(format!(
            "a fitted random intercept needs at least 2 clusters with positive weight, found {drawable}; use model = \"fixed_only\" or add clusters"
        )));
    }
    Ok(())
}

fn model_spec(config: &SimulationConfig, monte_carlo: &MonteCarloConfig) -> ModelSpec {
    ModelSpec {
        family: config.outcome_family,
        random_intercept: monte_carlo.model == FitModelChoice::Matched
            && config.clustering.is_some(),
    }
}

fn true_values(config: &SimulationConfig, plan: &SimulationPlan, spec: &ModelSpec) -> TrueValues {
    let coefficients = plan.coefficients();
    TrueValues {
        sex_effect: coefficients.sex.exp(),
        age_effect: coefficients.odds_ratio_age_per(config.age_delta),
        intercept: coefficients.intercept,
        intercept_sd: config
            .clustering
            .as_ref()
            .filter(|_| spec.random_intercept)
            .map(|c| c.intercept_sd),
    }
}

fn create_progress_bar(len: u64, enabled: bool) -> ProgressBar {
    let draw_target = if enabled && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} replicates ({eta})")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClusterConfig;

    fn small_config(seed: u64) -> SimulationConfig {
        SimulationConfig {
            sample_size: 400,
            male_probability: 0.5,
            odds_ratio_sex: 1.5,
            odds_ratio_age: 1.3,
            age_delta: 10.0,
            reference_prevalence: 0.3,
            reference_age: 50.0,
            age_range: (40.0, 70.0),
            outcome_family: Default::default(),
            clustering: None,
            seed: Some(seed),
        }
    }

    fn quick(replicates: usize) -> MonteCarloConfig {
        MonteCarloConfig {
            replicates,
            ..MonteCarloConfig::default()
        }
    }

    #[test]
    fn invalid_monte_carlo_settings_are_rejected() {
        let config = small_config(1);
        for bad in [
            quick(0),
            MonteCarloConfig {
                max_failure_fraction: 1.5,
                ..quick(2)
            },
            MonteCarloConfig {
                lower_quantile: 0.9,
                upper_quantile: 0.1,
                ..quick(2)
            },
        ] {
            assert!(matches!(
                run_monte_carlo(&config, &bad),
                Err(MonteCarloError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn invalid_simulation_config_fails_before_any_replicate() {
        let mut config = small_config(1);
        config.odds_ratio_sex = 0.0;
        assert!(matches!(
            run_monte_carlo(&config, &quick(3)),
            Err(MonteCarloError::Simulation(SimulationError::InvalidParameter { .. }))
        ));
    }

    #[test]
    fn records_come_back_in_index_order_with_derived_seeds() {
        let config = small_config(11);
        let run = run_monte_carlo(&config, &quick(6)).unwrap();
        assert_eq!(run.base_seed, 11);
        assert_eq!(run.replicates.len() + run.excluded.len(), 6);
        for pair in run.replicates.windows(2) {
            assert!(pair[0].index < pair[1].index);
        }
        for record in &run.replicates {
            assert_eq!(record.seed, replicate_seed(11, record.index));
        }
        assert_eq!(run.summary.successful, run.replicates.len());
        assert!(run.summary.intercept_sd.is_none());
    }

    #[test]
    fn fixed_pool_matches_global_pool() {
        let config = small_config(3);
        let global = run_monte_carlo(&config, &quick(4)).unwrap();
        let pooled = run_monte_carlo(
            &config,
            &MonteCarloConfig {
                threads: 2,
                ..quick(4)
            },
        )
        .unwrap();
        assert_eq!(global.replicates, pooled.replicates);
        assert_eq!(global.summary, pooled.summary);
    }

    #[test]
    fn fixed_only_model_ignores_clusters() {
        let mut config = small_config(5);
        config.clustering = Some(ClusterConfig {
            labels: vec!["a".into(), "b".into(), "c".into()],
            weights: None,
            intercept_sd: 0.5,
        });
        let mc = MonteCarloConfig {
            model: FitModelChoice::FixedOnly,
            ..quick(3)
        };
        let run = run_monte_carlo(&config, &mc).unwrap();
        assert!(run.truth.intercept_sd.is_none());
        assert!(run.replicates.iter().all(|r| r.fit.intercept_sd.is_none()));
        assert!(run.replicates.iter().all(|r| r.true_cluster_intercepts.is_some()));
    }

    fn two_cities(weights: Vec<f64>) -> ClusterConfig {
        ClusterConfig {
            labels: vec!["a".into(), "b".into()],
            weights: Some(weights),
            intercept_sd: 1.0,
        }
    }

    #[test]
    fn random_intercept_needs_two_drawable_clusters() {
        let mut config = small_config(13);
        config.clustering = Some(ClusterConfig {
            labels: vec!["only".into()],
            weights: None,
            intercept_sd: 1.0,
        });
        assert!(matches!(
            run_monte_carlo(&config, &quick(2)),
            Err(MonteCarloError::InvalidConfig(_))
        ));

        config.clustering = Some(two_cities(vec![1.0, 0.0]));
        assert!(matches!(
            run_monte_carlo(&config, &quick(2)),
            Err(MonteCarloError::InvalidConfig(_))
        ));

        let fixed = MonteCarloConfig {
            model: FitModelChoice::FixedOnly,
            ..quick(2)
        };
        assert!(run_monte_carlo(&config, &fixed).is_ok());
    }

    #[test]
    fn replicate_drawing_a_single_cluster_is_excluded() {
        // About one "b" per cohort of 100 at weights 99:1, so roughly a
        // third of cohorts contain none.
        let mut config = small_config(0);
        config.sample_size = 100;
        config.clustering = Some(ClusterConfig {
            intercept_sd: 3.0,
            ..two_cities(vec![99.0, 1.0])
        });
        let mc = MonteCarloConfig {
            max_failure_fraction: 1.0,
            ..quick(60)
        };
        let run = run_monte_carlo(&config, &mc).unwrap();
        assert!(!run.excluded.is_empty());
        assert!(
            run.excluded
                .iter()
                .any(|e| e.reason.contains("Only 1 cluster observed"))
        );
        assert_eq!(run.summary.excluded, run.excluded.len());
        assert_eq!(run.summary.successful + run.summary.excluded, 60);
    }

    #[test]
    fn tiny_samples_exceed_the_failure_budget() {
        // Ten individuals at 1% prevalence almost never contain a case, so
        // nearly every logistic fit separates.
        let mut config = small_config(9);
        config.sample_size = 10;
        config.reference_prevalence = 0.01;
        let mc = MonteCarloConfig {
            max_failure_fraction: 0.0,
            ..quick(20)
        };
        assert!(matches!(
            run_monte_carlo(&config, &mc),
            Err(MonteCarloError::ExcessiveFitFailure { attempted: 20, .. })
        ));
    }
}
