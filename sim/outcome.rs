//! Outcome simulation.
//!
//! Draw order is fixed: sex, age, cluster membership, one random intercept
//! per cluster label (in label order), then one outcome per individual.
//! Reordering any of these changes every downstream value for a given seed.

use crate::covariates::{CovariatePlan, Covariates};
use crate::fit::model::Family;
use crate::params::{DerivedCoefficients, inverse_logit};
use crate::seeding::{resolve_seed, seeded_rng};
use crate::types::{SimulatedDataset, SimulatedIndividual, SimulationConfig, SimulationError};
use rand::Rng;
use rand::distributions::{Bernoulli, Distribution};
use rand_distr::{Normal, Poisson};

/// A fully validated simulation: coefficients, covariate distributions and
/// the random-intercept distribution. Building one never consumes randomness.
#[derive(Debug, Clone)]
pub struct SimulationPlan {
    coefficients: DerivedCoefficients,
    covariates: CovariatePlan,
    family: Family,
    cluster_intercept: Option<Normal<f64>>,
}

impl SimulationPlan {
    pub fn new(config: &SimulationConfig) -> Result<Self, SimulationError> {
        let coefficients = DerivedCoefficients::from_config(config)?;
        let covariates = CovariatePlan::from_config(config)?;
        let cluster_intercept = match &config.clustering {
            Some(clustering) => {
                let sd = clustering.intercept_sd;
                if !(sd.is_finite() && sd >= 0.0) {
                    return Err(SimulationError::invalid(
                        "clustering.intercept_sd",
                        "finite and nonnegative",
                        sd,
                    ));
                }
                Some(
                    Normal::new(0.0, sd)
                        .map_err(|e| SimulationError::Distribution(e.to_string()))?,
                )
            }
            None => None,
        };

        Ok(Self {
            coefficients,
            covariates,
            family: config.outcome_family,
            cluster_intercept,
        })
    }

    pub fn coefficients(&self) -> &DerivedCoefficients {
        &self.coefficients
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn is_clustered(&self) -> bool {
        self.cluster_intercept.is_some()
    }

    /// Draws one cohort from `rng`.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<SimulatedDataset, SimulationError> {
        let Covariates { sex, age, cluster } = self.covariates.sample(rng);

        let cluster_draws: Option<Vec<(String, f64)>> = match (
            self.covariates.cluster_labels(),
            self.cluster_intercept.as_ref(),
        ) {
            (Some(labels), Some(dist)) => Some(
                labels
                    .iter()
                    .map(|label| (label.clone(), dist.sample(rng)))
                    .collect(),
            ),
            _ => None,
        };

        let mut individuals = Vec::with_capacity(sex.len());
        for i in 0..sex.len() {
            let (label, shift) = match (&cluster, &cluster_draws) {
                (Some(membership), Some(draws)) => {
                    let (label, value) = &draws[membership[i]];
                    (Some(label.clone()), Some(*value))
                }
                _ => (None, None),
            };
            let eta = self
                .coefficients
                .linear_predictor(sex[i], age[i], shift.unwrap_or(0.0));
            let (mean, outcome) = draw_outcome(self.family, eta, rng)?;
            individuals.push(SimulatedIndividual {
                sex: sex[i],
                age: age[i],
                cluster: label,
                cluster_intercept: shift,
                linear_predictor: eta,
                mean,
                outcome,
            });
        }

        Ok(SimulatedDataset {
            seed: None,
            family: self.family,
            individuals,
            cluster_intercepts: cluster_draws,
        })
    }
}

fn draw_outcome<R: Rng + ?Sized>(
    family: Family,
    eta: f64,
    rng: &mut R,
) -> Result<(f64, u64), SimulationError> {
    match family {
        Family::Logistic => {
            let p = inverse_logit(eta);
            let dist = Bernoulli::new(p).map_err(|e| {
                SimulationError::Distribution(format!("Bernoulli({p}) from eta {eta}: {e}"))
            })?;
            Ok((p, u64::from(dist.sample(rng))))
        }
        Family::Poisson => {
            let rate = eta.exp();
            let dist = Poisson::new(rate).map_err(|e| {
                SimulationError::Distribution(format!("Poisson({rate}) from eta {eta}: {e}"))
            })?;
            let count: f64 = dist.sample(rng);
            Ok((rate, count as u64))
        }
    }
}

/// Simulates one dataset, seeding from `config.seed` or, when absent, from
/// the operating system. The seed used is recorded in the result.
pub fn simulate(config: &SimulationConfig) -> Result<SimulatedDataset, SimulationError> {
    let plan = SimulationPlan::new(config)?;
    let seed = resolve_seed(config.seed)?;
    let mut rng = seeded_rng(seed);
    let mut dataset = plan.draw(&mut rng)?;
    dataset.seed = Some(seed);
    log::debug!(
        "Simulated {} individuals with seed {seed}.",
        dataset.individuals.len()
    );
    Ok(dataset)
}

/// Simulates one dataset from a caller-owned random source. `config.seed` is
/// ignored. The configuration is fully validated before `rng` is used.
pub fn simulate_with_rng<R: Rng + ?Sized>(
    config: &SimulationConfig,
    rng: &mut R,
) -> Result<SimulatedDataset, SimulationError> {
    SimulationPlan::new(config)?.draw(rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClusterConfig, Sex};
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashMap;

    fn base_config() -> SimulationConfig {
        SimulationConfig {
            sample_size: 500,
            male_probability: 0.5,
            odds_ratio_sex: 1.05,
            odds_ratio_age: 1.10,
            age_delta: 15.0,
            reference_prevalence: 0.25,
            reference_age: 50.0,
            age_range: (48.0, 80.0),
            outcome_family: Family::Logistic,
            clustering: None,
            seed: Some(1),
        }
    }

    #[test]
    fn linear_predictor_and_mean_are_consistent() {
        let config = base_config();
        let dataset = simulate(&config).unwrap();
        let coefficients = DerivedCoefficients::from_config(&config).unwrap();
        for individual in &dataset.individuals {
            let eta = coefficients.linear_predictor(individual.sex, individual.age, 0.0);
            assert_relative_eq!(individual.linear_predictor, eta);
            assert_relative_eq!(individual.mean, inverse_logit(eta));
            assert!(individual.outcome <= 1);
            assert!(individual.cluster.is_none());
        }
        assert_eq!(dataset.seed, Some(1));
    }

    #[test]
    fn cluster_members_share_one_intercept() {
        let mut config = base_config();
        config.sample_size = 2_000;
        config.clustering = Some(ClusterConfig {
            labels: vec!["north".into(), "south".into(), "east".into()],
            weights: None,
            intercept_sd: 2.0,
        });
        let dataset = simulate(&config).unwrap();
        let draws: HashMap<String, f64> =
            dataset.cluster_intercepts.clone().unwrap().into_iter().collect();
        assert_eq!(draws.len(), 3);
        for individual in &dataset.individuals {
            let label = individual.cluster.as_ref().unwrap();
            assert_eq!(individual.cluster_intercept, Some(draws[label]));
        }
    }

    #[test]
    fn poisson_outcomes_track_rates() {
        let mut config = base_config();
        config.outcome_family = Family::Poisson;
        config.sample_size = 20_000;
        let dataset = simulate(&config).unwrap();
        let total_rate: f64 = dataset.individuals.iter().map(|i| i.mean).sum();
        let total_count: u64 = dataset.individuals.iter().map(|i| i.outcome).sum();
        assert!(dataset.individuals.iter().any(|i| i.outcome > 1));
        assert!((total_count as f64 - total_rate).abs() / total_rate < 0.05);
    }

    #[test]
    fn reference_prevalence_is_reproduced_empirically() {
        let mut config = base_config();
        config.sample_size = 40_000;
        config.age_range = (49.99, 50.01);
        config.male_probability = 0.0;
        let dataset = simulate(&config).unwrap();
        assert!(dataset.individuals.iter().all(|i| i.sex == Sex::Female));
        let cases = dataset.individuals.iter().filter(|i| i.outcome == 1).count() as f64;
        assert!((cases / 40_000.0 - 0.25).abs() < 0.01);
    }

    #[test]
    fn invalid_intercept_sd_is_rejected_before_sampling() {
        let mut config = base_config();
        config.clustering = Some(ClusterConfig {
            labels: vec!["a".into()],
            weights: None,
            intercept_sd: -1.0,
        });
        let mut rng = StdRng::seed_from_u64(8);
        let untouched = rng.clone();
        assert!(matches!(
            simulate_with_rng(&config, &mut rng),
            Err(SimulationError::InvalidParameter {
                field: "clustering.intercept_sd",
                ..
            })
        ));
        assert_eq!(rng.r#gen::<u64>(), untouched.clone().r#gen::<u64>());
    }
}
