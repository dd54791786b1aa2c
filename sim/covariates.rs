//! Covariate sampling: sex, age, and cluster membership.
//!
//! All validation happens when the plan is built, so a plan that exists can
//! always be sampled and a rejected configuration never touches the random
//! source. Draws are taken variable by variable (every sex, then every age,
//! then every cluster) so that a given seed yields the same cohort regardless
//! of how the draws are consumed afterwards.

use crate::types::{ClusterConfig, SimulationConfig, SimulationError, Sex};
use rand::Rng;
use rand::distributions::{Bernoulli, Distribution, WeightedIndex};
use rand_distr::Normal;
use std::collections::HashSet;

/// z-score of the 99th percentile of the standard normal. The age standard
/// deviation is half the configured range divided by this value.
pub const AGE_RANGE_Z: f64 = 2.326_347_874_040_840_8;

/// Validated, ready-to-sample covariate distributions.
#[derive(Debug, Clone)]
pub struct CovariatePlan {
    sample_size: usize,
    sex: Bernoulli,
    age_mean: f64,
    age_sd: f64,
    age: Normal<f64>,
    clusters: Option<ClusterPlan>,
}

#[derive(Debug, Clone)]
struct ClusterPlan {
    labels: Vec<String>,
    membership: WeightedIndex<f64>,
}

/// Covariates for a whole cohort, stored column-wise.
#[derive(Debug, Clone, PartialEq)]
pub struct Covariates {
    pub sex: Vec<Sex>,
    pub age: Vec<f64>,
    /// Index into the plan's label list, per individual.
    pub cluster: Option<Vec<usize>>,
}

impl Covariates {
    pub fn len(&self) -> usize {
        self.sex.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sex.is_empty()
    }
}

impl CovariatePlan {
    pub fn from_config(config: &SimulationConfig) -> Result<Self, SimulationError> {
        Self::new(
            config.sample_size,
            config.male_probability,
            config.age_range,
            config.clustering.as_ref(),
        )
    }

    pub fn new(
        sample_size: usize,
        male_probability: f64,
        age_range: (f64, f64),
        clustering: Option<&ClusterConfig>,
    ) -> Result<Self, SimulationError> {
        if sample_size == 0 {
            return Err(SimulationError::invalid("sample_size", "at least 1", sample_size));
        }
        if !(0.0..=1.0).contains(&male_probability) {
            return Err(SimulationError::invalid(
                "male_probability",
                "within [0, 1]",
                male_probability,
            ));
        }
        let (lo, hi) = age_range;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(SimulationError::invalid(
                "age_range",
                "a finite (min, max) pair with min < max",
                format!("({lo}, {hi})"),
            ));
        }

        let sex = Bernoulli::new(male_probability)
            .map_err(|e| SimulationError::Distribution(e.to_string()))?;
        let age_mean = (lo + hi) / 2.0;
        let age_sd = (hi - lo) / 2.0 / AGE_RANGE_Z;
        let age = Normal::new(age_mean, age_sd)
            .map_err(|e| SimulationError::Distribution(e.to_string()))?;
        let clusters = clustering.map(ClusterPlan::new).transpose()?;

        Ok(Self {
            sample_size,
            sex,
            age_mean,
            age_sd,
            age,
            clusters,
        })
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Mean and standard deviation of the (pre-rounding) age distribution.
    pub fn age_distribution(&self) -> (f64, f64) {
        (self.age_mean, self.age_sd)
    }

    pub fn cluster_labels(&self) -> Option<&[String]> {
        self.clusters.as_ref().map(|c| c.labels.as_slice())
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Covariates {
        let n = self.sample_size;
        let sex = (0..n)
            .map(|_| {
                if self.sex.sample(rng) {
                    Sex::Male
                } else {
                    Sex::Female
                }
            })
            .collect();
        let age = (0..n).map(|_| self.age.sample(rng).round()).collect();
        let cluster = self
            .clusters
            .as_ref()
            .map(|c| (0..n).map(|_| c.membership.sample(rng)).collect());

        Covariates { sex, age, cluster }
    }
}

impl ClusterPlan {
    fn new(config: &ClusterConfig) -> Result<Self, SimulationError> {
        if config.labels.is_empty() {
            return Err(SimulationError::invalid(
                "clustering.labels",
                "a nonempty list",
                "[]",
            ));
        }
        let mut seen = HashSet::with_capacity(config.labels.len());
        for label in &config.labels {
            if !seen.insert(label.as_str()) {
                return Err(SimulationError::invalid(
                    "clustering.labels",
                    "distinct",
                    format!("duplicate label '{label}'"),
                ));
            }
        }

        let weights = match &config.weights {
            Some(w) => {
                if w.len() != config.labels.len() {
                    return Err(SimulationError::invalid(
                        "clustering.weights",
                        "one weight per label",
                        format!("{} weights for {} labels", w.len(), config.labels.len()),
                    ));
                }
                if let Some(bad) = w.iter().find(|v| !(v.is_finite() && **v >= 0.0)) {
                    return Err(SimulationError::invalid(
                        "clustering.weights",
                        "finite and nonnegative",
                        bad,
                    ));
                }
                if w.iter().all(|&v| v == 0.0) {
                    return Err(SimulationError::invalid(
                        "clustering.weights",
                        "not all zero",
                        format!("{w:?}"),
                    ));
                }
                w.clone()
            }
            None => vec![1.0; config.labels.len()],
        };

        let membership = WeightedIndex::new(&weights)
            .map_err(|e| SimulationError::Distribution(e.to_string()))?;

        Ok(Self {
            labels: config.labels.clone(),
            membership,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn cities(weights: Option<Vec<f64>>) -> ClusterConfig {
        ClusterConfig {
            labels: ["Aarhus", "Bergen", "Cork", "Delft", "Espoo"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            weights,
            intercept_sd: 2.0,
        }
    }

    #[test]
    fn age_sd_follows_the_range_rule() {
        let plan = CovariatePlan::new(10, 0.5, (48.0, 80.0), None).unwrap();
        let (mean, sd) = plan.age_distribution();
        assert_relative_eq!(mean, 64.0);
        assert_relative_eq!(sd, 16.0 / AGE_RANGE_Z, max_relative = 1e-12);
    }

    #[test]
    fn ages_are_whole_years_and_mostly_in_range() {
        let plan = CovariatePlan::new(20_000, 0.5, (48.0, 80.0), None).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let covariates = plan.sample(&mut rng);
        assert_eq!(covariates.len(), 20_000);
        assert!(covariates.age.iter().all(|a| a.fract() == 0.0));
        let inside = covariates
            .age
            .iter()
            .filter(|&&a| (48.0..=80.0).contains(&a))
            .count() as f64
            / 20_000.0;
        // Two-sided coverage of ±z(0.99) is 98%; rounding pulls a little more in.
        assert!(inside > 0.97, "only {inside} of ages inside the range");
        assert!(covariates.cluster.is_none());
    }

    #[test]
    fn male_fraction_tracks_probability() {
        let plan = CovariatePlan::new(20_000, 0.3, (20.0, 60.0), None).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let covariates = plan.sample(&mut rng);
        let males = covariates.sex.iter().filter(|&&s| s == Sex::Male).count() as f64;
        assert!((males / 20_000.0 - 0.3).abs() < 0.02);
    }

    #[test]
    fn cluster_membership_is_proportional_to_weights() {
        let config = cities(Some(vec![1.0, 2.0, 2.0, 3.0, 3.0]));
        let plan = CovariatePlan::new(55_000, 0.5, (48.0, 80.0), Some(&config)).unwrap();
        let mut rng = StdRng::seed_from_u64(99);
        let clusters = plan.sample(&mut rng).cluster.unwrap();
        let mut counts = [0usize; 5];
        for c in clusters {
            counts[c] += 1;
        }
        let expected = [5_000.0, 10_000.0, 10_000.0, 15_000.0, 15_000.0];
        for (count, expected) in counts.iter().zip(expected) {
            assert!((*count as f64 - expected).abs() / expected < 0.05);
        }
    }

    #[test]
    fn zero_weight_cluster_is_never_drawn() {
        let config = cities(Some(vec![0.0, 1.0, 1.0, 1.0, 1.0]));
        let plan = CovariatePlan::new(5_000, 0.5, (48.0, 80.0), Some(&config)).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let clusters = plan.sample(&mut rng).cluster.unwrap();
        assert!(clusters.iter().all(|&c| c != 0));
    }

    #[test]
    fn degenerate_plans_are_rejected() {
        assert!(CovariatePlan::new(0, 0.5, (48.0, 80.0), None).is_err());
        assert!(CovariatePlan::new(10, 1.5, (48.0, 80.0), None).is_err());
        assert!(CovariatePlan::new(10, 0.5, (80.0, 48.0), None).is_err());

        let empty = ClusterConfig {
            labels: vec![],
            weights: None,
            intercept_sd: 1.0,
        };
        assert!(CovariatePlan::new(10, 0.5, (48.0, 80.0), Some(&empty)).is_err());
        let zeros = cities(Some(vec![0.0; 5]));
        assert!(CovariatePlan::new(10, 0.5, (48.0, 80.0), Some(&zeros)).is_err());
        let short = cities(Some(vec![1.0; 3]));
        assert!(CovariatePlan::new(10, 0.5, (48.0, 80.0), Some(&short)).is_err());
        let mut duplicated = cities(None);
        duplicated.labels[1] = "Aarhus".to_string();
        assert!(CovariatePlan::new(10, 0.5, (48.0, 80.0), Some(&duplicated)).is_err());
    }
}
