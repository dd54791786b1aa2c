use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// --- Public Data Structures ---

/// Response distribution together with its canonical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// Binary outcome, logit link. Exponentiated coefficients are odds ratios.
    #[default]
    Logistic,
    /// Count outcome, log link. Exponentiated coefficients are rate ratios.
    Poisson,
}

impl Family {
    pub fn link(self, mu: f64) -> f64 {
        match self {
            Family::Logistic => (mu / (1.0 - mu)).ln(),
            Family::Poisson => mu.ln(),
        }
    }

    pub fn inverse_link(self, eta: f64) -> f64 {
        match self {
            Family::Logistic => 1.0 / (1.0 + (-eta).exp()),
            Family::Poisson => eta.exp(),
        }
    }
}

/// Which model to fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub family: Family,
    /// Adds a Gaussian random intercept per cluster.
    pub random_intercept: bool,
}

/// Objective used to estimate the random-intercept standard deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceCriterion {
    /// Laplace approximation with the fixed effects integrated out as well
    /// (REML analogue). Less biased with few clusters.
    #[default]
    Restricted,
    /// Laplace approximation over the random effects only.
    MaximumLikelihood,
}

/// Tuning for the inner P-IRLS loop and the outer variance optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FitOptions {
    pub max_iterations: usize,
    /// Relative change in penalized deviance that counts as converged.
    pub convergence_tolerance: f64,
    pub outer_max_iterations: usize,
    /// Gradient tolerance for the outer BFGS on `ln σ`.
    pub outer_tolerance: f64,
    pub criterion: VarianceCriterion,
    /// Estimated random-intercept SDs below this are a singular fit.
    pub min_intercept_sd: f64,
    /// Largest |η| allowed in a converged logistic fit before it is treated
    /// as (quasi-)complete separation.
    pub max_abs_eta: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            convergence_tolerance: 1e-10,
            outer_max_iterations: 100,
            outer_tolerance: 1e-4,
            criterion: VarianceCriterion::Restricted,
            min_intercept_sd: 1e-4,
            max_abs_eta: 20.0,
        }
    }
}

/// Fixed-effect values on the linear-predictor scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixedEffects {
    pub intercept: f64,
    pub sex: f64,
    /// Per year of age.
    pub age: f64,
}

/// Named estimates extracted from a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub family: Family,
    /// `exp(β_sex)`: odds ratio (logistic) or rate ratio (Poisson), male vs female.
    pub sex_effect: f64,
    /// `exp(β_age)` per year of age.
    pub age_effect: f64,
    pub coefficients: FixedEffects,
    /// Wald standard errors of `coefficients`, conditional on the estimated
    /// variance component in the mixed case.
    pub standard_errors: FixedEffects,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intercept_sd: Option<f64>,
    /// Conditional modes of the random intercepts, keyed by cluster label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_intercepts: Option<BTreeMap<String, f64>>,
    pub deviance: f64,
    /// P-IRLS iterations of the final inner fit.
    pub iterations: usize,
}

impl FitResult {
    /// Age effect for an increment of `delta` years.
    pub fn age_effect_per(&self, delta: f64) -> f64 {
        (self.coefficients.age * delta).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn links_invert() {
        for family in [Family::Logistic, Family::Poisson] {
            for eta in [-3.0, -0.2, 0.0, 1.7] {
                assert_relative_eq!(
                    family.link(family.inverse_link(eta)),
                    eta,
                    epsilon = 1e-12
                );
            }
        }
    }

    #[test]
    fn options_fill_missing_fields_from_defaults() {
        let options: FitOptions = toml::from_str("max_iterations = 80\ncriterion = \"maximum_likelihood\"").unwrap();
        assert_eq!(options.max_iterations, 80);
        assert_eq!(options.criterion, VarianceCriterion::MaximumLikelihood);
        assert_eq!(options.min_intercept_sd, FitOptions::default().min_intercept_sd);
    }

    #[test]
    fn age_effect_rescales_by_increment() {
        let result = FitResult {
            family: Family::Logistic,
            sex_effect: 1.0,
            age_effect: (0.01f64).exp(),
            coefficients: FixedEffects {
                intercept: -1.0,
                sex: 0.0,
                age: 0.01,
            },
            standard_errors: FixedEffects {
                intercept: 0.1,
                sex: 0.1,
                age: 0.001,
            },
            intercept_sd: None,
            cluster_intercepts: None,
            deviance: 0.0,
            iterations: 4,
        };
        assert_relative_eq!(result.age_effect_per(15.0), (0.15f64).exp(), max_relative = 1e-12);
    }
}
