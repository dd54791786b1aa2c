//! Converts interpretable epidemiological targets into linear-predictor
//! coefficients.
//!
//! With `β_age = ln(OR_age) / Δ`, the intercept is chosen so that a female of
//! `reference_age` has exactly `reference_prevalence` on the logit scale:
//! `β_0 = logit(p_ref) - β_age · a_ref`.
//!
//! The same coefficients drive Poisson outcomes, where `exp(β_0 + ...)` is a
//! rate: the reference female then has rate `p_ref / (1 - p_ref)`, the odds
//! of `p_ref`, and the odds ratios act as rate ratios.

use crate::fit::model::Family;
use crate::types::{SimulationConfig, SimulationError, Sex};
use serde::{Deserialize, Serialize};

pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

pub fn inverse_logit(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta).exp())
}

/// Linear-predictor coefficients implied by a [`SimulationConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedCoefficients {
    pub intercept: f64,
    pub sex: f64,
    /// Per year of age.
    pub age: f64,
}

impl DerivedCoefficients {
    pub fn from_config(config: &SimulationConfig) -> Result<Self, SimulationError> {
        Self::derive(
            config.odds_ratio_sex,
            config.odds_ratio_age,
            config.age_delta,
            config.reference_prevalence,
            config.reference_age,
        )
    }

    pub fn derive(
        odds_ratio_sex: f64,
        odds_ratio_age: f64,
        age_delta: f64,
        reference_prevalence: f64,
        reference_age: f64,
    ) -> Result<Self, SimulationError> {
        if !(odds_ratio_sex.is_finite() && odds_ratio_sex > 0.0) {
            return Err(SimulationError::invalid(
                "odds_ratio_sex",
                "a finite value > 0",
                odds_ratio_sex,
            ));
        }
        if !(odds_ratio_age.is_finite() && odds_ratio_age > 0.0) {
            return Err(SimulationError::invalid(
                "odds_ratio_age",
                "a finite value > 0",
                odds_ratio_age,
            ));
        }
        if !age_delta.is_finite() || age_delta == 0.0 {
            return Err(SimulationError::invalid(
                "age_delta",
                "a finite nonzero value",
                age_delta,
            ));
        }
        if !(reference_prevalence > 0.0 && reference_prevalence < 1.0) {
            return Err(SimulationError::invalid(
                "reference_prevalence",
                "strictly between 0 and 1",
                reference_prevalence,
            ));
        }
        if !reference_age.is_finite() {
            return Err(SimulationError::invalid(
                "reference_age",
                "finite",
                reference_age,
            ));
        }

        let age = odds_ratio_age.ln() / age_delta;
        Ok(Self {
            intercept: logit(reference_prevalence) - age * reference_age,
            sex: odds_ratio_sex.ln(),
            age,
        })
    }

    /// `β_0 + β_sex·[male] + β_age·age + cluster_intercept`.
    pub fn linear_predictor(&self, sex: Sex, age: f64, cluster_intercept: f64) -> f64 {
        self.intercept + self.sex * sex.indicator() + self.age * age + cluster_intercept
    }

    /// Outcome probability on the logit scale for an individual outside any
    /// cluster effect. For Poisson outcomes use [`Self::mean_at`].
    pub fn prevalence_at(&self, sex: Sex, age: f64) -> f64 {
        inverse_logit(self.linear_predictor(sex, age, 0.0))
    }

    /// Expected outcome under `family` for an individual outside any cluster
    /// effect: a probability for logistic outcomes, a rate for Poisson.
    pub fn mean_at(&self, family: Family, sex: Sex, age: f64) -> f64 {
        family.inverse_link(self.linear_predictor(sex, age, 0.0))
    }

    /// Odds ratio for an age increment of `delta` years.
    pub fn odds_ratio_age_per(&self, delta: f64) -> f64 {
        (self.age * delta).exp()
    }
}
