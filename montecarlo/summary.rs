//! Aggregation of replicate estimates into per-quantity summaries.

use crate::fit::model::FitResult;
use serde::{Deserialize, Serialize};

/// Empirical distribution of one estimated quantity across replicates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantitySummary {
    pub true_value: f64,
    pub empirical_mean: f64,
    /// Sample standard deviation (divisor `n - 1`; zero for a single value).
    pub empirical_sd: f64,
    pub lower_quantile: f64,
    pub upper_quantile: f64,
}

impl QuantitySummary {
    /// Summarizes `estimates` against `true_value`. Empty input yields NaN
    /// statistics.
    pub fn from_estimates(true_value: f64, estimates: &[f64], lower: f64, upper: f64) -> Self {
        let mut sorted = estimates.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Self {
            true_value,
            empirical_mean: mean(&sorted),
            empirical_sd: sample_sd(&sorted),
            lower_quantile: quantile(&sorted, lower),
            upper_quantile: quantile(&sorted, upper),
        }
    }

    pub fn contains_true_value(&self) -> bool {
        self.lower_quantile <= self.true_value && self.true_value <= self.upper_quantile
    }

    /// `(mean - truth) / truth`.
    pub fn relative_bias(&self) -> f64 {
        (self.empirical_mean - self.true_value) / self.true_value
    }
}

/// Generating values the replicate estimates are compared with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrueValues {
    pub sex_effect: f64,
    /// Effect per `age_delta` years.
    pub age_effect: f64,
    pub intercept: f64,
    /// Present when a random intercept is fitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intercept_sd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateSummary {
    pub sex_effect: QuantitySummary,
    /// Per `age_delta` years, comparable with the configured odds ratio.
    pub age_effect: QuantitySummary,
    pub intercept: QuantitySummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intercept_sd: Option<QuantitySummary>,
    pub successful: usize,
    pub excluded: usize,
}

impl ReplicateSummary {
    pub fn from_fits<'a>(
        truth: &TrueValues,
        fits: impl IntoIterator<Item = &'a FitResult>,
        age_delta: f64,
        excluded: usize,
        (lower, upper): (f64, f64),
    ) -> Self {
        let fits: Vec<&FitResult> = fits.into_iter().collect();
        let sex: Vec<f64> = fits.iter().map(|r| r.sex_effect).collect();
        let age: Vec<f64> = fits.iter().map(|r| r.age_effect_per(age_delta)).collect();
        let intercept: Vec<f64> = fits.iter().map(|r| r.coefficients.intercept).collect();
        let intercept_sd = truth.intercept_sd.and_then(|true_sd| {
            let sds: Option<Vec<f64>> = fits.iter().map(|r| r.intercept_sd).collect();
            sds.map(|sds| QuantitySummary::from_estimates(true_sd, &sds, lower, upper))
        });

        Self {
            sex_effect: QuantitySummary::from_estimates(truth.sex_effect, &sex, lower, upper),
            age_effect: QuantitySummary::from_estimates(truth.age_effect, &age, lower, upper),
            intercept: QuantitySummary::from_estimates(truth.intercept, &intercept, lower, upper),
            intercept_sd,
            successful: fits.len(),
            excluded,
        }
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn sample_sd(values: &[f64]) -> f64 {
    match values.len() {
        0 => f64::NAN,
        1 => 0.0,
        n => {
            let m = mean(values);
            let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
            (ss / (n - 1) as f64).sqrt()
        }
    }
}

/// Quantile of already sorted values by linear interpolation between order
/// statistics at `h = (n - 1) p` (Hyndman-Fan type 7).
pub fn quantile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let h = (sorted.len() - 1) as f64 * p.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}
