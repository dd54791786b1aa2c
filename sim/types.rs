//! Shared data types for the simulation side: the run configuration, the
//! per-individual records, and the error taxonomy for malformed input.

use crate::fit::model::Family;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

/// Biological sex of a simulated individual. Female is the reference level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    /// Design-matrix indicator: 1.0 for male, 0.0 for female.
    pub fn indicator(self) -> f64 {
        match self {
            Sex::Male => 1.0,
            Sex::Female => 0.0,
        }
    }
}

/// Cluster (city) membership and random-intercept settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Distinct cluster identifiers. Their order fixes the order of the
    /// random-intercept draws.
    pub labels: Vec<String>,
    /// Relative membership weights, one per label. Uniform when omitted.
    #[serde(default)]
    pub weights: Option<Vec<f64>>,
    /// Standard deviation of the per-cluster random intercept.
    pub intercept_sd: f64,
}

/// Immutable input to one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    pub sample_size: usize,
    pub male_probability: f64,
    /// Odds ratio of male vs female.
    pub odds_ratio_sex: f64,
    /// Odds ratio per `age_delta` years.
    pub odds_ratio_age: f64,
    pub age_delta: f64,
    /// Outcome prevalence for a female aged `reference_age`.
    pub reference_prevalence: f64,
    pub reference_age: f64,
    /// `(min, max)`; ages are normal around the midpoint with ~99% of the
    /// mass inside the range.
    pub age_range: (f64, f64),
    #[serde(default)]
    pub outcome_family: Family,
    #[serde(default)]
    pub clustering: Option<ClusterConfig>,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// One simulated unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedIndividual {
    pub sex: Sex,
    pub age: f64,
    pub cluster: Option<String>,
    /// The random intercept shared by everyone in `cluster`.
    pub cluster_intercept: Option<f64>,
    pub linear_predictor: f64,
    /// Outcome probability (logistic) or rate (Poisson).
    pub mean: f64,
    /// 0/1 for logistic outcomes, a count for Poisson outcomes.
    pub outcome: u64,
}

/// The result of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedDataset {
    /// Seed the random source was initialised with, when the run owned it.
    pub seed: Option<u64>,
    pub family: Family,
    pub individuals: Vec<SimulatedIndividual>,
    /// Random-intercept draw per cluster label, in label order.
    pub cluster_intercepts: Option<Vec<(String, f64)>>,
}

/// Errors raised while validating a configuration or drawing from it.
#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Invalid parameter '{field}': must be {constraint} (got {value}).")]
    InvalidParameter {
        field: &'static str,
        constraint: &'static str,
        value: String,
    },

    #[error("Could not seed the random source from the operating system: {0}")]
    RandomSource(#[from] rand::Error),

    #[error("A sampling distribution could not be constructed: {0}")]
    Distribution(String),
}

impl SimulationError {
    pub(crate) fn invalid(field: &'static str, constraint: &'static str, value: impl Display) -> Self {
        SimulationError::InvalidParameter {
            field,
            constraint,
            value: value.to_string(),
        }
    }
}
