//! # Fitting Input
//!
//! The individual-level table a model is fitted to: outcome, male indicator,
//! age and, optionally, cluster membership. Column order of the design
//! matrix is fixed: intercept, male, age, then one indicator per cluster in
//! `ClusterIndex::labels` order. Coefficient extraction relies on it.

use crate::fit::estimate::FitError;
use crate::types::SimulatedIndividual;
use ndarray::{Array1, Array2};
use std::collections::BTreeMap;

/// Number of fixed-effect columns: intercept, male, age.
pub const NUM_FIXED: usize = 3;

/// Cluster membership encoded as indices into a sorted label list.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterIndex {
    pub labels: Vec<String>,
    pub membership: Vec<usize>,
}

impl ClusterIndex {
    /// Builds the index from per-row labels. Labels are sorted so the column
    /// layout does not depend on row order.
    pub fn from_labels<S: AsRef<str>>(rows: &[S]) -> Self {
        let mut positions: BTreeMap<&str, usize> = BTreeMap::new();
        for row in rows {
            positions.entry(row.as_ref()).or_insert(0);
        }
        for (i, value) in positions.values_mut().enumerate() {
            *value = i;
        }
        let membership = rows.iter().map(|row| positions[row.as_ref()]).collect();
        let labels = positions.keys().map(|s| s.to_string()).collect();
        Self { labels, membership }
    }

    pub fn num_clusters(&self) -> usize {
        self.labels.len()
    }
}

#[derive(Debug, Clone)]
pub struct FitData {
    /// Outcome: 0/1 for logistic fits, counts for Poisson fits.
    pub y: Array1<f64>,
    /// 1.0 for male, 0.0 for female.
    pub male: Array1<f64>,
    pub age: Array1<f64>,
    pub clusters: Option<ClusterIndex>,
}

impl FitData {
    pub fn new(
        y: Array1<f64>,
        male: Array1<f64>,
        age: Array1<f64>,
        clusters: Option<ClusterIndex>,
    ) -> Result<Self, FitError> {
        let n = y.len();
        if n == 0 {
            return Err(FitError::InvalidInput("the table has no rows".to_string()));
        }
        if male.len() != n || age.len() != n {
            return Err(FitError::InvalidInput(format!(
                "column lengths differ: outcome {n}, male {}, age {}",
                male.len(),
                age.len()
            )));
        }
        if let Some(index) = &clusters {
            if index.membership.len() != n {
                return Err(FitError::InvalidInput(format!(
                    "cluster column has {} rows, expected {n}",
                    index.membership.len()
                )));
            }
            if index.membership.iter().any(|&c| c >= index.labels.len()) {
                return Err(FitError::InvalidInput(
                    "cluster membership refers to an unknown label".to_string(),
                ));
            }
        }
        for (name, column) in [("outcome", &y), ("male", &male), ("age", &age)] {
            if !column.iter().all(|v| v.is_finite()) {
                return Err(FitError::InvalidInput(format!(
                    "column '{name}' contains non-finite values"
                )));
            }
        }
        if !male.iter().all(|&v| v == 0.0 || v == 1.0) {
            return Err(FitError::InvalidInput(
                "column 'male' must be 0 or 1".to_string(),
            ));
        }
        Ok(Self {
            y,
            male,
            age,
            clusters,
        })
    }

    /// Builds the table from simulated individuals. Cluster membership is
    /// kept when every individual has a cluster label.
    pub fn from_individuals(individuals: &[SimulatedIndividual]) -> Result<Self, FitError> {
        let y = individuals.iter().map(|i| i.outcome as f64).collect();
        let male = individuals.iter().map(|i| i.sex.indicator()).collect();
        let age = individuals.iter().map(|i| i.age).collect();
        let labels: Option<Vec<&str>> = individuals
            .iter()
            .map(|i| i.cluster.as_deref())
            .collect();
        let clusters = match labels {
            Some(labels) if !labels.is_empty() => Some(ClusterIndex::from_labels(&labels)),
            _ => None,
        };
        Self::new(y, male, age, clusters)
    }

    pub fn n(&self) -> usize {
        self.y.len()
    }

    /// `[1, male, age]`, followed by cluster indicators when requested.
    pub fn design_matrix(&self, with_clusters: bool) -> Array2<f64> {
        let q = match (&self.clusters, with_clusters) {
            (Some(index), true) => index.num_clusters(),
            _ => 0,
        };
        let mut x = Array2::zeros((self.n(), NUM_FIXED + q));
        for i in 0..self.n() {
            x[[i, 0]] = 1.0;
            x[[i, 1]] = self.male[i];
            x[[i, 2]] = self.age[i];
        }
        if q > 0 {
            if let Some(index) = &self.clusters {
                for (i, &c) in index.membership.iter().enumerate() {
                    x[[i, NUM_FIXED + c]] = 1.0;
                }
            }
        }
        x
    }
}
