//! Maximum-likelihood fitting of the two model shapes the simulator produces:
//! a fixed-effects GLM on sex and age, and the same GLM with a Gaussian
//! random intercept per cluster.

pub mod data;
pub mod estimate;
pub mod model;
pub mod pirls;

pub use data::{ClusterIndex, FitData};
pub use estimate::{FitError, fit_model};
pub use model::{Family, FitOptions, FitResult, FixedEffects, ModelSpec, VarianceCriterion};
