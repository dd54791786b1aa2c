//! Monte-Carlo replication of simulate-then-fit and its summary statistics.

pub mod driver;
pub mod summary;

pub use driver::{
    ExcludedReplicate, FitModelChoice, MonteCarloConfig, MonteCarloError, MonteCarloRun,
    ReplicateRecord, run_monte_carlo, run_replicate,
};
pub use summary::{QuantitySummary, ReplicateSummary, TrueValues};
