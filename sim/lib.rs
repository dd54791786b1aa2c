#![deny(dead_code)]
#![deny(unused_imports)]

//! Simulate epidemiological cohorts under known generative parameters, fit
//! logistic/Poisson models with and without a random intercept, and measure
//! how well the fits recover the truth across Monte-Carlo replicates.

pub mod config;
pub mod covariates;
pub mod dataset;
pub mod outcome;
pub mod params;
pub mod seeding;
pub mod types;

#[path = "../fit/mod.rs"]
pub mod fit;

#[path = "../montecarlo/mod.rs"]
pub mod montecarlo;
