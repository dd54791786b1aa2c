// fit/estimate.rs

//! # Model Estimation
//!
//! Entry point for both model shapes.
//!
//! - **Fixed effects:** a single unpenalized P-IRLS run.
//! - **Random intercept:** the cluster intercepts enter the design matrix as
//!   indicator columns carrying a ridge penalty `λ = 1/σ²`, so for a fixed
//!   `σ` P-IRLS returns the joint mode of fixed effects and intercepts. The
//!   outer loop minimizes the Laplace approximate negative log marginal
//!   likelihood over `θ = ln σ`:
//!
//!   `V(θ) = ½ (D + λ‖û‖²) + ½ ln|H| − ½ q ln λ`
//!
//!   where `D` is the deviance at the mode and `H` is either the full
//!   penalized Hessian (restricted criterion: fixed effects integrated out
//!   too) or its random-effect block `Z'WZ + λI` (maximum likelihood).
//!   The outer optimizer is BFGS on a central-difference gradient, with a
//!   golden-section search over the bounded interval as fallback.

// External Crate for Optimization
use wolfe_bfgs::{Bfgs, BfgsSolution};

use crate::fit::data::{FitData, NUM_FIXED};
use crate::fit::model::{Family, FitOptions, FitResult, FixedEffects, ModelSpec, VarianceCriterion};
use crate::fit::pirls::{PirlsResult, PirlsStatus, fit_penalized_glm, log_determinant_spd};

use ndarray::{Array1, Array2, array, s};
use ndarray_linalg::Inverse;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Search interval for `ln σ`.
const LOG_SD_BOUNDS: (f64, f64) = (-12.0, 5.0);
/// Step for the central-difference gradient in `ln σ`.
const GRADIENT_STEP: f64 = 1e-3;
/// Curvature of the quadratic wall outside `LOG_SD_BOUNDS`.
const BOUND_WALL: f64 = 1e3;
const GOLDEN_ITERATIONS: usize = 80;
/// Cost reported to BFGS when an evaluation fails.
const FAILED_COST: f64 = 1e10;
/// Relative slack within which the objective at the lower end of
/// `LOG_SD_BOUNDS` counts as no worse than at the optimizer's point.
const BOUNDARY_SLACK: f64 = 1e-6;

/// Errors from model fitting. Everything except `InvalidInput` means the
/// data were well formed but the estimator did not produce a usable fit.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Malformed fitting input: {0}")]
    InvalidInput(String),

    #[error(
        "The P-IRLS inner loop did not converge within {max_iterations} iterations. Last deviance change was {last_change:.6e}."
    )]
    PirlsDidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },

    #[error("The fit became numerically unstable: {reason}")]
    Unstable { reason: String },

    #[error(
        "The fitted linear predictor reached |eta| = {max_abs_eta:.1}; the outcome is (quasi-)completely separated."
    )]
    PerfectSeparation { max_abs_eta: f64 },

    #[error(
        "The random-intercept SD estimate {sd:.3e} is below {threshold:.1e}; the variance component is singular."
    )]
    DegenerateVariance { sd: f64, threshold: f64 },

    #[error("Only {found} cluster observed; the random-intercept variance cannot be estimated.")]
    TooFewClusters { found: usize },

    #[error("A linear system solve failed. The penalized Hessian may be singular. Error: {0}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),

    #[error("Variance-component optimization failed: {0}")]
    OptimizationFailed(String),
}

impl FitError {
    /// True for estimator failures on valid data (the Monte-Carlo driver
    /// drops such replicates); false for malformed input.
    pub fn is_convergence_failure(&self) -> bool {
        !matches!(self, FitError::InvalidInput(_))
    }
}

/// Fits `spec` to `data`.
pub fn fit_model(
    data: &FitData,
    spec: &ModelSpec,
    options: &FitOptions,
) -> Result<FitResult, FitError> {
    validate_response(data, spec.family)?;
    if spec.random_intercept {
        fit_mixed(data, spec.family, options)
    } else {
        fit_fixed(data, spec.family, options)
    }
}

fn validate_response(data: &FitData, family: Family) -> Result<(), FitError> {
    match family {
        Family::Logistic => {
            if !data.y.iter().all(|&v| v == 0.0 || v == 1.0) {
                return Err(FitError::InvalidInput(
                    "logistic outcome must be 0 or 1".to_string(),
                ));
            }
        }
        Family::Poisson => {
            if !data.y.iter().all(|&v| v >= 0.0 && v.fract() == 0.0) {
                return Err(FitError::InvalidInput(
                    "Poisson outcome must be a nonnegative integer count".to_string(),
                ));
            }
        }
    }
    Ok(())
}

fn fit_fixed(data: &FitData, family: Family, options: &FitOptions) -> Result<FitResult, FitError> {
    let x = data.design_matrix(false);
    let penalty = Array1::zeros(NUM_FIXED);
    let fit = fit_penalized_glm(x.view(), data.y.view(), penalty.view(), family, options)?;
    check_status(&fit, options)?;
    check_separation(&fit, family, options)?;

    log::debug!(
        "Fixed-effects {family:?} fit converged in {} iterations, deviance {:.4}.",
        fit.iteration,
        fit.deviance
    );
    let covariance = fit
        .penalized_hessian
        .inv()
        .map_err(FitError::LinearSystemSolveFailed)?;
    Ok(build_result(family, &fit, &covariance, None, None))
}

fn fit_mixed(data: &FitData, family: Family, options: &FitOptions) -> Result<FitResult, FitError> {
    let clusters = data.clusters.as_ref().ok_or_else(|| {
        FitError::InvalidInput(
            "a random intercept was requested but the table has no cluster column".to_string(),
        )
    })?;
    if clusters.num_clusters() < 2 {
        return Err(FitError::TooFewClusters {
            found: clusters.num_clusters(),
        });
    }

    let state = Arc::new(internal::LamlState::new(data, family, options.clone()));
    let log_sd = internal::optimize_log_sd(&state, options)?;
    let log_sd = internal::settle_on_lower_bound(&state, log_sd);
    let evaluation = state.evaluate(log_sd)?;
    let fit = evaluation.fit;
    check_separation(&fit, family, options)?;

    let sd = log_sd.exp();
    if sd < options.min_intercept_sd {
        return Err(FitError::DegenerateVariance {
            sd,
            threshold: options.min_intercept_sd,
        });
    }
    log::debug!(
        "Random-intercept {family:?} fit: sd {sd:.4}, Laplace objective {:.4}, {} inner iterations.",
        evaluation.cost,
        fit.iteration
    );

    let covariance = fit
        .penalized_hessian
        .inv()
        .map_err(FitError::LinearSystemSolveFailed)?;
    let cluster_intercepts: BTreeMap<String, f64> = clusters
        .labels
        .iter()
        .cloned()
        .zip(fit.beta.slice(s![NUM_FIXED..]).iter().copied())
        .collect();
    Ok(build_result(
        family,
        &fit,
        &covariance,
        Some(sd),
        Some(cluster_intercepts),
    ))
}

fn check_status(fit: &PirlsResult, options: &FitOptions) -> Result<(), FitError> {
    match fit.status {
        PirlsStatus::Converged => Ok(()),
        PirlsStatus::MaxIterationsReached => Err(FitError::PirlsDidNotConverge {
            max_iterations: options.max_iterations,
            last_change: fit.last_change,
        }),
        PirlsStatus::Unstable => Err(FitError::Unstable {
            reason: format!(
                "step halving failed at iteration {} (deviance {:.6e})",
                fit.iteration, fit.deviance
            ),
        }),
    }
}

fn check_separation(fit: &PirlsResult, family: Family, options: &FitOptions) -> Result<(), FitError> {
    if family == Family::Logistic && fit.max_abs_eta > options.max_abs_eta {
        return Err(FitError::PerfectSeparation {
            max_abs_eta: fit.max_abs_eta,
        });
    }
    Ok(())
}

fn build_result(
    family: Family,
    fit: &PirlsResult,
    covariance: &Array2<f64>,
    intercept_sd: Option<f64>,
    cluster_intercepts: Option<BTreeMap<String, f64>>,
) -> FitResult {
    let coefficients = FixedEffects {
        intercept: fit.beta[0],
        sex: fit.beta[1],
        age: fit.beta[2],
    };
    let se = |j: usize| covariance[[j, j]].max(0.0).sqrt();
    FitResult {
        family,
        sex_effect: coefficients.sex.exp(),
        age_effect: coefficients.age.exp(),
        coefficients,
        standard_errors: FixedEffects {
            intercept: se(0),
            sex: se(1),
            age: se(2),
        },
        intercept_sd,
        cluster_intercepts,
        deviance: fit.deviance,
        iterations: fit.iteration,
    }
}

/// Internal module for the variance-component optimization.
mod internal {
    use super::*;

    #[derive(Clone)]
    pub(super) struct LamlEvaluation {
        pub(super) cost: f64,
        pub(super) fit: PirlsResult,
    }

    /// Holds the data for the outer optimization and caches inner fits by
    /// the exact bits of `ln σ`.
    pub(super) struct LamlState {
        x: Array2<f64>,
        y: Array1<f64>,
        membership: Vec<usize>,
        num_clusters: usize,
        family: Family,
        options: FitOptions,
        cache: RefCell<HashMap<u64, LamlEvaluation>>,
    }

    impl LamlState {
        pub(super) fn new(data: &FitData, family: Family, options: FitOptions) -> Self {
            let (membership, num_clusters) = data
                .clusters
                .as_ref()
                .map(|c| (c.membership.clone(), c.num_clusters()))
                .unwrap_or_default();
            Self {
                x: data.design_matrix(true),
                y: data.y.clone(),
                membership,
                num_clusters,
                family,
                options,
                cache: RefCell::new(HashMap::new()),
            }
        }

        fn penalty(&self, lambda: f64) -> Array1<f64> {
            let mut penalty = Array1::zeros(NUM_FIXED + self.num_clusters);
            penalty.slice_mut(s![NUM_FIXED..]).fill(lambda);
            penalty
        }

        /// Runs P-IRLS at `ln σ = log_sd` and evaluates the Laplace objective.
        pub(super) fn evaluate(&self, log_sd: f64) -> Result<LamlEvaluation, FitError> {
            let key = log_sd.to_bits();
            if let Some(cached) = self.cache.borrow().get(&key) {
                return Ok(cached.clone());
            }

            let lambda = (-2.0 * log_sd).exp();
            let penalty = self.penalty(lambda);
            let fit = fit_penalized_glm(
                self.x.view(),
                self.y.view(),
                penalty.view(),
                self.family,
                &self.options,
            )?;
            check_status(&fit, &self.options)?;

            let log_det = match self.options.criterion {
                VarianceCriterion::Restricted => log_determinant_spd(&fit.penalized_hessian)?,
                VarianceCriterion::MaximumLikelihood => {
                    let mut cluster_weight = vec![0.0; self.num_clusters];
                    for (&c, &w) in self.membership.iter().zip(fit.final_weights.iter()) {
                        cluster_weight[c] += w;
                    }
                    cluster_weight.iter().map(|w| (w + lambda).ln()).sum()
                }
            };
            let cost = 0.5 * fit.penalized_deviance() + 0.5 * log_det
                - 0.5 * self.num_clusters as f64 * lambda.ln();

            let evaluation = LamlEvaluation { cost, fit };
            self.cache.borrow_mut().insert(key, evaluation.clone());
            Ok(evaluation)
        }

        pub(super) fn cost(&self, log_sd: f64) -> Result<f64, FitError> {
            Ok(self.evaluate(log_sd)?.cost)
        }

        pub(super) fn gradient(&self, log_sd: f64) -> Result<f64, FitError> {
            let forward = self.cost(log_sd + GRADIENT_STEP)?;
            let backward = self.cost(log_sd - GRADIENT_STEP)?;
            Ok((forward - backward) / (2.0 * GRADIENT_STEP))
        }
    }

    /// Minimizes the Laplace objective over `ln σ`, returning the minimizer
    /// clamped to `LOG_SD_BOUNDS`.
    pub(super) fn optimize_log_sd(
        state: &Arc<LamlState>,
        options: &FitOptions,
    ) -> Result<f64, FitError> {
        let (lo, hi) = LOG_SD_BOUNDS;
        let state_for_closure = Arc::clone(state);
        let cost_and_grad = move |theta: &Array1<f64>| -> (f64, Array1<f64>) {
            let raw = theta[0];
            let inside = raw.clamp(lo, hi);
            let excess = raw - inside;
            match (
                state_for_closure.cost(inside),
                state_for_closure.gradient(inside),
            ) {
                (Ok(cost), Ok(grad)) if cost.is_finite() && grad.is_finite() => (
                    cost + BOUND_WALL * excess * excess,
                    array![grad + 2.0 * BOUND_WALL * excess],
                ),
                (cost, grad) => {
                    log::debug!(
                        "Laplace objective unavailable at ln(sd) = {inside:.4}: cost {cost:?}, gradient {grad:?}"
                    );
                    (FAILED_COST, Array1::zeros(1))
                }
            }
        };

        let initial_log_sd = array![0.0];
        match Bfgs::new(initial_log_sd, cost_and_grad)
            .with_tolerance(options.outer_tolerance)
            .with_max_iterations(options.outer_max_iterations)
            .run()
        {
            Ok(BfgsSolution {
                final_point,
                final_value,
                iterations,
                ..
            }) if final_value.is_finite() && final_value < FAILED_COST => {
                log::debug!(
                    "BFGS on ln(sd) finished in {iterations} iterations at {:.5} (objective {final_value:.6}).",
                    final_point[0]
                );
                Ok(final_point[0].clamp(lo, hi))
            }
            Ok(solution) => {
                log::warn!(
                    "BFGS ended on a failed evaluation (objective {:.3e}); falling back to golden-section search.",
                    solution.final_value
                );
                golden_section(state)
            }
            Err(e) => {
                log::warn!("BFGS failed: {e:?}; falling back to golden-section search.");
                golden_section(state)
            }
        }
    }

    /// The objective flattens as `σ → 0`, so BFGS stalls well above the
    /// lower bound when the minimum is on it. If the lower end is no worse
    /// than `log_sd`, the lower end is the estimate.
    pub(super) fn settle_on_lower_bound(state: &LamlState, log_sd: f64) -> f64 {
        let (lo, _) = LOG_SD_BOUNDS;
        match (state.cost(log_sd), state.cost(lo)) {
            (Ok(at_point), Ok(at_bound)) if at_bound <= at_point + BOUNDARY_SLACK * (1.0 + at_point.abs()) => {
                log::debug!(
                    "Laplace objective at ln(sd) = {lo} ({at_bound:.6}) is no worse than at {log_sd:.4} ({at_point:.6}); the variance component is on its boundary."
                );
                lo
            }
            _ => log_sd,
        }
    }

    fn golden_section(state: &LamlState) -> Result<f64, FitError> {
        let ratio = (5.0_f64.sqrt() - 1.0) / 2.0;
        let objective = |t: f64| state.cost(t).unwrap_or(f64::INFINITY);
        let (mut a, mut b) = LOG_SD_BOUNDS;
        let mut c = b - ratio * (b - a);
        let mut d = a + ratio * (b - a);
        let mut fc = objective(c);
        let mut fd = objective(d);
        for _ in 0..GOLDEN_ITERATIONS {
            if fc < fd {
                b = d;
                d = c;
                fd = fc;
                c = b - ratio * (b - a);
                fc = objective(c);
            } else {
                a = c;
                c = d;
                fc = fd;
                d = a + ratio * (b - a);
                fd = objective(d);
            }
        }
        let best = 0.5 * (a + b);
        if objective(best).is_finite() {
            Ok(best)
        } else {
            Err(FitError::OptimizationFailed(
                "no finite Laplace objective found for ln(sd) in the search interval".to_string(),
            ))
        }
    }

}
