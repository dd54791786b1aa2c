use crate::fit::estimate::FitError;
use crate::fit::model::{Family, FitOptions};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use ndarray_linalg::{Cholesky, Solve, UPLO};

/// The status of the P-IRLS convergence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PirlsStatus {
    /// Converged successfully within tolerance.
    Converged,
    /// Reached maximum iterations without converging.
    MaxIterationsReached,
    /// Step halving could not restore a finite, non-increasing objective.
    Unstable,
}

/// Holds the result of a P-IRLS run for a fixed diagonal penalty.
///
/// * `beta`: coefficients in design-matrix column order.
/// * `penalized_hessian`: `X'WX + diag(penalty)` at the final weights. With
///   unit dispersion its inverse is the (conditional) covariance of `beta`.
/// * `deviance`: unpenalized deviance at `beta`.
/// * `penalty_term`: `Σ penalty_j β_j²`.
#[derive(Clone, Debug)]
pub struct PirlsResult {
    pub beta: Array1<f64>,
    pub penalized_hessian: Array2<f64>,
    pub deviance: f64,
    pub penalty_term: f64,
    pub final_weights: Array1<f64>,
    pub status: PirlsStatus,
    pub iteration: usize,
    pub max_abs_eta: f64,
    pub last_change: f64,
}

impl PirlsResult {
    pub fn penalized_deviance(&self) -> f64 {
        self.deviance + self.penalty_term
    }
}

const MAX_STEP_HALVINGS: usize = 30;

/// Penalized iteratively reweighted least squares with a diagonal ridge.
///
/// Minimizes `deviance(β) + Σ_j penalty_j β_j²`. A zero penalty vector gives
/// the ordinary maximum-likelihood GLM. Iteration starts from the usual
/// `mustart` values (`(y + 0.5)/2` for logistic, `y + 0.1` for Poisson) and
/// halves the step whenever the penalized deviance rises or turns non-finite.
pub fn fit_penalized_glm(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    penalty: ArrayView1<f64>,
    family: Family,
    options: &FitOptions,
) -> Result<PirlsResult, FitError> {
    let p = x.ncols();
    if penalty.len() != p {
        return Err(FitError::InvalidInput(format!(
            "penalty has {} entries for {p} design columns",
            penalty.len()
        )));
    }

    let mut eta = initial_eta(y, family);
    let (mut mu, mut weights, mut z) = update_glm_vectors(y, &eta, family);
    let mut beta = Array1::<f64>::zeros(p);
    let mut deviance = calculate_deviance(y, &mu, family);
    let mut penalty_term = 0.0;
    // The start is not a point in coefficient space, so nothing to halve toward yet.
    let mut last_penalized = f64::INFINITY;
    let mut last_change = f64::INFINITY;

    for iter in 1..=options.max_iterations {
        if !weights.iter().all(|w| w.is_finite()) || !z.iter().all(|v| v.is_finite()) {
            log::debug!("P-IRLS: non-finite working quantities at iteration {iter}");
            return Ok(unstable_result(
                x, beta, penalty, deviance, penalty_term, weights, iter, &eta, last_change,
            ));
        }

        let (mut beta_trial, _) = solve_weighted_system(x, z.view(), weights.view(), penalty)?;
        let mut eta_trial = x.dot(&beta_trial);
        let mut mu_trial = eta_trial.mapv(|e| clamp_mean(family, e));
        let mut deviance_trial = calculate_deviance(y, &mu_trial, family);
        let mut penalty_trial = quadratic_penalty(&beta_trial, penalty);
        let mut penalized_trial = deviance_trial + penalty_trial;

        let allowed_rise = options.convergence_tolerance * (0.1 + last_penalized.abs());
        let mut halvings = 0;
        while last_penalized.is_finite()
            && (!penalized_trial.is_finite() || penalized_trial - last_penalized > allowed_rise)
        {
            if halvings == MAX_STEP_HALVINGS {
                log::debug!(
                    "P-IRLS: step halving exhausted at iteration {iter} (trial {penalized_trial:.6e}, current {last_penalized:.6e})"
                );
                return Ok(unstable_result(
                    x, beta, penalty, deviance, penalty_term, weights, iter, &eta, last_change,
                ));
            }
            beta_trial = (&beta_trial + &beta) * 0.5;
            eta_trial = x.dot(&beta_trial);
            mu_trial = eta_trial.mapv(|e| clamp_mean(family, e));
            deviance_trial = calculate_deviance(y, &mu_trial, family);
            penalty_trial = quadratic_penalty(&beta_trial, penalty);
            penalized_trial = deviance_trial + penalty_trial;
            halvings += 1;
        }

        beta = beta_trial;
        eta = eta_trial;
        (mu, weights, z) = update_glm_vectors(y, &eta, family);
        deviance = deviance_trial;
        penalty_term = penalty_trial;

        last_change = (last_penalized - penalized_trial).abs();
        log::debug!(
            "P-IRLS Iteration #{:<2} | Penalized Deviance: {:<13.7} | Change: {:>12.6e}{}",
            iter,
            penalized_trial,
            last_change,
            if halvings > 0 {
                format!(" | Step Halving: {halvings} attempts")
            } else {
                String::new()
            }
        );

        let converged = last_change < options.convergence_tolerance * (0.1 + penalized_trial.abs());
        last_penalized = penalized_trial;

        if converged {
            let (_, penalized_hessian) =
                solve_weighted_system(x, z.view(), weights.view(), penalty)?;
            return Ok(PirlsResult {
                beta,
                penalized_hessian,
                deviance,
                penalty_term,
                final_weights: weights,
                status: PirlsStatus::Converged,
                iteration: iter,
                max_abs_eta: max_abs(&eta),
                last_change,
            });
        }
    }

    log::debug!(
        "P-IRLS reached max iterations ({}) without convergence (mean of last fit {:.4e})",
        options.max_iterations,
        mu.mean().unwrap_or(f64::NAN)
    );
    let penalized_hessian = weighted_hessian(x, weights.view(), penalty);
    Ok(PirlsResult {
        beta,
        penalized_hessian,
        deviance,
        penalty_term,
        final_weights: weights,
        status: PirlsStatus::MaxIterationsReached,
        iteration: options.max_iterations,
        max_abs_eta: max_abs(&eta),
        last_change,
    })
}

#[allow(clippy::too_many_arguments)]
fn unstable_result(
    x: ArrayView2<f64>,
    beta: Array1<f64>,
    penalty: ArrayView1<f64>,
    deviance: f64,
    penalty_term: f64,
    weights: Array1<f64>,
    iteration: usize,
    eta: &Array1<f64>,
    last_change: f64,
) -> PirlsResult {
    let weights = weights.mapv(|w| if w.is_finite() { w } else { 0.0 });
    PirlsResult {
        penalized_hessian: weighted_hessian(x, weights.view(), penalty),
        beta,
        deviance,
        penalty_term,
        final_weights: weights,
        status: PirlsStatus::Unstable,
        iteration,
        max_abs_eta: max_abs(eta),
        last_change,
    }
}

fn initial_eta(y: ArrayView1<f64>, family: Family) -> Array1<f64> {
    match family {
        Family::Logistic => y.mapv(|yi| family.link((yi + 0.5) / 2.0)),
        Family::Poisson => y.mapv(|yi| family.link(yi + 0.1)),
    }
}

fn clamp_mean(family: Family, eta: f64) -> f64 {
    const PROB_EPS: f64 = 1e-10;
    const MIN_RATE: f64 = 1e-10;
    match family {
        Family::Logistic => family
            .inverse_link(eta.clamp(-700.0, 700.0))
            .clamp(PROB_EPS, 1.0 - PROB_EPS),
        Family::Poisson => family.inverse_link(eta.clamp(-700.0, 700.0)).max(MIN_RATE),
    }
}

fn max_abs(values: &Array1<f64>) -> f64 {
    values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
}

fn quadratic_penalty(beta: &Array1<f64>, penalty: ArrayView1<f64>) -> f64 {
    Zip::from(beta)
        .and(penalty)
        .fold(0.0, |acc, &b, &s| acc + s * b * b)
}

/// Mean, working weights and working response for the current `eta`.
pub fn update_glm_vectors(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
    family: Family,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    const MIN_WEIGHT: f64 = 1e-10;

    let mu = eta.mapv(|e| clamp_mean(family, e));
    let weights = match family {
        Family::Logistic => mu.mapv(|m| (m * (1.0 - m)).max(MIN_WEIGHT)),
        Family::Poisson => mu.mapv(|m| m.max(MIN_WEIGHT)),
    };
    let z = eta + &((&y - &mu) / &weights);
    (mu, weights, z)
}

/// Unit deviance summed over observations.
pub fn calculate_deviance(y: ArrayView1<f64>, mu: &Array1<f64>, family: Family) -> f64 {
    match family {
        Family::Logistic => {
            let total = Zip::from(y).and(mu).fold(0.0, |acc, &yi, &mui| {
                let term1 = if yi > 0.0 { yi * (yi.ln() - mui.ln()) } else { 0.0 };
                let term2 = if yi < 1.0 {
                    (1.0 - yi) * ((1.0 - yi).ln() - (1.0 - mui).ln())
                } else {
                    0.0
                };
                acc + term1 + term2
            });
            2.0 * total
        }
        Family::Poisson => {
            let total = Zip::from(y).and(mu).fold(0.0, |acc, &yi, &mui| {
                let log_term = if yi > 0.0 { yi * (yi / mui).ln() } else { 0.0 };
                acc + log_term - (yi - mui)
            });
            2.0 * total
        }
    }
}

fn weighted_hessian(
    x: ArrayView2<f64>,
    weights: ArrayView1<f64>,
    penalty: ArrayView1<f64>,
) -> Array2<f64> {
    let wx = &x * &weights.insert_axis(Axis(1));
    let mut hessian = x.t().dot(&wx);
    for (j, &s) in penalty.iter().enumerate() {
        hessian[[j, j]] += s;
    }
    hessian
}

/// Solves `(X'WX + diag(penalty)) β = X'Wz`, returning `β` and the matrix.
pub fn solve_weighted_system(
    x: ArrayView2<f64>,
    z: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    penalty: ArrayView1<f64>,
) -> Result<(Array1<f64>, Array2<f64>), FitError> {
    let hessian = weighted_hessian(x, weights, penalty);
    let rhs = x.t().dot(&(&weights * &z));
    let beta = hessian
        .solve(&rhs)
        .map_err(FitError::LinearSystemSolveFailed)?;
    if !beta.iter().all(|b| b.is_finite()) {
        return Err(FitError::Unstable {
            reason: "weighted least-squares solve produced non-finite coefficients".to_string(),
        });
    }
    Ok((beta, hessian))
}

/// `ln det(H)` for a symmetric positive-definite `H`, via Cholesky.
pub fn log_determinant_spd(matrix: &Array2<f64>) -> Result<f64, FitError> {
    let lower = matrix
        .cholesky(UPLO::Lower)
        .map_err(FitError::LinearSystemSolveFailed)?;
    Ok(2.0 * lower.diag().iter().map(|d| d.ln()).sum::<f64>())
}
