//! # Logistic Fitting Backends
//!
//! Two ways of turning a design matrix into scores, behind one
//! `ScoringBackend` interface:
//!
//! - `MaximumLikelihood`: unpenalized logistic regression fitted by Newton
//!   iterations (IRLS). Scores are probabilities in `[0, 1]`.
//! - `RidgeClassifier`: L2-penalized logistic regression with no intercept of
//!   its own (the design's `Intercept` column, if any, is penalized like every
//!   other coefficient). Scores are hard class labels, exactly 0.0 or 1.0.
//!
//! The hard labels are deliberately not dressed up as probabilities. Any
//! ROC-AUC computed on them is the AUC of a two-valued score, i.e. the mean of
//! sensitivity and specificity at one operating point. `ScoringBackend::score_kind`
//! lets callers report this.

use super::EvaluationConfig;
use super::formula::{DesignLayout, Formula, FormulaError, ModelFrame};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use ndarray_linalg::{Cholesky, UPLO};
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const PROB_EPS: f64 = 1e-10;
const MIN_WEIGHT: f64 = 1e-10;
const ETA_LIMIT: f64 = 700.0;
/// Smallest admissible ratio between Cholesky pivots before the system is
/// treated as singular.
const PIVOT_RATIO_LIMIT: f64 = 1e-7;
const MAX_STEP_HALVINGS: usize = 30;
/// Fitted probabilities this close to every target mean the classes are
/// perfectly separated.
const SEPARATION_RESIDUAL: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Design matrix could not be built: {0}")]
    Formula(#[from] FormulaError),
    #[error("The training fold is empty.")]
    EmptyTrainingSet,
    #[error("The information matrix is singular or numerically rank deficient ({0}).")]
    SingularDesign(String),
    #[error("Non-finite coefficients at iteration {0}.")]
    NonFinite(usize),
}

/// Which fitting backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Penalty {
    None,
    L2,
}

impl Penalty {
    pub const ALL: [Penalty; 2] = [Penalty::None, Penalty::L2];

    pub fn is_l2(self) -> bool {
        matches!(self, Penalty::L2)
    }

    pub fn backend(self, config: &EvaluationConfig) -> Box<dyn ScoringBackend> {
        match self {
            Penalty::None => Box::new(MaximumLikelihood {
                max_iterations: config.max_iterations,
                tolerance: config.convergence_tolerance,
            }),
            Penalty::L2 => Box::new(RidgeClassifier {
                inverse_strength: config.l2_inverse_strength,
                max_iterations: config.l2_max_iterations,
                tolerance: config.l2_tolerance,
            }),
        }
    }
}

impl fmt::Display for Penalty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Penalty::None => f.write_str("none"),
            Penalty::L2 => f.write_str("l2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreKind {
    /// Continuous probabilities.
    Probability,
    /// Class labels, 0.0 or 1.0 only.
    HardLabel,
}

/// Coefficients and convergence information from one fit.
#[derive(Debug, Clone)]
pub struct LogitFit {
    pub coefficients: Array1<f64>,
    pub iterations: usize,
    pub converged: bool,
    /// The training classes were perfectly separated, so the coefficients
    /// are where the iteration cap left them rather than a finite optimum.
    pub separated: bool,
}

pub trait ScoringBackend: Send + Sync {
    fn score_kind(&self) -> ScoreKind;

    fn fit(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<LogitFit, FitError>;

    fn score(&self, fit: &LogitFit, x: ArrayView2<f64>) -> Array1<f64>;

    fn fit_and_score(
        &self,
        x_train: ArrayView2<f64>,
        y_train: ArrayView1<f64>,
        x_test: ArrayView2<f64>,
    ) -> Result<(Array1<f64>, LogitFit), FitError> {
        if x_train.nrows() == 0 {
            return Err(FitError::EmptyTrainingSet);
        }
        let fit = self.fit(x_train, y_train)?;
        Ok((self.score(&fit, x_test), fit))
    }
}

/// Unpenalized maximum-likelihood logistic regression.
#[derive(Debug, Clone)]
pub struct MaximumLikelihood {
    pub max_iterations: usize,
    /// Relative deviance change that counts as converged.
    pub tolerance: f64,
}

impl ScoringBackend for MaximumLikelihood {
    fn score_kind(&self) -> ScoreKind {
        ScoreKind::Probability
    }

    fn fit(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<LogitFit, FitError> {
        let mut beta = Array1::<f64>::zeros(x.ncols());
        let mut eta = x.dot(&beta);
        let mut deviance = binomial_deviance(y, &eta);
        let mut converged = false;
        let mut separated = false;
        let mut iteration = 0;

        while iteration < self.max_iterations {
            iteration += 1;
            let (mu, weights) = glm_vectors(&eta);
            if max_residual(y, &mu) < SEPARATION_RESIDUAL {
                separated = true;
                break;
            }
            let gradient = x.t().dot(&(&y - &mu));
            let information = weighted_gram(x, &weights);
            // At beta = 0 every weight is 0.25, so a singular system there is a
            // rank-deficient design. Later it can only come from weights
            // collapsing towards zero on (quasi-)separated data.
            let step = match solve_spd(&information, &gradient) {
                Ok(step) => step,
                Err(err) if iteration == 1 => return Err(err),
                Err(err) => {
                    log::debug!("Stopping IRLS at iteration {iteration}: {err}");
                    separated = true;
                    break;
                }
            };

            // Step halving keeps the deviance from increasing.
            let mut scale = 1.0;
            let mut candidate = &beta + &step;
            let mut candidate_eta = x.dot(&candidate);
            let mut candidate_deviance = binomial_deviance(y, &candidate_eta);
            let mut halvings = 0;
            while !(candidate_deviance <= deviance) && halvings < MAX_STEP_HALVINGS {
                scale *= 0.5;
                candidate = &beta + &(&step * scale);
                candidate_eta = x.dot(&candidate);
                candidate_deviance = binomial_deviance(y, &candidate_eta);
                halvings += 1;
            }
            if !candidate_deviance.is_finite() || candidate.iter().any(|b| !b.is_finite()) {
                return Err(FitError::NonFinite(iteration));
            }

            let change = (deviance - candidate_deviance).abs();
            beta = candidate;
            eta = candidate_eta;
            deviance = candidate_deviance;
            if change <= self.tolerance * (deviance.abs() + 0.1) {
                converged = true;
                break;
            }
        }

        if !separated {
            let (mu, _) = glm_vectors(&eta);
            separated = max_residual(y, &mu) < SEPARATION_RESIDUAL;
        }
        if separated {
            log::warn!(
                "Training data is perfectly separated; keeping the fit from iteration {} (deviance {:.3e}). Coefficients are bounded only by the iteration cap.",
                iteration,
                deviance
            );
        } else if !converged {
            log::debug!(
                "Maximum-likelihood fit stopped after {} iterations without converging (deviance {:.6e})",
                iteration,
                deviance
            );
        }

        Ok(LogitFit {
            coefficients: beta,
            iterations: iteration,
            converged,
            separated,
        })
    }

    fn score(&self, fit: &LogitFit, x: ArrayView2<f64>) -> Array1<f64> {
        x.dot(&fit.coefficients).mapv(sigmoid)
    }
}

/// L2-regularized logistic regression minimizing
/// `0.5 * |w|^2 + C * sum(log-loss)`, scored by predicted class.
#[derive(Debug, Clone)]
pub struct RidgeClassifier {
    /// `C`, the inverse of the regularization strength.
    pub inverse_strength: f64,
    pub max_iterations: usize,
    /// Stop once the gradient norm falls below this fraction of its start.
    pub tolerance: f64,
}

impl RidgeClassifier {
    fn objective(&self, w: &Array1<f64>, y: ArrayView1<f64>, eta: &Array1<f64>) -> f64 {
        0.5 * w.dot(w) + self.inverse_strength * 0.5 * binomial_deviance(y, eta)
    }
}

impl ScoringBackend for RidgeClassifier {
    fn score_kind(&self) -> ScoreKind {
        ScoreKind::HardLabel
    }

    fn fit(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<LogitFit, FitError> {
        let c = self.inverse_strength;
        let mut w = Array1::<f64>::zeros(x.ncols());
        let mut eta = x.dot(&w);
        let mut objective = self.objective(&w, y, &eta);
        let mut initial_norm = None;
        let mut converged = false;
        let mut iteration = 0;

        while iteration < self.max_iterations {
            let (mu, weights) = glm_vectors(&eta);
            let gradient = &w + &(x.t().dot(&(&mu - &y)) * c);
            let norm = gradient.dot(&gradient).sqrt();
            let reference = *initial_norm.get_or_insert(norm);
            if norm <= self.tolerance * reference || norm == 0.0 {
                converged = true;
                break;
            }
            iteration += 1;

            let mut hessian = weighted_gram(x, &weights) * c;
            hessian.diag_mut().mapv_inplace(|d| d + 1.0);
            let step = solve_spd(&hessian, &gradient)?;

            let mut scale = 1.0;
            let mut candidate = &w - &step;
            let mut candidate_eta = x.dot(&candidate);
            let mut candidate_objective = self.objective(&candidate, y, &candidate_eta);
            let mut halvings = 0;
            while !(candidate_objective <= objective) && halvings < MAX_STEP_HALVINGS {
                scale *= 0.5;
                candidate = &w - &(&step * scale);
                candidate_eta = x.dot(&candidate);
                candidate_objective = self.objective(&candidate, y, &candidate_eta);
                halvings += 1;
            }
            if !candidate_objective.is_finite() || candidate.iter().any(|v| !v.is_finite()) {
                return Err(FitError::NonFinite(iteration));
            }

            w = candidate;
            eta = candidate_eta;
            objective = candidate_objective;
        }

        if !converged {
            log::debug!(
                "L2 fit stopped after {} iterations without converging (objective {:.6e})",
                iteration,
                objective
            );
        }

        Ok(LogitFit {
            coefficients: w,
            iterations: iteration,
            converged,
            separated: false,
        })
    }

    fn score(&self, fit: &LogitFit, x: ArrayView2<f64>) -> Array1<f64> {
        x.dot(&fit.coefficients)
            .mapv(|margin| if margin > 0.0 { 1.0 } else { 0.0 })
    }
}

/// A fitted model together with the names of its design columns.
#[derive(Debug, Clone)]
pub struct FittedLogit {
    pub penalty: Penalty,
    pub column_names: Vec<String>,
    pub fit: LogitFit,
}

/// Fits `formula` on `train_df` and scores `test_df`. The test design reuses
/// the categorical levels seen in training.
pub fn fit_predict_logit(
    train_df: &DataFrame,
    test_df: &DataFrame,
    formula: &str,
    penalty: Penalty,
    config: &EvaluationConfig,
) -> Result<(Array1<f64>, FittedLogit), FitError> {
    let formula: Formula = formula.parse()?;
    let train = ModelFrame::from_dataframe(train_df, &formula)?;
    let test = ModelFrame::from_dataframe(test_df, &formula)?;
    let train_rows: Vec<usize> = (0..train.height()).collect();
    let test_rows: Vec<usize> = (0..test.height()).collect();

    let layout = DesignLayout::fit(&formula, &train, &train_rows)?;
    let x_train = layout.design_matrix(&train, &train_rows)?;
    let y_train = layout.response(&train, &train_rows)?;
    let x_test = layout.design_matrix(&test, &test_rows)?;

    let backend = penalty.backend(config);
    let (scores, fit) = backend.fit_and_score(x_train.view(), y_train.view(), x_test.view())?;
    Ok((
        scores,
        FittedLogit {
            penalty,
            column_names: layout.column_names().to_vec(),
            fit,
        },
    ))
}

fn sigmoid(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta.clamp(-ETA_LIMIT, ETA_LIMIT)).exp())
}

/// Mean and working weights for the logit link, clamped away from 0 and 1.
fn glm_vectors(eta: &Array1<f64>) -> (Array1<f64>, Array1<f64>) {
    let mu = eta.mapv(|e| sigmoid(e).clamp(PROB_EPS, 1.0 - PROB_EPS));
    let weights = mu.mapv(|m| (m * (1.0 - m)).max(MIN_WEIGHT));
    (mu, weights)
}

/// Largest `|y - mu|` over the rows.
fn max_residual(y: ArrayView1<f64>, mu: &Array1<f64>) -> f64 {
    Zip::from(y)
        .and(mu)
        .fold(0.0_f64, |acc, &yi, &mui| acc.max((yi - mui).abs()))
}

/// `-2 * log-likelihood`, evaluated on the linear predictor for stability.
fn binomial_deviance(y: ArrayView1<f64>, eta: &Array1<f64>) -> f64 {
    let total = Zip::from(y).and(eta).fold(0.0, |acc, &yi, &e| {
        // log(1 + exp(e)) without overflow
        let softplus = if e > 0.0 {
            e + (-e).exp().ln_1p()
        } else {
            e.exp().ln_1p()
        };
        acc + softplus - yi * e
    });
    2.0 * total
}

/// `X' diag(w) X`.
fn weighted_gram(x: ArrayView2<f64>, weights: &Array1<f64>) -> Array2<f64> {
    let root = weights.mapv(f64::sqrt).insert_axis(Axis(1));
    let xw = &x * &root;
    xw.t().dot(&xw)
}

/// Solves `a z = b` for symmetric positive definite `a` through its Cholesky
/// factor, rejecting systems whose pivots show numerical rank deficiency.
fn solve_spd(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, FitError> {
    let lower = a
        .cholesky(UPLO::Lower)
        .map_err(|e| FitError::SingularDesign(e.to_string()))?;

    let diag = lower.diag();
    let max_pivot = diag.iter().fold(0.0_f64, |m, &d| m.max(d.abs()));
    let min_pivot = diag.iter().fold(f64::INFINITY, |m, &d| m.min(d.abs()));
    if !(min_pivot > PIVOT_RATIO_LIMIT * max_pivot) {
        return Err(FitError::SingularDesign(format!(
            "pivot ratio {:.3e}",
            min_pivot / max_pivot
        )));
    }

    let n = b.len();
    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let partial: f64 = (0..i).map(|k| lower[[i, k]] * z[k]).sum();
        z[i] = (b[i] - partial) / lower[[i, i]];
    }
    let mut solution = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let partial: f64 = (i + 1..n).map(|k| lower[[k, i]] * solution[k]).sum();
        solution[i] = (z[i] - partial) / lower[[i, i]];
    }
    Ok(solution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use polars::prelude::Column;

    fn overlapping_data() -> (Array2<f64>, Array1<f64>) {
        let feature = [-2.0, -1.5, -1.0, -0.5, 0.0, 0.2, 0.5, 1.0, 1.5, 2.0];
        let y = array![0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0];
        let mut x = Array2::ones((feature.len(), 2));
        for (i, &f) in feature.iter().enumerate() {
            x[[i, 1]] = f;
        }
        (x, y)
    }

    #[test]
    fn maximum_likelihood_solves_score_equations() {
        let (x, y) = overlapping_data();
        let backend = MaximumLikelihood {
            max_iterations: 50,
            tolerance: 1e-12,
        };
        let fit = backend.fit(x.view(), y.view()).unwrap();
        assert!(fit.converged);
        assert!(fit.coefficients[1] > 0.0);

        // At the MLE, X'(y - mu) vanishes.
        let mu = backend.score(&fit, x.view());
        let gradient = x.t().dot(&(&y - &mu));
        assert_abs_diff_eq!(gradient[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(gradient[1], 0.0, epsilon = 1e-6);
        assert!(mu.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn duplicated_column_is_singular() {
        let (x, y) = overlapping_data();
        let mut collinear = Array2::ones((x.nrows(), 3));
        collinear.column_mut(1).assign(&x.column(1));
        collinear.column_mut(2).assign(&x.column(1));
        let backend = MaximumLikelihood {
            max_iterations: 50,
            tolerance: 1e-8,
        };
        assert!(matches!(
            backend.fit(collinear.view(), y.view()),
            Err(FitError::SingularDesign(_))
        ));
    }

    #[test]
    fn separated_data_keeps_the_capped_fit() {
        let x = array![[1.0, -2.0], [1.0, -1.0], [1.0, 1.0], [1.0, 2.0]];
        let y = array![0.0, 0.0, 1.0, 1.0];
        let backend = MaximumLikelihood {
            max_iterations: 50,
            tolerance: 1e-8,
        };
        let fit = backend.fit(x.view(), y.view()).unwrap();
        assert!(fit.separated);
        assert!(fit.iterations <= 50);
        assert!(fit.coefficients.iter().all(|b| b.is_finite()));

        let probabilities = backend.score(&fit, x.view());
        assert!(probabilities[0] < 0.01 && probabilities[1] < 0.01);
        assert!(probabilities[2] > 0.99 && probabilities[3] > 0.99);
    }

    #[test]
    fn overlapping_classes_are_not_flagged_as_separated() {
        let (x, y) = overlapping_data();
        let backend = MaximumLikelihood {
            max_iterations: 50,
            tolerance: 1e-8,
        };
        assert!(!backend.fit(x.view(), y.view()).unwrap().separated);
    }

    #[test]
    fn ridge_survives_collinearity_and_emits_labels() {
        let (x, y) = overlapping_data();
        let mut collinear = Array2::ones((x.nrows(), 3));
        collinear.column_mut(1).assign(&x.column(1));
        collinear.column_mut(2).assign(&x.column(1));
        let backend = RidgeClassifier {
            inverse_strength: 1.0,
            max_iterations: 100,
            tolerance: 1e-6,
        };
        assert_eq!(backend.score_kind(), ScoreKind::HardLabel);
        let (labels, fit) = backend
            .fit_and_score(collinear.view(), y.view(), collinear.view())
            .unwrap();
        assert!(fit.converged);
        // Identical columns share the penalized weight equally.
        assert_abs_diff_eq!(fit.coefficients[1], fit.coefficients[2], epsilon = 1e-6);
        assert!(labels.iter().all(|&l| l == 0.0 || l == 1.0));
        assert_eq!(labels[0], 0.0);
        assert_eq!(labels[9], 1.0);
    }

    #[test]
    fn fit_predict_logit_scores_every_test_row() {
        let train = DataFrame::new(vec![
            Column::new("target".into(), vec![0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0]),
            Column::new(
                "b".into(),
                vec![-2.0, -1.5, -1.0, -0.5, 0.0, 0.2, 0.5, 1.0, 1.5, 2.0],
            ),
        ])
        .unwrap();
        let test = DataFrame::new(vec![
            Column::new("target".into(), vec![0.0, 1.0, 1.0]),
            Column::new("b".into(), vec![-3.0, 0.1, 3.0]),
        ])
        .unwrap();
        let config = EvaluationConfig::default();
        for penalty in Penalty::ALL {
            let (preds, model) =
                fit_predict_logit(&train, &test, "target ~ b", penalty, &config).unwrap();
            assert_eq!(preds.len(), 3);
            assert_eq!(model.column_names, vec!["Intercept", "b"]);
            assert_eq!(model.penalty, penalty);
            assert!(preds[0] < preds[2]);
        }
    }
}
