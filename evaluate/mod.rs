//! # Cross-Validated Model Evaluation
//!
//! Ranks candidate feature sets for predicting in-hospital COVID-19 death.
//! Each model specification is fitted twice, without a penalty and with an
//! L2 penalty, under k-fold cross-validation. The out-of-fold scores of all
//! folds are pooled and summarized by the F1 score of the positive class
//! and by ROC-AUC.
//!
//! The row order is shuffled exactly once per call, before any fold is
//! formed, so every specification and penalty sees the same folds and their
//! metrics are directly comparable.

pub mod crossval;
pub mod formula;
pub mod logit;
pub mod metrics;

use crossval::{CrossValidatedScores, FoldError, all_folds_failed, cross_validate, shuffled_order};
use formula::{Formula, FormulaError, ModelFrame, binary_column};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use logit::{Penalty, ScoreKind};
use metrics::{MetricError, binarize, f1_score, roc_auc};
use ndarray::Array1;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Target column produced by the episode table.
pub const DEFAULT_TARGET: &str = "is_covid_death";

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("Target column '{column}' is unusable: {source}")]
    Target {
        column: String,
        #[source]
        source: FormulaError,
    },
    #[error("Model specification '{name}' has an invalid formula: {source}")]
    InvalidFormula {
        name: String,
        #[source]
        source: FormulaError,
    },
    #[error(transparent)]
    Folds(#[from] FoldError),
    #[error(transparent)]
    Metric(#[from] MetricError),
}

/// Tuning of the evaluation. The defaults are the settings the model
/// comparison was designed around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub n_folds: usize,
    /// Iteration cap of the unpenalized fit.
    pub max_iterations: usize,
    pub convergence_tolerance: f64,
    /// `C` of the L2 fit; larger means weaker regularization.
    pub l2_inverse_strength: f64,
    pub l2_max_iterations: usize,
    pub l2_tolerance: f64,
    /// Scores at or above this are predicted deaths.
    pub threshold: f64,
    /// Seed of the global shuffle; `None` draws from the OS.
    pub seed: Option<u64>,
    pub show_progress: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            n_folds: 20,
            max_iterations: 50,
            convergence_tolerance: 1e-8,
            l2_inverse_strength: 1.0,
            l2_max_iterations: 100,
            l2_tolerance: 1e-4,
            threshold: 0.5,
            seed: None,
            show_progress: false,
        }
    }
}

/// A named formula such as `is_covid_death ~ gender + race + age`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub formula: String,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            formula: formula.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub model_name: String,
    pub l2: bool,
    pub f1: f64,
    pub roc_auc: f64,
    /// ROC-AUC was computed on 0/1 predictions, so it reduces to balanced
    /// accuracy at a single operating point.
    pub hard_label: bool,
    /// Folds that fell back to all-negative scores.
    pub failed_folds: usize,
}

/// Evaluates every specification with and without an L2 penalty.
///
/// Returns exactly two results per specification. Formula parse errors are
/// reported up front; anything that goes wrong while fitting an individual
/// fold only degrades that fold and is counted in `failed_folds`.
pub fn evaluate_models(
    df: &DataFrame,
    specs: &[ModelSpec],
    target_name: &str,
    config: &EvaluationConfig,
) -> Result<Vec<EvaluationResult>, EvaluationError> {
    let formulas = specs
        .iter()
        .map(|spec| {
            spec.formula
                .parse::<Formula>()
                .map_err(|source| EvaluationError::InvalidFormula {
                    name: spec.name.clone(),
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let target_formula = Formula {
        target: target_name.to_string(),
        intercept: true,
        terms: Vec::new(),
    };
    let target_error = |source| EvaluationError::Target {
        column: target_name.to_string(),
        source,
    };
    let target_frame = ModelFrame::from_dataframe(df, &target_formula).map_err(target_error)?;

    let order = shuffled_order(df.height(), config.seed);
    let y_true = binary_column(&target_frame, target_name, &order).map_err(target_error)?;

    log::info!(
        "Evaluating {} model specifications on {} rows with {}-fold cross-validation",
        specs.len(),
        df.height(),
        config.n_folds
    );

    let progress = if config.show_progress {
        ProgressBar::with_draw_target(Some(specs.len() as u64), ProgressDrawTarget::stderr())
    } else {
        ProgressBar::hidden()
    };
    progress.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} models {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut results = Vec::with_capacity(specs.len() * Penalty::ALL.len());
    for (spec, formula) in specs.iter().zip(&formulas) {
        progress.set_message(spec.name.clone());
        let frame = ModelFrame::from_dataframe(df, formula);

        for penalty in Penalty::ALL {
            let cv = match &frame {
                Ok(frame) => cross_validate(frame, formula, &order, penalty, config)?,
                Err(err) => all_folds_failed(df.height(), penalty, config, err)?,
            };
            let result = summarize(&spec.name, penalty, &cv, &y_true, config.threshold)?;
            log::info!(
                "{:<24} penalty={:<4} f1={:.4} roc_auc={:.4}",
                result.model_name,
                penalty,
                result.f1,
                result.roc_auc
            );
            results.push(result);
        }
        progress.inc(1);
    }
    progress.finish_and_clear();

    Ok(results)
}

fn summarize(
    name: &str,
    penalty: Penalty,
    cv: &CrossValidatedScores,
    y_true: &Array1<f64>,
    threshold: f64,
) -> Result<EvaluationResult, MetricError> {
    if cv.failed_folds > 0 {
        log::warn!(
            "Model '{}' ({} penalty): {} folds could not be fitted and were scored as negatives",
            name,
            penalty,
            cv.failed_folds
        );
    }
    let hard_label = cv.kind == ScoreKind::HardLabel;
    if hard_label {
        log::info!(
            "Model '{name}' ({penalty} penalty): ROC-AUC is computed on 0/1 labels and is not comparable to probability-based AUC"
        );
    }

    let y_pred = binarize(cv.scores.view(), threshold);
    Ok(EvaluationResult {
        model_name: name.to_string(),
        l2: penalty.is_l2(),
        f1: f1_score(y_true.view(), y_pred.view())?,
        roc_auc: roc_auc(y_true.view(), cv.scores.view())?,
        hard_label,
        failed_folds: cv.failed_folds,
    })
}

/// Orders results by ROC-AUC, best first, breaking ties by F1.
pub fn rank_results(results: &mut [EvaluationResult]) {
    results.sort_by(|a, b| {
        b.roc_auc
            .total_cmp(&a.roc_auc)
            .then_with(|| b.f1.total_cmp(&a.f1))
    });
}

/// Results as a table, for printing or CSV export.
pub fn results_dataframe(results: &[EvaluationResult]) -> PolarsResult<DataFrame> {
    DataFrame::new(vec![
        Column::new(
            "model_name".into(),
            results.iter().map(|r| r.model_name.clone()).collect::<Vec<_>>(),
        ),
        Column::new("l2".into(), results.iter().map(|r| r.l2).collect::<Vec<_>>()),
        Column::new("f1".into(), results.iter().map(|r| r.f1).collect::<Vec<_>>()),
        Column::new(
            "roc_auc".into(),
            results.iter().map(|r| r.roc_auc).collect::<Vec<_>>(),
        ),
        Column::new(
            "hard_label".into(),
            results.iter().map(|r| r.hard_label).collect::<Vec<_>>(),
        ),
        Column::new(
            "failed_folds".into(),
            results
                .iter()
                .map(|r| r.failed_folds as u32)
                .collect::<Vec<_>>(),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, f1: f64, roc_auc: f64) -> EvaluationResult {
        EvaluationResult {
            model_name: name.to_string(),
            l2: false,
            f1,
            roc_auc,
            hard_label: false,
            failed_folds: 0,
        }
    }

    #[test]
    fn ranking_is_by_auc_then_f1() {
        let mut results = vec![
            result("low", 0.9, 0.6),
            result("tie_low_f1", 0.2, 0.8),
            result("tie_high_f1", 0.5, 0.8),
        ];
        rank_results(&mut results);
        let names: Vec<&str> = results.iter().map(|r| r.model_name.as_str()).collect();
        assert_eq!(names, vec!["tie_high_f1", "tie_low_f1", "low"]);
    }

    #[test]
    fn invalid_formula_is_reported_with_its_name() {
        let df = DataFrame::new(vec![Column::new("y".into(), vec![0.0, 1.0])]).unwrap();
        let err = evaluate_models(
            &df,
            &[ModelSpec::new("broken", "y + a")],
            "y",
            &EvaluationConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EvaluationError::InvalidFormula { name, .. } if name == "broken"));
    }

    #[test]
    fn results_table_has_one_row_per_result() {
        let ridge = EvaluationResult {
            l2: true,
            hard_label: true,
            ..result("b", 0.3, 0.4)
        };
        let df = results_dataframe(&[result("a", 0.1, 0.2), ridge]).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 6);
        let hard_label: Vec<Option<bool>> =
            df.column("hard_label").unwrap().bool().unwrap().into_iter().collect();
        assert_eq!(hard_label, vec![Some(false), Some(true)]);
    }

    #[test]
    fn ridge_results_are_flagged_as_hard_label() {
        let n = 40;
        let y: Vec<f64> = (0..n).map(|i| (i % 2) as f64).collect();
        let x: Vec<f64> = (0..n).map(|i| (i % 2) as f64 + 0.1 * (i % 7) as f64).collect();
        let df = DataFrame::new(vec![
            Column::new("y".into(), y),
            Column::new("x".into(), x),
        ])
        .unwrap();
        let config = EvaluationConfig {
            n_folds: 4,
            seed: Some(2),
            ..EvaluationConfig::default()
        };
        let results =
            evaluate_models(&df, &[ModelSpec::new("x", "y ~ x")], "y", &config).unwrap();
        assert_eq!(results.len(), 2);
        for result in &results {
            assert_eq!(result.hard_label, result.l2);
        }
    }
}
