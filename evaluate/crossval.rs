use super::EvaluationConfig;
use super::formula::{DesignLayout, Formula, FormulaError, ModelFrame};
use super::logit::{FitError, Penalty, ScoreKind};
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FoldError {
    #[error("Cannot split {rows} rows into {folds} folds.")]
    TooFewRows { rows: usize, folds: usize },
    #[error("At least two folds are required, got {0}.")]
    TooFewFolds(usize),
}

/// One train/test split, expressed as positions into the (shuffled) row order.
#[derive(Debug, Clone, PartialEq)]
pub struct Fold {
    pub test: Range<usize>,
    pub train: Vec<usize>,
}

/// Contiguous k-fold partitioning without reshuffling. The first `n % k`
/// folds are one row larger than the rest.
#[derive(Debug, Clone, Copy)]
pub struct KFold {
    pub n_splits: usize,
}

impl KFold {
    pub fn new(n_splits: usize) -> Self {
        Self { n_splits }
    }

    pub fn split(&self, n: usize) -> Result<Vec<Fold>, FoldError> {
        if self.n_splits < 2 {
            return Err(FoldError::TooFewFolds(self.n_splits));
        }
        if n < self.n_splits {
            return Err(FoldError::TooFewRows {
                rows: n,
                folds: self.n_splits,
            });
        }

        let base = n / self.n_splits;
        let larger = n % self.n_splits;
        let mut folds = Vec::with_capacity(self.n_splits);
        let mut start = 0;
        for fold in 0..self.n_splits {
            let size = base + usize::from(fold < larger);
            let test = start..start + size;
            let train = (0..test.start).chain(test.end..n).collect();
            folds.push(Fold { test, train });
            start += size;
        }
        Ok(folds)
    }
}

/// A random permutation of `0..n`. Seeded runs are reproducible.
pub fn shuffled_order(n: usize, seed: Option<u64>) -> Vec<usize> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut rng);
    order
}

/// Out-of-fold scores for one formula and penalty.
#[derive(Debug, Clone)]
pub struct CrossValidatedScores {
    /// Indexed by position in the shuffled order.
    pub scores: Array1<f64>,
    pub kind: ScoreKind,
    /// Folds whose fit or prediction failed and were scored as all-negative.
    pub failed_folds: usize,
}

/// Runs k-fold cross-validation over `order`. A fold that cannot be fitted
/// scores zero for each of its held-out rows instead of aborting the run.
pub fn cross_validate(
    frame: &ModelFrame,
    formula: &Formula,
    order: &[usize],
    penalty: Penalty,
    config: &EvaluationConfig,
) -> Result<CrossValidatedScores, FoldError> {
    let folds = KFold::new(config.n_folds).split(order.len())?;
    let backend = penalty.backend(config);

    let outcomes: Vec<(Range<usize>, Result<Array1<f64>, FitError>)> = folds
        .into_par_iter()
        .map(|fold| {
            let train_rows: Vec<usize> = fold.train.iter().map(|&pos| order[pos]).collect();
            let test_rows = &order[fold.test.clone()];
            let outcome = (|| {
                let layout = DesignLayout::fit(formula, frame, &train_rows)?;
                let x_train = layout.design_matrix(frame, &train_rows)?;
                let y_train = layout.response(frame, &train_rows)?;
                let x_test = layout.design_matrix(frame, test_rows)?;
                let (scores, _) =
                    backend.fit_and_score(x_train.view(), y_train.view(), x_test.view())?;
                Ok::<_, FitError>(scores)
            })();
            (fold.test, outcome)
        })
        .collect();

    let mut scores = Array1::zeros(order.len());
    let mut failed_folds = 0;
    for (fold_index, (test, outcome)) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(fold_scores) => scores
                .slice_mut(ndarray::s![test.start..test.end])
                .assign(&fold_scores),
            Err(err) => {
                failed_folds += 1;
                log::debug!(
                    "Fold {} of '{}' ({} penalty) fell back to zero scores: {}",
                    fold_index,
                    formula,
                    penalty,
                    err
                );
            }
        }
    }

    Ok(CrossValidatedScores {
        scores,
        kind: backend.score_kind(),
        failed_folds,
    })
}

/// Every fold of a specification fails the same way when its columns cannot
/// even be extracted; this scores such a specification without fitting.
pub(crate) fn all_folds_failed(
    n_rows: usize,
    penalty: Penalty,
    config: &EvaluationConfig,
    err: &FormulaError,
) -> Result<CrossValidatedScores, FoldError> {
    let folds = KFold::new(config.n_folds).split(n_rows)?;
    log::debug!("All folds fall back to zero scores: {err}");
    Ok(CrossValidatedScores {
        scores: Array1::zeros(n_rows),
        kind: penalty.backend(config).score_kind(),
        failed_folds: folds.len(),
    })
}
