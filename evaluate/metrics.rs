use ndarray::{Array1, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("ROC-AUC is undefined when the target holds a single class.")]
    SingleClass,
    #[error("Length mismatch: {truth} targets but {scores} scores.")]
    LengthMismatch { truth: usize, scores: usize },
}

/// Hard 0/1 predictions: `score >= threshold`.
pub fn binarize(scores: ArrayView1<f64>, threshold: f64) -> Array1<f64> {
    scores.mapv(|s| if s >= threshold { 1.0 } else { 0.0 })
}

/// F1 of the positive class. Zero when there are no true positives, which
/// includes the degenerate case of no positives predicted or present.
pub fn f1_score(y_true: ArrayView1<f64>, y_pred: ArrayView1<f64>) -> Result<f64, MetricError> {
    check_lengths(y_true, y_pred)?;
    let (mut tp, mut fp, mut fn_) = (0usize, 0usize, 0usize);
    for (&truth, &pred) in y_true.iter().zip(y_pred.iter()) {
        match (truth > 0.5, pred > 0.5) {
            (true, true) => tp += 1,
            (false, true) => fp += 1,
            (true, false) => fn_ += 1,
            (false, false) => {}
        }
    }
    if tp == 0 {
        return Ok(0.0);
    }
    Ok(2.0 * tp as f64 / (2 * tp + fp + fn_) as f64)
}

/// Area under the ROC curve via the Mann-Whitney U statistic, with tied
/// scores sharing their average rank.
pub fn roc_auc(y_true: ArrayView1<f64>, scores: ArrayView1<f64>) -> Result<f64, MetricError> {
    check_lengths(y_true, scores)?;
    let n = y_true.len();
    let n_pos = y_true.iter().filter(|&&t| t > 0.5).count() as f64;
    let n_neg = n as f64 - n_pos;
    if n_pos == 0.0 || n_neg == 0.0 {
        return Err(MetricError::SingleClass);
    }

    let mut idx: Vec<usize> = (0..n).collect();
    idx.sort_by(|&i, &j| scores[i].total_cmp(&scores[j]));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && scores[idx[j]] == scores[idx[i]] {
            j += 1;
        }
        let avg_rank = (i + j - 1) as f64 / 2.0 + 1.0;
        for &k in &idx[i..j] {
            ranks[k] = avg_rank;
        }
        i = j;
    }

    let sum_ranks_pos: f64 = (0..n).filter(|&k| y_true[k] > 0.5).map(|k| ranks[k]).sum();
    Ok((sum_ranks_pos - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

fn check_lengths(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Result<(), MetricError> {
    if a.len() != b.len() {
        return Err(MetricError::LengthMismatch {
            truth: a.len(),
            scores: b.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn f1_matches_hand_count() {
        let y = array![1.0, 1.0, 0.0, 0.0, 1.0];
        let p = array![1.0, 0.0, 1.0, 0.0, 1.0];
        // tp = 2, fp = 1, fn = 1
        assert_abs_diff_eq!(f1_score(y.view(), p.view()).unwrap(), 4.0 / 6.0);
    }

    #[test]
    fn f1_is_zero_without_predicted_positives() {
        let y = array![1.0, 0.0];
        let p = array![0.0, 0.0];
        assert_eq!(f1_score(y.view(), p.view()).unwrap(), 0.0);
    }

    #[test]
    fn auc_of_perfect_and_inverted_rankings() {
        let y = array![0.0, 0.0, 1.0, 1.0];
        assert_abs_diff_eq!(roc_auc(y.view(), array![0.1, 0.2, 0.8, 0.9].view()).unwrap(), 1.0);
        assert_abs_diff_eq!(roc_auc(y.view(), array![0.9, 0.8, 0.2, 0.1].view()).unwrap(), 0.0);
    }

    #[test]
    fn constant_scores_give_half() {
        let y = array![0.0, 1.0, 0.0, 1.0];
        let s = Array1::zeros(4);
        assert_abs_diff_eq!(roc_auc(y.view(), s.view()).unwrap(), 0.5);
    }

    #[test]
    fn hard_labels_give_balanced_accuracy_auc() {
        // With 0/1 scores the AUC collapses to (TPR + TNR) / 2.
        let y = array![1.0, 1.0, 0.0, 0.0];
        let s = array![1.0, 0.0, 0.0, 0.0];
        assert_abs_diff_eq!(roc_auc(y.view(), s.view()).unwrap(), 0.75);
    }

    #[test]
    fn single_class_is_rejected() {
        let y = array![1.0, 1.0];
        assert_eq!(
            roc_auc(y.view(), array![0.2, 0.4].view()),
            Err(MetricError::SingleClass)
        );
    }

    #[test]
    fn binarize_uses_inclusive_threshold() {
        let s = array![0.49, 0.5, 0.51];
        assert_eq!(binarize(s.view(), 0.5), array![0.0, 1.0, 1.0]);
    }
}
