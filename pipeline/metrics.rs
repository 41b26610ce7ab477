//! Held-out evaluation of a trained classifier.
//!
//! Everything here is computed once, at the end of training, and persisted next
//! to the model. Serving code only ever reads a `MetricsBundle`.

use itertools::Itertools;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MODEL_NAME: &str = "Random Forest";

#[derive(Error, Debug, PartialEq)]
pub enum MetricsError {
    #[error("Cannot evaluate on an empty set of predictions.")]
    Empty,
    #[error("Length mismatch: {truth} true labels, {predicted} predictions.")]
    LengthMismatch { truth: usize, predicted: usize },
    #[error("ROC-AUC is undefined when the held-out labels contain a single class.")]
    SingleClass,
    #[error("{importances} importances were given for {names} feature names.")]
    ImportanceMismatch { importances: usize, names: usize },
}

/// Precision, recall and F1 for one class (or an average over classes).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub rejected: ClassMetrics,
    pub approved: ClassMetrics,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

/// Everything reported about a trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsBundle {
    pub model_name: String,
    pub accuracy: f64,
    pub roc_auc: f64,
    pub train_samples: usize,
    pub test_samples: usize,
    /// Rows are true labels, columns predictions; index 0 is rejected, 1 approved.
    pub confusion_matrix: [[usize; 2]; 2],
    pub classification_report: ClassificationReport,
    /// Sorted by descending importance.
    pub feature_importance: Vec<FeatureImportance>,
}

impl MetricsBundle {
    /// Scores held-out predictions and ranks the forest's feature importances.
    pub fn evaluate(
        y_true: ArrayView1<u8>,
        y_pred: ArrayView1<u8>,
        probabilities: ArrayView1<f64>,
        importances: &[f64],
        feature_names: &[String],
        train_samples: usize,
    ) -> Result<Self, MetricsError> {
        let confusion = confusion_matrix(y_true, y_pred)?;
        if probabilities.len() != y_true.len() {
            return Err(MetricsError::LengthMismatch {
                truth: y_true.len(),
                predicted: probabilities.len(),
            });
        }

        let bundle = Self {
            model_name: MODEL_NAME.to_string(),
            accuracy: accuracy(y_true, y_pred)?,
            roc_auc: roc_auc(y_true, probabilities)?,
            train_samples,
            test_samples: y_true.len(),
            confusion_matrix: confusion,
            classification_report: classification_report(&confusion),
            feature_importance: rank_importances(importances, feature_names)?,
        };
        log::info!(
            "Held-out accuracy {:.4}, ROC-AUC {:.4} on {} samples",
            bundle.accuracy,
            bundle.roc_auc,
            bundle.test_samples
        );
        Ok(bundle)
    }
}

fn check_lengths(truth: usize, predicted: usize) -> Result<(), MetricsError> {
    if truth != predicted {
        return Err(MetricsError::LengthMismatch { truth, predicted });
    }
    if truth == 0 {
        return Err(MetricsError::Empty);
    }
    Ok(())
}

pub fn accuracy(y_true: ArrayView1<u8>, y_pred: ArrayView1<u8>) -> Result<f64, MetricsError> {
    check_lengths(y_true.len(), y_pred.len())?;
    let correct = y_true.iter().zip(y_pred.iter()).filter(|(a, b)| a == b).count();
    Ok(correct as f64 / y_true.len() as f64)
}

pub fn confusion_matrix(
    y_true: ArrayView1<u8>,
    y_pred: ArrayView1<u8>,
) -> Result<[[usize; 2]; 2], MetricsError> {
    check_lengths(y_true.len(), y_pred.len())?;
    let mut matrix = [[0usize; 2]; 2];
    for (&truth, &predicted) in y_true.iter().zip(y_pred.iter()) {
        matrix[usize::from(truth == 1)][usize::from(predicted == 1)] += 1;
    }
    Ok(matrix)
}

/// Area under the ROC curve via the Mann-Whitney rank statistic.
/// Tied scores share the average of their ranks.
pub fn roc_auc(y_true: ArrayView1<u8>, scores: ArrayView1<f64>) -> Result<f64, MetricsError> {
    check_lengths(y_true.len(), scores.len())?;
    let positives = y_true.iter().filter(|&&label| label == 1).count();
    let negatives = y_true.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(MetricsError::SingleClass);
    }

    let order: Vec<usize> = (0..scores.len())
        .sorted_by(|&a, &b| scores[a].total_cmp(&scores[b]))
        .collect();

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // 1-based ranks start+1 ..= end share their mean.
        let rank = (start + 1 + end) as f64 / 2.0;
        let tied_positives = order[start..end].iter().filter(|&&i| y_true[i] == 1).count();
        positive_rank_sum += rank * tied_positives as f64;
        start = end;
    }

    let (p, n) = (positives as f64, negatives as f64);
    Ok((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn class_metrics(matrix: &[[usize; 2]; 2], class: usize) -> ClassMetrics {
    let true_positive = matrix[class][class];
    let support = matrix[class][0] + matrix[class][1];
    let predicted = matrix[0][class] + matrix[1][class];
    let precision = ratio(true_positive, predicted);
    let recall = ratio(true_positive, support);
    let f1_score = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };
    ClassMetrics {
        precision,
        recall,
        f1_score,
        support,
    }
}

pub fn classification_report(matrix: &[[usize; 2]; 2]) -> ClassificationReport {
    let rejected = class_metrics(matrix, 0);
    let approved = class_metrics(matrix, 1);
    let total = rejected.support + approved.support;

    let macro_avg = ClassMetrics {
        precision: (rejected.precision + approved.precision) / 2.0,
        recall: (rejected.recall + approved.recall) / 2.0,
        f1_score: (rejected.f1_score + approved.f1_score) / 2.0,
        support: total,
    };

    let weight = |metric: fn(&ClassMetrics) -> f64| {
        if total == 0 {
            0.0
        } else {
            (metric(&rejected) * rejected.support as f64
                + metric(&approved) * approved.support as f64)
                / total as f64
        }
    };
    let weighted_avg = ClassMetrics {
        precision: weight(|m| m.precision),
        recall: weight(|m| m.recall),
        f1_score: weight(|m| m.f1_score),
        support: total,
    };

    ClassificationReport {
        rejected,
        approved,
        macro_avg,
        weighted_avg,
    }
}

/// Pairs importances with feature names, most important first.
/// Equal importances keep schema order.
pub fn rank_importances(
    importances: &[f64],
    feature_names: &[String],
) -> Result<Vec<FeatureImportance>, MetricsError> {
    if importances.len() != feature_names.len() {
        return Err(MetricsError::ImportanceMismatch {
            importances: importances.len(),
            names: feature_names.len(),
        });
    }
    Ok(feature_names
        .iter()
        .zip(importances)
        .map(|(feature, &importance)| FeatureImportance {
            feature: feature.clone(),
            importance,
        })
        .sorted_by(|a, b| b.importance.total_cmp(&a.importance))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn perfect_ranking_has_unit_auc() {
        let y = array![0u8, 0, 1, 1];
        let scores = array![0.1, 0.2, 0.8, 0.9];
        assert_abs_diff_eq!(roc_auc(y.view(), scores.view()).unwrap(), 1.0);
    }

    #[test]
    fn ties_share_ranks() {
        let y = array![0u8, 1, 0, 1];
        let scores = array![0.5, 0.5, 0.5, 0.5];
        assert_abs_diff_eq!(roc_auc(y.view(), scores.view()).unwrap(), 0.5);

        let y = array![0u8, 0, 1, 1];
        let scores = array![0.1, 0.4, 0.35, 0.8];
        assert_abs_diff_eq!(roc_auc(y.view(), scores.view()).unwrap(), 0.75);
    }

    #[test]
    fn auc_needs_both_classes() {
        let y = array![1u8, 1];
        let scores = array![0.2, 0.9];
        assert_eq!(
            roc_auc(y.view(), scores.view()),
            Err(MetricsError::SingleClass)
        );
    }

    #[test]
    fn confusion_rows_are_true_labels() {
        let y_true = array![0u8, 0, 1, 1, 1];
        let y_pred = array![0u8, 1, 1, 1, 0];
        assert_eq!(
            confusion_matrix(y_true.view(), y_pred.view()).unwrap(),
            [[1, 1], [1, 2]]
        );
        assert_abs_diff_eq!(
            accuracy(y_true.view(), y_pred.view()).unwrap(),
            0.6,
            epsilon = 1e-12
        );
    }

    #[test]
    fn report_matches_hand_computation() {
        let report = classification_report(&[[1, 1], [1, 2]]);
        assert_abs_diff_eq!(report.rejected.precision, 0.5);
        assert_abs_diff_eq!(report.rejected.recall, 0.5);
        assert_abs_diff_eq!(report.approved.precision, 2.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(report.approved.recall, 2.0 / 3.0, epsilon = 1e-12);
        assert_eq!(report.approved.support, 3);
        assert_abs_diff_eq!(
            report.macro_avg.f1_score,
            (0.5 + 2.0 / 3.0) / 2.0,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            report.weighted_avg.recall,
            (0.5 * 2.0 + 2.0 / 3.0 * 3.0) / 5.0,
            epsilon = 1e-12
        );
        assert_eq!(report.weighted_avg.support, 5);
    }

    #[test]
    fn zero_denominators_report_zero() {
        // Nothing is ever predicted as rejected.
        let report = classification_report(&[[0, 2], [0, 3]]);
        assert_eq!(report.rejected.precision, 0.0);
        assert_eq!(report.rejected.recall, 0.0);
        assert_eq!(report.rejected.f1_score, 0.0);
    }

    #[test]
    fn importances_are_ranked() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ranked = rank_importances(&[0.2, 0.5, 0.3], &names).unwrap();
        let order: Vec<&str> = ranked.iter().map(|f| f.feature.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
        assert!(rank_importances(&[1.0], &names).is_err());
    }

    #[test]
    fn bundle_round_trips_through_toml() {
        let y_true = array![0u8, 1, 1, 0];
        let y_pred = array![0u8, 1, 0, 0];
        let proba = array![0.2, 0.9, 0.4, 0.1];
        let names = vec!["x".to_string(), "y".to_string()];
        let bundle = MetricsBundle::evaluate(
            y_true.view(),
            y_pred.view(),
            proba.view(),
            &[0.25, 0.75],
            &names,
            16,
        )
        .unwrap();
        assert_eq!(bundle.model_name, MODEL_NAME);
        assert_eq!(bundle.test_samples, 4);
        assert_eq!(bundle.feature_importance[0].feature, "y");

        let text = toml::to_string_pretty(&bundle).unwrap();
        let restored: MetricsBundle = toml::from_str(&text).unwrap();
        assert_eq!(restored, bundle);
    }
}
