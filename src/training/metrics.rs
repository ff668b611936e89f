//! Holdout evaluation metrics

use serde::{Deserialize, Serialize};
use std::fmt;

/// Decision threshold used for the label-based metrics
pub const DECISION_THRESHOLD: f64 = 0.5;

/// The five gated metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricName {
    #[serde(rename = "AUC")]
    Auc,
    Accuracy,
    Precision,
    Recall,
    F1,
}

impl MetricName {
    /// Gate evaluation order
    pub const ALL: [MetricName; 5] = [
        MetricName::Auc,
        MetricName::Accuracy,
        MetricName::Precision,
        MetricName::Recall,
        MetricName::F1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Auc => "AUC",
            MetricName::Accuracy => "Accuracy",
            MetricName::Precision => "Precision",
            MetricName::Recall => "Recall",
            MetricName::F1 => "F1",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluation metrics of one training run, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    #[serde(rename = "auc", alias = "AUC")]
    pub auc: f64,
    #[serde(rename = "accuracy", alias = "Accuracy")]
    pub accuracy: f64,
    #[serde(rename = "precision", alias = "Precision")]
    pub precision: f64,
    #[serde(rename = "recall", alias = "Recall")]
    pub recall: f64,
    #[serde(rename = "f1", alias = "F1")]
    pub f1: f64,
}

impl EvaluationMetrics {
    pub fn new(auc: f64, accuracy: f64, precision: f64, recall: f64, f1: f64) -> Self {
        Self {
            auc,
            accuracy,
            precision,
            recall,
            f1,
        }
    }

    pub fn get(&self, name: MetricName) -> f64 {
        match name {
            MetricName::Auc => self.auc,
            MetricName::Accuracy => self.accuracy,
            MetricName::Precision => self.precision,
            MetricName::Recall => self.recall,
            MetricName::F1 => self.f1,
        }
    }

    /// Compute metrics from holdout labels and predicted probabilities.
    ///
    /// Label metrics use `p > 0.5` as the positive decision. Precision with no
    /// predicted positives is 0.
    pub fn evaluate(labels: &[bool], scores: &[f64]) -> Self {
        assert_eq!(labels.len(), scores.len(), "labels and scores must have equal lengths");

        let (mut tp, mut fp, mut tn, mut fn_) = (0usize, 0usize, 0usize, 0usize);
        for (&label, &score) in labels.iter().zip(scores) {
            match (label, score > DECISION_THRESHOLD) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (false, false) => tn += 1,
                (true, false) => fn_ += 1,
            }
        }

        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            auc: roc_auc(labels, scores),
            accuracy: ratio(tp + tn, labels.len()),
            precision,
            recall,
            f1,
        }
    }
}

/// Area under the ROC curve via the Mann-Whitney rank statistic.
///
/// Tied scores receive their average rank. Returns 0.5 when either class is
/// absent, since the curve is undefined there.
pub fn roc_auc(labels: &[bool], scores: &[f64]) -> f64 {
    let n_pos = labels.iter().filter(|&&l| l).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // 1-based ranks i+1 ..= j+1 share their mean
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg;
        }
        i = j + 1;
    }

    let pos_rank_sum: f64 = labels
        .iter()
        .zip(&ranks)
        .filter(|(&l, _)| l)
        .map(|(_, r)| r)
        .sum();

    let n_pos = n_pos as f64;
    (pos_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_ranking() {
        let labels = [false, false, true, true];
        let scores = [0.1, 0.2, 0.8, 0.9];
        let m = EvaluationMetrics::evaluate(&labels, &scores);
        assert_eq!(m, EvaluationMetrics::new(1.0, 1.0, 1.0, 1.0, 1.0));
    }

    #[test]
    fn test_auc_with_ties() {
        // One positive tied with one negative contributes half a pair
        let labels = [false, true, false, true];
        let scores = [0.1, 0.5, 0.5, 0.9];
        assert!((roc_auc(&labels, &scores) - 0.875).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_ranking() {
        let labels = [true, true, false, false];
        let scores = [0.1, 0.2, 0.8, 0.9];
        let m = EvaluationMetrics::evaluate(&labels, &scores);
        assert_eq!(m.auc, 0.0);
        assert_eq!(m.accuracy, 0.0);
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.f1, 0.0);
    }

    #[test]
    fn test_no_predicted_positives() {
        let labels = [true, false];
        let scores = [0.4, 0.1];
        let m = EvaluationMetrics::evaluate(&labels, &scores);
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.recall, 0.0);
        assert_eq!(m.accuracy, 0.5);
        assert_eq!(m.auc, 1.0);
    }

    #[test]
    fn test_threshold_is_strict() {
        let m = EvaluationMetrics::evaluate(&[true], &[0.5]);
        assert_eq!(m.recall, 0.0);
    }

    #[test]
    fn test_metric_names_display() {
        let names: Vec<String> = MetricName::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["AUC", "Accuracy", "Precision", "Recall", "F1"]);
    }
}
