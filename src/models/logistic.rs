//! Standardized, L2-regularized logistic regression.
//!
//! Fitted by full-batch gradient descent from a zero start, so the same data
//! and hyper-parameters always produce the same weights.

use serde::{Deserialize, Serialize};

use crate::models::loader::ScorerArtifact;
use crate::models::scorer::{checked_probability, Scorer, ScoringError, Trainer};
use crate::training::TrainingError;

/// Per-column mean/std standardization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl Scaler {
    /// Minimum stddev to avoid division by zero on constant columns.
    const MIN_STD: f64 = 1e-6;

    /// Fit from rows of equal width. Callers guarantee `x` is non-empty.
    pub fn fit(x: &[Vec<f64>]) -> Self {
        let ncols = x.first().map_or(0, Vec::len);
        let n = x.len() as f64;

        let mut mean = vec![0.0; ncols];
        for row in x {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v;
            }
        }
        for m in mean.iter_mut() {
            *m /= n;
        }

        let mut var = vec![0.0; ncols];
        for row in x {
            for ((acc, v), m) in var.iter_mut().zip(row).zip(&mean) {
                let d = v - m;
                *acc += d * d;
            }
        }
        let std = var
            .into_iter()
            .map(|v| (v / n).sqrt().max(Self::MIN_STD))
            .collect();

        Self { mean, std }
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }
}

/// Fitted logistic regression parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub feature_names: Vec<String>,
    pub scaler: Scaler,
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl LogisticModel {
    fn logit(&self, z: &[f64]) -> f64 {
        self.weights.iter().zip(z).map(|(w, v)| w * v).sum::<f64>() + self.bias
    }
}

fn sigmoid(t: f64) -> f64 {
    if t >= 0.0 {
        1.0 / (1.0 + (-t).exp())
    } else {
        let e = t.exp();
        e / (1.0 + e)
    }
}

impl Scorer for LogisticModel {
    fn name(&self) -> &str {
        "logistic_regression"
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn score(&self, features: &[f64]) -> Result<f64, ScoringError> {
        if features.len() != self.weights.len() {
            return Err(ScoringError::FeatureCount {
                expected: self.weights.len(),
                got: features.len(),
            });
        }
        let z = self.scaler.transform(features);
        checked_probability(sigmoid(self.logit(&z)))
    }

    fn artifact(&self) -> ScorerArtifact {
        ScorerArtifact::LogisticRegression(self.clone())
    }
}

/// Hyper-parameters for [`LogisticModel`] fitting
#[derive(Debug, Clone, PartialEq)]
pub struct LogisticTrainer {
    pub learning_rate: f64,
    pub epochs: usize,
    pub l2: f64,
}

impl Default for LogisticTrainer {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            epochs: 500,
            l2: 1e-3,
        }
    }
}

impl Trainer for LogisticTrainer {
    fn fit(
        &self,
        x: &[Vec<f64>],
        y: &[bool],
        feature_names: Vec<String>,
    ) -> Result<Box<dyn Scorer>, TrainingError> {
        if x.is_empty() {
            return Err(TrainingError::EmptyDataset);
        }
        if x.len() != y.len() {
            return Err(TrainingError::LabelCountMismatch {
                rows: x.len(),
                labels: y.len(),
            });
        }
        let ncols = feature_names.len();
        if let Some(row) = x.iter().find(|row| row.len() != ncols) {
            return Err(TrainingError::RaggedRows {
                expected: ncols,
                got: row.len(),
            });
        }

        let scaler = Scaler::fit(x);
        let z: Vec<Vec<f64>> = x.iter().map(|row| scaler.transform(row)).collect();
        let n = z.len() as f64;

        let mut model = LogisticModel {
            feature_names,
            scaler,
            weights: vec![0.0; ncols],
            bias: 0.0,
        };

        for _ in 0..self.epochs {
            let mut grad_w = vec![0.0; ncols];
            let mut grad_b = 0.0;

            for (row, &label) in z.iter().zip(y) {
                let err = sigmoid(model.logit(row)) - if label { 1.0 } else { 0.0 };
                for (g, v) in grad_w.iter_mut().zip(row) {
                    *g += err * v;
                }
                grad_b += err;
            }

            for (w, g) in model.weights.iter_mut().zip(&grad_w) {
                *w -= self.learning_rate * (g / n + self.l2 * *w);
            }
            model.bias -= self.learning_rate * grad_b / n;
        }

        if model.weights.iter().any(|w| !w.is_finite()) || !model.bias.is_finite() {
            return Err(TrainingError::Diverged);
        }

        Ok(Box::new(model))
    }
}
