//! Threshold gate deciding whether a trained model may reach Production

use serde::{Deserialize, Serialize};

use super::metrics::{EvaluationMetrics, MetricName};
use crate::config::ConfigError;

/// Minimum value per metric. Every metric must reach its minimum to pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateThresholds {
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

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            auc: 0.70,
            accuracy: 0.65,
            precision: 0.60,
            recall: 0.60,
            f1: 0.60,
        }
    }
}

impl GateThresholds {
    pub fn minimum(&self, name: MetricName) -> f64 {
        match name {
            MetricName::Auc => self.auc,
            MetricName::Accuracy => self.accuracy,
            MetricName::Precision => self.precision,
            MetricName::Recall => self.recall,
            MetricName::F1 => self.f1,
        }
    }

    /// Check every threshold lies in [0, 1]
    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in MetricName::ALL {
            let value = self.minimum(name);
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError(format!(
                    "gate threshold {} = {} must be within [0, 1]",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of the gate. A failure is a result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum GateResult {
    Pass,
    Fail { violations: Vec<MetricName> },
}

impl GateResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, GateResult::Pass)
    }

    /// Violated metric names in gate order; empty on pass
    pub fn violations(&self) -> &[MetricName] {
        match self {
            GateResult::Pass => &[],
            GateResult::Fail { violations } => violations,
        }
    }
}

/// Compare metrics against thresholds. A NaN metric never passes.
pub fn gate(metrics: &EvaluationMetrics, thresholds: &GateThresholds) -> GateResult {
    let violations: Vec<MetricName> = MetricName::ALL
        .into_iter()
        .filter(|&name| !(metrics.get(name) >= thresholds.minimum(name)))
        .collect();

    if violations.is_empty() {
        GateResult::Pass
    } else {
        GateResult::Fail { violations }
    }
}
