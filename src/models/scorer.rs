//! Scorer capability shared by training, the registry and inference.
//!
//! Any algorithm plugs in by implementing [`Trainer`] (fit) and [`Scorer`]
//! (probability for one feature row). Nothing outside this module and the
//! algorithm itself depends on how a scorer computes its output.

use std::fmt;
use thiserror::Error;

use crate::models::loader::ScorerArtifact;
use crate::training::TrainingError;

/// Failure while scoring a single feature row
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoringError {
    #[error("expected {expected} features, got {got}")]
    FeatureCount { expected: usize, got: usize },

    #[error("scorer produced a non-finite or out-of-range probability: {0}")]
    InvalidProbability(f64),
}

/// A fitted model that maps a feature row to a probability in [0, 1].
pub trait Scorer: Send + Sync + fmt::Debug {
    /// Algorithm name, for logs
    fn name(&self) -> &str;

    /// Feature layout the scorer was fitted on
    fn feature_names(&self) -> &[String];

    /// Probability of the positive class for one row
    fn score(&self, features: &[f64]) -> Result<f64, ScoringError>;

    /// Serializable form of the fitted parameters
    fn artifact(&self) -> ScorerArtifact;
}

/// Fits a scorer from a labelled feature matrix.
pub trait Trainer {
    fn fit(
        &self,
        x: &[Vec<f64>],
        y: &[bool],
        feature_names: Vec<String>,
    ) -> Result<Box<dyn Scorer>, TrainingError>;
}

/// Check a raw scorer output before it leaves the scorer boundary.
pub fn checked_probability(p: f64) -> Result<f64, ScoringError> {
    if p.is_finite() && (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(ScoringError::InvalidProbability(p))
    }
}
