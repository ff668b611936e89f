//! Scorer artifact codec

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::logistic::LogisticModel;
use crate::models::scorer::Scorer;

/// Serialized form of every scorer the pipeline knows how to load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", content = "params", rename_all = "snake_case")]
pub enum ScorerArtifact {
    LogisticRegression(LogisticModel),
}

impl ScorerArtifact {
    /// Materialize the artifact into a live scorer
    pub fn into_scorer(self) -> Arc<dyn Scorer> {
        match self {
            ScorerArtifact::LogisticRegression(model) => Arc::new(model),
        }
    }
}

/// Artifact bytes could not be encoded or decoded
#[derive(Debug, Error)]
#[error("artifact codec error: {0}")]
pub struct ArtifactError(#[from] serde_json::Error);

/// Loader turning artifact bytes into scorers and back
#[derive(Debug, Clone, Default)]
pub struct ModelLoader;

impl ModelLoader {
    pub fn new() -> Self {
        Self
    }

    /// Encode a scorer as artifact bytes
    pub fn encode(&self, scorer: &dyn Scorer) -> Result<Vec<u8>, ArtifactError> {
        let bytes = serde_json::to_vec(&scorer.artifact())?;
        debug!(scorer = scorer.name(), bytes = bytes.len(), "Encoded scorer artifact");
        Ok(bytes)
    }

    /// Decode artifact bytes into a scorer
    pub fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn Scorer>, ArtifactError> {
        let artifact: ScorerArtifact = serde_json::from_slice(bytes)?;
        let scorer = artifact.into_scorer();
        info!(
            scorer = scorer.name(),
            features = scorer.feature_names().len(),
            "Scorer loaded from artifact"
        );
        Ok(scorer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::logistic::Scaler;

    fn model() -> LogisticModel {
        LogisticModel {
            feature_names: vec!["age".to_string()],
            scaler: Scaler {
                mean: vec![50.0],
                std: vec![10.0],
            },
            weights: vec![0.8],
            bias: -0.2,
        }
    }

    #[test]
    fn test_decoded_scorer_scores_like_original() {
        let loader = ModelLoader::new();
        let original = model();
        let bytes = loader.encode(&original).unwrap();
        let loaded = loader.decode(&bytes).unwrap();

        assert_eq!(loaded.name(), "logistic_regression");
        assert_eq!(loaded.score(&[72.0]).unwrap(), original.score(&[72.0]).unwrap());
    }

    #[test]
    fn test_artifact_is_tagged_by_algorithm() {
        let bytes = ModelLoader::new().encode(&model()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["algorithm"], "logistic_regression");
    }

    #[test]
    fn test_garbage_bytes_fail() {
        assert!(ModelLoader::new().decode(b"not json").is_err());
    }
}
