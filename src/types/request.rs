//! Inference request envelope received from the bus

use serde::{Deserialize, Serialize};

use crate::contract::RawFeatures;
use crate::registry::Stage;

/// One patient scoring request.
///
/// `features` is the flat field mapping validated by the feature contract;
/// the envelope itself carries routing data only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Caller-supplied correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Stage to score with; Production when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,

    pub features: RawFeatures,
}

impl InferenceRequest {
    pub fn new(features: RawFeatures) -> Self {
        Self {
            request_id: None,
            stage: None,
            features,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Requested stage, defaulting to Production
    pub fn stage(&self) -> Stage {
        self.stage.unwrap_or(Stage::Production)
    }

    /// Caller id, or a fresh one when the caller sent none
    pub fn request_id(&self) -> String {
        self.request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_envelope() {
        let req: InferenceRequest = serde_json::from_value(json!({
            "features": {"age": 72, "gender": 1}
        }))
        .unwrap();

        assert_eq!(req.stage(), Stage::Production);
        assert!(req.request_id.is_none());
        assert!(!req.request_id().is_empty());
        assert_eq!(req.features.len(), 2);
    }

    #[test]
    fn test_explicit_stage_and_id() {
        let req: InferenceRequest = serde_json::from_value(json!({
            "request_id": "abc",
            "stage": "staging",
            "features": {}
        }))
        .unwrap();

        assert_eq!(req.stage(), Stage::Staging);
        assert_eq!(req.request_id(), "abc");
    }
}
