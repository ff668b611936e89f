//! Inference engine: validated features in, categorized risk out

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::contract::{FeatureContract, FeatureVector, FieldViolation, RawFeatures, SchemaError, ViolationReason};
use crate::drift::LiveWindow;
use crate::feature_extractor::FeatureExtractor;
use crate::metrics::InferenceMetrics;
use crate::models::scorer::ScoringError;
use crate::registry::{ModelRegistry, RegistryError, Stage};
use crate::types::request::InferenceRequest;
use crate::types::risk::{ErrorBody, ErrorKind, InferenceResponse, RiskCategory, RiskCutpoints, RiskResult};

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("input schema v{input} cannot be scored by model version {model_version} (schema v{model})")]
    SchemaVersionMismatch { input: u32, model: u32, model_version: u64 },

    #[error("no model available at stage {stage}: {source}")]
    ModelUnavailable {
        stage: Stage,
        #[source]
        source: RegistryError,
    },

    #[error("model version {model_version} failed to score: {source}")]
    Scoring {
        model_version: u64,
        #[source]
        source: ScoringError,
    },
}

impl InferenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InferenceError::Schema(_) => ErrorKind::SchemaViolation,
            InferenceError::SchemaVersionMismatch { .. } => ErrorKind::SchemaVersionMismatch,
            InferenceError::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            InferenceError::Scoring { .. } => ErrorKind::ScoringFailure,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let body = ErrorBody::new(self.kind(), self.to_string());
        match self {
            InferenceError::Schema(e) => body.with_violations(e.violations.clone()),
            _ => body,
        }
    }
}

/// Audit record of one prediction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineageRecord {
    pub timestamp: DateTime<Utc>,
    pub model_version: u64,
    pub stage: Stage,
    /// blake3 of the canonical JSON of the validated input
    pub input_hash: String,
    pub probability: f64,
}

impl LineageRecord {
    pub fn new(fv: &FeatureVector, result: &RiskResult) -> Self {
        Self {
            timestamp: Utc::now(),
            model_version: result.model_version_used,
            stage: result.stage_used,
            input_hash: input_hash(fv),
            probability: result.probability,
        }
    }
}

/// Hash of a vector's canonical JSON (keys sorted)
pub fn input_hash(fv: &FeatureVector) -> String {
    let canonical = fv.to_json().to_string();
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

/// Scores requests against registry-resolved models.
///
/// `predict` is synchronous and holds no lock while scoring: the registry
/// hands out a cloned version from its current snapshot.
pub struct InferenceEngine {
    contract: FeatureContract,
    registry: Arc<ModelRegistry>,
    extractor: FeatureExtractor,
    cutpoints: RiskCutpoints,
    metrics: Arc<InferenceMetrics>,
    window: Arc<LiveWindow>,
}

impl InferenceEngine {
    pub fn new(
        contract: FeatureContract,
        registry: Arc<ModelRegistry>,
        cutpoints: RiskCutpoints,
        metrics: Arc<InferenceMetrics>,
        window: Arc<LiveWindow>,
    ) -> Self {
        info!(
            schema_version = contract.version(),
            medium = cutpoints.medium,
            high = cutpoints.high,
            "Inference engine initialized"
        );
        Self {
            contract,
            registry,
            extractor: FeatureExtractor::new(),
            cutpoints,
            metrics,
            window,
        }
    }

    pub fn contract(&self) -> &FeatureContract {
        &self.contract
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<InferenceMetrics> {
        &self.metrics
    }

    pub fn window(&self) -> &Arc<LiveWindow> {
        &self.window
    }

    /// Score one raw input with the model holding `stage`
    pub fn predict(&self, raw: &RawFeatures, stage: Stage) -> Result<RiskResult, InferenceError> {
        let start = Instant::now();

        match self.score(raw, stage) {
            Ok((result, fv)) => {
                let lineage = LineageRecord::new(&fv, &result);
                info!(
                    timestamp = %lineage.timestamp,
                    model_version = lineage.model_version,
                    stage = %lineage.stage,
                    input_hash = %lineage.input_hash,
                    probability = lineage.probability,
                    "Prediction lineage"
                );

                self.metrics
                    .record_prediction(start.elapsed(), result.probability, result.category);
                self.window.push(fv);
                Ok(result)
            }
            Err(e) => {
                self.metrics.record_error(e.kind(), start.elapsed());
                if e.kind().is_client_error() {
                    debug!(error = %e, "Rejected inference request");
                } else {
                    warn!(error = %e, "Inference failed");
                }
                Err(e)
            }
        }
    }

    /// Score several inputs; each resolves the stage independently
    pub fn predict_batch(&self, raws: &[RawFeatures], stage: Stage) -> Vec<Result<RiskResult, InferenceError>> {
        raws.iter().map(|raw| self.predict(raw, stage)).collect()
    }

    /// Answer a bus request; never fails
    pub fn handle(&self, request: &InferenceRequest) -> InferenceResponse {
        let request_id = request.request_id();
        match self.predict(&request.features, request.stage()) {
            Ok(result) => InferenceResponse::Success { request_id, result },
            Err(e) => InferenceResponse::Failure {
                request_id,
                error: e.to_body(),
            },
        }
    }

    fn score(&self, raw: &RawFeatures, stage: Stage) -> Result<(RiskResult, FeatureVector), InferenceError> {
        let fv = self.contract.validate(raw)?;

        let version = self
            .registry
            .resolve(stage)
            .map_err(|source| InferenceError::ModelUnavailable { stage, source })?;

        if !self.contract.is_compatible_with(version.schema_version) {
            return Err(InferenceError::SchemaVersionMismatch {
                input: fv.schema_version(),
                model: version.schema_version,
                model_version: version.id,
            });
        }

        // Absent optional fields take the training median; anything still
        // missing was never seen in training
        let filled = fv.fill_missing(version.reference.medians());
        let features = self
            .extractor
            .select(&filled, version.scorer.feature_names())
            .map_err(|missing| SchemaError {
                schema_version: fv.schema_version(),
                violations: missing
                    .into_iter()
                    .map(|field| FieldViolation {
                        field,
                        reason: ViolationReason::Missing,
                    })
                    .collect(),
            })?;

        let probability = version
            .scorer
            .score(&features)
            .map_err(|source| InferenceError::Scoring {
                model_version: version.id,
                source,
            })?;

        let result = RiskResult {
            probability,
            category: RiskCategory::from_probability(probability, &self.cutpoints),
            model_version_used: version.id,
            stage_used: stage,
        };
        Ok((result, fv))
    }
}
