//! Risk scoring results and responses

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::contract::FieldViolation;
use crate::registry::Stage;

/// Discrete risk category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskCategory {
    Low,
    Medium,
    High,
}

impl RiskCategory {
    /// Determine risk category from a probability. Lower bounds are inclusive.
    pub fn from_probability(probability: f64, cutpoints: &RiskCutpoints) -> Self {
        if probability >= cutpoints.high {
            RiskCategory::High
        } else if probability >= cutpoints.medium {
            RiskCategory::Medium
        } else {
            RiskCategory::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskCategory::Low => "low",
            RiskCategory::Medium => "medium",
            RiskCategory::High => "high",
        }
    }
}

/// Configurable category cutpoints
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskCutpoints {
    /// Lowest probability classified Medium
    pub medium: f64,
    /// Lowest probability classified High
    pub high: f64,
}

impl Default for RiskCutpoints {
    fn default() -> Self {
        Self {
            medium: 0.3,
            high: 0.7,
        }
    }
}

impl RiskCutpoints {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0 <= self.medium && self.medium < self.high && self.high <= 1.0) {
            return Err(ConfigError(format!(
                "risk cutpoints must satisfy 0 <= medium < high <= 1, got medium={} high={}",
                self.medium, self.high
            )));
        }
        Ok(())
    }
}

/// Successful prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskResult {
    /// Probability of readmission (0.0 - 1.0)
    pub probability: f64,
    pub category: RiskCategory,
    pub model_version_used: u64,
    pub stage_used: Stage,
}

/// Error classification carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedRequest,
    SchemaViolation,
    SchemaVersionMismatch,
    ModelUnavailable,
    ScoringFailure,
}

impl ErrorKind {
    /// HTTP-equivalent status code
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::MalformedRequest => 400,
            ErrorKind::SchemaViolation => 422,
            ErrorKind::SchemaVersionMismatch => 409,
            ErrorKind::ModelUnavailable => 503,
            ErrorKind::ScoringFailure => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedRequest => "malformed_request",
            ErrorKind::SchemaViolation => "schema_violation",
            ErrorKind::SchemaVersionMismatch => "schema_version_mismatch",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::ScoringFailure => "scoring_failure",
        }
    }
}

/// Structured error body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub status: u16,
    /// Field-level detail for schema violations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<FieldViolation>,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: kind.status(),
            violations: Vec::new(),
        }
    }

    pub fn with_violations(mut self, violations: Vec<FieldViolation>) -> Self {
        self.violations = violations;
        self
    }
}

/// Reply published for every inference request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InferenceResponse {
    Success {
        request_id: String,
        #[serde(flatten)]
        result: RiskResult,
    },
    Failure {
        request_id: String,
        error: ErrorBody,
    },
}

impl InferenceResponse {
    pub fn request_id(&self) -> &str {
        match self {
            InferenceResponse::Success { request_id, .. } | InferenceResponse::Failure { request_id, .. } => {
                request_id
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InferenceResponse::Success { .. })
    }
}
