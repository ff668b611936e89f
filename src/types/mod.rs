//! Type definitions for the readmission risk pipeline

pub mod request;
pub mod risk;

pub use request::InferenceRequest;
pub use risk::{ErrorBody, ErrorKind, InferenceResponse, RiskCategory, RiskCutpoints, RiskResult};
