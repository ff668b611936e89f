//! Readmission Risk Pipeline Library
//!
//! Scores hospital patients for 30-day readmission risk and manages the
//! scoring model's lifecycle: contract validation, gated training, staged
//! promotion, drift monitoring and NATS-served inference.

pub mod config;
pub mod consumer;
pub mod contract;
pub mod drift;
pub mod feature_extractor;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod producer;
pub mod registry;
pub mod training;
pub mod types;

pub use config::AppConfig;
pub use consumer::RequestConsumer;
pub use contract::{FeatureContract, FeatureVector, RawFeatures, SchemaError};
pub use feature_extractor::FeatureExtractor;
pub use models::inference::{InferenceEngine, InferenceError};
pub use producer::ResponseProducer;
pub use registry::{ModelRegistry, ModelVersion, PromotionError, RegistryError, Stage};
pub use types::{request::InferenceRequest, risk::RiskResult};
