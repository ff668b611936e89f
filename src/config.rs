//! Configuration management for the readmission risk pipeline

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::contract::{FeatureContract, Strictness};
use crate::drift::DriftConfig;
use crate::models::logistic::LogisticTrainer;
use crate::training::dataset::DEFAULT_LABEL_COLUMN;
use crate::training::GateThresholds;
use crate::types::risk::RiskCutpoints;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

/// Prefix of environment overrides, e.g. `READMIT_NATS__URL`
pub const ENV_PREFIX: &str = "READMIT";

#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub nats: NatsConfig,
    pub registry: RegistryConfig,
    pub contract: ContractConfig,
    pub training: TrainingConfig,
    pub gate: GateThresholds,
    pub drift: DriftConfig,
    pub risk: RiskCutpoints,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// NATS connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,
    /// Subject for incoming inference requests
    pub request_subject: String,
    /// Subject for outgoing inference responses
    pub response_subject: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            request_subject: "readmission.requests".to_string(),
            response_subject: "readmission.results".to_string(),
        }
    }
}

/// Model registry location
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root directory of the filesystem store
    pub path: String,
    /// Seconds between store reloads while serving
    pub reload_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: "registry".to_string(),
            reload_secs: 10,
        }
    }
}

/// Feature contract options
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContractConfig {
    /// "strict" rejects unknown fields, "lenient" drops them
    pub strictness: Strictness,
}

impl ContractConfig {
    pub fn contract(&self) -> FeatureContract {
        FeatureContract::readmission_v1().with_strictness(self.strictness)
    }
}

/// Training run parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Share of each class held out for evaluation
    pub test_ratio: f64,
    /// Split seed
    pub seed: u64,
    /// Label column of CSV datasets
    pub label_column: String,
    pub learning_rate: f64,
    pub epochs: usize,
    /// L2 penalty on weights
    pub l2: f64,
    /// Search learning_rate and l2 on a validation split before fitting
    pub tune: bool,
    /// Parameter sets tried when tuning, including the configured one
    pub trials: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        let trainer = LogisticTrainer::default();
        Self {
            test_ratio: 0.2,
            seed: 42,
            label_column: DEFAULT_LABEL_COLUMN.to_string(),
            learning_rate: trainer.learning_rate,
            epochs: trainer.epochs,
            l2: trainer.l2,
            tune: false,
            trials: 20,
        }
    }
}

impl TrainingConfig {
    pub fn trainer(&self) -> LogisticTrainer {
        LogisticTrainer {
            learning_rate: self.learning_rate,
            epochs: self.epochs,
            l2: self.l2,
        }
    }
}

/// Serving loop configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum requests scored concurrently
    pub workers: usize,
    /// Seconds between metrics summaries
    pub metrics_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            metrics_interval_secs: 30,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific path, layered with `READMIT_*`
    /// environment overrides, and validate it
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app.validate()?;
        Ok(app)
    }

    /// Reject values outside their documented ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gate.validate()?;
        self.drift.validate()?;
        self.risk.validate()?;

        let t = &self.training;
        if !(t.test_ratio > 0.0 && t.test_ratio < 1.0) {
            return Err(ConfigError(format!(
                "training.test_ratio must be strictly between 0 and 1, got {}",
                t.test_ratio
            )));
        }
        if !(t.learning_rate > 0.0) || t.epochs == 0 || !(t.l2 >= 0.0) {
            return Err(ConfigError(
                "training needs learning_rate > 0, epochs >= 1 and l2 >= 0".to_string(),
            ));
        }
        if t.trials == 0 {
            return Err(ConfigError("training.trials must be at least 1".to_string()));
        }
        if self.registry.reload_secs == 0 {
            return Err(ConfigError("registry.reload_secs must be at least 1".to_string()));
        }
        if self.pipeline.workers == 0 {
            return Err(ConfigError("pipeline.workers must be at least 1".to_string()));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(ConfigError(format!(
                "logging.format must be json or pretty, got {}",
                self.logging.format
            )));
        }
        Ok(())
    }
}
