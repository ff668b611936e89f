//! Model training and the promotion gate

pub mod dataset;
pub mod gate;
pub mod metrics;
pub mod trainer;
pub mod tuning;

pub use dataset::{CsvDatasetSource, DatasetError, DatasetSource, LabeledExample, TrainingDataset};
pub use gate::{gate, GateResult, GateThresholds};
pub use metrics::{EvaluationMetrics, MetricName};
pub use trainer::{train, TrainingOutcome};
pub use tuning::tune;

use thiserror::Error;

/// A training run could not proceed on the given data
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrainingError {
    #[error("training dataset is empty")]
    EmptyDataset,

    #[error("{rows} feature rows but {labels} labels")]
    LabelCountMismatch { rows: usize, labels: usize },

    #[error("feature row has {got} values, expected {expected}")]
    RaggedRows { expected: usize, got: usize },

    #[error("all labels are {label}; training needs both classes")]
    SingleClass { label: bool },

    #[error("class {label} has {count} examples; at least 2 are needed to split")]
    InsufficientClassSamples { label: bool, count: usize },

    #[error("row {row}: field {field} is not finite")]
    NonFiniteValue { row: usize, field: String },

    #[error("row {row}: schema v{found} does not match dataset schema v{expected}")]
    SchemaVersionMismatch { row: usize, expected: u32, found: u32 },

    #[error("row {row}: missing features {missing:?}")]
    InconsistentFields { row: usize, missing: Vec<String> },

    #[error("split ratio {0} must be strictly between 0 and 1")]
    InvalidSplitRatio(f64),

    #[error("optimizer diverged to non-finite weights")]
    Diverged,
}
