//! Scorers, their artifact codec and the inference engine

pub mod inference;
pub mod loader;
pub mod logistic;
pub mod scorer;

pub use inference::InferenceEngine;
pub use loader::ModelLoader;
pub use logistic::{LogisticModel, LogisticTrainer};
pub use scorer::{Scorer, ScoringError, Trainer};
