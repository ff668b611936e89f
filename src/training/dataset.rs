//! Training datasets and their ingestion sources

use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::contract::{FeatureContract, FeatureVector, RawFeatures, SchemaError};

/// Default name of the label column in training files
pub const DEFAULT_LABEL_COLUMN: &str = "readmitted_30d";

/// One validated feature vector with its binary outcome
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledExample {
    pub features: FeatureVector,
    pub label: bool,
}

/// Labelled examples tagged with the schema version they were validated under
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingDataset {
    schema_version: u32,
    examples: Vec<LabeledExample>,
}

impl TrainingDataset {
    pub fn new(schema_version: u32, examples: Vec<LabeledExample>) -> Self {
        Self {
            schema_version,
            examples,
        }
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn examples(&self) -> &[LabeledExample] {
        &self.examples
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Number of positive labels
    pub fn positives(&self) -> usize {
        self.examples.iter().filter(|e| e.label).count()
    }
}

/// Failure while reading a dataset
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read dataset: {0}")]
    Csv(#[from] csv::Error),

    #[error("dataset is missing column {0}")]
    MissingColumn(String),

    #[error("row {row}: label {value:?} is not 0/1")]
    InvalidLabel { row: usize, value: String },

    #[error("row {row}: {source}")]
    Schema {
        row: usize,
        #[source]
        source: SchemaError,
    },
}

/// Anything that can produce a labelled dataset validated by a contract
pub trait DatasetSource {
    fn load(&self, contract: &FeatureContract) -> Result<TrainingDataset, DatasetError>;
}

/// CSV file with a header row naming contract fields and the label column.
/// Columns that are neither are ignored.
#[derive(Debug, Clone)]
pub struct CsvDatasetSource {
    path: PathBuf,
    label_column: String,
}

impl CsvDatasetSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            label_column: DEFAULT_LABEL_COLUMN.to_string(),
        }
    }

    pub fn with_label_column(mut self, label_column: &str) -> Self {
        self.label_column = label_column.to_string();
        self
    }

    fn read<R: std::io::Read>(
        &self,
        reader: R,
        contract: &FeatureContract,
    ) -> Result<TrainingDataset, DatasetError> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = reader.headers()?.clone();

        let label_idx = headers
            .iter()
            .position(|h| h == self.label_column)
            .ok_or_else(|| DatasetError::MissingColumn(self.label_column.clone()))?;

        // Only contract fields are forwarded, so extra columns never trip strict mode
        let field_names = contract.field_names();
        let columns: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| field_names.contains(h))
            .map(|(i, h)| (i, h.to_string()))
            .collect();

        let mut examples = Vec::new();
        for (i, record) in reader.records().enumerate() {
            let record = record?;
            // Data rows start on line 2
            let row = i + 2;

            let mut raw = RawFeatures::new();
            for (idx, name) in &columns {
                match record.get(*idx) {
                    Some("") | None => {}
                    Some(value) => {
                        raw.insert(name.clone(), Value::String(value.to_string()));
                    }
                }
            }

            let features = contract
                .validate(&raw)
                .map_err(|source| DatasetError::Schema { row, source })?;
            let label = parse_label(record.get(label_idx).unwrap_or_default())
                .ok_or_else(|| DatasetError::InvalidLabel {
                    row,
                    value: record.get(label_idx).unwrap_or_default().to_string(),
                })?;

            examples.push(LabeledExample { features, label });
        }

        debug!(rows = examples.len(), "Parsed dataset rows");
        Ok(TrainingDataset::new(contract.version(), examples))
    }
}

impl DatasetSource for CsvDatasetSource {
    fn load(&self, contract: &FeatureContract) -> Result<TrainingDataset, DatasetError> {
        let file = std::fs::File::open(&self.path).map_err(csv::Error::from)?;
        let dataset = self.read(file, contract)?;
        info!(
            path = %self.path.display(),
            rows = dataset.len(),
            positives = dataset.positives(),
            schema_version = dataset.schema_version(),
            "Loaded training dataset"
        );
        Ok(dataset)
    }
}

fn parse_label(value: &str) -> Option<bool> {
    match value {
        "1" | "1.0" | "true" | "True" => Some(true),
        "0" | "0.0" | "false" | "False" => Some(false),
        _ => None,
    }
}
