//! Training run: stratified split, fit, holdout evaluation, reference snapshot

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::time::Instant;
use tracing::{debug, info};

use super::dataset::TrainingDataset;
use super::metrics::EvaluationMetrics;
use super::TrainingError;
use crate::config::TrainingConfig;
use crate::contract::FeatureVector;
use crate::drift::ReferenceDistribution;
use crate::feature_extractor::FeatureExtractor;
use crate::models::scorer::{Scorer, Trainer};

/// Everything a training run hands to the registry
#[derive(Debug)]
pub struct TrainingOutcome {
    pub scorer: Box<dyn Scorer>,
    pub metrics: EvaluationMetrics,
    pub reference: ReferenceDistribution,
    pub schema_version: u32,
    pub train_size: usize,
    pub holdout_size: usize,
}

/// A dataset split into training and holdout partitions, with every row
/// imputed and laid out the same way
pub(super) struct Prepared {
    pub train_idx: Vec<usize>,
    pub holdout_idx: Vec<usize>,
    pub layout: Vec<String>,
    /// Reference over the raw training partition; its medians fill gaps
    pub reference: ReferenceDistribution,
    rows: Vec<Vec<f64>>,
}

impl Prepared {
    /// Split `dataset`, summarize the training partition and build the
    /// feature matrix. Absent optional fields take the training-partition
    /// median, on both sides of the split.
    pub fn new(dataset: &TrainingDataset, config: &TrainingConfig) -> Result<Self, TrainingError> {
        check_dataset(dataset)?;

        let ratio = config.test_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(TrainingError::InvalidSplitRatio(ratio));
        }

        let (train_idx, holdout_idx) = stratified_split(dataset, ratio, config.seed)?;
        debug!(
            train = train_idx.len(),
            holdout = holdout_idx.len(),
            seed = config.seed,
            "Stratified split"
        );

        let examples = dataset.examples();
        let reference =
            ReferenceDistribution::from_vectors(train_idx.iter().map(|&i| &examples[i].features));

        let imputed: Vec<FeatureVector> = examples
            .iter()
            .map(|e| e.features.fill_missing(reference.medians()))
            .collect();

        let extractor = FeatureExtractor::new();
        // Imputed training rows share one field set: every field seen anywhere
        // in the partition
        let layout = extractor.feature_names(&imputed[train_idx[0]]);

        let rows = imputed
            .iter()
            .enumerate()
            .map(|(row, fv)| {
                extractor
                    .select(fv, &layout)
                    .map_err(|missing| TrainingError::InconsistentFields { row, missing })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            train_idx,
            holdout_idx,
            layout,
            reference,
            rows,
        })
    }

    pub fn matrix(&self, dataset: &TrainingDataset, indices: &[usize]) -> (Vec<Vec<f64>>, Vec<bool>) {
        let examples = dataset.examples();
        indices
            .iter()
            .map(|&i| (self.rows[i].clone(), examples[i].label))
            .unzip()
    }
}

/// Fit a scorer on a stratified training partition and evaluate it on the
/// holdout. The split depends only on the dataset order and `config.seed`.
pub fn train(
    dataset: &TrainingDataset,
    config: &TrainingConfig,
    trainer: &dyn Trainer,
) -> Result<TrainingOutcome, TrainingError> {
    let start = Instant::now();
    let prepared = Prepared::new(dataset, config)?;

    let (x_train, y_train) = prepared.matrix(dataset, &prepared.train_idx);
    let (x_holdout, y_holdout) = prepared.matrix(dataset, &prepared.holdout_idx);

    let scorer = trainer.fit(&x_train, &y_train, prepared.layout.clone())?;

    let scores = x_holdout
        .iter()
        .map(|row| scorer.score(row))
        .collect::<Result<Vec<f64>, _>>()
        .map_err(|_| TrainingError::Diverged)?;
    let metrics = EvaluationMetrics::evaluate(&y_holdout, &scores);

    info!(
        scorer = scorer.name(),
        rows = dataset.len(),
        features = prepared.layout.len(),
        auc = metrics.auc,
        accuracy = metrics.accuracy,
        precision = metrics.precision,
        recall = metrics.recall,
        f1 = metrics.f1,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Training run complete"
    );

    Ok(TrainingOutcome {
        scorer,
        metrics,
        schema_version: dataset.schema_version(),
        train_size: prepared.train_idx.len(),
        holdout_size: prepared.holdout_idx.len(),
        reference: prepared.reference,
    })
}

fn check_dataset(dataset: &TrainingDataset) -> Result<(), TrainingError> {
    if dataset.is_empty() {
        return Err(TrainingError::EmptyDataset);
    }

    for (row, example) in dataset.examples().iter().enumerate() {
        let found = example.features.schema_version();
        if found != dataset.schema_version() {
            return Err(TrainingError::SchemaVersionMismatch {
                row,
                expected: dataset.schema_version(),
                found,
            });
        }
        if let Some((field, _)) = example.features.iter().find(|(_, v)| !v.is_finite()) {
            return Err(TrainingError::NonFiniteValue {
                row,
                field: field.to_string(),
            });
        }
    }

    let positives = dataset.positives();
    if positives == 0 {
        return Err(TrainingError::SingleClass { label: false });
    }
    if positives == dataset.len() {
        return Err(TrainingError::SingleClass { label: true });
    }
    Ok(())
}

/// Split each class separately so both partitions keep the label balance.
/// Every class contributes at least one row to each side.
fn stratified_split(
    dataset: &TrainingDataset,
    ratio: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>), TrainingError> {
    let all: Vec<usize> = (0..dataset.len()).collect();
    stratify(dataset, &all, ratio, seed)
}

/// Stratified split of a subset of dataset rows
pub(super) fn stratify(
    dataset: &TrainingDataset,
    indices: &[usize],
    ratio: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>), TrainingError> {
    let examples = dataset.examples();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut kept = Vec::new();
    let mut held = Vec::new();

    for label in [false, true] {
        let mut class: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| examples[i].label == label)
            .collect();

        if class.len() < 2 {
            return Err(TrainingError::InsufficientClassSamples {
                label,
                count: class.len(),
            });
        }

        class.shuffle(&mut rng);
        let n_held = ((class.len() as f64 * ratio).round() as usize).clamp(1, class.len() - 1);
        held.extend_from_slice(&class[..n_held]);
        kept.extend_from_slice(&class[n_held..]);
    }

    kept.sort_unstable();
    held.sort_unstable();
    Ok((kept, held))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{FeatureContract, FieldSpec};
    use crate::models::logistic::LogisticTrainer;
    use crate::training::dataset::LabeledExample;
    use serde_json::json;

    fn vector(age: i64, creatinine: f64) -> FeatureVector {
        let raw = json!({
            "age": age,
            "gender": age % 2,
            "num_encounters": 1,
            "avg_los": 3.0,
            "creatinine": creatinine,
            "heart_rate": 80,
            "systolic_bp": 120
        });
        FeatureContract::readmission_v1()
            .validate(raw.as_object().unwrap())
            .unwrap()
    }

    /// High creatinine drives readmission
    fn dataset(n: usize) -> TrainingDataset {
        let examples = (0..n)
            .map(|i| {
                let label = i % 2 == 0;
                let creatinine = if label { 2.0 + (i % 5) as f64 * 0.1 } else { 0.8 + (i % 5) as f64 * 0.1 };
                LabeledExample {
                    features: vector(30 + (i % 50) as i64, creatinine),
                    label,
                }
            })
            .collect();
        TrainingDataset::new(1, examples)
    }

    #[test]
    fn test_train_on_separable_data() {
        let outcome = train(&dataset(60), &TrainingConfig::default(), &LogisticTrainer::default()).unwrap();

        assert_eq!(outcome.train_size + outcome.holdout_size, 60);
        assert_eq!(outcome.holdout_size, 12);
        assert_eq!(outcome.schema_version, 1);
        assert!(outcome.metrics.auc > 0.9);
        assert_eq!(outcome.reference.fields.len(), 7);
        assert_eq!(outcome.reference.fields[0].count, 48);
    }

    /// Schema v2 rows where only every third patient has a hemoglobin lab
    fn sparse_v2_dataset(n: usize) -> TrainingDataset {
        let contract = FeatureContract::readmission_v1()
            .extend(vec![FieldSpec::float("hemoglobin", Some(0.0), None)]);
        let examples = (0..n)
            .map(|i| {
                let label = i % 2 == 0;
                let base = if label { 2.1 } else { 0.9 };
                let mut raw = json!({
                    "age": 40 + (i % 30) as i64,
                    "gender": i % 2,
                    "num_encounters": 1,
                    "avg_los": 3.0,
                    "creatinine": base + (i % 4) as f64 * 0.05,
                    "heart_rate": 80,
                    "systolic_bp": 120
                });
                if i % 3 == 1 {
                    raw["hemoglobin"] = json!(10.0 + (i % 7) as f64);
                }
                LabeledExample {
                    features: contract.validate(raw.as_object().unwrap()).unwrap(),
                    label,
                }
            })
            .collect();
        TrainingDataset::new(2, examples)
    }

    #[test]
    fn test_optional_field_missing_from_first_row_is_kept() {
        let data = sparse_v2_dataset(60);
        assert!(data.examples()[0].features.get("hemoglobin").is_none());

        let outcome = train(&data, &TrainingConfig::default(), &LogisticTrainer::default()).unwrap();
        assert!(outcome.scorer.feature_names().iter().any(|n| n == "hemoglobin"));

        let hemoglobin = outcome.reference.field("hemoglobin").unwrap();
        assert!(hemoglobin.count > 0);
        assert!(hemoglobin.count < outcome.train_size);
        assert!(outcome.metrics.auc > 0.9);
    }

    #[test]
    fn test_absent_values_take_training_median() {
        let data = sparse_v2_dataset(60);
        let prepared = Prepared::new(&data, &TrainingConfig::default()).unwrap();
        let column = prepared.layout.iter().position(|n| n == "hemoglobin").unwrap();
        let median = prepared.reference.field("hemoglobin").unwrap().median;

        let (x, _) = prepared.matrix(&data, &prepared.holdout_idx);
        for (row, &i) in x.iter().zip(&prepared.holdout_idx) {
            match data.examples()[i].features.get("hemoglobin") {
                Some(observed) => assert_eq!(row[column], observed),
                None => assert_eq!(row[column], median),
            }
        }
        assert!(x.iter().all(|row| row.len() == prepared.layout.len()));
    }

    #[test]
    fn test_split_is_seeded() {
        let data = dataset(40);
        let a = stratified_split(&data, 0.2, 42).unwrap();
        let b = stratified_split(&data, 0.2, 42).unwrap();
        let c = stratified_split(&data, 0.2, 7).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.1, c.1);
    }

    #[test]
    fn test_split_keeps_both_classes_in_holdout() {
        let data = dataset(10);
        let (_, holdout) = stratified_split(&data, 0.2, 42).unwrap();
        let labels: Vec<bool> = holdout.iter().map(|&i| data.examples()[i].label).collect();
        assert!(labels.contains(&true));
        assert!(labels.contains(&false));
    }

    #[test]
    fn test_empty_dataset() {
        let err = train(
            &TrainingDataset::new(1, vec![]),
            &TrainingConfig::default(),
            &LogisticTrainer::default(),
        )
        .unwrap_err();
        assert_eq!(err, TrainingError::EmptyDataset);
    }

    #[test]
    fn test_single_class() {
        let examples = dataset(10)
            .examples()
            .iter()
            .cloned()
            .map(|e| LabeledExample { label: true, ..e })
            .collect();
        let err = train(
            &TrainingDataset::new(1, examples),
            &TrainingConfig::default(),
            &LogisticTrainer::default(),
        )
        .unwrap_err();
        assert_eq!(err, TrainingError::SingleClass { label: true });
    }

    #[test]
    fn test_too_few_per_class() {
        let mut examples: Vec<LabeledExample> = dataset(10)
            .examples()
            .iter()
            .filter(|e| !e.label)
            .cloned()
            .collect();
        examples.push(LabeledExample {
            features: vector(70, 2.5),
            label: true,
        });
        let err = train(
            &TrainingDataset::new(1, examples),
            &TrainingConfig::default(),
            &LogisticTrainer::default(),
        )
        .unwrap_err();
        assert_eq!(err, TrainingError::InsufficientClassSamples { label: true, count: 1 });
    }

    #[test]
    fn test_schema_tag_mismatch() {
        let data = dataset(10);
        let err = train(
            &TrainingDataset::new(2, data.examples().to_vec()),
            &TrainingConfig::default(),
            &LogisticTrainer::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            TrainingError::SchemaVersionMismatch { row: 0, expected: 2, found: 1 }
        );
    }

    #[test]
    fn test_invalid_ratio() {
        let config = TrainingConfig {
            test_ratio: 1.0,
            ..TrainingConfig::default()
        };
        let err = train(&dataset(10), &config, &LogisticTrainer::default()).unwrap_err();
        assert_eq!(err, TrainingError::InvalidSplitRatio(1.0));
    }
}
