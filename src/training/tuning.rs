//! Seeded random search over logistic regression hyper-parameters.
//!
//! Candidates are scored by AUC on a validation split carved out of the
//! training partition, so the holdout used by the gate never influences the
//! chosen parameters.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Range;
use tracing::{debug, info};

use super::dataset::TrainingDataset;
use super::metrics::roc_auc;
use super::trainer::{stratify, Prepared};
use super::TrainingError;
use crate::config::TrainingConfig;
use crate::models::logistic::LogisticTrainer;
use crate::models::scorer::Trainer;

/// Share of the training partition used to score candidates
pub const VALIDATION_RATIO: f64 = 0.2;

/// Search range of the learning rate, sampled log-uniformly
pub const LEARNING_RATE_RANGE: Range<f64> = 0.01..0.5;

/// Search range of the L2 penalty, sampled log-uniformly
pub const L2_RANGE: Range<f64> = 1e-5..1.0;

fn log_uniform(rng: &mut StdRng, range: &Range<f64>) -> f64 {
    10f64.powf(rng.gen_range(range.start.log10()..range.end.log10()))
}

/// Pick `learning_rate` and `l2` for `config`. The first candidate is the
/// configured pair; the remaining `config.trials - 1` are drawn from a
/// generator seeded with `config.seed`. Ties keep the earlier candidate.
pub fn tune(dataset: &TrainingDataset, config: &TrainingConfig) -> Result<LogisticTrainer, TrainingError> {
    let prepared = Prepared::new(dataset, config)?;
    let (fit_idx, validation_idx) = stratify(dataset, &prepared.train_idx, VALIDATION_RATIO, config.seed)?;
    let (x_fit, y_fit) = prepared.matrix(dataset, &fit_idx);
    let (x_val, y_val) = prepared.matrix(dataset, &validation_idx);

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<(LogisticTrainer, f64)> = None;
    let mut last_error = TrainingError::Diverged;

    for trial in 0..config.trials.max(1) {
        let candidate = if trial == 0 {
            config.trainer()
        } else {
            LogisticTrainer {
                learning_rate: log_uniform(&mut rng, &LEARNING_RATE_RANGE),
                epochs: config.epochs,
                l2: log_uniform(&mut rng, &L2_RANGE),
            }
        };

        let auc = match score_candidate(&candidate, &prepared, &x_fit, &y_fit, &x_val, &y_val) {
            Ok(auc) => auc,
            Err(e) => {
                debug!(trial, learning_rate = candidate.learning_rate, l2 = candidate.l2, error = %e, "Tuning trial failed");
                last_error = e;
                continue;
            }
        };
        debug!(trial, learning_rate = candidate.learning_rate, l2 = candidate.l2, auc, "Tuning trial");

        if best.as_ref().map_or(!auc.is_nan(), |(_, best_auc)| auc > *best_auc) {
            best = Some((candidate, auc));
        }
    }

    let (chosen, auc) = best.ok_or(last_error)?;
    info!(
        learning_rate = chosen.learning_rate,
        l2 = chosen.l2,
        epochs = chosen.epochs,
        validation_auc = auc,
        trials = config.trials,
        validation_rows = validation_idx.len(),
        "Hyper-parameters tuned"
    );
    Ok(chosen)
}

fn score_candidate(
    candidate: &LogisticTrainer,
    prepared: &Prepared,
    x_fit: &[Vec<f64>],
    y_fit: &[bool],
    x_val: &[Vec<f64>],
    y_val: &[bool],
) -> Result<f64, TrainingError> {
    let scorer = candidate.fit(x_fit, y_fit, prepared.layout.clone())?;
    let scores = x_val
        .iter()
        .map(|row| scorer.score(row))
        .collect::<Result<Vec<f64>, _>>()
        .map_err(|_| TrainingError::Diverged)?;
    Ok(roc_auc(y_val, &scores))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{FeatureContract, FeatureVector};
    use crate::training::dataset::LabeledExample;
    use serde_json::json;

    fn vector(age: i64, creatinine: f64, heart_rate: f64) -> FeatureVector {
        let raw = json!({
            "age": age,
            "gender": age % 2,
            "num_encounters": 2,
            "avg_los": 4.0,
            "creatinine": creatinine,
            "heart_rate": heart_rate,
            "systolic_bp": 125
        });
        FeatureContract::readmission_v1()
            .validate(raw.as_object().unwrap())
            .unwrap()
    }

    /// Overlapping classes so candidates do not all reach AUC 1
    fn dataset(n: usize) -> TrainingDataset {
        let examples = (0..n)
            .map(|i| {
                let label = i % 3 == 0;
                let shift = if label { 0.5 } else { 0.0 };
                LabeledExample {
                    features: vector(
                        35 + (i % 45) as i64,
                        1.0 + shift + (i % 7) as f64 * 0.15,
                        70.0 + (i % 11) as f64 * 3.0,
                    ),
                    label,
                }
            })
            .collect();
        TrainingDataset::new(1, examples)
    }

    fn config(trials: usize) -> TrainingConfig {
        TrainingConfig {
            tune: true,
            trials,
            epochs: 100,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_tuning_is_seeded() {
        let data = dataset(120);
        let a = tune(&data, &config(6)).unwrap();
        let b = tune(&data, &config(6)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.epochs, 100);
    }

    #[test]
    fn test_single_trial_keeps_configured_parameters() {
        let data = dataset(120);
        let config = config(1);
        assert_eq!(tune(&data, &config).unwrap(), config.trainer());
    }

    #[test]
    fn test_sampled_parameters_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let lr = log_uniform(&mut rng, &LEARNING_RATE_RANGE);
            let l2 = log_uniform(&mut rng, &L2_RANGE);
            assert!(lr >= 0.01 * (1.0 - 1e-9) && lr <= 0.5 * (1.0 + 1e-9), "lr {lr}");
            assert!(l2 >= 1e-5 * (1.0 - 1e-9) && l2 <= 1.0 + 1e-9, "l2 {l2}");
        }
    }

    #[test]
    fn test_holdout_rows_do_not_influence_choice() {
        let data = dataset(120);
        let config = config(6);
        let holdout = Prepared::new(&data, &config).unwrap().holdout_idx;

        // Same labels, so the split is unchanged; holdout features become noise
        let mut examples = data.examples().to_vec();
        for &i in &holdout {
            examples[i].features = vector(99, 9.5, 180.0);
        }
        let scrambled = TrainingDataset::new(1, examples);

        assert_eq!(tune(&data, &config).unwrap(), tune(&scrambled, &config).unwrap());
    }

    #[test]
    fn test_validation_split_needs_two_per_class() {
        let data = dataset(30);
        let mut examples: Vec<LabeledExample> = data.examples().iter().filter(|e| !e.label).cloned().collect();
        examples.extend(data.examples().iter().filter(|e| e.label).take(2).cloned());
        let err = tune(&TrainingDataset::new(1, examples), &config(3)).unwrap_err();
        assert_eq!(err, TrainingError::InsufficientClassSamples { label: true, count: 1 });
    }
}
