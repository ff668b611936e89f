//! Train, gate, promote and serve against an in-memory registry

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use readmission_risk_pipeline::config::TrainingConfig;
use readmission_risk_pipeline::contract::{FeatureContract, RawFeatures};
use readmission_risk_pipeline::drift::{self, DriftConfig, LiveWindow, ReferenceDistribution};
use readmission_risk_pipeline::metrics::InferenceMetrics;
use readmission_risk_pipeline::models::logistic::{LogisticModel, LogisticTrainer, Scaler};
use readmission_risk_pipeline::training::{
    gate, train, EvaluationMetrics, GateThresholds, LabeledExample, MetricName, TrainingDataset,
};
use readmission_risk_pipeline::types::risk::{ErrorKind, InferenceResponse, RiskCategory, RiskCutpoints};
use readmission_risk_pipeline::{InferenceEngine, InferenceRequest, ModelRegistry, PromotionError, Stage};
use serde_json::json;
use std::sync::Arc;

const FIELDS: [&str; 7] = [
    "age",
    "gender",
    "num_encounters",
    "avg_los",
    "creatinine",
    "heart_rate",
    "systolic_bp",
];

fn raw(value: serde_json::Value) -> RawFeatures {
    value.as_object().unwrap().clone()
}

fn example_patient() -> RawFeatures {
    raw(json!({
        "age": 72,
        "gender": 1,
        "num_encounters": 2,
        "avg_los": 4.5,
        "creatinine": 1.8,
        "heart_rate": 110,
        "systolic_bp": 145
    }))
}

fn hand_model() -> Arc<LogisticModel> {
    Arc::new(LogisticModel {
        feature_names: FIELDS.iter().map(|f| f.to_string()).collect(),
        scaler: Scaler {
            mean: vec![0.0; 7],
            std: vec![1.0; 7],
        },
        weights: vec![0.02, 0.0, 0.3, 0.1, 0.8, 0.01, 0.0],
        bias: -4.5,
    })
}

fn engine(registry: Arc<ModelRegistry>) -> InferenceEngine {
    InferenceEngine::new(
        FeatureContract::readmission_v1(),
        registry,
        RiskCutpoints::default(),
        Arc::new(InferenceMetrics::new()),
        Arc::new(LiveWindow::new(100)),
    )
}

#[test]
fn gated_promotion_scenario() {
    let registry = Arc::new(ModelRegistry::in_memory(GateThresholds::default()));
    let contract = FeatureContract::readmission_v1();
    let reference = ReferenceDistribution::from_vectors(&[contract.validate(&example_patient()).unwrap()]);

    let v1_metrics = EvaluationMetrics::new(0.72, 0.66, 0.61, 0.62, 0.61);
    assert!(gate(&v1_metrics, registry.thresholds()).is_pass());
    let v1 = registry
        .register(hand_model(), v1_metrics, 1, reference.clone())
        .unwrap();
    registry.promote(v1, Stage::Production).unwrap();

    let engine = engine(registry.clone());
    let result = engine.predict(&example_patient(), Stage::Production).unwrap();
    assert!((0.0..=1.0).contains(&result.probability));
    assert_eq!(
        result.category,
        RiskCategory::from_probability(result.probability, &RiskCutpoints::default())
    );
    assert_eq!(result.model_version_used, v1);
    assert_eq!(result.stage_used, Stage::Production);

    // A weaker candidate is refused and production is untouched
    let v2_metrics = EvaluationMetrics::new(0.68, 0.66, 0.61, 0.62, 0.61);
    let v2 = registry.register(hand_model(), v2_metrics, 1, reference).unwrap();
    match registry.promote(v2, Stage::Production) {
        Err(PromotionError::GateFailed { version, violations }) => {
            assert_eq!(version, v2);
            assert_eq!(violations, vec![MetricName::Auc]);
        }
        other => panic!("expected gate failure, got {:?}", other),
    }
    assert_eq!(registry.resolve(Stage::Production).unwrap().id, v1);

    // Staging has no gate
    registry.promote(v2, Stage::Staging).unwrap();
    let staged = engine.predict(&example_patient(), Stage::Staging).unwrap();
    assert_eq!(staged.model_version_used, v2);
    assert_eq!(engine.metrics().health().predictions, 2);
}

#[test]
fn errors_map_to_kinds() {
    let registry = Arc::new(ModelRegistry::in_memory(GateThresholds::default()));
    let engine = engine(registry.clone());

    let unavailable = engine.predict(&example_patient(), Stage::Production).unwrap_err();
    assert_eq!(unavailable.kind(), ErrorKind::ModelUnavailable);

    let id = registry
        .register(
            hand_model(),
            EvaluationMetrics::new(0.8, 0.8, 0.8, 0.8, 0.8),
            1,
            ReferenceDistribution::default(),
        )
        .unwrap();
    registry.promote(id, Stage::Production).unwrap();

    let mut missing = example_patient();
    missing.remove("creatinine");
    let request = InferenceRequest::new(missing).with_request_id("r-missing");
    match engine.handle(&request) {
        InferenceResponse::Failure { request_id, error } => {
            assert_eq!(request_id, "r-missing");
            assert_eq!(error.kind, ErrorKind::SchemaViolation);
            assert_eq!(error.status, 422);
        }
        other => panic!("expected failure, got {:?}", other),
    }

    let ok = engine.handle(&InferenceRequest::new(example_patient()).with_request_id("r-ok"));
    assert!(ok.is_success());
    assert_eq!(ok.request_id(), "r-ok");

    match engine.handle(&InferenceRequest::new(example_patient()).with_stage(Stage::Staging)) {
        InferenceResponse::Failure { error, .. } => {
            assert_eq!(error.kind, ErrorKind::ModelUnavailable);
            assert_eq!(error.status, 503);
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

fn synthetic_dataset(rows: usize, seed: u64) -> TrainingDataset {
    let contract = FeatureContract::readmission_v1();
    let mut rng = StdRng::seed_from_u64(seed);

    let examples = (0..rows)
        .map(|_| {
            let age: i64 = rng.gen_range(30..90);
            let creatinine: f64 = rng.gen_range(0.6..2.6);
            let encounters: i64 = rng.gen_range(0..7);
            let score = (age as f64 - 60.0) / 30.0 + (creatinine - 1.6) + (encounters as f64 - 3.0) / 3.0;

            let features = contract
                .validate(&raw(json!({
                    "age": age,
                    "gender": rng.gen_range(0..2),
                    "num_encounters": encounters,
                    "avg_los": rng.gen_range(1.0..8.0),
                    "creatinine": creatinine,
                    "heart_rate": rng.gen_range(55.0..120.0),
                    "systolic_bp": rng.gen_range(100.0..170.0)
                })))
                .unwrap();
            LabeledExample {
                features,
                label: score > 0.0,
            }
        })
        .collect();

    TrainingDataset::new(contract.version(), examples)
}

#[test]
fn trained_model_passes_gate_and_serves() {
    let dataset = synthetic_dataset(400, 11);
    let config = TrainingConfig::default();
    let outcome = train(&dataset, &config, &LogisticTrainer::default()).unwrap();

    assert!(outcome.metrics.auc > 0.9, "auc {}", outcome.metrics.auc);
    assert_eq!(outcome.train_size + outcome.holdout_size, 400);

    let registry = Arc::new(ModelRegistry::in_memory(GateThresholds::default()));
    assert!(gate(&outcome.metrics, registry.thresholds()).is_pass());

    let id = registry
        .register(
            Arc::from(outcome.scorer),
            outcome.metrics,
            outcome.schema_version,
            outcome.reference,
        )
        .unwrap();
    registry.promote(id, Stage::Production).unwrap();

    let engine = engine(registry.clone());
    let sick = engine
        .predict(
            &raw(json!({
                "age": 88, "gender": 0, "num_encounters": 6, "avg_los": 6.0,
                "creatinine": 2.5, "heart_rate": 100, "systolic_bp": 150
            })),
            Stage::Production,
        )
        .unwrap();
    let well = engine
        .predict(
            &raw(json!({
                "age": 32, "gender": 1, "num_encounters": 0, "avg_los": 2.0,
                "creatinine": 0.7, "heart_rate": 70, "systolic_bp": 120
            })),
            Stage::Production,
        )
        .unwrap();
    assert!(sick.probability > well.probability);
    assert_eq!(sick.category, RiskCategory::High);
    assert_eq!(well.category, RiskCategory::Low);
}

#[test]
fn training_reference_detects_shifted_traffic() {
    let dataset = synthetic_dataset(1000, 5);
    let outcome = train(&dataset, &TrainingConfig::default(), &LogisticTrainer::default()).unwrap();

    let same = synthetic_dataset(1000, 99);
    let live: Vec<_> = same.examples().iter().map(|e| e.features.clone()).collect();
    let verdict = drift::check(&live, &outcome.reference, &DriftConfig::default());
    assert!(!verdict.drift_detected, "{:?}", verdict.drifted_fields());

    let contract = FeatureContract::readmission_v1();
    let shifted: Vec<_> = live
        .iter()
        .map(|fv| {
            let mut r = fv.to_json().as_object().unwrap().clone();
            let creatinine = fv.get("creatinine").unwrap();
            r.insert("creatinine".to_string(), json!(creatinine + 3.0));
            contract.validate(&r).unwrap()
        })
        .collect();
    let verdict = drift::check(&shifted, &outcome.reference, &DriftConfig::default());
    assert!(verdict.drift_detected);
    assert!(verdict.drifted_fields().contains(&"creatinine"));
}
