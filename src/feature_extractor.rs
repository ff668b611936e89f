//! Feature extraction for readmission model training and inference.
//!
//! Turns a validated [`FeatureVector`] into the numeric model input: the
//! contract fields in contract order followed by derived clinical indicators.
//! Training and inference both go through this module so the two sides can
//! never disagree on feature layout.

use crate::contract::FeatureVector;

/// Creatinine above this level flags possible kidney injury (mg/dL)
const HIGH_CREATININE: f64 = 1.5;
/// Stage 2 hypertension systolic cutoff (mmHg)
const HIGH_SYSTOLIC_BP: f64 = 140.0;
/// Tachycardia heart rate cutoff (bpm)
const TACHYCARDIA_BPM: f64 = 100.0;

/// Derived feature names, in emission order
pub const DERIVED_FEATURES: [&str; 4] = [
    "high_creatinine",
    "high_bp",
    "tachycardia",
    "encounter_los_ratio",
];

/// Feature extractor that transforms validated vectors into model input.
pub struct FeatureExtractor;

impl FeatureExtractor {
    /// Create a new feature extractor.
    pub fn new() -> Self {
        Self
    }

    /// Extract named features from a validated vector.
    ///
    /// Derived indicators are only emitted when the fields they depend on are
    /// present, which they always are under the base contract.
    pub fn extract(&self, fv: &FeatureVector) -> Vec<(String, f64)> {
        let mut features: Vec<(String, f64)> = fv
            .iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();

        let flag = |hit: bool| if hit { 1.0 } else { 0.0 };

        if let Some(creatinine) = fv.get("creatinine") {
            features.push(("high_creatinine".to_string(), flag(creatinine > HIGH_CREATININE)));
        }
        if let Some(sbp) = fv.get("systolic_bp") {
            features.push(("high_bp".to_string(), flag(sbp >= HIGH_SYSTOLIC_BP)));
        }
        if let Some(hr) = fv.get("heart_rate") {
            features.push(("tachycardia".to_string(), flag(hr >= TACHYCARDIA_BPM)));
        }
        if let (Some(encounters), Some(los)) = (fv.get("num_encounters"), fv.get("avg_los")) {
            features.push(("encounter_los_ratio".to_string(), encounters / (los + 1e-6)));
        }

        features
    }

    /// Feature names produced for a vector (model layout at training time).
    pub fn feature_names(&self, fv: &FeatureVector) -> Vec<String> {
        self.extract(fv).into_iter().map(|(name, _)| name).collect()
    }

    /// Build the model input for `layout`, the feature names a model was
    /// trained on. Returns the names the vector could not supply.
    pub fn select(&self, fv: &FeatureVector, layout: &[String]) -> Result<Vec<f64>, Vec<String>> {
        let named = self.extract(fv);
        let mut values = Vec::with_capacity(layout.len());
        let mut missing = Vec::new();

        for name in layout {
            match named.iter().find(|(n, _)| n == name) {
                Some((_, value)) => values.push(*value),
                None => missing.push(name.clone()),
            }
        }

        if missing.is_empty() {
            Ok(values)
        } else {
            Err(missing)
        }
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}
