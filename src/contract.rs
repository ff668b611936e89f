//! Feature contract for patient feature vectors.
//!
//! The contract fixes which fields a feature vector carries, their numeric kind
//! and their admissible range. Training and inference both validate through
//! it, so a model never sees a vector shaped differently from the one it was
//! fitted on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Raw, unvalidated input: a flat mapping of field names to JSON values.
pub type RawFeatures = Map<String, Value>;

/// Numeric kind of a contract field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Integer,
    Float,
}

/// Declared shape of a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    /// Inclusive lower bound
    pub min: Option<f64>,
    /// Inclusive upper bound
    pub max: Option<f64>,
    pub required: bool,
}

impl FieldSpec {
    pub fn integer(name: &str, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Integer,
            min,
            max,
            required: true,
        }
    }

    pub fn float(name: &str, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Float,
            min,
            max,
            required: true,
        }
    }

    /// Mark the field optional (used by additive schema extensions)
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// How unknown fields in raw input are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// Unknown fields are a schema violation
    #[default]
    Strict,
    /// Unknown fields are dropped (forward-compatible clients)
    Lenient,
}

/// Why a single field failed validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ViolationReason {
    Missing,
    Unexpected,
    NotNumeric,
    NotInteger { value: f64 },
    NotFinite,
    OutOfRange {
        value: f64,
        min: Option<f64>,
        max: Option<f64>,
    },
}

/// One field-level violation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    #[serde(flatten)]
    pub reason: ViolationReason,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            ViolationReason::Missing => write!(f, "{}: required field missing", self.field),
            ViolationReason::Unexpected => write!(f, "{}: unexpected field", self.field),
            ViolationReason::NotNumeric => write!(f, "{}: not a number", self.field),
            ViolationReason::NotInteger { value } => {
                write!(f, "{}: expected an integer, got {}", self.field, value)
            }
            ViolationReason::NotFinite => write!(f, "{}: value is not finite", self.field),
            ViolationReason::OutOfRange { value, min, max } => {
                let lo = min.map(|v| v.to_string()).unwrap_or_else(|| "-inf".to_string());
                let hi = max.map(|v| v.to_string()).unwrap_or_else(|| "inf".to_string());
                write!(f, "{}: {} outside [{}, {}]", self.field, value, lo, hi)
            }
        }
    }
}

/// Raw input did not satisfy the feature contract.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("schema v{schema_version} validation failed: {}", join_violations(.violations))]
pub struct SchemaError {
    pub schema_version: u32,
    pub violations: Vec<FieldViolation>,
}

impl SchemaError {
    /// Names of the offending fields, in contract order followed by unknown fields
    pub fn fields(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A validated feature vector, ordered as the contract declares its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    schema_version: u32,
    values: Vec<(String, f64)>,
}

impl FeatureVector {
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Look up a field value by name
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| *value)
    }

    /// Fields in contract order
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Canonical JSON object of the vector (used for lineage hashing)
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .values
            .iter()
            .map(|(name, value)| (name.clone(), Value::from(*value)))
            .collect();
        Value::Object(map)
    }

    /// Copy of the vector with absent fields taken from `fill`. Filled fields
    /// follow the present ones.
    pub fn fill_missing<'a, I>(&self, fill: I) -> FeatureVector
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut values = self.values.clone();
        for (name, value) in fill {
            if self.get(name).is_none() && value.is_finite() {
                values.push((name.to_string(), value));
            }
        }
        FeatureVector {
            schema_version: self.schema_version,
            values,
        }
    }
}

/// Versioned feature contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureContract {
    version: u32,
    fields: Vec<FieldSpec>,
    /// Older model schema versions this contract can serve
    compatible_with: Vec<u32>,
    strictness: Strictness,
}

impl FeatureContract {
    /// Build a fresh contract. A fresh contract declares no compatibility with
    /// older versions, so replacing or retyping fields is a breaking bump.
    pub fn new(version: u32, fields: Vec<FieldSpec>) -> Self {
        Self {
            version,
            fields,
            compatible_with: Vec::new(),
            strictness: Strictness::Strict,
        }
    }

    /// The readmission contract (version 1)
    pub fn readmission_v1() -> Self {
        Self::new(
            1,
            vec![
                FieldSpec::integer("age", Some(0.0), Some(120.0)),
                FieldSpec::integer("gender", Some(0.0), Some(1.0)),
                FieldSpec::integer("num_encounters", Some(0.0), None),
                FieldSpec::float("avg_los", Some(0.0), None),
                FieldSpec::float("creatinine", Some(0.0), None),
                FieldSpec::float("heart_rate", Some(30.0), Some(250.0)),
                FieldSpec::float("systolic_bp", Some(50.0), Some(250.0)),
            ],
        )
    }

    pub fn with_strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    /// Additive extension: appends optional fields and bumps the version. The
    /// new contract stays compatible with every version this one served.
    pub fn extend(&self, extra: Vec<FieldSpec>) -> Self {
        let mut fields = self.fields.clone();
        fields.extend(extra.into_iter().map(FieldSpec::optional));

        let mut compatible_with = self.compatible_with.clone();
        compatible_with.push(self.version);

        Self {
            version: self.version + 1,
            fields,
            compatible_with,
            strictness: self.strictness,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn strictness(&self) -> Strictness {
        self.strictness
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Whether vectors validated under this contract may be scored by a model
    /// trained on `model_schema_version`.
    pub fn is_compatible_with(&self, model_schema_version: u32) -> bool {
        model_schema_version == self.version || self.compatible_with.contains(&model_schema_version)
    }

    /// Validate raw input into a [`FeatureVector`].
    ///
    /// All violations are collected so callers see every offending field at
    /// once rather than the first one.
    pub fn validate(&self, raw: &RawFeatures) -> Result<FeatureVector, SchemaError> {
        let mut violations = Vec::new();
        let mut values = Vec::with_capacity(self.fields.len());

        for spec in &self.fields {
            match raw.get(&spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        violations.push(FieldViolation {
                            field: spec.name.clone(),
                            reason: ViolationReason::Missing,
                        });
                    }
                }
                Some(value) => match check_value(spec, value) {
                    Ok(v) => values.push((spec.name.clone(), v)),
                    Err(reason) => violations.push(FieldViolation {
                        field: spec.name.clone(),
                        reason,
                    }),
                },
            }
        }

        if self.strictness == Strictness::Strict {
            let known: HashSet<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
            let mut unknown: Vec<&String> = raw.keys().filter(|k| !known.contains(k.as_str())).collect();
            unknown.sort();
            violations.extend(unknown.into_iter().map(|name| FieldViolation {
                field: name.clone(),
                reason: ViolationReason::Unexpected,
            }));
        }

        if violations.is_empty() {
            Ok(FeatureVector {
                schema_version: self.version,
                values,
            })
        } else {
            Err(SchemaError {
                schema_version: self.version,
                violations,
            })
        }
    }
}

impl Default for FeatureContract {
    fn default() -> Self {
        Self::readmission_v1()
    }
}

fn coerce(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn check_value(spec: &FieldSpec, value: &Value) -> Result<f64, ViolationReason> {
    let v = coerce(value).ok_or(ViolationReason::NotNumeric)?;

    if !v.is_finite() {
        return Err(ViolationReason::NotFinite);
    }
    if spec.kind == FieldKind::Integer && v.fract() != 0.0 {
        return Err(ViolationReason::NotInteger { value: v });
    }

    let below = spec.min.map_or(false, |min| v < min);
    let above = spec.max.map_or(false, |max| v > max);
    if below || above {
        return Err(ViolationReason::OutOfRange {
            value: v,
            min: spec.min,
            max: spec.max,
        });
    }

    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawFeatures {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn valid_patient() -> RawFeatures {
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

    #[test]
    fn test_valid_input_keeps_contract_order() {
        let contract = FeatureContract::readmission_v1();
        let fv = contract.validate(&valid_patient()).unwrap();

        assert_eq!(fv.schema_version(), 1);
        assert_eq!(fv.len(), 7);
        let names: Vec<&str> = fv.iter().map(|(n, _)| n).collect();
        assert_eq!(names, contract.field_names());
        assert_eq!(fv.get("creatinine"), Some(1.8));
    }

    #[test]
    fn test_missing_field_is_named() {
        let contract = FeatureContract::readmission_v1();
        let mut input = valid_patient();
        input.remove("heart_rate");

        let err = contract.validate(&input).unwrap_err();
        assert_eq!(err.fields(), vec!["heart_rate"]);
        assert_eq!(err.violations[0].reason, ViolationReason::Missing);
    }

    #[test]
    fn test_unexpected_field_rejected_when_strict() {
        let contract = FeatureContract::readmission_v1();
        let mut input = valid_patient();
        input.insert("zip_code".to_string(), json!(12345));

        let err = contract.validate(&input).unwrap_err();
        assert_eq!(err.fields(), vec!["zip_code"]);
        assert_eq!(err.violations[0].reason, ViolationReason::Unexpected);
    }

    #[test]
    fn test_unexpected_field_dropped_when_lenient() {
        let contract = FeatureContract::readmission_v1().with_strictness(Strictness::Lenient);
        let mut input = valid_patient();
        input.insert("zip_code".to_string(), json!(12345));

        let fv = contract.validate(&input).unwrap();
        assert_eq!(fv.get("zip_code"), None);
        assert_eq!(fv.len(), 7);
    }

    #[test]
    fn test_range_and_kind_checks() {
        let contract = FeatureContract::readmission_v1();
        let mut input = valid_patient();
        input.insert("age".to_string(), json!(-1));
        input.insert("gender".to_string(), json!(0.5));
        input.insert("heart_rate".to_string(), json!("fast"));

        let err = contract.validate(&input).unwrap_err();
        assert_eq!(err.fields(), vec!["age", "gender", "heart_rate"]);
        assert!(matches!(err.violations[0].reason, ViolationReason::OutOfRange { .. }));
        assert!(matches!(err.violations[1].reason, ViolationReason::NotInteger { .. }));
        assert_eq!(err.violations[2].reason, ViolationReason::NotNumeric);
    }

    #[test]
    fn test_numeric_strings_are_coerced() {
        let contract = FeatureContract::readmission_v1();
        let mut input = valid_patient();
        input.insert("creatinine".to_string(), json!(" 2.25 "));

        let fv = contract.validate(&input).unwrap();
        assert_eq!(fv.get("creatinine"), Some(2.25));
    }

    #[test]
    fn test_null_counts_as_missing() {
        let contract = FeatureContract::readmission_v1();
        let mut input = valid_patient();
        input.insert("avg_los".to_string(), Value::Null);

        let err = contract.validate(&input).unwrap_err();
        assert_eq!(err.fields(), vec!["avg_los"]);
    }

    #[test]
    fn test_extension_is_additive_and_compatible() {
        let v1 = FeatureContract::readmission_v1();
        let v2 = v1.extend(vec![FieldSpec::float("hemoglobin", Some(0.0), None)]);

        assert_eq!(v2.version(), 2);
        assert!(v2.is_compatible_with(1));
        assert!(v2.is_compatible_with(2));
        assert!(!v1.is_compatible_with(2));

        // Optional extension field may be absent
        let fv = v2.validate(&valid_patient()).unwrap();
        assert_eq!(fv.schema_version(), 2);
        assert_eq!(fv.get("hemoglobin"), None);
    }

    #[test]
    fn test_fill_missing_only_adds_absent_fields() {
        let v2 = FeatureContract::readmission_v1()
            .extend(vec![FieldSpec::float("hemoglobin", Some(0.0), None)]);
        let fv = v2.validate(&valid_patient()).unwrap();

        let filled = fv.fill_missing([("hemoglobin", 13.5), ("age", 40.0), ("albumin", f64::NAN)]);
        assert_eq!(filled.get("hemoglobin"), Some(13.5));
        assert_eq!(filled.get("age"), Some(72.0));
        assert_eq!(filled.get("albumin"), None);
        assert_eq!(filled.len(), 8);
        assert_eq!(filled.schema_version(), 2);
    }

    #[test]
    fn test_breaking_contract_declares_no_compatibility() {
        let v3 = FeatureContract::new(3, vec![FieldSpec::float("age", Some(0.0), None)]);
        assert!(!v3.is_compatible_with(1));
        assert!(!v3.is_compatible_with(2));
    }
}
