//! Distribution drift between live inference inputs and the training reference.
//!
//! Each field of the reference keeps decile cutpoints and a sorted sample over
//! the training partition. A live batch is compared per field through the
//! population stability index (PSI) over those deciles and a two-sample
//! Kolmogorov-Smirnov test against the sample.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics, Statistics};
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;

use crate::config::ConfigError;
use crate::contract::FeatureVector;

/// Number of quantile buckets per field
pub const BUCKETS: usize = 10;

/// Live rows needed per bucket before PSI is meaningful
pub const MIN_ROWS_PER_BUCKET: usize = 50;

/// Most order statistics kept per field for the KS test
pub const REFERENCE_SAMPLE: usize = 1000;

/// Additive smoothing applied to bucket proportions before taking logs
const SMOOTHING: f64 = 1e-6;

/// Summary of one field over the reference partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldReference {
    pub name: String,
    pub count: usize,
    pub mean: f64,
    pub variance: f64,
    /// Fill value for vectors lacking the field
    pub median: f64,
    pub min: f64,
    pub max: f64,
    /// Interior decile cutpoints, ascending (`BUCKETS - 1` values)
    pub cutpoints: Vec<f64>,
    /// Share of reference values per bucket; sums to 1
    pub proportions: Vec<f64>,
    /// Evenly spaced order statistics, ascending
    #[serde(default)]
    pub sample: Vec<f64>,
}

impl FieldReference {
    fn from_values(name: &str, mut values: Vec<f64>) -> Self {
        values.sort_by(f64::total_cmp);
        let n = values.len();
        let mean = values.iter().mean();
        let variance = values.iter().population_variance();

        let mut data = Data::new(values.clone());
        let median = data.quantile(0.5);
        let cutpoints: Vec<f64> = (1..BUCKETS)
            .map(|k| data.quantile(k as f64 / BUCKETS as f64))
            .collect();
        let proportions = proportions(&values, &cutpoints);

        Self {
            name: name.to_string(),
            count: n,
            mean,
            variance,
            median,
            min: values[0],
            max: values[n - 1],
            cutpoints,
            proportions,
            sample: order_statistics(&values, REFERENCE_SAMPLE),
        }
    }
}

/// At most `k` evenly spaced values of a sorted slice, endpoints included
fn order_statistics(sorted: &[f64], k: usize) -> Vec<f64> {
    if sorted.len() <= k {
        return sorted.to_vec();
    }
    let last = sorted.len() - 1;
    (0..k).map(|i| sorted[i * last / (k - 1)]).collect()
}

/// Per-field reference snapshot attached to a model version
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReferenceDistribution {
    pub fields: Vec<FieldReference>,
}

impl ReferenceDistribution {
    /// Summarize vectors field by field. Field order follows the first vector;
    /// fields a vector lacks are skipped for that vector.
    pub fn from_vectors<'a, I>(vectors: I) -> Self
    where
        I: IntoIterator<Item = &'a FeatureVector>,
    {
        let mut columns: Vec<(String, Vec<f64>)> = Vec::new();
        for fv in vectors {
            for (name, value) in fv.iter() {
                match columns.iter_mut().find(|(n, _)| n == name) {
                    Some((_, values)) => values.push(value),
                    None => columns.push((name.to_string(), vec![value])),
                }
            }
        }

        Self {
            fields: columns
                .into_iter()
                .map(|(name, values)| FieldReference::from_values(&name, values))
                .collect(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldReference> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// (field, median) pairs for imputing absent fields
    pub fn medians(&self) -> impl Iterator<Item = (&str, f64)> {
        self.fields.iter().map(|f| (f.name.as_str(), f.median))
    }
}

/// Bucket index under ascending cutpoints; a value equal to a cutpoint falls
/// in the lower bucket
fn bucket(value: f64, cutpoints: &[f64]) -> usize {
    cutpoints.partition_point(|&c| c < value)
}

fn proportions(values: &[f64], cutpoints: &[f64]) -> Vec<f64> {
    let mut counts = vec![0usize; cutpoints.len() + 1];
    for &v in values {
        counts[bucket(v, cutpoints)] += 1;
    }
    let n = values.len() as f64;
    counts.into_iter().map(|c| c as f64 / n).collect()
}

/// Population stability index between reference and live bucket proportions
pub fn psi(expected: &[f64], actual: &[f64]) -> f64 {
    expected
        .iter()
        .zip(actual)
        .map(|(&e, &a)| {
            let e = e + SMOOTHING;
            let a = a + SMOOTHING;
            (a - e) * (a / e).ln()
        })
        .sum()
}

/// Largest gap between the empirical CDFs of two sorted samples
pub fn ks_statistic(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (n, m) = (a.len() as f64, b.len() as f64);
    let (mut i, mut j) = (0, 0);
    let mut d: f64 = 0.0;

    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        d = d.max((i as f64 / n - j as f64 / m).abs());
    }
    d
}

/// Asymptotic two-sided p-value of a two-sample KS statistic, with the
/// Stephens small-sample correction
pub fn ks_pvalue(d: f64, n: usize, m: usize) -> f64 {
    if n == 0 || m == 0 || d <= 0.0 {
        return 1.0;
    }
    let en = ((n * m) as f64 / (n + m) as f64).sqrt();
    kolmogorov_survival((en + 0.12 + 0.11 / en) * d)
}

/// P(K > lambda) for the Kolmogorov distribution
fn kolmogorov_survival(lambda: f64) -> f64 {
    // Series converges too slowly below this; the survival is 1 to 1e-7
    if lambda < 0.2 {
        return 1.0;
    }
    let mut sum = 0.0;
    let mut sign = 1.0;
    for k in 1..=100 {
        let k = k as f64;
        let term = sign * 2.0 * (-2.0 * k * k * lambda * lambda).exp();
        sum += term;
        if term.abs() < 1e-12 {
            break;
        }
        sign = -sign;
    }
    sum.clamp(0.0, 1.0)
}

/// When a batch counts as drifted overall
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriftTrigger {
    /// At least this many fields drifted
    Fields(usize),
    /// At least this share of evaluated fields drifted
    Fraction(f64),
}

/// Drift detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// PSI above which a field is drifted
    pub per_field_threshold: f64,
    /// KS significance level for the whole batch, split evenly across fields
    pub ks_alpha: f64,
    /// Drifted-field count that flags overall drift (default 1)
    pub min_drifted_fields: Option<usize>,
    /// Drifted-field share that flags overall drift; exclusive with the count
    pub min_drifted_fraction: Option<f64>,
    /// Smaller batches yield an insufficient-data verdict
    pub min_batch_size: usize,
    /// Capacity of the live inference window
    pub window_size: usize,
    /// Seconds between monitor checks
    pub interval_secs: u64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            per_field_threshold: 0.1,
            ks_alpha: 0.05,
            min_drifted_fields: None,
            min_drifted_fraction: None,
            min_batch_size: BUCKETS * MIN_ROWS_PER_BUCKET,
            window_size: 1000,
            interval_secs: 300,
        }
    }
}

impl DriftConfig {
    pub fn trigger(&self) -> DriftTrigger {
        match (self.min_drifted_fraction, self.min_drifted_fields) {
            (Some(fraction), _) => DriftTrigger::Fraction(fraction),
            (None, fields) => DriftTrigger::Fields(fields.unwrap_or(1)),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.per_field_threshold.is_finite() && self.per_field_threshold > 0.0) {
            return Err(ConfigError(format!(
                "drift.per_field_threshold must be positive, got {}",
                self.per_field_threshold
            )));
        }
        if !(self.ks_alpha > 0.0 && self.ks_alpha < 1.0) {
            return Err(ConfigError(format!(
                "drift.ks_alpha must be strictly between 0 and 1, got {}",
                self.ks_alpha
            )));
        }
        if self.min_drifted_fields.is_some() && self.min_drifted_fraction.is_some() {
            return Err(ConfigError(
                "set only one of drift.min_drifted_fields and drift.min_drifted_fraction".to_string(),
            ));
        }
        if self.min_drifted_fields == Some(0) {
            return Err(ConfigError("drift.min_drifted_fields must be at least 1".to_string()));
        }
        if let Some(fraction) = self.min_drifted_fraction {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(ConfigError(format!(
                    "drift.min_drifted_fraction must be in (0, 1], got {}",
                    fraction
                )));
            }
        }
        let floor = BUCKETS * MIN_ROWS_PER_BUCKET;
        if self.min_batch_size < floor {
            return Err(ConfigError(format!(
                "drift.min_batch_size must be at least {} ({} rows per PSI bucket), got {}",
                floor, MIN_ROWS_PER_BUCKET, self.min_batch_size
            )));
        }
        if self.window_size < self.min_batch_size {
            return Err(ConfigError(format!(
                "drift.window_size ({}) is smaller than drift.min_batch_size ({})",
                self.window_size, self.min_batch_size
            )));
        }
        if self.interval_secs == 0 {
            return Err(ConfigError("drift.interval_secs must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Drift result for one field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDrift {
    pub field: String,
    pub psi: f64,
    pub ks_stat: f64,
    pub ks_pvalue: f64,
    /// Live mean minus reference mean, in reference standard deviations
    pub mean_shift: f64,
    pub drifted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriftStatus {
    Evaluated,
    InsufficientData { observed: usize, required: usize },
}

/// Outcome of one drift check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftVerdict {
    pub status: DriftStatus,
    pub fields: Vec<FieldDrift>,
    pub drift_detected: bool,
    pub batch_size: usize,
    pub evaluated_at: DateTime<Utc>,
}

impl DriftVerdict {
    /// Names of drifted fields in reference order
    pub fn drifted_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.drifted)
            .map(|f| f.field.as_str())
            .collect()
    }

    /// Treat an insufficient batch as an error
    pub fn into_result(self) -> Result<DriftVerdict, DriftError> {
        match self.status {
            DriftStatus::InsufficientData { observed, required } => {
                Err(DriftError::InsufficientData { observed, required })
            }
            DriftStatus::Evaluated => Ok(self),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DriftError {
    #[error("insufficient data for drift check: {observed} vectors, need {required}")]
    InsufficientData { observed: usize, required: usize },
}

/// Compare a live batch against a reference. Pure apart from the timestamp.
pub fn check(live: &[FeatureVector], reference: &ReferenceDistribution, config: &DriftConfig) -> DriftVerdict {
    let evaluated_at = Utc::now();
    let required = config.min_batch_size.max(1);

    if live.len() < required {
        return DriftVerdict {
            status: DriftStatus::InsufficientData {
                observed: live.len(),
                required,
            },
            fields: Vec::new(),
            drift_detected: false,
            batch_size: live.len(),
            evaluated_at,
        };
    }

    let mut fields = Vec::with_capacity(reference.fields.len());
    for field_ref in &reference.fields {
        let mut values: Vec<f64> = live.iter().filter_map(|fv| fv.get(&field_ref.name)).collect();
        if values.is_empty() {
            continue;
        }
        values.sort_by(f64::total_cmp);

        let live_props = proportions(&values, &field_ref.cutpoints);
        let ks_stat = ks_statistic(&field_ref.sample, &values);
        let live_mean = values.iter().mean();
        let std = field_ref.variance.sqrt().max(SMOOTHING);

        fields.push(FieldDrift {
            field: field_ref.name.clone(),
            psi: psi(&field_ref.proportions, &live_props),
            ks_stat,
            ks_pvalue: ks_pvalue(ks_stat, field_ref.sample.len(), values.len()),
            mean_shift: (live_mean - field_ref.mean) / std,
            drifted: false,
        });
    }

    // Bonferroni split keeps the batch-level KS false-alarm rate at ks_alpha
    let field_alpha = config.ks_alpha / fields.len().max(1) as f64;
    for f in &mut fields {
        f.drifted = f.psi > config.per_field_threshold || f.ks_pvalue < field_alpha;
    }

    let drifted = fields.iter().filter(|f| f.drifted).count();
    let drift_detected = match config.trigger() {
        DriftTrigger::Fields(min) => drifted >= min,
        DriftTrigger::Fraction(min) => {
            !fields.is_empty() && drifted as f64 / fields.len() as f64 >= min
        }
    };

    DriftVerdict {
        status: DriftStatus::Evaluated,
        fields,
        drift_detected,
        batch_size: live.len(),
        evaluated_at,
    }
}

/// Bounded FIFO of recently validated inference inputs
#[derive(Debug)]
pub struct LiveWindow {
    capacity: usize,
    vectors: Mutex<VecDeque<FeatureVector>>,
}

impl LiveWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            vectors: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Append a vector, evicting the oldest when full
    pub fn push(&self, fv: FeatureVector) {
        if let Ok(mut vectors) = self.vectors.lock() {
            if vectors.len() == self.capacity {
                vectors.pop_front();
            }
            vectors.push_back(fv);
        }
    }

    /// Copy of the current window, oldest first
    pub fn snapshot(&self) -> Vec<FeatureVector> {
        self.vectors
            .lock()
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.vectors.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
