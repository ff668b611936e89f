//! Serving metrics and live model-health statistics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

use crate::types::risk::{ErrorKind, RiskCategory};

/// Running mean and variance of served probabilities (Welford)
#[derive(Debug, Default, Clone, Copy)]
struct RunningMoments {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningMoments {
    fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }
}

/// Metrics collector for the inference path
pub struct InferenceMetrics {
    /// Total successful predictions
    pub predictions_served: AtomicU64,
    /// Total failed requests
    pub errors: AtomicU64,
    errors_by_kind: RwLock<HashMap<ErrorKind, u64>>,
    predictions_by_category: RwLock<HashMap<RiskCategory, u64>>,
    /// Latencies in microseconds, most recent window
    latencies: RwLock<Vec<u64>>,
    score_buckets: RwLock<[u64; 10]>,
    moments: RwLock<RunningMoments>,
    start_time: Instant,
}

impl InferenceMetrics {
    pub fn new() -> Self {
        Self {
            predictions_served: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            errors_by_kind: RwLock::new(HashMap::new()),
            predictions_by_category: RwLock::new(HashMap::new()),
            latencies: RwLock::new(Vec::with_capacity(1000)),
            score_buckets: RwLock::new([0; 10]),
            moments: RwLock::new(RunningMoments::default()),
            start_time: Instant::now(),
        }
    }

    /// Record a successful prediction
    pub fn record_prediction(&self, latency: Duration, probability: f64, category: RiskCategory) {
        self.predictions_served.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);

        let bucket = (probability * 10.0).clamp(0.0, 9.0) as usize;
        if let Ok(mut buckets) = self.score_buckets.write() {
            buckets[bucket] += 1;
        }
        if let Ok(mut by_category) = self.predictions_by_category.write() {
            *by_category.entry(category).or_insert(0) += 1;
        }
        if let Ok(mut moments) = self.moments.write() {
            moments.push(probability);
        }
    }

    /// Record a failed request
    pub fn record_error(&self, kind: ErrorKind, latency: Duration) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
        if let Ok(mut by_kind) = self.errors_by_kind.write() {
            *by_kind.entry(kind).or_insert(0) += 1;
        }
    }

    fn record_latency(&self, latency: Duration) {
        if let Ok(mut times) = self.latencies.write() {
            times.push(latency.as_micros() as u64);
            // Keep only last 10000
            if times.len() > 10000 {
                times.drain(0..5000);
            }
        }
    }

    pub fn latency_stats(&self) -> LatencyStats {
        let mut sorted = match self.latencies.read() {
            Ok(times) if !times.is_empty() => times.clone(),
            _ => return LatencyStats::default(),
        };
        sorted.sort_unstable();

        let count = sorted.len();
        let pick = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];

        LatencyStats {
            count: count as u64,
            mean_us: sorted.iter().sum::<u64>() / count as u64,
            p50_us: pick(0.50),
            p95_us: pick(0.95),
            p99_us: pick(0.99),
            max_us: sorted[count - 1],
        }
    }

    /// Live model health: mean confidence and prediction variance
    pub fn health(&self) -> ModelHealth {
        let moments = self.moments.read().map(|m| *m).unwrap_or_default();
        ModelHealth {
            predictions: moments.count,
            mean_confidence: moments.mean,
            prediction_variance: moments.variance(),
        }
    }

    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.predictions_served.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn score_distribution(&self) -> [u64; 10] {
        self.score_buckets.read().map(|b| *b).unwrap_or([0; 10])
    }

    pub fn predictions_by_category(&self) -> HashMap<RiskCategory, u64> {
        self.predictions_by_category
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn errors_by_kind(&self) -> HashMap<ErrorKind, u64> {
        self.errors_by_kind.read().map(|m| m.clone()).unwrap_or_default()
    }

    /// Log summary statistics
    pub fn print_summary(&self) {
        let served = self.predictions_served.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let latency = self.latency_stats();
        let health = self.health();

        info!(
            served,
            errors,
            throughput = %format!("{:.1}", self.throughput()),
            mean_us = latency.mean_us,
            p50_us = latency.p50_us,
            p95_us = latency.p95_us,
            p99_us = latency.p99_us,
            "Inference summary"
        );
        info!(
            mean_confidence = %format!("{:.3}", health.mean_confidence),
            prediction_variance = %format!("{:.4}", health.prediction_variance),
            "Model health"
        );

        let by_category = self.predictions_by_category();
        for category in [RiskCategory::Low, RiskCategory::Medium, RiskCategory::High] {
            let count = by_category.get(&category).copied().unwrap_or(0);
            let pct = if served > 0 {
                count as f64 / served as f64 * 100.0
            } else {
                0.0
            };
            info!(category = category.as_str(), count, pct = %format!("{:.1}", pct), "Predictions by category");
        }

        for (kind, count) in self.errors_by_kind() {
            info!(kind = kind.as_str(), status = kind.status(), count, "Errors by kind");
        }

        let dist = self.score_distribution();
        let total: u64 = dist.iter().sum();
        for (i, &count) in dist.iter().enumerate() {
            let pct = if total > 0 { count as f64 / total as f64 * 100.0 } else { 0.0 };
            let bar: String = "█".repeat(((pct / 2.0) as usize).min(20));
            info!(
                "  {:.1}-{:.1}: {:>6} ({:>5.1}%) {}",
                i as f64 / 10.0,
                (i + 1) as f64 / 10.0,
                count,
                pct,
                bar
            );
        }
    }
}

impl Default for InferenceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct LatencyStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ModelHealth {
    pub predictions: u64,
    pub mean_confidence: f64,
    pub prediction_variance: f64,
}

/// Periodic summary logger
pub struct MetricsReporter {
    metrics: Arc<InferenceMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<InferenceMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}
