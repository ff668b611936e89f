//! Test Request Producer
//!
//! Generates synthetic patient requests and publishes them to NATS for
//! pipeline testing. `csv` mode writes a labeled training dataset instead.

use rand::Rng;
use readmission_risk_pipeline::contract::RawFeatures;
use readmission_risk_pipeline::types::request::InferenceRequest;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Synthetic patient generator
struct PatientGenerator {
    rng: rand::rngs::ThreadRng,
    request_counter: u64,
}

impl PatientGenerator {
    fn new() -> Self {
        Self {
            rng: rand::thread_rng(),
            request_counter: 0,
        }
    }

    fn next_id(&mut self) -> String {
        self.request_counter += 1;
        format!("req_{:012}", self.request_counter)
    }

    /// Younger patient with stable vitals
    fn generate_routine(&mut self) -> RawFeatures {
        features(json!({
            "age": self.rng.gen_range(25..70),
            "gender": self.rng.gen_range(0..2),
            "num_encounters": self.rng.gen_range(0..2),
            "avg_los": round2(self.rng.gen_range(1.0..4.0)),
            "creatinine": round2(self.rng.gen_range(0.6..1.2)),
            "heart_rate": round2(self.rng.gen_range(58.0..90.0)),
            "systolic_bp": round2(self.rng.gen_range(105.0..135.0))
        }))
    }

    /// Older patient with frequent encounters and abnormal labs
    fn generate_high_risk(&mut self) -> RawFeatures {
        features(json!({
            "age": self.rng.gen_range(65..95),
            "gender": self.rng.gen_range(0..2),
            "num_encounters": self.rng.gen_range(2..8),
            "avg_los": round2(self.rng.gen_range(4.0..12.0)),
            "creatinine": round2(self.rng.gen_range(1.4..3.5)),
            "heart_rate": round2(self.rng.gen_range(95.0..130.0)),
            "systolic_bp": round2(self.rng.gen_range(140.0..185.0))
        }))
    }

    /// Request that breaks the feature contract
    fn generate_invalid(&mut self) -> RawFeatures {
        let mut raw = self.generate_routine();
        match self.rng.gen_range(0..3) {
            0 => {
                raw.remove("creatinine");
            }
            1 => {
                raw.insert("age".to_string(), json!(-4));
            }
            _ => {
                raw.insert("heart_rate".to_string(), json!("fast"));
            }
        }
        raw
    }
}

fn features(value: Value) -> RawFeatures {
    match value {
        Value::Object(map) => map,
        _ => RawFeatures::new(),
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_producer=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.get(1).map(|s| s.as_str()) == Some("csv") {
        let path = args.get(2).map(|s| s.as_str()).unwrap_or("data/train.csv");
        let rows: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(1000);
        let high_risk_rate: f64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(0.3);
        return write_dataset(Path::new(path), rows, high_risk_rate);
    }

    info!("Starting Test Request Producer");

    // Parse arguments
    let nats_url = args.get(1).map(|s| s.as_str()).unwrap_or("nats://localhost:4222");
    let subject = args.get(2).map(|s| s.as_str()).unwrap_or("readmission.requests");
    let count: u64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(100);
    let high_risk_rate: f64 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(0.2);
    let delay_ms: u64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(100);
    let invalid_rate: f64 = args.get(6).and_then(|s| s.parse().ok()).unwrap_or(0.0);

    info!(
        nats_url = %nats_url,
        subject = %subject,
        count = count,
        high_risk_rate = high_risk_rate,
        invalid_rate = invalid_rate,
        delay_ms = delay_ms,
        "Configuration loaded"
    );

    // Connect to NATS
    let client = match async_nats::connect(nats_url).await {
        Ok(c) => {
            info!("Connected to NATS");
            c
        }
        Err(e) => {
            warn!(error = %e, "Failed to connect to NATS. Running in dry-run mode.");
            return run_dry_mode(count, high_risk_rate, invalid_rate, delay_ms).await;
        }
    };

    let mut generator = PatientGenerator::new();
    let mut rng = rand::thread_rng();

    info!("Starting to publish {} requests...", count);

    let mut routine_count = 0;
    let mut high_risk_count = 0;
    let mut invalid_count = 0;

    for i in 0..count {
        let features = if rng.gen_bool(invalid_rate) {
            invalid_count += 1;
            generator.generate_invalid()
        } else if rng.gen_bool(high_risk_rate) {
            high_risk_count += 1;
            generator.generate_high_risk()
        } else {
            routine_count += 1;
            generator.generate_routine()
        };
        let request = InferenceRequest::new(features).with_request_id(generator.next_id());

        let payload = serde_json::to_vec(&request)?;
        client.publish(subject.to_string(), payload.into()).await?;

        if (i + 1) % 10 == 0 {
            info!(
                "Published {}/{} requests ({} routine, {} high risk, {} invalid)",
                i + 1,
                count,
                routine_count,
                high_risk_count,
                invalid_count
            );
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    client.flush().await?;
    info!(
        "Completed! Published {} requests ({} routine, {} high risk, {} invalid)",
        count, routine_count, high_risk_count, invalid_count
    );

    Ok(())
}

async fn run_dry_mode(count: u64, high_risk_rate: f64, invalid_rate: f64, delay_ms: u64) -> anyhow::Result<()> {
    info!("Running in dry-run mode (no NATS connection)");

    let mut generator = PatientGenerator::new();
    let mut rng = rand::thread_rng();

    for i in 0..count {
        let features = if rng.gen_bool(invalid_rate) {
            generator.generate_invalid()
        } else if rng.gen_bool(high_risk_rate) {
            generator.generate_high_risk()
        } else {
            generator.generate_routine()
        };
        let request = InferenceRequest::new(features).with_request_id(generator.next_id());

        let json = serde_json::to_string_pretty(&request)?;

        if (i + 1) % 10 == 0 || i == 0 {
            info!("Sample request {}:\n{}", i + 1, json);
        }

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    Ok(())
}

/// Write a labeled dataset; high-risk profiles are readmitted 70% of the time, routine ones 10%
fn write_dataset(path: &Path, rows: usize, high_risk_rate: f64) -> anyhow::Result<()> {
    const COLUMNS: [&str; 7] = [
        "age",
        "gender",
        "num_encounters",
        "avg_los",
        "creatinine",
        "heart_rate",
        "systolic_bp",
    ];

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    let mut header: Vec<&str> = COLUMNS.to_vec();
    header.push("readmitted_30d");
    writer.write_record(&header)?;

    let mut generator = PatientGenerator::new();
    let mut rng = rand::thread_rng();
    let mut positives = 0;

    for _ in 0..rows {
        let high_risk = rng.gen_bool(high_risk_rate);
        let features = if high_risk {
            generator.generate_high_risk()
        } else {
            generator.generate_routine()
        };
        let readmitted = rng.gen_bool(if high_risk { 0.7 } else { 0.1 });
        if readmitted {
            positives += 1;
        }

        let mut record: Vec<String> = COLUMNS
            .iter()
            .map(|c| features.get(*c).map(|v| v.to_string()).unwrap_or_default())
            .collect();
        record.push(if readmitted { "1" } else { "0" }.to_string());
        writer.write_record(&record)?;
    }
    writer.flush()?;

    info!(path = %path.display(), rows, positives, "Wrote training dataset");
    Ok(())
}
