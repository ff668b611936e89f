//! Readmission Risk Pipeline - Main Entry Point
//!
//! `train`, `promote`, `list` and `drift` manage the model lifecycle against
//! the filesystem registry. `serve` consumes scoring requests from NATS and
//! publishes responses, with requests scored concurrently.

use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command, ValueHint};
use futures::StreamExt;
use readmission_risk_pipeline::{
    config::{AppConfig, LoggingConfig, DEFAULT_CONFIG_PATH},
    consumer::{decode_request, RequestConsumer},
    contract::{FeatureContract, FeatureVector, RawFeatures},
    drift::{self, LiveWindow},
    metrics::{InferenceMetrics, MetricsReporter},
    models::inference::InferenceEngine,
    monitor::{log_verdict, DriftMonitor},
    producer::ResponseProducer,
    registry::{FsStore, ModelRegistry, Stage},
    training::{gate, train, tune, CsvDatasetSource, DatasetSource, GateResult},
    types::risk::{ErrorBody, ErrorKind, InferenceResponse},
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

fn cli() -> Command {
    Command::new("readmission-risk-pipeline")
        .version(clap::crate_version!())
        .about("Readmission risk scoring with a gated model registry")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .help("Path to the configuration file")
                .default_value(DEFAULT_CONFIG_PATH)
                .value_parser(clap::value_parser!(PathBuf))
                .value_hint(ValueHint::FilePath),
        )
        .subcommand(
            Command::new("train")
                .about("Train a model from a CSV dataset and register it")
                .arg(
                    Arg::new("data")
                        .long("data")
                        .short('d')
                        .required(true)
                        .help("CSV with contract fields and the label column")
                        .value_parser(clap::value_parser!(PathBuf))
                        .value_hint(ValueHint::FilePath),
                )
                .arg(
                    Arg::new("promote")
                        .long("promote")
                        .help("Promote the new version after registering it")
                        .value_parser(["staging", "production"]),
                ),
        )
        .subcommand(
            Command::new("promote")
                .about("Assign a registered version to a stage")
                .arg(
                    Arg::new("version")
                        .required(true)
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("stage")
                        .required(true)
                        .value_parser(["staging", "production"]),
                ),
        )
        .subcommand(Command::new("list").about("List registered versions"))
        .subcommand(
            Command::new("drift")
                .about("Check a batch of logged inputs for drift against a version's reference")
                .arg(
                    Arg::new("input")
                        .long("input")
                        .short('i')
                        .required(true)
                        .help("JSON lines, one feature object or request envelope per line")
                        .value_parser(clap::value_parser!(PathBuf))
                        .value_hint(ValueHint::FilePath),
                )
                .arg(
                    Arg::new("stage")
                        .long("stage")
                        .default_value("production")
                        .value_parser(["none", "staging", "production"]),
                )
                .arg(
                    Arg::new("strict")
                        .long("strict")
                        .help("Fail when the batch is too small to evaluate")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("serve").about("Serve inference requests from NATS"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = AppConfig::load_from_path(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    init_logging(&config.logging)?;
    info!(path = %config_path.display(), "Configuration loaded");

    match matches.subcommand() {
        Some(("train", sub)) => run_train(&config, sub),
        Some(("promote", sub)) => run_promote(&config, sub),
        Some(("list", _)) => run_list(&config),
        Some(("drift", sub)) => run_drift(&config, sub),
        Some(("serve", _)) => serve(config).await,
        _ => unreachable!("Subcommand is required by CLI configuration"),
    }
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("readmission_risk_pipeline={}", config.level).parse()?);

    if config.format == "pretty" {
        tracing_subscriber::fmt().with_env_filter(filter).pretty().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }
    Ok(())
}

fn open_registry(config: &AppConfig) -> Result<ModelRegistry> {
    let store = FsStore::open(&config.registry.path)
        .with_context(|| format!("Failed to open registry at {}", config.registry.path))?;
    ModelRegistry::open(Box::new(store), config.gate).context("Failed to load model registry")
}

fn parse_stage(matches: &ArgMatches, name: &str) -> Result<Stage> {
    let raw = matches
        .get_one::<String>(name)
        .with_context(|| format!("missing argument {}", name))?;
    raw.parse::<Stage>().map_err(anyhow::Error::msg)
}

fn run_train(config: &AppConfig, matches: &ArgMatches) -> Result<()> {
    let data = matches
        .get_one::<PathBuf>("data")
        .context("missing argument data")?;
    let contract = config.contract.contract();

    let dataset = CsvDatasetSource::new(data)
        .with_label_column(&config.training.label_column)
        .load(&contract)
        .with_context(|| format!("Failed to load dataset {}", data.display()))?;

    let trainer = if config.training.tune {
        tune(&dataset, &config.training).context("Hyper-parameter tuning failed")?
    } else {
        config.training.trainer()
    };
    let outcome = train(&dataset, &config.training, &trainer).context("Training failed")?;

    let registry = open_registry(config)?;
    let verdict = gate(&outcome.metrics, registry.thresholds());
    let id = registry.register(
        Arc::from(outcome.scorer),
        outcome.metrics,
        outcome.schema_version,
        outcome.reference,
    )?;

    match &verdict {
        GateResult::Pass => info!(version = id, "Gate passed"),
        GateResult::Fail { violations } => {
            warn!(version = id, violations = ?violations, "Gate failed; version cannot reach production")
        }
    }
    println!(
        "registered version {} (AUC {:.3}, accuracy {:.3}, precision {:.3}, recall {:.3}, F1 {:.3}): gate {}",
        id,
        outcome.metrics.auc,
        outcome.metrics.accuracy,
        outcome.metrics.precision,
        outcome.metrics.recall,
        outcome.metrics.f1,
        if verdict.is_pass() { "passed" } else { "failed" }
    );

    if matches.contains_id("promote") {
        let stage = parse_stage(matches, "promote")?;
        registry.promote(id, stage)?;
        println!("promoted version {} to {}", id, stage);
    }
    Ok(())
}

fn run_promote(config: &AppConfig, matches: &ArgMatches) -> Result<()> {
    let id = *matches
        .get_one::<u64>("version")
        .context("missing argument version")?;
    let stage = parse_stage(matches, "stage")?;

    let registry = open_registry(config)?;
    registry.promote(id, stage)?;
    println!("promoted version {} to {}", id, stage);
    Ok(())
}

fn run_list(config: &AppConfig) -> Result<()> {
    let registry = open_registry(config)?;
    println!(
        "{:>7}  {:<10}  {:>6}  {:>6}  {:>6}  {:>6}  {:>6}  {:>6}  created",
        "version", "stage", "schema", "AUC", "acc", "prec", "recall", "F1"
    );
    for v in registry.list()? {
        println!(
            "{:>7}  {:<10}  {:>6}  {:>6.3}  {:>6.3}  {:>6.3}  {:>6.3}  {:>6.3}  {}",
            v.id,
            v.stage,
            v.schema_version,
            v.metrics.auc,
            v.metrics.accuracy,
            v.metrics.precision,
            v.metrics.recall,
            v.metrics.f1,
            v.created_at.to_rfc3339()
        );
    }
    Ok(())
}

fn run_drift(config: &AppConfig, matches: &ArgMatches) -> Result<()> {
    let input = matches
        .get_one::<PathBuf>("input")
        .context("missing argument input")?;
    let stage = parse_stage(matches, "stage")?;

    let registry = open_registry(config)?;
    let version = registry.resolve(stage)?;
    let batch = read_batch(input, &config.contract.contract())?;

    let verdict = drift::check(&batch, &version.reference, &config.drift);
    log_verdict(version.id, &verdict);
    println!("{}", serde_json::to_string_pretty(&verdict)?);

    if matches.get_flag("strict") {
        verdict.into_result()?;
    }
    Ok(())
}

/// Read and validate a JSON-lines batch of feature objects
fn read_batch(path: &Path, contract: &FeatureContract) -> Result<Vec<FeatureVector>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let mut batch = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value =
            serde_json::from_str(line).with_context(|| format!("line {}: invalid JSON", i + 1))?;
        let raw: RawFeatures = match value {
            serde_json::Value::Object(mut map) => match map.remove("features") {
                Some(serde_json::Value::Object(features)) => features,
                Some(_) => bail!("line {}: features must be an object", i + 1),
                None => map,
            },
            _ => bail!("line {}: expected a JSON object", i + 1),
        };
        let fv = contract
            .validate(&raw)
            .with_context(|| format!("line {}: schema violation", i + 1))?;
        batch.push(fv);
    }
    Ok(batch)
}

async fn serve(config: AppConfig) -> Result<()> {
    info!("Starting Readmission Risk Pipeline");

    let registry = Arc::new(open_registry(&config)?);
    match registry.resolve(Stage::Production) {
        Ok(v) => info!(version = v.id, schema_version = v.schema_version, "Production model loaded"),
        Err(e) => warn!(error = %e, "No production model; requests will be answered as unavailable"),
    }

    let metrics = Arc::new(InferenceMetrics::new());
    let window = Arc::new(LiveWindow::new(config.drift.window_size));
    let engine = Arc::new(InferenceEngine::new(
        config.contract.contract(),
        registry.clone(),
        config.risk,
        metrics.clone(),
        window.clone(),
    ));

    // Connect to NATS
    let client = async_nats::connect(&config.nats.url)
        .await
        .with_context(|| format!("Failed to connect to NATS at {}", config.nats.url))?;
    info!(url = %config.nats.url, "Connected to NATS");

    let consumer = RequestConsumer::new(client.clone(), &config.nats.request_subject);
    let producer = Arc::new(ResponseProducer::new(client.clone(), &config.nats.response_subject));

    let num_workers = config.pipeline.workers;
    info!(
        workers = num_workers,
        requests = %consumer.subject(),
        responses = %producer.subject(),
        "Starting request processing loop"
    );

    // Semaphore to limit concurrent processing
    let semaphore = Arc::new(Semaphore::new(num_workers));
    let processed_count = Arc::new(AtomicU64::new(0));

    let reporter = MetricsReporter::new(metrics.clone(), config.pipeline.metrics_interval_secs);
    tokio::spawn(reporter.start());

    let monitor = DriftMonitor::new(registry.clone(), window.clone(), config.drift.clone());
    tokio::spawn(monitor.start());

    // Pick up promotions made by `promote` from another process
    tokio::spawn(registry.clone().watch(Duration::from_secs(config.registry.reload_secs)));

    let mut subscription = consumer.subscribe().await?;

    while let Some(message) = subscription.next().await {
        // Acquire permit (limits concurrent tasks)
        let permit = semaphore.clone().acquire_owned().await?;

        let engine = engine.clone();
        let producer = producer.clone();
        let processed_count = processed_count.clone();

        tokio::spawn(async move {
            let start_time = Instant::now();

            let response = match decode_request(&message.payload) {
                Ok(request) => engine.handle(&request),
                Err(e) => {
                    warn!(error = %e, "Failed to deserialize request");
                    engine
                        .metrics()
                        .record_error(ErrorKind::MalformedRequest, start_time.elapsed());
                    InferenceResponse::Failure {
                        request_id: uuid::Uuid::new_v4().to_string(),
                        error: ErrorBody::new(ErrorKind::MalformedRequest, format!("malformed request: {}", e)),
                    }
                }
            };

            // Request-reply callers get the answer on their inbox
            let published = match message.reply.as_ref() {
                Some(reply) => producer.publish_to(&reply.to_string(), &response).await,
                None => producer.publish(&response).await,
            };

            if let Err(e) = published {
                error!(
                    request_id = %response.request_id(),
                    error = %e,
                    "Failed to publish response"
                );
            } else {
                debug!(
                    request_id = %response.request_id(),
                    processing_time_us = start_time.elapsed().as_micros() as u64,
                    "Request processed"
                );
            }

            let count = processed_count.fetch_add(1, Ordering::Relaxed) + 1;

            // Log progress every 100 requests
            if count % 100 == 0 {
                let latency = engine.metrics().latency_stats();
                info!(
                    processed = count,
                    throughput = %format!("{:.1} req/s", engine.metrics().throughput()),
                    avg_latency_us = latency.mean_us,
                    "Processing milestone"
                );
            }

            drop(permit);
        });
    }

    info!("Pipeline shutting down...");
    metrics.print_summary();
    // Give in-flight publishes a chance to reach the server
    let _ = tokio::time::timeout(Duration::from_secs(5), client.flush()).await;

    Ok(())
}
