//! Periodic drift checks over the live inference window

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::drift::{self, DriftConfig, DriftStatus, DriftVerdict, LiveWindow};
use crate::registry::{ModelRegistry, RegistryError, Stage};

/// Compares recent inference inputs with the Production model's reference
pub struct DriftMonitor {
    registry: Arc<ModelRegistry>,
    window: Arc<LiveWindow>,
    config: DriftConfig,
}

impl DriftMonitor {
    pub fn new(registry: Arc<ModelRegistry>, window: Arc<LiveWindow>, config: DriftConfig) -> Self {
        Self {
            registry,
            window,
            config,
        }
    }

    /// Run one check now
    pub fn check_now(&self) -> Result<DriftVerdict, RegistryError> {
        let version = self.registry.resolve(Stage::Production)?;
        let batch = self.window.snapshot();
        let verdict = drift::check(&batch, &version.reference, &self.config);
        log_verdict(version.id, &verdict);
        Ok(verdict)
    }

    /// Start the periodic check task
    pub async fn start(self) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let monitor = Arc::new(self);
        let mut interval = tokio::time::interval(period);
        // First tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let m = Arc::clone(&monitor);
            match tokio::task::spawn_blocking(move || m.check_now()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(error = %e, "Drift check skipped"),
                Err(e) => error!(error = %e, "Drift check task failed"),
            }
        }
    }
}

/// Log a verdict at a level matching its outcome
pub fn log_verdict(model_version: u64, verdict: &DriftVerdict) {
    match verdict.status {
        DriftStatus::InsufficientData { observed, required } => {
            debug!(model_version, observed, required, "Not enough live data for drift check");
        }
        DriftStatus::Evaluated if verdict.drift_detected => {
            warn!(
                model_version,
                batch_size = verdict.batch_size,
                drifted = ?verdict.drifted_fields(),
                "Feature drift detected; retraining recommended"
            );
        }
        DriftStatus::Evaluated => {
            let max_psi = verdict.fields.iter().map(|f| f.psi).fold(0.0, f64::max);
            info!(
                model_version,
                batch_size = verdict.batch_size,
                max_psi,
                "No feature drift"
            );
        }
    }
}
