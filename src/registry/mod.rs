//! Versioned model registry with Staging and Production stages.
//!
//! Readers clone an `Arc` of an immutable [`Snapshot`] under a short read
//! lock. Writers serialize on a separate mutex, persist through the
//! [`RegistryStore`], and only then swap in a new snapshot, so a reader never
//! observes a stage held twice or vacated mid-promotion.

pub mod store;

pub use store::{FsStore, InMemoryStore, RegistryStore, StageAssignments, VersionRecord};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::drift::ReferenceDistribution;
use crate::models::loader::{ArtifactError, ModelLoader};
use crate::models::scorer::Scorer;
use crate::training::{gate, EvaluationMetrics, GateResult, GateThresholds, MetricName};

/// Lifecycle stage of a model version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    None,
    Staging,
    Production,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::None => write!(f, "none"),
            Stage::Staging => write!(f, "staging"),
            Stage::Production => write!(f, "production"),
        }
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "latest" => Ok(Stage::None),
            "staging" => Ok(Stage::Staging),
            "production" | "prod" => Ok(Stage::Production),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no model version holds stage {0}")]
    NotFound(Stage),

    #[error("unknown model version {0}")]
    UnknownVersion(u64),

    #[error("registry storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry metadata error: {0}")]
    Metadata(#[source] serde_json::Error),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("registry state is inconsistent: {0}")]
    Corrupt(String),

    #[error("registry lock poisoned")]
    LockPoisoned,
}

impl RegistryError {
    pub(crate) fn storage(path: &std::path::Path, source: std::io::Error) -> Self {
        RegistryError::Storage {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A promotion request was refused; stage assignments are unchanged
#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("unknown model version {0}")]
    UnknownVersion(u64),

    #[error("version {version} failed the gate on {}", join_metrics(.violations))]
    GateFailed {
        version: u64,
        violations: Vec<MetricName>,
    },

    #[error("cannot promote to stage none; stages are vacated only by promoting another version")]
    InvalidTarget,

    #[error("version {0} holds production; moving it to staging would leave production empty")]
    WouldVacateProduction(u64),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

fn join_metrics(names: &[MetricName]) -> String {
    names.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// A registered model version
#[derive(Debug, Clone)]
pub struct ModelVersion {
    pub id: u64,
    pub scorer: Arc<dyn Scorer>,
    pub metrics: EvaluationMetrics,
    pub schema_version: u32,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub reference: Arc<ReferenceDistribution>,
}

impl ModelVersion {
    fn record(&self) -> VersionRecord {
        VersionRecord {
            id: self.id,
            algorithm: self.scorer.name().to_string(),
            feature_names: self.scorer.feature_names().to_vec(),
            metrics: self.metrics,
            schema_version: self.schema_version,
            stage: self.stage,
            created_at: self.created_at,
            reference: self.reference.as_ref().clone(),
        }
    }
}

/// Immutable view of the registry at one instant
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    versions: BTreeMap<u64, ModelVersion>,
    stages: StageAssignments,
}

impl Snapshot {
    pub fn stages(&self) -> StageAssignments {
        self.stages
    }

    fn next_id(&self) -> u64 {
        self.versions.keys().next_back().map_or(1, |id| id + 1)
    }
}

pub struct ModelRegistry {
    store: Box<dyn RegistryStore>,
    loader: ModelLoader,
    thresholds: GateThresholds,
    state: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl ModelRegistry {
    /// Load every persisted version and the stage pointer from `store`
    pub fn open(store: Box<dyn RegistryStore>, thresholds: GateThresholds) -> Result<Self, RegistryError> {
        let loader = ModelLoader::new();
        let snapshot = load_snapshot(store.as_ref(), &loader, &Snapshot::default())?;

        info!(
            versions = snapshot.versions.len(),
            staging = ?snapshot.stages.staging,
            production = ?snapshot.stages.production,
            "Model registry opened"
        );

        Ok(Self {
            store,
            loader,
            thresholds,
            state: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        })
    }

    /// Empty registry backed by memory
    pub fn in_memory(thresholds: GateThresholds) -> Self {
        Self {
            store: Box::new(InMemoryStore::new()),
            loader: ModelLoader::new(),
            thresholds,
            state: RwLock::new(Arc::new(Snapshot::default())),
            writer: Mutex::new(()),
        }
    }

    pub fn thresholds(&self) -> &GateThresholds {
        &self.thresholds
    }

    /// Current snapshot; cheap to clone and never mutated
    pub fn snapshot(&self) -> Result<Arc<Snapshot>, RegistryError> {
        self.state
            .read()
            .map(|guard| Arc::clone(&*guard))
            .map_err(|_| RegistryError::LockPoisoned)
    }

    fn publish(&self, snapshot: Snapshot) -> Result<(), RegistryError> {
        let mut guard = self.state.write().map_err(|_| RegistryError::LockPoisoned)?;
        *guard = Arc::new(snapshot);
        Ok(())
    }

    /// Re-read the store so versions and promotions written by another
    /// process become visible. Returns whether anything changed.
    pub fn reload(&self) -> Result<bool, RegistryError> {
        let _writer = self.writer.lock().map_err(|_| RegistryError::LockPoisoned)?;
        let current = self.snapshot()?;
        let next = load_snapshot(self.store.as_ref(), &self.loader, &current)?;

        let changed = next.stages != current.stages || next.versions.len() != current.versions.len();
        if changed {
            info!(
                versions = next.versions.len(),
                staging = ?next.stages.staging,
                production = ?next.stages.production,
                "Model registry reloaded"
            );
            self.publish(next)?;
        }
        Ok(changed)
    }

    /// Reload every `period` until the task is dropped
    pub async fn watch(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let registry = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || registry.reload()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Registry reload failed"),
                Err(e) => warn!(error = %e, "Registry reload task panicked"),
            }
        }
    }

    /// Persist a new version at stage None and return its id
    pub fn register(
        &self,
        scorer: Arc<dyn Scorer>,
        metrics: EvaluationMetrics,
        schema_version: u32,
        reference: ReferenceDistribution,
    ) -> Result<u64, RegistryError> {
        let _writer = self.writer.lock().map_err(|_| RegistryError::LockPoisoned)?;
        let current = self.snapshot()?;

        let version = ModelVersion {
            id: current.next_id(),
            scorer,
            metrics,
            schema_version,
            stage: Stage::None,
            created_at: Utc::now(),
            reference: Arc::new(reference),
        };

        let artifact = self.loader.encode(version.scorer.as_ref())?;
        self.store.put_version(&version.record(), &artifact)?;

        let id = version.id;
        let mut next = current.as_ref().clone();
        next.versions.insert(id, version);
        self.publish(next)?;

        info!(
            version = id,
            schema_version,
            auc = metrics.auc,
            f1 = metrics.f1,
            "Registered model version"
        );
        Ok(id)
    }

    /// Assign `id` to `target`, demoting the previous holder to None.
    ///
    /// Production requires the stored metrics to pass the gate under this
    /// registry's thresholds. Re-promoting the current holder is a no-op.
    pub fn promote(&self, id: u64, target: Stage) -> Result<(), PromotionError> {
        let _writer = self.writer.lock().map_err(|_| RegistryError::LockPoisoned)?;
        let current = self.snapshot()?;

        let version = current.versions.get(&id).ok_or(PromotionError::UnknownVersion(id))?;

        match target {
            Stage::None => return Err(PromotionError::InvalidTarget),
            Stage::Staging if current.stages.production == Some(id) => {
                return Err(PromotionError::WouldVacateProduction(id));
            }
            Stage::Production => {
                if let GateResult::Fail { violations } = gate(&version.metrics, &self.thresholds) {
                    warn!(version = id, violations = %join_metrics(&violations), "Promotion refused by gate");
                    return Err(PromotionError::GateFailed { version: id, violations });
                }
            }
            Stage::Staging => {}
        }

        if current.stages.holder(target) == Some(id) {
            return Ok(());
        }

        let mut stages = current.stages;
        let previous = stages.holder(target);
        stages.assign(target, id);

        // The stage pointer is the commit point
        self.store.put_stages(&stages)?;

        let mut next = current.as_ref().clone();
        next.stages = stages;
        for version in next.versions.values_mut() {
            let stage = stages.stage_of(version.id);
            if version.stage != stage {
                version.stage = stage;
                if let Err(e) = self.store.put_metadata(&version.record()) {
                    warn!(version = version.id, error = %e, "Failed to refresh version metadata");
                }
            }
        }
        self.publish(next)?;

        info!(
            version = id,
            stage = %target,
            demoted = ?previous,
            "Promoted model version"
        );
        Ok(())
    }

    /// Holder of `stage`; for [`Stage::None`], the latest version
    pub fn resolve(&self, stage: Stage) -> Result<ModelVersion, RegistryError> {
        let snapshot = self.snapshot()?;
        let version = match stage {
            Stage::None => snapshot.versions.values().next_back(),
            _ => snapshot
                .stages
                .holder(stage)
                .and_then(|id| snapshot.versions.get(&id)),
        };
        version.cloned().ok_or(RegistryError::NotFound(stage))
    }

    pub fn get(&self, id: u64) -> Result<ModelVersion, RegistryError> {
        self.snapshot()?
            .versions
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownVersion(id))
    }

    /// All versions ascending by id
    pub fn list(&self) -> Result<Vec<ModelVersion>, RegistryError> {
        Ok(self.snapshot()?.versions.values().cloned().collect())
    }
}

/// Build a snapshot from `store`, reusing scorers already decoded in `known`
fn load_snapshot(
    store: &dyn RegistryStore,
    loader: &ModelLoader,
    known: &Snapshot,
) -> Result<Snapshot, RegistryError> {
    let stages = store.load_stages()?;

    let mut versions = BTreeMap::new();
    for (record, artifact) in store.load_versions()? {
        let stage = stages.stage_of(record.id);
        let version = match known.versions.get(&record.id) {
            Some(existing) => ModelVersion {
                stage,
                ..existing.clone()
            },
            None => {
                if stage != record.stage {
                    warn!(
                        version = record.id,
                        recorded = %record.stage,
                        pointer = %stage,
                        "Version metadata stage differs from stage pointer; using pointer"
                    );
                }
                ModelVersion {
                    id: record.id,
                    scorer: loader.decode(&artifact)?,
                    metrics: record.metrics,
                    schema_version: record.schema_version,
                    stage,
                    created_at: record.created_at,
                    reference: Arc::new(record.reference),
                }
            }
        };
        versions.insert(record.id, version);
    }

    for stage in [Stage::Staging, Stage::Production] {
        if let Some(id) = stages.holder(stage) {
            if !versions.contains_key(&id) {
                return Err(RegistryError::Corrupt(format!(
                    "stage {} points at missing version {}",
                    stage, id
                )));
            }
        }
    }

    Ok(Snapshot { versions, stages })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::logistic::{LogisticModel, Scaler};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn scorer() -> Arc<dyn Scorer> {
        Arc::new(LogisticModel {
            feature_names: vec!["age".to_string()],
            scaler: Scaler {
                mean: vec![50.0],
                std: vec![10.0],
            },
            weights: vec![1.0],
            bias: 0.0,
        })
    }

    fn passing() -> EvaluationMetrics {
        EvaluationMetrics::new(0.72, 0.66, 0.61, 0.62, 0.61)
    }

    fn failing() -> EvaluationMetrics {
        EvaluationMetrics::new(0.68, 0.66, 0.61, 0.62, 0.61)
    }

    fn registry() -> ModelRegistry {
        ModelRegistry::in_memory(GateThresholds::default())
    }

    fn register(registry: &ModelRegistry, metrics: EvaluationMetrics) -> u64 {
        registry
            .register(scorer(), metrics, 1, ReferenceDistribution::default())
            .unwrap()
    }

    #[test]
    fn test_register_allocates_monotonic_ids() {
        let registry = registry();
        assert_eq!(register(&registry, passing()), 1);
        assert_eq!(register(&registry, failing()), 2);

        let versions = registry.list().unwrap();
        assert_eq!(versions.iter().map(|v| v.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(versions.iter().all(|v| v.stage == Stage::None));
    }

    #[test]
    fn test_promote_to_production_demotes_previous() {
        let registry = registry();
        let v1 = register(&registry, passing());
        let v2 = register(&registry, passing());

        registry.promote(v1, Stage::Production).unwrap();
        registry.promote(v2, Stage::Production).unwrap();

        assert_eq!(registry.resolve(Stage::Production).unwrap().id, v2);
        assert_eq!(registry.get(v1).unwrap().stage, Stage::None);
        let holders = registry
            .list()
            .unwrap()
            .iter()
            .filter(|v| v.stage == Stage::Production)
            .count();
        assert_eq!(holders, 1);
    }

    #[test]
    fn test_failing_gate_leaves_stages_unchanged() {
        let registry = registry();
        let v1 = register(&registry, passing());
        let v2 = register(&registry, failing());
        registry.promote(v1, Stage::Production).unwrap();
        let before = registry.snapshot().unwrap().stages();

        let err = registry.promote(v2, Stage::Production).unwrap_err();
        match err {
            PromotionError::GateFailed { version, violations } => {
                assert_eq!(version, v2);
                assert_eq!(violations, vec![MetricName::Auc]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.snapshot().unwrap().stages(), before);
        assert_eq!(registry.resolve(Stage::Production).unwrap().id, v1);
    }

    #[test]
    fn test_staging_is_unconditional() {
        let registry = registry();
        let v1 = register(&registry, failing());
        registry.promote(v1, Stage::Staging).unwrap();
        assert_eq!(registry.resolve(Stage::Staging).unwrap().id, v1);
    }

    #[test]
    fn test_gate_is_rechecked_with_registry_thresholds() {
        let strict = ModelRegistry::in_memory(GateThresholds {
            auc: 0.9,
            ..GateThresholds::default()
        });
        let v1 = register(&strict, passing());
        assert!(matches!(
            strict.promote(v1, Stage::Production),
            Err(PromotionError::GateFailed { .. })
        ));
    }

    #[test]
    fn test_staging_to_production_vacates_staging() {
        let registry = registry();
        let v1 = register(&registry, passing());
        registry.promote(v1, Stage::Staging).unwrap();
        registry.promote(v1, Stage::Production).unwrap();

        assert!(matches!(
            registry.resolve(Stage::Staging),
            Err(RegistryError::NotFound(Stage::Staging))
        ));
        assert_eq!(registry.get(v1).unwrap().stage, Stage::Production);
    }

    #[test]
    fn test_invalid_promotions() {
        let registry = registry();
        let v1 = register(&registry, passing());
        registry.promote(v1, Stage::Production).unwrap();

        assert!(matches!(registry.promote(42, Stage::Staging), Err(PromotionError::UnknownVersion(42))));
        assert!(matches!(registry.promote(v1, Stage::None), Err(PromotionError::InvalidTarget)));
        assert!(matches!(
            registry.promote(v1, Stage::Staging),
            Err(PromotionError::WouldVacateProduction(1))
        ));
        // Re-promotion of the current holder is a no-op
        registry.promote(v1, Stage::Production).unwrap();
        assert_eq!(registry.resolve(Stage::Production).unwrap().id, v1);
    }

    #[test]
    fn test_resolve_none_returns_latest() {
        let registry = registry();
        assert!(matches!(registry.resolve(Stage::None), Err(RegistryError::NotFound(Stage::None))));
        register(&registry, passing());
        let v2 = register(&registry, failing());
        assert_eq!(registry.resolve(Stage::None).unwrap().id, v2);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_promotions() {
        let registry = registry();
        let v1 = register(&registry, passing());
        let before = registry.snapshot().unwrap();
        registry.promote(v1, Stage::Production).unwrap();

        assert_eq!(before.stages().production, None);
        assert_eq!(registry.snapshot().unwrap().stages().production, Some(v1));
    }

    #[test]
    fn test_readers_never_see_production_vacated_or_shared() {
        let registry = registry();
        let v1 = register(&registry, passing());
        let v2 = register(&registry, passing());
        registry.promote(v1, Stage::Production).unwrap();

        let done = AtomicBool::new(false);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let mut reads = 0;
                    while !done.load(Ordering::Acquire) || reads < 200 {
                        let holder = registry.resolve(Stage::Production).unwrap();
                        assert!(holder.id == v1 || holder.id == v2);
                        assert_eq!(holder.stage, Stage::Production);

                        let holders = registry
                            .list()
                            .unwrap()
                            .iter()
                            .filter(|v| v.stage == Stage::Production)
                            .count();
                        assert_eq!(holders, 1);
                        reads += 1;
                    }
                });
            }

            for round in 0..500 {
                let id = if round % 2 == 0 { v2 } else { v1 };
                registry.promote(id, Stage::Production).unwrap();
            }
            done.store(true, Ordering::Release);
        });

        assert_eq!(registry.resolve(Stage::Production).unwrap().id, v1);
    }

    #[test]
    fn test_reload_without_outside_writes_is_unchanged() {
        let registry = registry();
        let v1 = register(&registry, passing());
        registry.promote(v1, Stage::Production).unwrap();
        let before = registry.resolve(Stage::Production).unwrap();

        assert!(!registry.reload().unwrap());
        let after = registry.resolve(Stage::Production).unwrap();
        assert_eq!(after.id, v1);
        assert!(Arc::ptr_eq(&before.scorer, &after.scorer));
    }

    #[test]
    fn test_stage_parsing() {
        assert_eq!("Production".parse::<Stage>().unwrap(), Stage::Production);
        assert_eq!("latest".parse::<Stage>().unwrap(), Stage::None);
        assert!("archived".parse::<Stage>().is_err());
    }
}
