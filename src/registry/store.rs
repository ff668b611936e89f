//! Durable storage behind the model registry.
//!
//! Filesystem layout:
//!
//! ```text
//! <root>/versions/<id>/model.json      scorer artifact
//! <root>/versions/<id>/metadata.json   VersionRecord, written last
//! <root>/stages.json                   stage pointer
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! reader sees either the old or the new content. A version directory without
//! `metadata.json` is an interrupted registration and is skipped on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::{RegistryError, Stage};
use crate::drift::ReferenceDistribution;
use crate::training::EvaluationMetrics;

/// Persisted metadata of one model version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: u64,
    pub algorithm: String,
    pub feature_names: Vec<String>,
    pub metrics: EvaluationMetrics,
    pub schema_version: u32,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub reference: ReferenceDistribution,
}

/// Which version holds each stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageAssignments {
    pub staging: Option<u64>,
    pub production: Option<u64>,
}

impl StageAssignments {
    pub fn holder(&self, stage: Stage) -> Option<u64> {
        match stage {
            Stage::Staging => self.staging,
            Stage::Production => self.production,
            Stage::None => None,
        }
    }

    pub fn stage_of(&self, id: u64) -> Stage {
        if self.production == Some(id) {
            Stage::Production
        } else if self.staging == Some(id) {
            Stage::Staging
        } else {
            Stage::None
        }
    }

    /// Assign `id` to `stage`, vacating any other stage it held
    pub fn assign(&mut self, stage: Stage, id: u64) {
        if self.staging == Some(id) {
            self.staging = None;
        }
        if self.production == Some(id) {
            self.production = None;
        }
        match stage {
            Stage::Staging => self.staging = Some(id),
            Stage::Production => self.production = Some(id),
            Stage::None => {}
        }
    }
}

/// Storage backend for registry state
pub trait RegistryStore: Send + Sync {
    /// All complete versions with their artifact bytes, ascending by id
    fn load_versions(&self) -> Result<Vec<(VersionRecord, Vec<u8>)>, RegistryError>;

    fn load_stages(&self) -> Result<StageAssignments, RegistryError>;

    /// Persist a new version. The artifact must be durable before the
    /// metadata that publishes it.
    fn put_version(&self, record: &VersionRecord, artifact: &[u8]) -> Result<(), RegistryError>;

    /// Rewrite metadata of an existing version
    fn put_metadata(&self, record: &VersionRecord) -> Result<(), RegistryError>;

    fn put_stages(&self, stages: &StageAssignments) -> Result<(), RegistryError>;
}

/// Volatile store for tests and dry runs
#[derive(Debug, Default)]
pub struct InMemoryStore {
    versions: Mutex<BTreeMap<u64, (VersionRecord, Vec<u8>)>>,
    stages: Mutex<StageAssignments>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegistryStore for InMemoryStore {
    fn load_versions(&self) -> Result<Vec<(VersionRecord, Vec<u8>)>, RegistryError> {
        let versions = self.versions.lock().map_err(|_| RegistryError::LockPoisoned)?;
        Ok(versions.values().cloned().collect())
    }

    fn load_stages(&self) -> Result<StageAssignments, RegistryError> {
        let stages = self.stages.lock().map_err(|_| RegistryError::LockPoisoned)?;
        Ok(*stages)
    }

    fn put_version(&self, record: &VersionRecord, artifact: &[u8]) -> Result<(), RegistryError> {
        let mut versions = self.versions.lock().map_err(|_| RegistryError::LockPoisoned)?;
        versions.insert(record.id, (record.clone(), artifact.to_vec()));
        Ok(())
    }

    fn put_metadata(&self, record: &VersionRecord) -> Result<(), RegistryError> {
        let mut versions = self.versions.lock().map_err(|_| RegistryError::LockPoisoned)?;
        match versions.get_mut(&record.id) {
            Some(entry) => {
                entry.0 = record.clone();
                Ok(())
            }
            None => Err(RegistryError::UnknownVersion(record.id)),
        }
    }

    fn put_stages(&self, stages: &StageAssignments) -> Result<(), RegistryError> {
        let mut current = self.stages.lock().map_err(|_| RegistryError::LockPoisoned)?;
        *current = *stages;
        Ok(())
    }
}

/// Directory-backed store
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    const METADATA: &'static str = "metadata.json";
    const ARTIFACT: &'static str = "model.json";
    const STAGES: &'static str = "stages.json";

    /// Open (creating if needed) a registry directory
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, RegistryError> {
        let root = root.as_ref().to_path_buf();
        let versions = root.join("versions");
        fs::create_dir_all(&versions).map_err(|e| RegistryError::storage(&versions, e))?;
        debug!(root = %root.display(), "Opened filesystem registry store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_dir(&self, id: u64) -> PathBuf {
        self.root.join("versions").join(id.to_string())
    }

    fn read(path: &Path) -> Result<Vec<u8>, RegistryError> {
        fs::read(path).map_err(|e| RegistryError::storage(path, e))
    }

    /// Write to `<path>.tmp`, then rename over `path`
    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RegistryError> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, bytes).map_err(|e| RegistryError::storage(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| RegistryError::storage(path, e))
    }

    fn write_metadata(&self, record: &VersionRecord) -> Result<(), RegistryError> {
        let bytes = serde_json::to_vec_pretty(record).map_err(RegistryError::Metadata)?;
        Self::write_atomic(&self.version_dir(record.id).join(Self::METADATA), &bytes)
    }
}

impl RegistryStore for FsStore {
    fn load_versions(&self) -> Result<Vec<(VersionRecord, Vec<u8>)>, RegistryError> {
        let dir = self.root.join("versions");
        let entries = fs::read_dir(&dir).map_err(|e| RegistryError::storage(&dir, e))?;

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RegistryError::storage(&dir, e))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let metadata_path = path.join(Self::METADATA);
            if !metadata_path.exists() {
                warn!(path = %path.display(), "Skipping version without metadata");
                continue;
            }

            let record: VersionRecord =
                serde_json::from_slice(&Self::read(&metadata_path)?).map_err(RegistryError::Metadata)?;
            let artifact = Self::read(&path.join(Self::ARTIFACT))?;
            versions.push((record, artifact));
        }

        versions.sort_by_key(|(record, _)| record.id);
        Ok(versions)
    }

    fn load_stages(&self) -> Result<StageAssignments, RegistryError> {
        let path = self.root.join(Self::STAGES);
        if !path.exists() {
            return Ok(StageAssignments::default());
        }
        serde_json::from_slice(&Self::read(&path)?).map_err(RegistryError::Metadata)
    }

    fn put_version(&self, record: &VersionRecord, artifact: &[u8]) -> Result<(), RegistryError> {
        let dir = self.version_dir(record.id);
        fs::create_dir_all(&dir).map_err(|e| RegistryError::storage(&dir, e))?;
        Self::write_atomic(&dir.join(Self::ARTIFACT), artifact)?;
        self.write_metadata(record)
    }

    fn put_metadata(&self, record: &VersionRecord) -> Result<(), RegistryError> {
        if !self.version_dir(record.id).join(Self::METADATA).exists() {
            return Err(RegistryError::UnknownVersion(record.id));
        }
        self.write_metadata(record)
    }

    fn put_stages(&self, stages: &StageAssignments) -> Result<(), RegistryError> {
        let bytes = serde_json::to_vec_pretty(stages).map_err(RegistryError::Metadata)?;
        Self::write_atomic(&self.root.join(Self::STAGES), &bytes)
    }
}
