//! Sweeping outputs
//!
//! Per-execution key/value records describing the infrastructure a stage was
//! initialized on. They are written once: a replan finds the record already
//! present and reuses the pod or VM identity it holds.

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::pipeline::infra::InfraFamily;

/// Key of the infrastructure details record
pub const STAGE_INFRA_DETAILS: &str = "stageInfraDetails";
/// Key of the cleanup details record
pub const STAGE_CLEANUP_DETAILS: &str = "stageCleanupDetails";

/// Errors raised by a sweeping output store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backing file could not be read or written
    #[error("Sweeping output store I/O error: {0}")]
    Io(String),
    /// Stored document is malformed
    #[error("Sweeping output store is corrupt: {0}")]
    Corrupt(String),
}

/// Where and how a stage was initialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StageInfraDetails {
    /// Build pod
    #[serde(rename_all = "camelCase")]
    Kubernetes {
        /// Pod name
        pod_name: String,
        /// Namespace
        namespace: String,
        /// Names of the step and service containers
        container_names: Vec<String>,
    },
    /// VM from a pool
    #[serde(rename_all = "camelCase")]
    Vm {
        /// Pool id
        pool_id: String,
        /// Stage runtime id
        stage_runtime_id: String,
    },
    /// Local Docker daemon
    #[serde(rename_all = "camelCase")]
    Docker {
        /// Stage runtime id
        stage_runtime_id: String,
    },
}

impl StageInfraDetails {
    /// Pod name or stage runtime id
    #[must_use]
    pub fn runtime_name(&self) -> &str {
        match self {
            Self::Kubernetes { pod_name, .. } => pod_name,
            Self::Vm {
                stage_runtime_id, ..
            }
            | Self::Docker { stage_runtime_id } => stage_runtime_id,
        }
    }
}

/// What has to be torn down once the stage ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCleanupDetails {
    /// Backend family
    pub infra_family: InfraFamily,
    /// Pod name or stage runtime id
    pub runtime_name: String,
    /// Namespace for pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Containers to stop
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_names: Vec<String>,
}

/// A stored record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SweepingOutput {
    /// Infrastructure details
    InfraDetails(StageInfraDetails),
    /// Cleanup details
    CleanupDetails(StageCleanupDetails),
}

/// Per-execution key/value store
pub trait SweepingOutputStore: Send + Sync {
    /// Reads a record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backing storage fails.
    fn get(&self, scope: &str, key: &str) -> Result<Option<SweepingOutput>, StoreError>;

    /// Writes a record, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backing storage fails.
    fn put(&self, scope: &str, key: &str, value: SweepingOutput) -> Result<(), StoreError>;

    /// Writes a record unless one exists. Returns true when written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backing storage fails.
    fn put_if_absent(
        &self,
        scope: &str,
        key: &str,
        value: SweepingOutput,
    ) -> Result<bool, StoreError> {
        if self.get(scope, key)?.is_some() {
            tracing::debug!(scope, key, "Sweeping output already present, skipping");
            return Ok(false);
        }
        self.put(scope, key, value)?;
        Ok(true)
    }
}

fn scoped(scope: &str, key: &str) -> String {
    format!("{scope}/{key}")
}

/// Store kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    outputs: RwLock<AHashMap<String, SweepingOutput>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.outputs.read().len()
    }

    /// True when nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.read().is_empty()
    }
}

impl SweepingOutputStore for InMemoryStore {
    fn get(&self, scope: &str, key: &str) -> Result<Option<SweepingOutput>, StoreError> {
        Ok(self.outputs.read().get(&scoped(scope, key)).cloned())
    }

    fn put(&self, scope: &str, key: &str, value: SweepingOutput) -> Result<(), StoreError> {
        self.outputs.write().insert(scoped(scope, key), value);
        Ok(())
    }

    fn put_if_absent(
        &self,
        scope: &str,
        key: &str,
        value: SweepingOutput,
    ) -> Result<bool, StoreError> {
        let mut outputs = self.outputs.write();
        let scoped_key = scoped(scope, key);
        if outputs.contains_key(&scoped_key) {
            tracing::debug!(scope, key, "Sweeping output already present, skipping");
            return Ok(false);
        }
        outputs.insert(scoped_key, value);
        Ok(true)
    }
}

/// Store persisted as a JSON document, used by the CLI across runs
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Store backed by `path`; the file is created on first write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<BTreeMap<String, SweepingOutput>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| StoreError::Io(e.to_string()))?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn write_all(&self, outputs: &BTreeMap<String, SweepingOutput>) -> Result<(), StoreError> {
        let content =
            serde_json::to_string_pretty(outputs).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        std::fs::write(&self.path, content).map_err(|e| StoreError::Io(e.to_string()))
    }
}

impl SweepingOutputStore for JsonFileStore {
    fn get(&self, scope: &str, key: &str) -> Result<Option<SweepingOutput>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.remove(&scoped(scope, key)))
    }

    fn put(&self, scope: &str, key: &str, value: SweepingOutput) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut outputs = self.read_all()?;
        outputs.insert(scoped(scope, key), value);
        self.write_all(&outputs)
    }

    fn put_if_absent(
        &self,
        scope: &str,
        key: &str,
        value: SweepingOutput,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock.lock();
        let mut outputs = self.read_all()?;
        let scoped_key = scoped(scope, key);
        if outputs.contains_key(&scoped_key) {
            tracing::debug!(scope, key, "Sweeping output already present, skipping");
            return Ok(false);
        }
        outputs.insert(scoped_key, value);
        self.write_all(&outputs)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pod(name: &str) -> SweepingOutput {
        SweepingOutput::InfraDetails(StageInfraDetails::Kubernetes {
            pod_name: name.to_string(),
            namespace: "builds".to_string(),
            container_names: vec!["step-1".to_string()],
        })
    }

    #[test]
    fn test_in_memory_put_if_absent() {
        let store = InMemoryStore::new();
        assert!(store.put_if_absent("exec-1", STAGE_INFRA_DETAILS, pod("a")).unwrap());
        assert!(!store.put_if_absent("exec-1", STAGE_INFRA_DETAILS, pod("b")).unwrap());
        assert_eq!(
            store.get("exec-1", STAGE_INFRA_DETAILS).unwrap(),
            Some(pod("a"))
        );
        assert_eq!(store.get("exec-2", STAGE_INFRA_DETAILS).unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_json_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outputs.json");

        let store = JsonFileStore::new(&path);
        assert_eq!(store.get("exec", STAGE_INFRA_DETAILS).unwrap(), None);
        assert!(store.put_if_absent("exec", STAGE_INFRA_DETAILS, pod("a")).unwrap());

        let reopened = JsonFileStore::new(&path);
        assert!(!reopened.put_if_absent("exec", STAGE_INFRA_DETAILS, pod("b")).unwrap());
        assert_eq!(
            reopened.get("exec", STAGE_INFRA_DETAILS).unwrap(),
            Some(pod("a"))
        );
    }

    #[test]
    fn test_json_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outputs.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonFileStore::new(&path).get("exec", "k").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn test_runtime_name() {
        let details = StageInfraDetails::Vm {
            pool_id: "linux-amd64".to_string(),
            stage_runtime_id: "rt-1".to_string(),
        };
        assert_eq!(details.runtime_name(), "rt-1");
    }
}
