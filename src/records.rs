//! Thread-safe registry of containers this manager started

use crate::model::ModelIdentity;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Lifecycle state of a model's container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Absent,
    Starting,
    Running,
    Stopping,
}

/// The manager's ownership claim over a container it launched
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub model: ModelIdentity,
    pub port: u16,
    /// Filled in once the container shows up in a listing
    pub runtime_id: Option<String>,
    pub status: ContainerStatus,
    /// Pid of the `docker run` client process
    pub pid: Option<u32>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl RunRecord {
    pub fn new(model: ModelIdentity, port: u16, pid: Option<u32>) -> Self {
        Self {
            model,
            port,
            runtime_id: None,
            status: ContainerStatus::Starting,
            pid,
            started_at: chrono::Utc::now(),
        }
    }
}

/// At most one record per model; never persisted
pub struct RunRecords {
    records: RwLock<HashMap<ModelIdentity, RunRecord>>,
}

impl Default for RunRecords {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRecords {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a record. Returns false, leaving the existing one in place, when
    /// the model already has a record.
    pub async fn insert(&self, record: RunRecord) -> bool {
        let mut records = self.records.write().await;
        if records.contains_key(&record.model) {
            return false;
        }

        let model = record.model;
        tracing::debug!(model = %model, port = record.port, "Run record added");
        records.insert(model, record);
        crate::metrics::update_record_count(records.len());
        true
    }

    pub async fn get(&self, model: ModelIdentity) -> Option<RunRecord> {
        self.records.read().await.get(&model).cloned()
    }

    /// Apply `f` to a model's record if present
    pub async fn update<F>(&self, model: ModelIdentity, f: F) -> bool
    where
        F: FnOnce(&mut RunRecord),
    {
        match self.records.write().await.get_mut(&model) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, model: ModelIdentity) -> Option<RunRecord> {
        let mut records = self.records.write().await;
        let removed = records.remove(&model)?;
        crate::metrics::update_record_count(records.len());
        drop(records);

        tracing::debug!(model = %model, port = removed.port, "Run record removed");
        Some(removed)
    }

    /// Ports held by current records
    pub async fn bound_ports(&self) -> HashSet<u16> {
        self.records.read().await.values().map(|r| r.port).collect()
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Remove and return every record
    pub async fn drain(&self) -> Vec<RunRecord> {
        Self::take_all(&mut *self.records.write().await)
    }

    /// Non-blocking [`RunRecords::drain`] for contexts that cannot await.
    /// Returns None when the lock is held elsewhere.
    pub fn try_drain(&self) -> Option<Vec<RunRecord>> {
        let mut records = self.records.try_write().ok()?;
        Some(Self::take_all(&mut records))
    }

    fn take_all(records: &mut HashMap<ModelIdentity, RunRecord>) -> Vec<RunRecord> {
        let mut drained: Vec<_> = records.drain().map(|(_, r)| r).collect();
        drained.sort_by_key(|r| r.model);
        crate::metrics::update_record_count(0);
        drained
    }
}
