//! Run record persistence.
//!
//! Records are written after every state change so that a restarted
//! process can resume a run instead of re-executing finished stages.

mod file;
mod record;

pub use file::FileRunStore;
pub use record::{InstanceRecord, RunRecord};

use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

/// Storage backend for run records.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts or replaces a record.
    async fn save(&self, record: &RunRecord) -> Result<(), StoreError>;

    /// Loads a record.
    async fn load(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError>;

    /// Returns records whose run has not reached a terminal status.
    async fn unfinished(&self) -> Result<Vec<RunRecord>, StoreError>;

    /// Deletes a record.
    async fn delete(&self, run_id: Uuid) -> Result<(), StoreError>;
}

/// In-memory run store.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    records: Mutex<HashMap<Uuid, RunRecord>>,
}

impl InMemoryRunStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.records.lock().insert(record.run_id, record.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.records.lock().get(&run_id).cloned())
    }

    async fn unfinished(&self) -> Result<Vec<RunRecord>, StoreError> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn delete(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.records.lock().remove(&run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventKind, RunStatus, TriggerContext};
    use crate::pipeline::InstanceId;

    fn record(status: RunStatus) -> RunRecord {
        let mut record = RunRecord::new(
            Uuid::new_v4(),
            "ci",
            "fp",
            TriggerContext::new(EventKind::Push, "refs/heads/main"),
            [InstanceId::new("build")],
        );
        record.status = status;
        record
    }

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemoryRunStore::new();
        let running = record(RunStatus::Running);
        let done = record(RunStatus::Succeeded);

        store.save(&running).await.unwrap();
        store.save(&done).await.unwrap();
        assert_eq!(store.len(), 2);

        assert_eq!(store.load(running.run_id).await.unwrap(), Some(running.clone()));
        let unfinished = store.unfinished().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].run_id, running.run_id);

        store.delete(running.run_id).await.unwrap();
        assert_eq!(store.load(running.run_id).await.unwrap(), None);
    }
}
