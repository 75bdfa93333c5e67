//! JSON-file run store.

use super::{RunRecord, RunStore};
use crate::errors::StoreError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Stores one JSON file per run in a directory.
///
/// Writes go to a temporary file that is then renamed over the record, so
/// a crash mid-write leaves the previous version intact.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    dir: PathBuf,
}

impl FileRunStore {
    /// Creates a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Returns the directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    async fn read(path: &Path) -> Result<Option<RunRecord>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn save(&self, record: &RunRecord) -> Result<(), StoreError> {
        let path = self.path_for(record.run_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;

        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(run_id = %record.run_id, path = %path.display(), "Run record saved");
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        Self::read(&self.path_for(run_id)).await
    }

    async fn unfinished(&self) -> Result<Vec<RunRecord>, StoreError> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(Some(record)) if !record.status.is_terminal() => records.push(record),
                Ok(_) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "Skipping unreadable run record"),
            }
        }

        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn delete(&self, run_id: Uuid) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(run_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
