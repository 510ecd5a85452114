//! Session records on disk.
//!
//! One JSON file per session under the state directory, written through a
//! temporary file and renamed into place so a crash never leaves a torn
//! record.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub name: String,
    pub agent: String,
    pub cwd: PathBuf,
    #[serde(default)]
    pub yolo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to write session record {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
    #[error("failed to encode session record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Load a record. Missing or unreadable records are `None`.
    pub async fn load(&self, id: &Uuid) -> Option<SessionRecord> {
        let path = self.path_for(id);
        let contents = match tokio::fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read session record");
                return None;
            }
        };
        match serde_json::from_slice::<SessionRecord>(&contents) {
            Ok(record) if record.id == *id => Some(record),
            Ok(record) => {
                tracing::warn!(path = %path.display(), found = %record.id, "session record id mismatch, ignoring");
                None
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt session record, ignoring");
                None
            }
        }
    }

    pub async fn save(&self, record: &SessionRecord) -> Result<(), PersistError> {
        let path = self.path_for(&record.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", record.id));
        let body = serde_json::to_vec_pretty(record)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PersistError::Write(self.dir.clone(), e))?;
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| PersistError::Write(tmp.clone(), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| PersistError::Write(path.clone(), e))?;
        Ok(())
    }

    pub async fn remove(&self, id: &Uuid) {
        let path = self.path_for(id);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove session record");
            }
        }
    }
}
