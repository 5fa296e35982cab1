use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::errors::SchedulerError;
use crate::models::StatusSnapshot;

/// Single-writer persistence for the status snapshot file.
///
/// Writes go to a sibling `.tmp` file which is then renamed over the real
/// file, so readers never observe a half-written snapshot. Concurrent
/// writers inside the process are serialised by `write_lock`.
pub struct StatusStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StatusStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, snapshot: &StatusSnapshot) -> Result<(), SchedulerError> {
        let _guard = self.write_lock.lock().await;

        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp_path = self.path.with_extension("json.tmp");

        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .map_err(|e| {
                SchedulerError::Storage(format!(
                    "Failed to write {}: {}",
                    tmp_path.display(),
                    e
                ))
            })?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| {
                SchedulerError::Storage(format!(
                    "Failed to rename {} to {}: {}",
                    tmp_path.display(),
                    self.path.display(),
                    e
                ))
            })?;

        Ok(())
    }
}

/// Read a snapshot file. `Ok(None)` when the file does not exist.
pub fn read_snapshot(path: &Path) -> Result<Option<StatusSnapshot>, SchedulerError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&content)?))
}
