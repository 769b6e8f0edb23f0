//! Cycle result ring persisted in the configuration directory.

use std::path::{Path, PathBuf};

use cachelot_core::model::CycleResult;
use tracing::warn;

use crate::error::{AppError, AppResult};

/// Most-recent-N cycle results, newest first, stored as one JSON file.
/// Writes go through a sibling temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct CycleLog {
    path: PathBuf,
    capacity: usize,
}

impl CycleLog {
    /// Bind the log to its file and retention capacity.
    #[must_use]
    pub fn new(path: PathBuf, capacity: usize) -> Self {
        Self {
            path,
            capacity: capacity.max(1),
        }
    }

    /// Load the retained results, newest first. A missing file is an empty
    /// history; a corrupt file is discarded with a warning.
    #[must_use]
    pub fn load(&self) -> Vec<CycleResult> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(error = %err, path = %self.path.display(), "failed to read cycle log");
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(results) => results,
            Err(err) => {
                warn!(error = %err, path = %self.path.display(), "discarding corrupt cycle log");
                Vec::new()
            }
        }
    }

    /// Prepend a result and truncate to capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the rewritten log cannot be committed.
    pub fn append(&self, result: CycleResult) -> AppResult<()> {
        let mut results = self.load();
        results.insert(0, result);
        results.truncate(self.capacity);

        let serialized =
            serde_json::to_vec_pretty(&results).map_err(|source| AppError::Io {
                operation: "cycles.serialize",
                path: Some(self.path.clone()),
                source: std::io::Error::other(source),
            })?;
        let temp = temp_path(&self.path);
        std::fs::write(&temp, serialized).map_err(|source| AppError::Io {
            operation: "cycles.write",
            path: Some(temp.clone()),
            source,
        })?;
        std::fs::rename(&temp, &self.path).map_err(|source| AppError::Io {
            operation: "cycles.commit",
            path: Some(self.path.clone()),
            source,
        })
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    PathBuf::from(temp)
}
