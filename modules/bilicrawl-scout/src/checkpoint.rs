use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{CrawlError, Result};
use crate::persist::{read_json_opt, write_json_atomic};

/// Durable set of content ids that finished processing.
///
/// Stored as a JSON array. Survives restarts; every write goes through
/// temp-file-then-rename so a killed process never leaves a half checkpoint.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the used set. Missing, blank or unparsable files load as empty.
    pub async fn load(&self) -> Result<BTreeSet<String>> {
        match read_json_opt::<Vec<String>>(&self.path).await {
            Ok(Some(ids)) => {
                let used: BTreeSet<String> = ids.into_iter().collect();
                info!(path = %self.path.display(), used = used.len(), "Loaded checkpoint");
                Ok(used)
            }
            Ok(None) => {
                info!(path = %self.path.display(), "No checkpoint yet, starting empty");
                Ok(BTreeSet::new())
            }
            Err(CrawlError::CorruptState { path, source }) => {
                warn!(path = %path.display(), error = %source, "Checkpoint unreadable, starting empty");
                Ok(BTreeSet::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Overwrite the checkpoint with `ids`.
    pub async fn persist(&self, ids: &BTreeSet<String>) -> Result<()> {
        let ids: Vec<&String> = ids.iter().collect();
        write_json_atomic(&self.path, &ids).await
    }
}
