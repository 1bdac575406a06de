//! Target catalog backed by a YAML file instead of the `targets` table.

use std::path::PathBuf;

use async_trait::async_trait;

use tapedeck_core::{load_targets_file, Target};

use crate::error::StoreError;
use crate::repo::TargetRepo;

/// Re-reads the file on every call so edits show up on the next reload.
pub struct FileTargetRepo {
    path: PathBuf,
}

impl FileTargetRepo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TargetRepo for FileTargetRepo {
    async fn enabled_targets(&self) -> Result<Vec<Target>, StoreError> {
        let path = self.path.clone();
        let targets = tokio::task::spawn_blocking(move || load_targets_file(&path))
            .await
            .map_err(|e| StoreError::Unavailable(format!("target file reader panicked: {e}")))??;
        Ok(targets.into_iter().filter(|t| t.enabled).collect())
    }
}
