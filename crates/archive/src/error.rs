//! Error type for the archive worker.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{program} failed: {detail}")]
    ToolFailed { program: String, detail: String },

    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("missing directory: {0}")]
    MissingDirectory(String),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
