use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("another supervisor holds {0}")]
    AlreadyRunning(String),

    #[error("capture for '{target}' exited immediately ({status})")]
    ExitedImmediately { target: String, status: String },

    #[error("missing directory: {0}")]
    MissingDirectory(String),

    #[error("store error: {0}")]
    Store(#[from] tapedeck_store::StoreError),
}
