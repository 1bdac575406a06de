use thiserror::Error;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("store error: {0}")]
    Store(#[from] tapedeck_store::StoreError),

    #[error("instance '{instance}' is shard {index} but only {active} pollers are active")]
    ShardOutOfRange {
        instance: String,
        index: usize,
        active: usize,
    },
}
