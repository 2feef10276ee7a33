use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Store(#[from] recall_store::StoreError),

    #[error("no context data available")]
    NoContextData,

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("snapshot unusable: {0}")]
    Snapshot(String),
}
