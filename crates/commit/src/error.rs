use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error(transparent)]
    Store(#[from] recall_store::StoreError),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("commit validation failed: {0}")]
    Validation(String),
}
