use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error(transparent)]
    Store(#[from] recall_store::StoreError),

    #[error("timed out after {waited_ms}ms waiting for event kind '{kind}'")]
    Timeout { kind: String, waited_ms: u64 },
}
