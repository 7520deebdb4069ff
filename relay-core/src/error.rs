use thiserror::Error;

/// Failure talking to the token store.
///
/// Multi-row deletes run as a single statement, so a `StorageError` from one
/// of them means nothing can be assumed about which rows are gone.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("token store unavailable: {0}")]
    Unavailable(String),

    #[error("token store query failed: {0}")]
    Query(#[from] diesel::result::Error),
}
