//! Error types for Folio

use thiserror::Error;

/// Main error type for Folio operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// No valid session could be resolved from the presented credentials
    #[error("Unauthorized: no valid session")]
    Unauthorized,

    /// Valid session, but it does not own the addressed store
    #[error("Access denied")]
    AccessDenied,

    /// Store id does not match the `user:<id>[:novel:<id>]` grammar
    #[error("Invalid store id: {0}")]
    InvalidStoreId(String),

    /// Novel was not found in the tenant store
    #[error("Novel not found: {0}")]
    NovelNotFound(String),

    /// Volume was not found in the novel store
    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    /// Chapter was not found in the novel store
    #[error("Chapter not found: {0}")]
    ChapterNotFound(String),

    /// The addressed local store is not open
    #[error("Store not open: {0}")]
    StoreNotOpen(String),

    /// Network-related error (transient, absorbed by the resilience controller)
    #[error("Network error: {0}")]
    Network(String),

    /// Remote sync backend is unreachable or refused the connection
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization of row values
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error encoding/decoding postcard wire frames or log records
    #[error("Codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::NovelNotFound("n-123".to_string());
        assert_eq!(format!("{}", err), "Novel not found: n-123");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
    }

    #[test]
    fn test_access_denied_display() {
        assert_eq!(format!("{}", SyncError::AccessDenied), "Access denied");
    }
}
