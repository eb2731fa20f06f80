//! Storage error types

use thiserror::Error;

/// Errors from the durable store
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Database failure
    #[error("database error: {0}")]
    Database(String),

    /// Record (de)serialization failure
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Payload quota would be exceeded
    #[error("payload quota exceeded (requested {requested}, in use {in_use}, limit {limit})")]
    QuotaExceeded {
        requested: u64,
        in_use: u64,
        limit: u64,
    },

    /// A payload read past the end of the stored file
    #[error("payload read out of range for bundle {bundle_id}")]
    PayloadOutOfRange { bundle_id: u64 },
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<postcard::Error> for StorageError {
    fn from(e: postcard::Error) -> Self {
        StorageError::Encoding(e.to_string())
    }
}
