/*!
Error types for the Drafthold core engine.
*/

use crate::checksum::Checksum;
use drafthold_retry::RetryableError;
use thiserror::Error;

/// Result type used throughout the Drafthold core.
pub type Result<T> = std::result::Result<T, DraftError>;

/// Errors that can occur during save, load, backup and export operations.
#[derive(Error, Debug)]
pub enum DraftError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Hard schema violations; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// The backing store refused a write because it is full
    #[error("Storage quota exceeded while writing '{key}'")]
    QuotaExceeded { key: String },

    /// Generic backing store failure, eligible for retry
    #[error("Storage error: {0}")]
    Storage(String),

    /// Stored bytes could not be decoded
    #[error("Corrupted data: {0}")]
    Corruption(String),

    /// Checksum mismatch on read
    #[error("Integrity check failed: expected checksum {expected}, got {actual}")]
    IntegrityCheckFailed { expected: Checksum, actual: Checksum },

    /// Envelope header is not one this engine can read
    #[error("Invalid envelope format: {0}")]
    InvalidFormat(String),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A backup selector matched backups of more than one document
    #[error("Ambiguous backup selector: {0}")]
    AmbiguousSelector(String),

    /// Every save attempt failed; carries the last underlying failure
    #[error("Save failed after {attempts} attempts: {source}")]
    SaveFailed {
        attempts: u32,
        #[source]
        source: Box<DraftError>,
    },
}

impl DraftError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new corruption error
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a new invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a quota error for the given key
    pub fn quota_exceeded<S: Into<String>>(key: S) -> Self {
        Self::QuotaExceeded { key: key.into() }
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    /// True for failures that mean the bytes read back cannot be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Corruption(_)
                | Self::IntegrityCheckFailed { .. }
                | Self::InvalidFormat(_)
                | Self::Json(_)
        )
    }
}

impl RetryableError for DraftError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Storage(_) | Self::QuotaExceeded { .. }
        )
    }
}
