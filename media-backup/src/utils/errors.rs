//! Crate-level error type for the backup pipeline.
//!
//! Components raise their own narrow errors (`CryptoError`, `ArchiveError`,
//! `ProviderError`, `RecordError`); the orchestrators fold them into
//! `BackupError` before turning them into a structured outcome.

use crate::archive::ArchiveError;
use crate::crypto::CryptoError;
use crate::provider::ProviderError;
use crate::record::RecordError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("Backup incomplete: {0}")]
    Incomplete(String),

    #[error("Asset enumeration failed: {0}")]
    Enumeration(#[source] ProviderError),

    #[error("Record store error: {0}")]
    Record(#[from] RecordError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<CryptoError> for BackupError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::NotFound(path) => BackupError::NotFound(path.display().to_string()),
            CryptoError::Decryption(msg) => BackupError::Decryption(msg),
            CryptoError::Io(e) => BackupError::Io(e),
        }
    }
}

impl BackupError {
    /// Wrap a failure of the encrypt step. Decrypt-side errors go through `From`.
    pub fn encryption(err: CryptoError) -> Self {
        match err {
            CryptoError::NotFound(path) => BackupError::NotFound(path.display().to_string()),
            other => BackupError::Encryption(other.to_string()),
        }
    }
}

impl From<ArchiveError> for BackupError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Corrupt(msg) => BackupError::ArchiveCorrupt(msg),
            ArchiveError::Io(e) => BackupError::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
