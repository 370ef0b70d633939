//! Remote media store boundary.
//!
//! [`MediaStore`] is what the enumerator and both orchestrators talk to.
//! [`cloudinary::CloudinaryStore`] is the production implementation and
//! [`fake::FakeMediaStore`] an in-memory one for tests and dry runs.

pub mod cloudinary;
pub mod fake;

use crate::models::{Asset, ResourceType};
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

pub use cloudinary::CloudinaryStore;
pub use fake::FakeMediaStore;

/// Errors raised by a media store
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Media store credentials are not configured")]
    NotConfigured,

    #[error("Authentication rejected: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request rejected: {0}")]
    BadRequest(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_)
                | ProviderError::Timeout(_)
                | ProviderError::Connection(_)
                | ProviderError::Server { .. }
        )
    }

    /// Classify an HTTP error status.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => ProviderError::Unauthorized(message),
            404 => ProviderError::NotFound(message),
            408 => ProviderError::Timeout(message),
            // 420 is the media store's own rate-limit status
            420 | 429 => ProviderError::RateLimited(message),
            500..=599 => ProviderError::Server { status, message },
            _ => ProviderError::BadRequest(message),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::from_status(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else if err.is_builder() {
            ProviderError::BadRequest(err.to_string())
        } else {
            // connect, request and body failures (resets, DNS)
            ProviderError::Connection(err.to_string())
        }
    }
}

/// One page of a listing request
#[derive(Debug, Clone)]
pub struct ListRequest {
    pub resource_type: ResourceType,
    /// Public id prefix, e.g. `avatars/`
    pub prefix: Option<String>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AssetPage {
    pub assets: Vec<Asset>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Full public id including the folder path
    pub public_id: String,
    /// Replace an existing asset with the same public id
    pub overwrite: bool,
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Whether credentials are present. Checked before any run starts.
    fn is_configured(&self) -> bool;

    /// Fetch one page of assets.
    async fn list_page(&self, request: &ListRequest) -> Result<AssetPage, ProviderError>;

    /// Download an asset's content to `dest`, returning the byte count.
    async fn download(&self, asset: &Asset, dest: &Path) -> Result<u64, ProviderError>;

    /// Whether an asset with this public id exists in any resource type.
    async fn exists(&self, public_id: &str) -> Result<bool, ProviderError>;

    /// Upload a local file under the given public id.
    async fn upload(&self, file: &Path, request: &UploadRequest) -> Result<Asset, ProviderError>;
}
