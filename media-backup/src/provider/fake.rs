//! In-memory [`MediaStore`] used by tests and dry runs.
//!
//! Failures are scripted per public id so orchestrator behavior can be
//! exercised without a network.

use super::{AssetPage, ListRequest, MediaStore, ProviderError, UploadRequest};
use crate::models::{Asset, ResourceType};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct StoredAsset {
    asset: Asset,
    content: Vec<u8>,
}

#[derive(Debug)]
struct FakeState {
    assets: BTreeMap<(ResourceType, String), StoredAsset>,
    configured: bool,
    unauthorized: bool,
    page_size: usize,
    failing_downloads: HashSet<String>,
    rejected_uploads: HashSet<String>,
    /// Remaining transient failures per public id
    flaky_uploads: HashMap<String, u32>,
    /// Remaining uploads per public id that never answer
    stalled_uploads: HashMap<String, u32>,
    failing_exists: bool,
    upload_attempts: Vec<String>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            assets: BTreeMap::new(),
            configured: true,
            unauthorized: false,
            page_size: 500,
            failing_downloads: HashSet::new(),
            rejected_uploads: HashSet::new(),
            flaky_uploads: HashMap::new(),
            stalled_uploads: HashMap::new(),
            failing_exists: false,
            upload_attempts: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeMediaStore {
    state: Mutex<FakeState>,
}

/// Classify a file by extension the way an auto upload would.
fn resource_type_for(format: &str) -> ResourceType {
    match format.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "svg" | "bmp" | "tif" | "tiff" | "heic" => {
            ResourceType::Image
        }
        "mp4" | "mov" | "webm" | "avi" | "mkv" | "mp3" | "wav" | "ogg" => ResourceType::Video,
        _ => ResourceType::Raw,
    }
}

impl FakeMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an asset with the given content.
    pub fn add_asset(&self, public_id: &str, resource_type: ResourceType, format: &str, content: &[u8]) {
        let asset = Asset {
            public_id: public_id.to_string(),
            format: format.to_string(),
            resource_type,
            delivery_type: "upload".to_string(),
            created_at: Some(Utc::now()),
            bytes: content.len() as u64,
            secure_url: format!("fake://{}", public_id),
        };
        self.lock().assets.insert(
            (resource_type, public_id.to_string()),
            StoredAsset {
                asset,
                content: content.to_vec(),
            },
        );
    }

    pub fn set_configured(&self, configured: bool) {
        self.lock().configured = configured;
    }

    /// Make every listing call fail with an authentication error.
    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.lock().unauthorized = unauthorized;
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.lock().page_size = page_size.max(1);
    }

    pub fn fail_download(&self, public_id: &str) {
        self.lock().failing_downloads.insert(public_id.to_string());
    }

    /// Reject every upload of this public id with a permanent error.
    pub fn reject_upload(&self, public_id: &str) {
        self.lock().rejected_uploads.insert(public_id.to_string());
    }

    /// Fail the next `times` uploads of this public id with a server error.
    pub fn fail_upload_transiently(&self, public_id: &str, times: u32) {
        self.lock().flaky_uploads.insert(public_id.to_string(), times);
    }

    /// Leave the next `times` uploads of this public id hanging forever.
    pub fn stall_upload(&self, public_id: &str, times: u32) {
        self.lock().stalled_uploads.insert(public_id.to_string(), times);
    }

    pub fn fail_exists_checks(&self, failing: bool) {
        self.lock().failing_exists = failing;
    }

    /// Forget all stored assets, keeping scripted failures.
    pub fn clear(&self) {
        self.lock().assets.clear();
    }

    pub fn contains(&self, public_id: &str) -> bool {
        self.lock().assets.keys().any(|(_, id)| id == public_id)
    }

    pub fn content(&self, public_id: &str) -> Option<Vec<u8>> {
        self.lock()
            .assets
            .iter()
            .find(|((_, id), _)| id == public_id)
            .map(|(_, stored)| stored.content.clone())
    }

    pub fn public_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().assets.keys().map(|(_, id)| id.clone()).collect();
        ids.sort();
        ids
    }

    /// Public ids of every upload attempt, in call order.
    pub fn upload_attempts(&self) -> Vec<String> {
        self.lock().upload_attempts.clone()
    }
}

#[async_trait]
impl MediaStore for FakeMediaStore {
    fn is_configured(&self) -> bool {
        self.lock().configured
    }

    async fn list_page(&self, request: &ListRequest) -> Result<AssetPage, ProviderError> {
        let state = self.lock();
        if !state.configured {
            return Err(ProviderError::NotConfigured);
        }
        if state.unauthorized {
            return Err(ProviderError::Unauthorized("invalid api_key".into()));
        }

        let offset = match &request.cursor {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| ProviderError::BadRequest(format!("invalid cursor {}", cursor)))?,
            None => 0,
        };

        let matching: Vec<&StoredAsset> = state
            .assets
            .iter()
            .filter(|((rt, id), _)| {
                *rt == request.resource_type
                    && request.prefix.as_deref().map_or(true, |p| id.starts_with(p))
            })
            .map(|(_, stored)| stored)
            .collect();

        let end = (offset + state.page_size).min(matching.len());
        let assets = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|stored| stored.asset.clone())
            .collect();
        let next_cursor = (end < matching.len()).then(|| end.to_string());

        Ok(AssetPage { assets, next_cursor })
    }

    async fn download(&self, asset: &Asset, dest: &Path) -> Result<u64, ProviderError> {
        let content = {
            let state = self.lock();
            if state.failing_downloads.contains(&asset.public_id) {
                return Err(ProviderError::Connection(format!(
                    "connection reset while fetching {}",
                    asset.secure_url
                )));
            }
            state
                .assets
                .get(&(asset.resource_type, asset.public_id.clone()))
                .map(|stored| stored.content.clone())
                .ok_or_else(|| ProviderError::NotFound(asset.public_id.clone()))?
        };

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &content).await?;
        Ok(content.len() as u64)
    }

    async fn exists(&self, public_id: &str) -> Result<bool, ProviderError> {
        let state = self.lock();
        if state.failing_exists {
            return Err(ProviderError::Server {
                status: 500,
                message: "resource lookup unavailable".into(),
            });
        }
        Ok(state.assets.keys().any(|(_, id)| id == public_id))
    }

    async fn upload(&self, file: &Path, request: &UploadRequest) -> Result<Asset, ProviderError> {
        let stalled = {
            let mut state = self.lock();
            if !state.configured {
                return Err(ProviderError::NotConfigured);
            }
            state.upload_attempts.push(request.public_id.clone());

            if state.rejected_uploads.contains(&request.public_id) {
                return Err(ProviderError::BadRequest(format!(
                    "invalid file for {}",
                    request.public_id
                )));
            }
            if let Some(remaining) = state.flaky_uploads.get_mut(&request.public_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ProviderError::Server {
                        status: 503,
                        message: "service unavailable".into(),
                    });
                }
            }
            let stalled = match state.stalled_uploads.get_mut(&request.public_id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            stalled
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let content = tokio::fs::read(file).await?;
        let format = file
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        let resource_type = resource_type_for(&format);
        let key = (resource_type, request.public_id.clone());

        let mut state = self.lock();
        if !request.overwrite {
            if let Some(existing) = state.assets.get(&key) {
                return Ok(existing.asset.clone());
            }
        }

        let asset = Asset {
            public_id: request.public_id.clone(),
            format,
            resource_type,
            delivery_type: "upload".to_string(),
            created_at: Some(Utc::now()),
            bytes: content.len() as u64,
            secure_url: format!("fake://{}", request.public_id),
        };
        state.assets.insert(
            key,
            StoredAsset {
                asset: asset.clone(),
                content,
            },
        );
        Ok(asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn list(resource_type: ResourceType, prefix: Option<&str>, cursor: Option<String>) -> ListRequest {
        ListRequest {
            resource_type,
            prefix: prefix.map(str::to_string),
            cursor,
        }
    }

    #[tokio::test]
    async fn test_pagination_and_prefix() {
        let store = FakeMediaStore::new();
        store.set_page_size(2);
        for i in 0..5 {
            store.add_asset(&format!("avatars/u{}", i), ResourceType::Image, "png", b"x");
        }
        store.add_asset("logo", ResourceType::Image, "png", b"x");

        let first = store.list_page(&list(ResourceType::Image, Some("avatars/"), None)).await.unwrap();
        assert_eq!(first.assets.len(), 2);
        let second = store
            .list_page(&list(ResourceType::Image, Some("avatars/"), first.next_cursor))
            .await
            .unwrap();
        let third = store
            .list_page(&list(ResourceType::Image, Some("avatars/"), second.next_cursor))
            .await
            .unwrap();
        assert_eq!(third.assets.len(), 1);
        assert!(third.next_cursor.is_none());

        let videos = store.list_page(&list(ResourceType::Video, None, None)).await.unwrap();
        assert!(videos.assets.is_empty());
    }

    #[tokio::test]
    async fn test_scripted_upload_failures() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("u1.png");
        std::fs::write(&file, b"png").unwrap();
        let store = FakeMediaStore::new();
        store.fail_upload_transiently("avatars/u1", 1);
        store.reject_upload("avatars/bad");

        let request = UploadRequest {
            public_id: "avatars/u1".into(),
            overwrite: false,
        };
        assert!(store.upload(&file, &request).await.unwrap_err().is_transient());
        let asset = store.upload(&file, &request).await.unwrap();
        assert_eq!(asset.resource_type, ResourceType::Image);
        assert_eq!(store.content("avatars/u1").unwrap(), b"png");

        let bad = UploadRequest {
            public_id: "avatars/bad".into(),
            overwrite: false,
        };
        assert!(!store.upload(&file, &bad).await.unwrap_err().is_transient());
        assert_eq!(store.upload_attempts(), vec!["avatars/u1", "avatars/u1", "avatars/bad"]);
    }

    #[tokio::test]
    async fn test_download_writes_content() {
        let dir = TempDir::new().unwrap();
        let store = FakeMediaStore::new();
        store.add_asset("docs/report", ResourceType::Raw, "pdf", b"%PDF");
        let asset = store
            .list_page(&list(ResourceType::Raw, None, None))
            .await
            .unwrap()
            .assets
            .remove(0);

        let dest = dir.path().join("docs").join("report.pdf");
        assert_eq!(store.download(&asset, &dest).await.unwrap(), 4);
        assert_eq!(std::fs::read(&dest).unwrap(), b"%PDF");

        store.fail_download("docs/report");
        assert!(store.download(&asset, &dest).await.is_err());
    }
}
