//! Cloudinary implementation of [`MediaStore`].
//!
//! Listing and existence checks go through the Admin API with basic auth,
//! uploads through the signed Upload API, and downloads fetch each asset's
//! delivery URL directly.

use super::{AssetPage, ListRequest, MediaStore, ProviderError, UploadRequest};
use crate::config::ProviderConfig;
use crate::fs::walker::PARTIAL_SUFFIX;
use crate::models::{Asset, ResourceType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Maximum page size accepted by the Admin API
const MAX_RESULTS: u32 = 500;

pub struct CloudinaryStore {
    client: Client,
    cloud_name: String,
    api_key: String,
    api_secret: String,
    base_url: String,
}

/// Resource as returned by the Admin and Upload APIs
#[derive(Debug, Deserialize)]
struct CloudinaryResource {
    public_id: String,
    #[serde(default)]
    format: Option<String>,
    resource_type: ResourceType,
    #[serde(rename = "type", default)]
    delivery_type: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    secure_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

impl From<CloudinaryResource> for Asset {
    fn from(r: CloudinaryResource) -> Self {
        Asset {
            public_id: r.public_id,
            format: r.format.unwrap_or_default(),
            resource_type: r.resource_type,
            delivery_type: r.delivery_type.unwrap_or_else(|| "upload".to_string()),
            created_at: r.created_at,
            bytes: r.bytes,
            secure_url: r.secure_url.or(r.url).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    resources: Vec<CloudinaryResource>,
    #[serde(default)]
    next_cursor: Option<String>,
}

impl CloudinaryStore {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            cloud_name: config.cloud_name.clone(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn ensure_configured(&self) -> Result<(), ProviderError> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(ProviderError::NotConfigured)
        }
    }

    fn resources_url(&self, resource_type: ResourceType) -> String {
        format!(
            "{}/{}/resources/{}",
            self.base_url, self.cloud_name, resource_type
        )
    }

    /// `.../resources/<type>/upload/<public id segments>`
    fn resource_url(&self, resource_type: ResourceType, public_id: &str) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&format!("{}/upload", self.resources_url(resource_type)))
            .map_err(|e| ProviderError::BadRequest(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::BadRequest(format!("Invalid base URL {}", self.base_url)))?
            .extend(public_id.split('/'));
        Ok(url)
    }

    /// SHA-256 signature over the alphabetically sorted parameters.
    fn sign(&self, params: &[(&str, String)]) -> String {
        let mut sorted: Vec<&(&str, String)> = params.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        let to_sign = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        format!("{:x}", Sha256::digest(format!("{}{}", to_sign, self.api_secret)))
    }
}

/// Turn a non-success response into a classified error.
async fn error_for(resp: Response) -> ProviderError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or(body);
    ProviderError::from_status(status, message)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

#[async_trait]
impl MediaStore for CloudinaryStore {
    fn is_configured(&self) -> bool {
        !self.cloud_name.is_empty() && !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    async fn list_page(&self, request: &ListRequest) -> Result<AssetPage, ProviderError> {
        self.ensure_configured()?;

        let mut query: Vec<(&str, String)> = vec![
            ("type", "upload".to_string()),
            ("max_results", MAX_RESULTS.to_string()),
        ];
        if let Some(prefix) = &request.prefix {
            query.push(("prefix", prefix.clone()));
        }
        if let Some(cursor) = &request.cursor {
            query.push(("next_cursor", cursor.clone()));
        }

        let resp = self
            .client
            .get(self.resources_url(request.resource_type))
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .query(&query)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }

        let page: ListResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        debug!(
            "Listed {} {} resources (more: {})",
            page.resources.len(),
            request.resource_type,
            page.next_cursor.is_some()
        );

        Ok(AssetPage {
            assets: page.resources.into_iter().map(Asset::from).collect(),
            next_cursor: page.next_cursor.filter(|c| !c.is_empty()),
        })
    }

    async fn download(&self, asset: &Asset, dest: &Path) -> Result<u64, ProviderError> {
        if asset.secure_url.is_empty() {
            return Err(ProviderError::BadRequest(format!(
                "Asset {} has no delivery URL",
                asset.public_id
            )));
        }

        let resp = self.client.get(&asset.secure_url).send().await?;
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = part_path(dest);
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e.into());
            }
            written += chunk.len() as u64;
        }

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, dest).await?;

        Ok(written)
    }

    async fn exists(&self, public_id: &str) -> Result<bool, ProviderError> {
        self.ensure_configured()?;

        for resource_type in ResourceType::ALL {
            let url = self.resource_url(resource_type, public_id)?;
            let resp = self
                .client
                .get(url)
                .basic_auth(&self.api_key, Some(&self.api_secret))
                .send()
                .await?;

            match resp.status().as_u16() {
                200..=299 => return Ok(true),
                404 => continue,
                _ => return Err(error_for(resp).await),
            }
        }

        Ok(false)
    }

    async fn upload(&self, file: &Path, request: &UploadRequest) -> Result<Asset, ProviderError> {
        self.ensure_configured()?;

        let timestamp = Utc::now().timestamp().to_string();
        let params = vec![
            ("overwrite", request.overwrite.to_string()),
            ("public_id", request.public_id.clone()),
            ("timestamp", timestamp),
        ];
        let signature = self.sign(&params);

        let handle = tokio::fs::File::open(file).await?;
        let len = handle.metadata().await?.len();
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        let body = reqwest::Body::wrap_stream(ReaderStream::new(handle));
        let part = Part::stream_with_length(body, len).file_name(file_name);

        let mut form = Form::new()
            .part("file", part)
            .text("api_key", self.api_key.clone())
            .text("signature", signature);
        for (key, value) in params {
            form = form.text(key, value);
        }

        let url = format!("{}/{}/auto/upload", self.base_url, self.cloud_name);
        let resp = self.client.post(&url).multipart(form).send().await?;

        if !resp.status().is_success() {
            let err = error_for(resp).await;
            warn!("Upload of {} rejected: {}", request.public_id, err);
            return Err(err);
        }

        let resource: CloudinaryResource = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        Ok(resource.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(secret: &str) -> CloudinaryStore {
        CloudinaryStore::new(&ProviderConfig {
            cloud_name: "community".into(),
            api_key: "1234".into(),
            api_secret: secret.into(),
            ..ProviderConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_is_configured_requires_all_credentials() {
        assert!(store("secret").is_configured());
        assert!(!store("").is_configured());
    }

    #[test]
    fn test_signature_sorts_parameters() {
        let s = store("abcd");
        let a = s.sign(&[("timestamp", "1".into()), ("public_id", "x".into())]);
        let b = s.sign(&[("public_id", "x".into()), ("timestamp", "1".into())]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(a, format!("{:x}", Sha256::digest("public_id=x&timestamp=1abcd")));
    }

    #[test]
    fn test_resource_url_keeps_folder_segments() {
        let s = store("secret");
        let url = s.resource_url(ResourceType::Image, "avatars/2024/u 1").unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.cloudinary.com/v1_1/community/resources/image/upload/avatars/2024/u%201"
        );
    }

    #[test]
    fn test_resource_conversion_prefers_secure_url() {
        let json = r#"{
            "public_id": "avatars/u1",
            "format": "png",
            "resource_type": "image",
            "type": "upload",
            "created_at": "2024-03-01T10:00:00Z",
            "bytes": 120,
            "url": "http://res.example.com/u1.png",
            "secure_url": "https://res.example.com/u1.png"
        }"#;
        let asset: Asset = serde_json::from_str::<CloudinaryResource>(json).unwrap().into();
        assert_eq!(asset.secure_url, "https://res.example.com/u1.png");
        assert_eq!(asset.folder(), Some("avatars"));
        assert!(asset.created_at.is_some());
    }

    #[tokio::test]
    async fn test_unconfigured_store_refuses_calls() {
        let s = store("");
        let err = s.exists("anything").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured));
    }
}
