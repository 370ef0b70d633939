//! Restore orchestrator.
//!
//! Re-uploads the assets of a backup archive. Decryption and extraction
//! happen in a scoped temporary directory before any remote call, so a wrong
//! passphrase or a damaged archive never results in a partial restore.
//! Each file then succeeds, fails or is skipped on its own; one failure
//! never stops the run.

use crate::archive::extract_archive;
use crate::backup::STAGING_DIR;
use crate::config::Config;
use crate::crypto::{decrypt_file, is_encrypted, ENCRYPTED_SUFFIX};
use crate::fs::walker::{walk_directory_lossy, FileInfo, WalkOptions};
use crate::models::asset::public_id_for;
use crate::models::outcome::summarize;
use crate::models::{FileFailure, Manifest, RestoreDetails, RestoreOutcome, MANIFEST_FILE};
use crate::provider::{MediaStore, ProviderError, UploadRequest};
use crate::record::{BackupKind, BackupStatus, RecordStore};
use crate::retry::{retry, RetryPolicy};
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// When a restore counts as successful.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuccessPolicy {
    /// Minimum share of attempted uploads that must succeed. The default of
    /// 0.5 accepts any run that uploaded at least as many files as it lost.
    pub min_upload_ratio: f64,
}

impl Default for SuccessPolicy {
    fn default() -> Self {
        Self { min_upload_ratio: 0.5 }
    }
}

impl SuccessPolicy {
    /// Only every upload succeeding counts.
    pub fn strict() -> Self {
        Self { min_upload_ratio: 1.0 }
    }

    pub fn is_success(&self, uploaded: usize, failed: usize) -> bool {
        if uploaded == 0 {
            return false;
        }
        failed == 0 || uploaded as f64 >= self.min_upload_ratio * (uploaded + failed) as f64
    }
}

#[derive(Debug, Clone)]
pub struct RestoreSettings {
    pub retry: RetryPolicy,
    pub upload_timeout: Duration,
    pub policy: SuccessPolicy,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            upload_timeout: Duration::from_secs(120),
            policy: SuccessPolicy::default(),
        }
    }
}

impl From<&Config> for RestoreSettings {
    fn from(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::new(
                config.restore.upload_attempts,
                Duration::from_secs(config.restore.retry_step_secs),
            ),
            upload_timeout: Duration::from_secs(config.restore.upload_timeout_secs),
            policy: SuccessPolicy {
                min_upload_ratio: config.restore.min_upload_ratio,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreOptions {
    /// Upload without probing the media store first
    pub skip_existing_check: bool,
    /// Upload and overwrite assets that already exist
    pub force_upload: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    #[serde(default = "default_restore_media")]
    pub restore_media: bool,
    #[serde(flatten)]
    pub options: RestoreOptions,
}

fn default_restore_media() -> bool {
    true
}

impl Default for RestoreRequest {
    fn default() -> Self {
        Self {
            restore_media: true,
            options: RestoreOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResponse {
    pub media_result: Option<RestoreOutcome>,
}

/// Find the newest backup archive in a run directory.
pub fn find_archive(backup_dir: &Path) -> Result<PathBuf> {
    let prefix = format!("{}_backup_", BackupKind::Cloudinary);
    let entries = std::fs::read_dir(backup_dir)
        .map_err(|_| BackupError::NotFound(format!("backup directory {}", backup_dir.display())))?;

    let mut newest: Option<(u64, PathBuf)> = None;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        let stem = rest.strip_suffix(ENCRYPTED_SUFFIX).unwrap_or(rest);
        let Some(epoch) = stem.strip_suffix(".zip").and_then(|e| e.parse::<u64>().ok()) else {
            continue;
        };
        if newest.as_ref().map_or(true, |(best, _)| epoch > *best) {
            newest = Some((epoch, entry.path()));
        }
    }

    newest
        .map(|(_, path)| path)
        .ok_or_else(|| BackupError::NotFound(format!("no backup archive in {}", backup_dir.display())))
}

/// Staged relative path (`folder/file.ext`) to the exact public id it was
/// exported from.
fn staged_public_ids(manifest: &Manifest) -> HashMap<String, String> {
    manifest
        .assets
        .iter()
        .map(|asset| {
            (
                format!("{}/{}", asset.staging_dir(), asset.file_name()),
                asset.public_id.clone(),
            )
        })
        .collect()
}

/// A staged file and the public id it restores to.
#[derive(Debug)]
struct RestoreItem {
    path: PathBuf,
    public_id: String,
    size: u64,
}

impl RestoreItem {
    /// Files listed in the manifest keep their recorded public id; anything
    /// else restores under its folder and file stem.
    fn from_file(file: FileInfo, known: Option<&HashMap<String, String>>) -> Self {
        let relative = file.relative_slash_path();
        let public_id = match known.and_then(|ids| ids.get(&relative)) {
            Some(id) => id.clone(),
            None => {
                let folder = relative.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
                let stem = file
                    .path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                public_id_for(folder, &stem)
            }
        };
        Self {
            public_id,
            path: file.path,
            size: file.size,
        }
    }
}

enum ItemResult {
    Uploaded,
    Failed(String),
    Empty,
    Existing,
}

pub struct RestoreOrchestrator {
    store: Arc<dyn MediaStore>,
    settings: RestoreSettings,
}

impl RestoreOrchestrator {
    pub fn new(store: Arc<dyn MediaStore>, settings: RestoreSettings) -> Self {
        Self { store, settings }
    }

    /// Restore the newest archive found in a backup run directory.
    pub async fn restore_dir(&self, backup_dir: &Path, passphrase: Option<&str>, options: RestoreOptions) -> RestoreOutcome {
        match find_archive(backup_dir) {
            Ok(archive) => self.restore_archive(&archive, passphrase, options).await,
            Err(e) => {
                warn!("Restore aborted: {}", e);
                RestoreOutcome::aborted(e.to_string())
            }
        }
    }

    /// Restore one archive (`.zip` or `.zip.enc`).
    pub async fn restore_archive(&self, archive: &Path, passphrase: Option<&str>, options: RestoreOptions) -> RestoreOutcome {
        info!("Restoring from {}", archive.display());
        match self.try_restore(archive, passphrase, options).await {
            Ok(outcome) => {
                info!(
                    "{} (total {}, uploaded {}, failed {}, skipped {})",
                    outcome.message,
                    outcome.total_files,
                    outcome.uploaded_count,
                    outcome.failed_count,
                    outcome.skipped_count
                );
                outcome
            }
            Err(e) => {
                warn!("Restore aborted: {}", e);
                RestoreOutcome::aborted(e.to_string())
            }
        }
    }

    /// Restore a recorded backup run, as the admin API does.
    pub async fn restore_backup(
        &self,
        records: &dyn RecordStore,
        backup_id: &str,
        passphrase: Option<&str>,
        request: RestoreRequest,
    ) -> RestoreResponse {
        if !request.restore_media {
            return RestoreResponse { media_result: None };
        }

        let record = match records.get_record(backup_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return RestoreResponse {
                    media_result: Some(RestoreOutcome::aborted(format!("Backup not found: {}", backup_id))),
                }
            }
            Err(e) => {
                return RestoreResponse {
                    media_result: Some(RestoreOutcome::aborted(e.to_string())),
                }
            }
        };

        if record.status != BackupStatus::Completed {
            return RestoreResponse {
                media_result: Some(RestoreOutcome::aborted(format!(
                    "Backup {} is {} and cannot be restored",
                    backup_id, record.status
                ))),
            };
        }

        let outcome = if record.path.is_dir() {
            self.restore_dir(&record.path, passphrase, request.options).await
        } else {
            self.restore_archive(&record.path, passphrase, request.options).await
        };

        RestoreResponse {
            media_result: Some(outcome),
        }
    }

    async fn try_restore(&self, archive: &Path, passphrase: Option<&str>, options: RestoreOptions) -> Result<RestoreOutcome> {
        if !archive.is_file() {
            return Err(BackupError::NotFound(format!("backup archive {}", archive.display())));
        }
        if !self.store.is_configured() {
            return Err(BackupError::Configuration(
                "media store credentials are not configured".into(),
            ));
        }

        // Removed on every exit path when dropped
        let work = tempfile::Builder::new().prefix("media-restore-").tempdir()?;
        let extracted = work.path().join(STAGING_DIR);

        let zip_path = if is_encrypted(archive) {
            let passphrase = passphrase
                .ok_or_else(|| BackupError::Decryption("archive is encrypted and no passphrase was given".into()))?
                .to_string();
            let source = archive.to_path_buf();
            let output = work.path().join("archive.zip");
            tokio::task::spawn_blocking(move || decrypt_file(&source, &output, &passphrase)).await??
        } else {
            archive.to_path_buf()
        };

        let dest = extracted.clone();
        let top_level = tokio::task::spawn_blocking(move || extract_archive(&zip_path, &dest)).await??;
        info!("Extracted {} top-level entries", top_level.len());

        let manifest = self.read_manifest(&extracted, work.path(), passphrase).await;

        let root = extracted.clone();
        let report = tokio::task::spawn_blocking(move || {
            walk_directory_lossy(
                &root,
                WalkOptions {
                    min_depth: Some(2),
                    ..WalkOptions::default()
                },
            )
        })
        .await?;

        for err in &report.errors {
            warn!("Could not read staged entry {}", err);
        }

        let known = manifest.as_ref().map(staged_public_ids);
        let items: Vec<RestoreItem> = report
            .files
            .into_iter()
            .map(|file| RestoreItem::from_file(file, known.as_ref()))
            .collect();
        let total_files = match &manifest {
            Some(manifest) => manifest.total_assets,
            None => items.len(),
        };
        if let Some(manifest) = &manifest {
            if manifest.total_assets != items.len() {
                warn!(
                    "Manifest lists {} assets but the archive holds {} files",
                    manifest.total_assets,
                    items.len()
                );
            }
        }

        let mut details = RestoreDetails {
            enumeration_errors: report.errors,
            ..RestoreDetails::default()
        };
        let (mut uploaded, mut failed, mut skipped) = (0usize, 0usize, 0usize);

        for item in &items {
            match self.restore_item(item, options).await {
                ItemResult::Uploaded => uploaded += 1,
                ItemResult::Failed(error) => {
                    failed += 1;
                    details.failures.push(FileFailure {
                        public_id: item.public_id.clone(),
                        error,
                    });
                }
                ItemResult::Empty => {
                    skipped += 1;
                    details.empty_files.push(item.public_id.clone());
                }
                ItemResult::Existing => {
                    skipped += 1;
                    details.existing.push(item.public_id.clone());
                }
            }
        }

        Ok(RestoreOutcome {
            uploaded_count: uploaded,
            failed_count: failed,
            skipped_count: skipped,
            total_files,
            success: self.settings.policy.is_success(uploaded, failed),
            message: summarize(uploaded, failed, skipped),
            details,
        })
    }

    /// Load the manifest if the archive has one, decrypting it when needed.
    async fn read_manifest(&self, extracted: &Path, work: &Path, passphrase: Option<&str>) -> Option<Manifest> {
        let plain = extracted.join(MANIFEST_FILE);
        let encrypted = extracted.join(format!("{}{}", MANIFEST_FILE, ENCRYPTED_SUFFIX));

        let path = if plain.is_file() {
            plain
        } else if encrypted.is_file() {
            let passphrase = passphrase?.to_string();
            let output = work.join(MANIFEST_FILE);
            match tokio::task::spawn_blocking(move || decrypt_file(&encrypted, &output, &passphrase)).await {
                Ok(Ok(path)) => path,
                Ok(Err(e)) => {
                    warn!("Could not decrypt manifest: {}", e);
                    return None;
                }
                Err(e) => {
                    warn!("Manifest decryption task failed: {}", e);
                    return None;
                }
            }
        } else {
            info!("No manifest in archive, counting files instead");
            return None;
        };

        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice::<Manifest>(&bytes) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!("Ignoring unreadable manifest: {}", e);
                None
            }
        }
    }

    async fn restore_item(&self, item: &RestoreItem, options: RestoreOptions) -> ItemResult {
        if item.size == 0 {
            warn!("Skipping empty file for {}", item.public_id);
            return ItemResult::Empty;
        }

        if !(options.force_upload || options.skip_existing_check) {
            match self.store.exists(&item.public_id).await {
                Ok(true) => {
                    info!("{} already exists, skipping", item.public_id);
                    return ItemResult::Existing;
                }
                Ok(false) => {}
                Err(e) => warn!("Could not check {}: {}. Uploading anyway", item.public_id, e),
            }
        }

        let request = UploadRequest {
            public_id: item.public_id.clone(),
            overwrite: options.force_upload,
        };
        let label = format!("upload {}", item.public_id);
        let timeout = self.settings.upload_timeout;

        let result = retry(&self.settings.retry, &label, ProviderError::is_transient, |_| {
            let request = &request;
            async move {
                match tokio::time::timeout(timeout, self.store.upload(&item.path, request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(format!("no response within {:?}", timeout))),
                }
            }
        })
        .await;

        match result {
            Ok(asset) => {
                info!("Uploaded {} ({} bytes)", asset.public_id, item.size);
                ItemResult::Uploaded
            }
            Err(e) => {
                warn!("Failed to restore {}: {}", item.public_id, e);
                ItemResult::Failed(e.to_string())
            }
        }
    }
}
