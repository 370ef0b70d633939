//! Backup orchestrator.
//!
//! One call to [`BackupOrchestrator::run`] is one backup run:
//! record → enumerate → manifest → downloads → archive → encrypt → cleanup →
//! complete → notify. Any failure after the record exists marks it `failed`
//! and enqueues a failure notification; nothing escapes as an error.

use crate::archive::create_archive;
use crate::config::Config;
use crate::crypto::{encrypt_file, write_recovery_key};
use crate::enumerator::list_assets;
use crate::models::{Asset, BackupOutcome, FolderScope, Manifest, MANIFEST_FILE};
use crate::notify::{self, NotificationQueue};
use crate::provider::MediaStore;
use crate::record::{BackupKind, BackupStatus, NewRecord, RecordStore, RecordUpdate};
use crate::utils::errors::{BackupError, Result};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Name of the staging directory inside a run directory.
pub const STAGING_DIR: &str = "cloudinary";

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub backup_root: PathBuf,
    pub folders: Vec<String>,
    pub passphrase: Option<String>,
    pub recovery_key_dir: Option<PathBuf>,
    pub disclose_passphrase: bool,
    pub download_concurrency: usize,
    pub min_download_ratio: Option<f64>,
    pub recipients: Vec<String>,
}

impl BackupSettings {
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
            folders: Vec::new(),
            passphrase: None,
            recovery_key_dir: None,
            disclose_passphrase: false,
            download_concurrency: 4,
            min_download_ratio: None,
            recipients: Vec::new(),
        }
    }
}

impl From<&Config> for BackupSettings {
    fn from(config: &Config) -> Self {
        Self {
            backup_root: config.backup.backup_root.clone(),
            folders: config.backup.folders.clone(),
            passphrase: config.backup.passphrase.clone().filter(|p| !p.is_empty()),
            recovery_key_dir: config.backup.recovery_key_dir.clone(),
            disclose_passphrase: config.backup.disclose_passphrase,
            download_concurrency: config.backup.download_concurrency.max(1),
            min_download_ratio: config.backup.min_download_ratio,
            recipients: config.notify.recipients.clone(),
        }
    }
}

/// Artifacts of a run that got as far as archiving.
struct RunArtifacts {
    archive: PathBuf,
    downloaded: usize,
    failed_downloads: usize,
}

pub struct BackupOrchestrator {
    store: Arc<dyn MediaStore>,
    records: Arc<dyn RecordStore>,
    notifier: NotificationQueue,
    settings: BackupSettings,
}

impl BackupOrchestrator {
    pub fn new(
        store: Arc<dyn MediaStore>,
        records: Arc<dyn RecordStore>,
        notifier: NotificationQueue,
        settings: BackupSettings,
    ) -> Self {
        Self {
            store,
            records,
            notifier,
            settings,
        }
    }

    /// Execute one backup run.
    pub async fn run(&self) -> BackupOutcome {
        let start = Instant::now();

        if !self.store.is_configured() {
            let err = BackupError::Configuration("media store credentials are not configured".into());
            error!("Backup aborted: {}", err);
            return self.fail(None, None, err).await;
        }

        let epoch_ms = Utc::now().timestamp_millis();
        let run_dir = self.settings.backup_root.join(format!(
            "backup_{}_{}",
            epoch_ms,
            &Uuid::new_v4().simple().to_string()[..8]
        ));

        let record = match self
            .records
            .create_record(NewRecord {
                kind: BackupKind::Cloudinary,
                status: BackupStatus::InProgress,
                path: run_dir.clone(),
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                error!("Could not create backup record: {}", e);
                return self.fail(None, None, e.into()).await;
            }
        };

        info!(run_id = %record.id, "Starting backup into {}", run_dir.display());

        match self.execute(&run_dir, epoch_ms).await {
            Ok(artifacts) => {
                if let Err(e) = self
                    .records
                    .update_record(&record.id, RecordUpdate::completed(artifacts.archive.clone()))
                    .await
                {
                    error!(run_id = %record.id, "Failed to mark record completed: {}", e);
                }

                info!(
                    run_id = %record.id,
                    "Backup completed in {:.1}s: {} downloaded, {} failed, archive {}",
                    start.elapsed().as_secs_f64(),
                    artifacts.downloaded,
                    artifacts.failed_downloads,
                    artifacts.archive.display()
                );

                self.notify_success(&artifacts);

                BackupOutcome {
                    success: true,
                    backup_dir: Some(run_dir),
                    archive_path: Some(artifacts.archive),
                    record_id: Some(record.id),
                    downloaded: artifacts.downloaded,
                    failed_downloads: artifacts.failed_downloads,
                    error: None,
                }
            }
            Err(err) => {
                error!(run_id = %record.id, "Backup failed: {}", err);
                let staging = run_dir.join(STAGING_DIR);
                if staging.exists() {
                    if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
                        warn!("Failed to remove staging directory {}: {}", staging.display(), e);
                    }
                }
                self.fail(Some(&record.id), Some(run_dir), err).await
            }
        }
    }

    async fn execute(&self, run_dir: &Path, epoch_ms: i64) -> Result<RunArtifacts> {
        let assets = list_assets(self.store.as_ref(), &self.settings.folders)
            .await
            .map_err(BackupError::Enumeration)?;

        let staging = run_dir.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging).await?;

        let manifest = Manifest::new(FolderScope::from_folders(&self.settings.folders), assets);
        self.write_manifest(&staging, &manifest).await?;

        let (downloaded, failed_downloads) = self.download_all(&staging, &manifest.assets).await;
        let total = manifest.total_assets;

        if let Some(ratio) = self.settings.min_download_ratio {
            if total > 0 && (downloaded as f64) < ratio * total as f64 {
                return Err(BackupError::Incomplete(format!(
                    "only {} of {} assets downloaded",
                    downloaded, total
                )));
            }
        }

        let archive_path = run_dir.join(format!("{}_backup_{}.zip", BackupKind::Cloudinary, epoch_ms));
        let source = staging.clone();
        let mut archive = tokio::task::spawn_blocking(move || create_archive(&source, &archive_path)).await??;

        if let Some(passphrase) = &self.settings.passphrase {
            let plain = archive.clone();
            let key = passphrase.clone();
            archive = tokio::task::spawn_blocking(move || encrypt_file(&plain, &key))
                .await?
                .map_err(BackupError::encryption)?;
            tokio::fs::remove_file(archive.with_extension("")).await?;

            if let Some(dir) = self.settings.recovery_key_dir.clone() {
                let key = passphrase.clone();
                match tokio::task::spawn_blocking(move || write_recovery_key(&key, &dir)).await? {
                    Ok(path) => info!("Recovery key written to {}", path.display()),
                    Err(e) => warn!("Failed to write recovery key: {}", e),
                }
            }
        }

        tokio::fs::remove_dir_all(&staging).await?;

        Ok(RunArtifacts {
            archive,
            downloaded,
            failed_downloads,
        })
    }

    async fn write_manifest(&self, staging: &Path, manifest: &Manifest) -> Result<()> {
        let path = staging.join(MANIFEST_FILE);
        tokio::fs::write(&path, serde_json::to_vec_pretty(manifest)?).await?;

        if let Some(passphrase) = self.settings.passphrase.clone() {
            let plain = path.clone();
            tokio::task::spawn_blocking(move || encrypt_file(&plain, &passphrase))
                .await?
                .map_err(BackupError::encryption)?;
            tokio::fs::remove_file(&path).await?;
        }

        info!("Manifest written with {} assets", manifest.total_assets);
        Ok(())
    }

    /// Download every asset, returning `(downloaded, failed)`.
    async fn download_all(&self, staging: &Path, assets: &[Asset]) -> (usize, usize) {
        let downloads: Vec<_> = assets.iter().map(|asset| self.download_one(staging, asset)).collect();
        let results: Vec<bool> = stream::iter(downloads)
            .buffer_unordered(self.settings.download_concurrency.max(1))
            .collect()
            .await;

        let downloaded = results.iter().filter(|ok| **ok).count();
        (downloaded, results.len() - downloaded)
    }

    async fn download_one(&self, staging: &Path, asset: &Asset) -> bool {
        let Some(dest) = staging_path(staging, asset) else {
            warn!("Skipping asset with unsafe public id {:?}", asset.public_id);
            return false;
        };
        match self.store.download(asset, &dest).await {
            Ok(bytes) => {
                info!("Downloaded {} ({} bytes)", asset.public_id, bytes);
                true
            }
            Err(e) => {
                warn!("Failed to download {}: {}", asset.public_id, e);
                false
            }
        }
    }

    fn notify_success(&self, artifacts: &RunArtifacts) {
        let recipients = &self.settings.recipients;
        self.notifier.enqueue(notify::backup_succeeded(
            recipients,
            &artifacts.archive,
            artifacts.downloaded,
            artifacts.failed_downloads,
            self.settings.passphrase.is_some(),
        ));

        if self.settings.disclose_passphrase {
            if let Some(passphrase) = &self.settings.passphrase {
                self.notifier
                    .enqueue(notify::passphrase_disclosure(recipients, passphrase, &artifacts.archive));
            }
        }
    }

    async fn fail(&self, record_id: Option<&str>, backup_dir: Option<PathBuf>, err: BackupError) -> BackupOutcome {
        let message = err.to_string();

        if let Some(id) = record_id {
            if let Err(e) = self.records.update_record(id, RecordUpdate::failed(&message)).await {
                error!(run_id = %id, "Failed to mark record failed: {}", e);
            }
        }

        self.notifier
            .enqueue(notify::backup_failed(&self.settings.recipients, &message));

        BackupOutcome {
            success: false,
            backup_dir,
            archive_path: None,
            record_id: record_id.map(str::to_string),
            downloaded: 0,
            failed_downloads: 0,
            error: Some(message),
        }
    }
}

/// Where an asset lands in the staging tree, or `None` when its public id
/// would escape it.
fn staging_path(staging: &Path, asset: &Asset) -> Option<PathBuf> {
    let relative = Path::new(asset.staging_dir()).join(asset.file_name());
    if relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        Some(staging.join(relative))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::extract_archive;
    use crate::crypto::{decrypt_file, RECOVERY_KEY_FILE};
    use crate::models::ResourceType;
    use crate::notify::testing::RecordingTransport;
    use crate::notify::DeliveryPolicy;
    use crate::provider::FakeMediaStore;
    use crate::record::MemoryRecordStore;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    struct Harness {
        store: Arc<FakeMediaStore>,
        records: Arc<MemoryRecordStore>,
        transport: Arc<RecordingTransport>,
        queue: NotificationQueue,
        handle: JoinHandle<()>,
        root: TempDir,
    }

    fn harness() -> Harness {
        let store = Arc::new(FakeMediaStore::new());
        store.add_asset("avatars/u1", ResourceType::Image, "png", b"u1");
        store.add_asset("avatars/u2", ResourceType::Image, "jpg", b"u2");
        store.add_asset("logo", ResourceType::Image, "svg", b"<svg/>");
        let transport = Arc::new(RecordingTransport::default());
        let (queue, handle) = NotificationQueue::spawn(transport.clone(), DeliveryPolicy::default());
        Harness {
            store,
            records: Arc::new(MemoryRecordStore::new()),
            transport,
            queue,
            handle,
            root: TempDir::new().unwrap(),
        }
    }

    impl Harness {
        fn settings(&self) -> BackupSettings {
            BackupSettings {
                recipients: vec!["ops@example.org".to_string()],
                ..BackupSettings::new(self.root.path().join("backups"))
            }
        }

        fn orchestrator(&self, settings: BackupSettings) -> BackupOrchestrator {
            BackupOrchestrator::new(self.store.clone(), self.records.clone(), self.queue.clone(), settings)
        }

        async fn delivered(self) -> Vec<String> {
            let Harness { queue, handle, transport, .. } = self;
            drop(queue);
            handle.await.unwrap();
            transport.subjects()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_backup_produces_archive_and_completes_record() {
        let h = harness();
        let outcome = h.orchestrator(h.settings()).run().await;

        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.downloaded, 3);
        let archive = outcome.archive_path.clone().unwrap();
        let name = archive.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("cloudinary_backup_") && name.ends_with(".zip"));
        assert!(!outcome.backup_dir.as_ref().unwrap().join(STAGING_DIR).exists());

        let record = h.records.get_record(outcome.record_id.as_deref().unwrap()).await.unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.path, archive);

        let out = h.root.path().join("out");
        let top = extract_archive(&archive, &out).unwrap();
        assert_eq!(top, vec!["avatars", "metadata.json", "root"]);
        assert_eq!(std::fs::read(out.join("root/logo.svg")).unwrap(), b"<svg/>");

        assert_eq!(h.delivered().await, vec!["Media backup completed"]);
    }

    #[tokio::test]
    async fn test_run_on_spawned_task() {
        let h = harness();
        let orchestrator = h.orchestrator(h.settings());
        let outcome = tokio::spawn(async move { orchestrator.run().await }).await.unwrap();

        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.downloaded, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_encrypted_backup_hides_manifest_and_archive() {
        let h = harness();
        let keys = h.root.path().join("keys");
        let settings = BackupSettings {
            passphrase: Some("correct horse".to_string()),
            recovery_key_dir: Some(keys.clone()),
            disclose_passphrase: true,
            ..h.settings()
        };
        let outcome = h.orchestrator(settings).run().await;

        assert!(outcome.success, "{:?}", outcome.error);
        let archive = outcome.archive_path.clone().unwrap();
        assert!(archive.to_string_lossy().ends_with(".zip.enc"));
        assert!(!archive.with_extension("").exists());
        assert!(keys.join(RECOVERY_KEY_FILE).exists());

        let plain = h.root.path().join("plain.zip");
        decrypt_file(&archive, &plain, "correct horse").unwrap();
        let out = h.root.path().join("out");
        let top = extract_archive(&plain, &out).unwrap();
        assert!(top.contains(&"metadata.json.enc".to_string()));
        assert!(!out.join(MANIFEST_FILE).exists());

        assert_eq!(
            h.delivered().await,
            vec!["Media backup completed", "Media backup recovery key"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credentials_creates_no_record() {
        let h = harness();
        h.store.set_configured(false);
        let outcome = h.orchestrator(h.settings()).run().await;

        assert!(!outcome.success);
        assert!(outcome.record_id.is_none());
        assert!(outcome.error.unwrap().starts_with("Configuration error"));
        assert!(h.records.list_records().await.unwrap().is_empty());
        assert_eq!(h.delivered().await, vec!["Media backup failed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enumeration_failure_marks_record_failed() {
        let h = harness();
        h.store.set_unauthorized(true);
        let outcome = h.orchestrator(h.settings()).run().await;

        assert!(!outcome.success);
        let record = h.records.get_record(outcome.record_id.as_deref().unwrap()).await.unwrap().unwrap();
        assert_eq!(record.status, BackupStatus::Failed);
        assert!(record.error.unwrap().contains("enumeration"));
        assert!(!outcome.backup_dir.unwrap().join(STAGING_DIR).exists());
        assert_eq!(h.delivered().await, vec!["Media backup failed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_failures_are_counted_not_fatal() {
        let h = harness();
        h.store.fail_download("avatars/u2");
        let outcome = h.orchestrator(h.settings()).run().await;

        assert!(outcome.success);
        assert_eq!(outcome.downloaded, 2);
        assert_eq!(outcome.failed_downloads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_threshold_fails_run() {
        let h = harness();
        h.store.fail_download("avatars/u2");
        let settings = BackupSettings {
            min_download_ratio: Some(1.0),
            ..h.settings()
        };
        let outcome = h.orchestrator(settings).run().await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("only 2 of 3"));
    }

    #[test]
    fn test_staging_path_rejects_escapes() {
        let staging = Path::new("/tmp/staging");
        let asset = |id: &str| Asset {
            public_id: id.to_string(),
            format: "png".into(),
            resource_type: ResourceType::Image,
            delivery_type: "upload".into(),
            created_at: None,
            bytes: 1,
            secure_url: String::new(),
        };
        assert_eq!(
            staging_path(staging, &asset("a/b/c")).unwrap(),
            PathBuf::from("/tmp/staging/a/b/c.png")
        );
        assert_eq!(
            staging_path(staging, &asset("logo")).unwrap(),
            PathBuf::from("/tmp/staging/root/logo.png")
        );
        assert!(staging_path(staging, &asset("../etc/passwd")).is_none());
    }
}
