//! Configuration for the backup pipeline.
//!
//! Loaded from an optional TOML file with environment variable overrides of
//! the form `MEDIA_BACKUP__<SECTION>__<KEY>` (e.g.
//! `MEDIA_BACKUP__PROVIDER__API_SECRET`). Every field has a default so an
//! empty file is a valid configuration.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "MEDIA_BACKUP";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub notify: NotifyConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Media store account name
    pub cloud_name: String,

    pub api_key: String,

    pub api_secret: String,

    /// Admin/upload API base URL
    pub api_base_url: String,

    /// Timeout applied to every download/upload/listing call
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory receiving one sub-directory per backup run
    pub backup_root: PathBuf,

    /// Folders to export (empty = whole account)
    pub folders: Vec<String>,

    /// Encrypt manifest and archive when set
    pub passphrase: Option<String>,

    /// Write the passphrase to RECOVERY_KEY.txt here after each run
    pub recovery_key_dir: Option<PathBuf>,

    /// E-mail the passphrase to the notification recipients after each run
    pub disclose_passphrase: bool,

    /// Concurrent asset downloads
    pub download_concurrency: usize,

    /// Fail the run when fewer than this share of assets downloaded
    /// (unset = never fail on download errors)
    pub min_download_ratio: Option<f64>,

    /// Cron expression for scheduled runs (server only)
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Attempts per file, including the first
    pub upload_attempts: u32,

    /// Linear backoff step: attempt n waits n * step
    pub retry_step_secs: u64,

    /// Timeout per upload attempt
    pub upload_timeout_secs: u64,

    /// Share of attempted uploads that must succeed (0.5 = uploaded >= failed)
    pub min_upload_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Transactional mail API endpoint (unset = log notifications only)
    pub endpoint: Option<String>,

    pub api_token: Option<String>,

    pub sender: String,

    /// Operators receiving run reports
    pub recipients: Vec<String>,

    pub max_attempts: u32,

    /// Linear backoff step between delivery attempts
    pub backoff_step_secs: u64,

    /// Pause before delivering the next queued item
    pub inter_item_delay_ms: u64,

    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            cloud_name: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            api_base_url: "https://api.cloudinary.com/v1_1".to_string(),
            request_timeout_secs: 120,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("/var/lib/media-backup/backups"),
            folders: Vec::new(),
            passphrase: None,
            recovery_key_dir: None,
            disclose_passphrase: false,
            download_concurrency: 4,
            min_download_ratio: None,
            schedule: None,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            upload_attempts: 3,
            retry_step_secs: 2,
            upload_timeout_secs: 120,
            min_upload_ratio: 0.5,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_token: None,
            sender: "backups@localhost".to_string(),
            recipients: Vec::new(),
            max_attempts: 3,
            backoff_step_secs: 2,
            inter_item_delay_ms: 1000,
            queue_capacity: 64,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, None)
    }

    fn load_from(path: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("backup.folders")
            .with_list_parse_key("notify.recipients")
            .try_parsing(true)
            .source(env);

        let config: Config = builder
            .add_source(environment)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BackupError::Configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.restore.upload_attempts == 0 {
            return Err(BackupError::Configuration(
                "restore.upload_attempts must be at least 1".into(),
            ));
        }
        if self.notify.max_attempts == 0 {
            return Err(BackupError::Configuration(
                "notify.max_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.restore.min_upload_ratio) {
            return Err(BackupError::Configuration(
                "restore.min_upload_ratio must be within 0..=1".into(),
            ));
        }
        if let Some(ratio) = self.backup.min_download_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(BackupError::Configuration(
                    "backup.min_download_ratio must be within 0..=1".into(),
                ));
            }
        }
        if self.backup.passphrase.as_deref() == Some("") {
            return Err(BackupError::Configuration(
                "backup.passphrase must not be empty when set".into(),
            ));
        }
        Ok(())
    }
}
