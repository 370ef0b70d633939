use std::path::PathBuf;

/// Process-level settings read from the environment (and `.env`).
///
/// Pipeline settings (credentials, folders, passphrase, retries) live in the
/// `media_backup::Config` file pointed to by `BACKUP_CONFIG`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub backup_config: Option<PathBuf>,
    pub backup_cron: Option<String>,
    pub log_level: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("DATA_DIR").unwrap_or_else(|_| "/var/lib/media-backup".into()),
        );

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            db_path: data_dir.join("media-backup.db"),
            data_dir,
            backup_config: std::env::var("BACKUP_CONFIG").ok().map(PathBuf::from),
            backup_cron: std::env::var("BACKUP_CRON").ok().filter(|c| !c.trim().is_empty()),
            log_level: std::env::var("LOG_LEVEL").ok(),
        }
    }
}
