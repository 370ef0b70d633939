use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::models::backup_record::SqliteRecordStore;
use media_backup::{
    BackupOrchestrator, BackupOutcome, BackupSettings, Config, MediaStore, NotificationQueue, RecordStore,
    RestoreOrchestrator, RestoreSettings,
};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub pipeline: Config,
    pub store: Arc<dyn MediaStore>,
    pub records: Arc<SqliteRecordStore>,
    pub notifier: NotificationQueue,
    /// Held for the duration of a backup run
    backup_lock: Mutex<()>,
}

impl AppState {
    pub fn new(
        db: DbPool,
        config: AppConfig,
        pipeline: Config,
        store: Arc<dyn MediaStore>,
        notifier: NotificationQueue,
    ) -> Self {
        Self {
            records: Arc::new(SqliteRecordStore::new(db.clone())),
            db,
            config,
            pipeline,
            store,
            notifier,
            backup_lock: Mutex::new(()),
        }
    }

    pub fn restorer(&self) -> RestoreOrchestrator {
        RestoreOrchestrator::new(self.store.clone(), RestoreSettings::from(&self.pipeline))
    }

    /// Run one backup unless another is still in progress.
    pub async fn run_backup(&self) -> Option<BackupOutcome> {
        let Ok(_guard) = self.backup_lock.try_lock() else {
            tracing::warn!("Skipping backup: a backup is already running");
            return None;
        };

        let records: Arc<dyn RecordStore> = self.records.clone();
        let orchestrator = BackupOrchestrator::new(
            self.store.clone(),
            records,
            self.notifier.clone(),
            BackupSettings::from(&self.pipeline),
        );
        Some(orchestrator.run().await)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::db::connection::memory_pool;
    use crate::db::migrate::migrate;
    use media_backup::models::asset::ResourceType;
    use media_backup::notify::LogTransport;
    use media_backup::{DeliveryPolicy, FakeMediaStore};

    /// State over an in-memory database and a fake store holding two assets.
    pub fn test_state() -> (Arc<AppState>, Arc<FakeMediaStore>, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let pool = memory_pool().unwrap();
        migrate(&pool).unwrap();

        let store = Arc::new(FakeMediaStore::new());
        store.add_asset("avatars/a1", ResourceType::Image, "png", b"a1");
        store.add_asset("r1", ResourceType::Image, "jpg", b"r1");

        let mut pipeline = Config::default();
        pipeline.backup.backup_root = root.path().join("backups");

        let config = AppConfig {
            port: 0,
            data_dir: root.path().to_path_buf(),
            db_path: root.path().join("test.db"),
            backup_config: None,
            backup_cron: None,
            log_level: None,
        };

        let (notifier, _handle) = NotificationQueue::spawn(Arc::new(LogTransport), DeliveryPolicy::default());
        let state = Arc::new(AppState::new(pool, config, pipeline, store.clone(), notifier));
        (state, store, root)
    }
}
