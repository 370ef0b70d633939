use crate::state::AppState;
use media_backup::BackupOutcome;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
    cancel: CancellationToken,
}

/// Body of one cron tick. Ticks after shutdown began start nothing.
async fn run_scheduled(state: &AppState, cancel: &CancellationToken) -> Option<BackupOutcome> {
    if cancel.is_cancelled() {
        tracing::info!("Shutting down, skipping scheduled backup");
        return None;
    }

    tracing::info!("Starting scheduled backup");
    let outcome = state.run_backup().await?;
    if outcome.success {
        tracing::info!(
            record_id = ?outcome.record_id,
            archive = ?outcome.archive_path,
            "Scheduled backup completed"
        );
    } else {
        tracing::error!(
            record_id = ?outcome.record_id,
            error = ?outcome.error,
            "Scheduled backup failed"
        );
    }
    Some(outcome)
}

impl BackupScheduler {
    pub async fn new(state: Arc<AppState>, cancel: CancellationToken) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
            cancel,
        })
    }

    pub async fn schedule_backup(&self, cron_expression: &str) -> anyhow::Result<()> {
        let state = self.state.clone();
        let cancel = self.cancel.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let state = state.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                run_scheduled(&state, &cancel).await;
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Backup scheduled");
        Ok(())
    }

    /// Schedule from `BACKUP_CRON`, falling back to `backup.schedule`.
    pub async fn init_schedules(&self) -> anyhow::Result<()> {
        let cron = self
            .state
            .config
            .backup_cron
            .clone()
            .or_else(|| self.state.pipeline.backup.schedule.clone())
            .filter(|c| !c.trim().is_empty());

        match cron {
            Some(cron) => self.schedule_backup(&cron).await,
            None => {
                tracing::info!("No backup schedule configured");
                Ok(())
            }
        }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::test_state;
    use media_backup::RecordStore;

    #[tokio::test]
    async fn test_tick_runs_backup() {
        let (state, _store, _root) = test_state();
        let outcome = run_scheduled(&state, &CancellationToken::new()).await.unwrap();
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(state.records.list_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_after_shutdown_is_skipped() {
        let (state, _store, _root) = test_state();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(run_scheduled(&state, &cancel).await.is_none());
        assert!(state.records.list_records().await.unwrap().is_empty());
    }
}
