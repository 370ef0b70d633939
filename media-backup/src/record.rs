//! Operation records for backup runs.
//!
//! A record is created `in_progress` before a run touches the disk and moves
//! exactly once to `completed` or `failed`. Storage is behind
//! [`RecordStore`]; [`MemoryRecordStore`] keeps records in process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record {id} is already {status}")]
    Terminal { id: String, status: BackupStatus },

    #[error("Record storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackupStatus::InProgress)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(BackupStatus::InProgress),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(RecordError::Storage(format!("unknown status {:?}", other))),
        }
    }
}

/// Kind of backup a record tracks; also the archive file name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Cloudinary,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Cloudinary => "cloudinary",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cloudinary" => Ok(BackupKind::Cloudinary),
            other => Err(RecordError::Storage(format!("unknown backup type {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub status: BackupStatus,
    /// Run directory while in progress, final artifact once completed
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRecord {
    pub kind: BackupKind,
    pub status: BackupStatus,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub status: BackupStatus,
    pub path: Option<PathBuf>,
    pub error: Option<String>,
}

impl RecordUpdate {
    pub fn completed(path: PathBuf) -> Self {
        Self {
            status: BackupStatus::Completed,
            path: Some(path),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: BackupStatus::Failed,
            path: None,
            error: Some(error.into()),
        }
    }
}

impl BackupRecord {
    /// Apply an update, refusing to reopen a finished record.
    pub fn apply(&mut self, update: RecordUpdate) -> Result<(), RecordError> {
        if self.status.is_terminal() {
            return Err(RecordError::Terminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        self.status = update.status;
        if let Some(path) = update.path {
            self.path = path;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_record(&self, record: NewRecord) -> Result<BackupRecord, RecordError>;

    async fn update_record(&self, id: &str, update: RecordUpdate) -> Result<BackupRecord, RecordError>;

    async fn get_record(&self, id: &str) -> Result<Option<BackupRecord>, RecordError>;

    /// All records, newest first.
    async fn list_records(&self) -> Result<Vec<BackupRecord>, RecordError>;
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, BackupRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_record(&self, record: NewRecord) -> Result<BackupRecord, RecordError> {
        let now = Utc::now();
        let record = BackupRecord {
            id: Uuid::new_v4().to_string(),
            kind: record.kind,
            status: record.status,
            path: record.path,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update_record(&self, id: &str, update: RecordUpdate) -> Result<BackupRecord, RecordError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| RecordError::NotFound(id.to_string()))?;
        record.apply(update)?;
        Ok(record.clone())
    }

    async fn get_record(&self, id: &str) -> Result<Option<BackupRecord>, RecordError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list_records(&self) -> Result<Vec<BackupRecord>, RecordError> {
        let mut records: Vec<BackupRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_record() -> NewRecord {
        NewRecord {
            kind: BackupKind::Cloudinary,
            status: BackupStatus::InProgress,
            path: PathBuf::from("/backups/backup_1"),
        }
    }

    #[tokio::test]
    async fn test_record_lifecycle() {
        let store = MemoryRecordStore::new();
        let record = store.create_record(new_record()).await.unwrap();
        assert_eq!(record.status, BackupStatus::InProgress);

        let done = store
            .update_record(&record.id, RecordUpdate::completed(PathBuf::from("/backups/a.zip")))
            .await
            .unwrap();
        assert_eq!(done.status, BackupStatus::Completed);
        assert_eq!(done.path, PathBuf::from("/backups/a.zip"));

        let fetched = store.get_record(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, BackupStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_record_is_never_reopened() {
        let store = MemoryRecordStore::new();
        let record = store.create_record(new_record()).await.unwrap();
        store
            .update_record(&record.id, RecordUpdate::failed("enumeration failed"))
            .await
            .unwrap();

        let err = store
            .update_record(&record.id, RecordUpdate::completed(PathBuf::from("/x.zip")))
            .await
            .unwrap_err();
        assert!(matches!(err, RecordError::Terminal { status: BackupStatus::Failed, .. }));

        let fetched = store.get_record(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.error.as_deref(), Some("enumeration failed"));
    }

    #[tokio::test]
    async fn test_unknown_record() {
        let store = MemoryRecordStore::new();
        assert!(store.get_record("missing").await.unwrap().is_none());
        assert!(matches!(
            store.update_record("missing", RecordUpdate::failed("x")).await,
            Err(RecordError::NotFound(_))
        ));
    }

    #[test]
    fn test_status_strings() {
        for status in [BackupStatus::InProgress, BackupStatus::Completed, BackupStatus::Failed] {
            assert_eq!(status.as_str().parse::<BackupStatus>().unwrap(), status);
            assert_eq!(serde_json::to_value(status).unwrap(), status.as_str());
        }
        assert!("running".parse::<BackupStatus>().is_err());
    }
}
