use crate::db::connection::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use media_backup::record::{BackupRecord, NewRecord, RecordError, RecordStore, RecordUpdate};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fmt::Display;
use std::path::PathBuf;
use uuid::Uuid;

// ── backup_records rows ──

struct RecordRow {
    id: String,
    kind: String,
    status: String,
    path: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

fn row_to_record(row: &Row) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        id: row.get("id")?,
        kind: row.get("type")?,
        status: row.get("status")?,
        path: row.get("path")?,
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn storage(err: impl Display) -> RecordError {
    RecordError::Storage(err.to_string())
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, RecordError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(storage)
}

impl TryFrom<RecordRow> for BackupRecord {
    type Error = RecordError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(BackupRecord {
            kind: row.kind.parse()?,
            status: row.status.parse()?,
            path: PathBuf::from(row.path),
            error: row.error,
            created_at: parse_time(&row.created_at)?,
            updated_at: parse_time(&row.updated_at)?,
            id: row.id,
        })
    }
}

pub fn find_all(conn: &Connection) -> Result<Vec<BackupRecord>, RecordError> {
    let mut stmt = conn
        .prepare("SELECT * FROM backup_records ORDER BY created_at DESC")
        .map_err(storage)?;
    let rows = stmt.query_map([], |row| row_to_record(row)).map_err(storage)?;
    rows.map(|row| row.map_err(storage).and_then(BackupRecord::try_from))
        .collect()
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<BackupRecord>, RecordError> {
    conn.query_row("SELECT * FROM backup_records WHERE id = ?", params![id], |row| {
        row_to_record(row)
    })
    .optional()
    .map_err(storage)?
    .map(BackupRecord::try_from)
    .transpose()
}

pub fn create(conn: &Connection, data: &NewRecord) -> Result<BackupRecord, RecordError> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO backup_records (id, type, status, path, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            data.kind.as_str(),
            data.status.as_str(),
            data.path.to_string_lossy().to_string(),
            now,
            now,
        ],
    )
    .map_err(storage)?;
    find_by_id(conn, &id)?.ok_or_else(|| storage("Failed to retrieve created record"))
}

/// Move an in-progress record to its next status.
///
/// The `status = 'in_progress'` guard makes the transition one-shot even if
/// two writers race on the same id.
pub fn update_status(conn: &Connection, id: &str, data: RecordUpdate) -> Result<BackupRecord, RecordError> {
    let mut record = find_by_id(conn, id)?.ok_or_else(|| RecordError::NotFound(id.to_string()))?;
    record.apply(data)?;

    let changed = conn
        .execute(
            "UPDATE backup_records SET status = ?1, path = ?2, error = ?3, updated_at = ?4
             WHERE id = ?5 AND status = 'in_progress'",
            params![
                record.status.as_str(),
                record.path.to_string_lossy().to_string(),
                record.error,
                record.updated_at.to_rfc3339(),
                id,
            ],
        )
        .map_err(storage)?;

    if changed == 0 {
        let current = find_by_id(conn, id)?.ok_or_else(|| RecordError::NotFound(id.to_string()))?;
        return Err(RecordError::Terminal {
            id: id.to_string(),
            status: current.status,
        });
    }

    Ok(record)
}

/// [`RecordStore`] backed by the server's SQLite database.
#[derive(Clone)]
pub struct SqliteRecordStore {
    db: DbPool,
}

impl SqliteRecordStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, RecordError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RecordError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get().map_err(storage)?;
            f(&conn)
        })
        .await
        .map_err(storage)?
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create_record(&self, record: NewRecord) -> Result<BackupRecord, RecordError> {
        self.with_conn(move |conn| create(conn, &record)).await
    }

    async fn update_record(&self, id: &str, update: RecordUpdate) -> Result<BackupRecord, RecordError> {
        let id = id.to_string();
        self.with_conn(move |conn| update_status(conn, &id, update)).await
    }

    async fn get_record(&self, id: &str) -> Result<Option<BackupRecord>, RecordError> {
        let id = id.to_string();
        self.with_conn(move |conn| find_by_id(conn, &id)).await
    }

    async fn list_records(&self) -> Result<Vec<BackupRecord>, RecordError> {
        self.with_conn(|conn| find_all(conn)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::memory_pool;
    use crate::db::migrate::migrate;
    use media_backup::record::{BackupKind, BackupStatus};

    fn store() -> SqliteRecordStore {
        let pool = memory_pool().unwrap();
        migrate(&pool).unwrap();
        SqliteRecordStore::new(pool)
    }

    fn in_progress(path: &str) -> NewRecord {
        NewRecord {
            kind: BackupKind::Cloudinary,
            status: BackupStatus::InProgress,
            path: PathBuf::from(path),
        }
    }

    #[tokio::test]
    async fn test_create_and_complete() {
        let store = store();
        let record = store.create_record(in_progress("/backups/backup_1")).await.unwrap();
        assert_eq!(record.status, BackupStatus::InProgress);
        assert_eq!(record.kind, BackupKind::Cloudinary);

        let done = store
            .update_record(
                &record.id,
                RecordUpdate::completed(PathBuf::from("/backups/backup_1/cloudinary_backup_1.zip")),
            )
            .await
            .unwrap();
        assert_eq!(done.status, BackupStatus::Completed);

        let fetched = store.get_record(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.path, PathBuf::from("/backups/backup_1/cloudinary_backup_1.zip"));
        assert_eq!(fetched.status, BackupStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_records_stay_terminal() {
        let store = store();
        let record = store.create_record(in_progress("/backups/backup_2")).await.unwrap();
        store
            .update_record(&record.id, RecordUpdate::failed("archive failed"))
            .await
            .unwrap();

        let err = store
            .update_record(&record.id, RecordUpdate::completed(PathBuf::from("/x.zip")))
            .await
            .unwrap_err();
        assert!(matches!(err, RecordError::Terminal { .. }));

        let fetched = store.get_record(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, BackupStatus::Failed);
        assert_eq!(fetched.error.as_deref(), Some("archive failed"));
    }

    #[tokio::test]
    async fn test_list_and_missing() {
        let store = store();
        store.create_record(in_progress("/a")).await.unwrap();
        store.create_record(in_progress("/b")).await.unwrap();
        assert_eq!(store.list_records().await.unwrap().len(), 2);

        assert!(store.get_record("missing").await.unwrap().is_none());
        assert!(matches!(
            store.update_record("missing", RecordUpdate::failed("x")).await,
            Err(RecordError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unreadable_row_fails_the_listing() {
        let store = store();
        store.create_record(in_progress("/a")).await.unwrap();
        {
            let conn = store.db.get().unwrap();
            conn.execute(
                "INSERT INTO backup_records (id, type, status, path, created_at, updated_at)
                 VALUES ('bad', 'cloudinary', 'failed', X'FF00', ?1, ?1)",
                params![Utc::now().to_rfc3339()],
            )
            .unwrap();
        }

        let err = store.list_records().await.unwrap_err();
        assert!(matches!(err, RecordError::Storage(_)));
        assert!(matches!(store.get_record("bad").await, Err(RecordError::Storage(_))));
    }
}
