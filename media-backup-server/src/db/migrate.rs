use crate::db::connection::DbPool;
use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_records (
  id TEXT PRIMARY KEY,
  type TEXT NOT NULL DEFAULT 'cloudinary',
  status TEXT NOT NULL DEFAULT 'in_progress' CHECK(status IN ('in_progress','completed','failed')),
  path TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backup_records_created_at ON backup_records(created_at DESC);
"#;

fn has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;
    Ok(columns.iter().any(|c| c == column))
}

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Added after the first release
    if !has_column(&conn, "backup_records", "error")? {
        conn.execute_batch("ALTER TABLE backup_records ADD COLUMN error TEXT")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
