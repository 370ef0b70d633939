use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn create_pool(db_path: &str) -> anyhow::Result<DbPool> {
    let manager = SqliteConnectionManager::file(db_path);
    build_pool(manager, 4)
}

/// Single-connection in-memory pool for tests.
#[cfg(test)]
pub fn memory_pool() -> anyhow::Result<DbPool> {
    build_pool(SqliteConnectionManager::memory(), 1)
}

fn build_pool(manager: SqliteConnectionManager, max_size: u32) -> anyhow::Result<DbPool> {
    let pool = Pool::builder().max_size(max_size).build(manager)?;

    // Configure pragmas on a fresh connection
    let conn = pool.get()?;
    conn.execute_batch(
        "PRAGMA journal_mode = DELETE;
         PRAGMA synchronous = FULL;
         PRAGMA foreign_keys = ON;",
    )?;

    Ok(pool)
}

pub fn close_pool(pool: &DbPool) {
    // r2d2 closes connections when the pool is dropped; flush what we can.
    if let Ok(conn) = pool.get() {
        let _ = conn.execute_batch("PRAGMA optimize");
    }
}
