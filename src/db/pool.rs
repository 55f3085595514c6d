use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;

use crate::error::HubError;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Create a read-write SQLite connection pool for the bar store, creating
/// the schema if the database file is new.
pub fn open_pool(path: &Path, max_size: u32) -> Result<DbPool, HubError> {
    let manager = SqliteConnectionManager::file(path);
    let pool = Pool::builder()
        .max_size(max_size)
        .build(manager)
        .map_err(|e| HubError::Db(format!("pool for {}: {e}", path.display())))?;

    let conn = pool.get()?;
    // Best-effort: WAL keeps the ingest path from blocking chart reads.
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    init_schema(&conn)?;
    Ok(pool)
}

/// Create the bar/tick tables.  Idempotent.
pub fn init_schema(conn: &Connection) -> Result<(), HubError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS bars (
            series_id    TEXT NOT NULL,
            kind         TEXT NOT NULL,
            bucket_start INTEGER NOT NULL,
            open         TEXT NOT NULL,
            high         TEXT NOT NULL,
            low          TEXT NOT NULL,
            close        TEXT NOT NULL,
            aux_value    TEXT,
            PRIMARY KEY (series_id, kind, bucket_start)
        );

        CREATE TABLE IF NOT EXISTS ticks (
            series_id TEXT NOT NULL,
            kind      TEXT NOT NULL,
            ts_ms     INTEGER NOT NULL,
            value     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ticks_series_kind_ts
        ON ticks(series_id, kind, ts_ms);

        CREATE TABLE IF NOT EXISTS pending_trades (
            tx_id      TEXT PRIMARY KEY,
            series_id  TEXT NOT NULL,
            wallet     TEXT NOT NULL,
            side       TEXT NOT NULL,
            created_ms INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}
