//! Versioned schema for the SQLite backend.
//!
//! `MIGRATIONS[n]` moves the schema from version `n` to `n + 1`. Applied
//! versions are recorded in `schema_migrations`, so opening a database runs
//! only the steps it has not seen yet.

use rusqlite::{params, Connection};

use crate::error::{Result, StoreError};

/// Schema steps, oldest first.
const MIGRATIONS: &[&str] = &[
    // v1: regions stored as fixed-size pages; missing pages read as zeros.
    r#"
    CREATE TABLE regions (
        region INTEGER PRIMARY KEY,
        size INTEGER NOT NULL
    );
    CREATE TABLE pages (
        region INTEGER NOT NULL,
        page INTEGER NOT NULL,
        data BLOB NOT NULL,
        PRIMARY KEY (region, page)
    );
    "#,
];

/// Schema version this build writes.
pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

/// Bring the schema up to [`SCHEMA_VERSION`]. Safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );",
    )?;

    let applied: u32 = conn.query_row(
        "SELECT IFNULL(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    if applied > SCHEMA_VERSION {
        return Err(StoreError::Migration(format!(
            "schema version {applied} was written by a newer build (this one knows {SCHEMA_VERSION})"
        )));
    }
    if applied == SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (step, sql) in MIGRATIONS.iter().enumerate().skip(applied as usize) {
        let version = step as u32 + 1;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, unix_millis()],
        )?;
    }
    tx.commit()?;

    tracing::debug!(from = applied, to = SCHEMA_VERSION, "storage schema migrated");
    Ok(())
}

fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}
