//! Database schema migrations for the SQLite roster store.
//!
//! Each migration transforms the schema from version N to N+1 and is
//! recorded in `schema_migrations`.

use rusqlite::Connection;

use crate::error::{Result, RosterError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema. Idempotent.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(RosterError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: contacts, groups, sync tokens.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE contacts (
            handle TEXT PRIMARY KEY,          -- lowercase passport handle
            display_name TEXT NOT NULL,
            lists INTEGER NOT NULL,           -- FL=1 AL=2 BL=4 RL=8 PL=16
            groups BLOB NOT NULL              -- CBOR array of group ids
        );

        CREATE TABLE groups (
            group_id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );

        -- Single row holding the opaque last-change/last-sync pair
        CREATE TABLE sync_tokens (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_change TEXT NOT NULL,
            last_sync TEXT NOT NULL
        );
        "#,
    )?;

    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
