//! Schema lifecycle: connection pragmas, creation, detection, and forward
//! migration of the on-disk schema.
//!
//! The database is self-describing: the `metadata` table carries
//! `schema_version`. Creating the schema ([`create_current`]) is the
//! repository-init path; opening an existing database goes through
//! [`ensure_migrated`], which walks an older version forward one step at
//! a time, each step in its own transaction. A database without the
//! `metadata` table is not an engine database at all — callers detect
//! that with [`has_metadata_table`] and refuse it rather than adopting
//! it.

mod migrations;

use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};

use crate::error::{Error, Result};

/// Version written by [`create_current`].
pub const SCHEMA_VERSION: u32 = 9;

/// Oldest version the migration chain still starts from.
pub const MIN_MIGRATABLE_VERSION: u32 = 7;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Pragmas applied to every connection before any other statement.
pub fn apply_connection_pragmas(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Bring an existing engine database to the current schema: migrate it
/// when old, refuse it when too new or too old.
///
/// Callers must have established that the `metadata` table exists; a
/// database without one is foreign and gets `NotARepository` upstream,
/// never a freshly bootstrapped schema.
pub fn ensure_migrated(conn: &Connection) -> Result<()> {
    let found = read_version(conn)?;
    if found > SCHEMA_VERSION || found < MIN_MIGRATABLE_VERSION {
        return Err(Error::UnsupportedSchemaVersion {
            found,
            min: MIN_MIGRATABLE_VERSION,
            max: SCHEMA_VERSION,
        });
    }
    if found < SCHEMA_VERSION {
        migrations::run(conn, found)?;
    }
    Ok(())
}

/// Whether the file already holds an engine schema.
pub fn has_metadata_table(conn: &Connection) -> Result<bool> {
    let name: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'metadata'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(name.is_some())
}

/// Create the current schema in a fresh database. Only the
/// repository-init path calls this.
pub fn create_current(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        r#"
        CREATE TABLE objects (
            oid         BLOB PRIMARY KEY,
            kind        INTEGER NOT NULL,
            data        BLOB,
            chunk_refs  BLOB,
            total_size  INTEGER NOT NULL,
            compression INTEGER NOT NULL DEFAULT 0,
            oid_hex     TEXT GENERATED ALWAYS AS (lower(hex(oid))) VIRTUAL,
            CHECK ((data IS NULL) != (chunk_refs IS NULL))
        );

        CREATE TABLE chunks (
            chunk_id    BLOB PRIMARY KEY,
            data        BLOB NOT NULL,
            compression INTEGER NOT NULL DEFAULT 0,
            raw_size    INTEGER NOT NULL,
            chunk_hex   TEXT GENERATED ALWAYS AS (lower(hex(chunk_id))) VIRTUAL
        );

        CREATE TABLE refs (
            name  BLOB PRIMARY KEY,
            value BLOB NOT NULL
        );

        CREATE TABLE peeled_refs (
            name  BLOB PRIMARY KEY,
            value BLOB NOT NULL
        );

        CREATE TABLE named_files (
            path TEXT PRIMARY KEY,
            data BLOB NOT NULL
        );

        CREATE TABLE metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE reflog (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            ref_name  BLOB NOT NULL,
            old_value BLOB,
            new_value BLOB,
            committer TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            tz_offset INTEGER NOT NULL,
            message   TEXT NOT NULL
        );
        CREATE INDEX reflog_by_ref ON reflog (ref_name, id);
        "#,
    )?;
    write_version(&tx, SCHEMA_VERSION)?;
    tx.commit()?;
    tracing::info!(version = SCHEMA_VERSION, "created schema");
    Ok(())
}

pub(crate) fn read_version(conn: &Connection) -> Result<u32> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match value {
        Some(v) => v
            .parse()
            .map_err(|_| Error::Corrupt(format!("unparseable schema_version {v:?}"))),
        None => Err(Error::Corrupt("schema_version key missing".into())),
    }
}

pub(crate) fn write_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [version.to_string()],
    )?;
    Ok(())
}
