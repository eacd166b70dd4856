//! Forward schema migrations.
//!
//! Each step moves one version and runs inside its own immediate
//! transaction, so a failed step leaves the file at its pre-step version.
//!
//! History:
//! - v7 -> v8: adds the peeled-ref cache and the reflog.
//! - v8 -> v9: rebuilds `chunks` with binary 32-byte ids (previously
//!   64-char hex text) and adds the derived hex columns. Packed
//!   `chunk_refs` blobs on objects address chunks by rowid, so the rebuild
//!   carries every rowid across explicitly.

use rusqlite::{params, Connection, Transaction, TransactionBehavior};

use super::{write_version, SCHEMA_VERSION};
use crate::error::{Error, Result};

pub(super) fn run(conn: &Connection, from: u32) -> Result<()> {
    let mut version = from;
    while version < SCHEMA_VERSION {
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        match version {
            7 => v7_to_v8(&tx)?,
            8 => v8_to_v9(&tx)?,
            _ => unreachable!("no migration defined from version {version}"),
        }
        write_version(&tx, version + 1)?;
        tx.commit()?;
        tracing::info!(from = version, to = version + 1, "migrated schema");
        version += 1;
    }
    Ok(())
}

fn v7_to_v8(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE peeled_refs (
            name  BLOB PRIMARY KEY,
            value BLOB NOT NULL
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
    Ok(())
}

fn v8_to_v9(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE chunks_migrated (
            chunk_id    BLOB PRIMARY KEY,
            data        BLOB NOT NULL,
            compression INTEGER NOT NULL DEFAULT 0,
            raw_size    INTEGER NOT NULL,
            chunk_hex   TEXT GENERATED ALWAYS AS (lower(hex(chunk_id))) VIRTUAL
        );
        "#,
    )?;

    {
        let mut read =
            tx.prepare("SELECT rowid, chunk_id, data, compression, raw_size FROM chunks")?;
        let mut write = tx.prepare(
            "INSERT INTO chunks_migrated (rowid, chunk_id, data, compression, raw_size) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        let rows = read.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        for row in rows {
            let (rowid, hex_id, data, compression, raw_size) = row?;
            let id = hex::decode(&hex_id)
                .map_err(|_| Error::Corrupt(format!("invalid hex chunk id {hex_id:?}")))?;
            if id.len() != 32 {
                return Err(Error::Corrupt(format!(
                    "chunk id {hex_id:?} is {} bytes, expected 32",
                    id.len()
                )));
            }
            write.execute(params![rowid, id, data, compression, raw_size])?;
        }
    }

    tx.execute_batch(
        r#"
        DROP TABLE chunks;
        ALTER TABLE chunks_migrated RENAME TO chunks;
        ALTER TABLE objects
            ADD COLUMN oid_hex TEXT GENERATED ALWAYS AS (lower(hex(oid))) VIRTUAL;
        "#,
    )?;
    Ok(())
}
