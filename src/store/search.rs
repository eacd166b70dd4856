//! Content search over blob payloads.
//!
//! Four passes, unioned: SQL `instr` over uncompressed inline rows,
//! host-side matching over compressed inline rows, and the same pair over
//! chunk rows. Chunk hits are mapped back to their objects by scanning
//! and unpacking the packed reference lists (there is no join table).
//! A match that straddles a chunk boundary cannot hit any single chunk
//! row, so chunked objects without a chunk hit are streamed once with a
//! carried overlap window.

use std::collections::{HashMap, HashSet};

use crate::codec::{compress, varint, Compression};
use crate::error::{Error, Result};
use crate::model::{ObjectId, ObjectKind};
use crate::repo::Repository;
use crate::store::objects::ObjectStore;

pub(crate) fn search(repo: &Repository, query: &[u8]) -> Result<Vec<ObjectId>> {
    if query.is_empty() {
        return all_blob_ids(repo);
    }

    let mut matched: HashSet<ObjectId> = HashSet::new();

    // Pass 1: uncompressed inline blobs, matched inside SQLite.
    {
        let mut stmt = repo.conn().prepare(
            "SELECT oid FROM objects \
             WHERE kind = ?1 AND data IS NOT NULL AND compression = 0 \
               AND instr(data, ?2) > 0",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![ObjectKind::Blob as i64, query],
            |row| row.get::<_, Vec<u8>>(0),
        )?;
        for row in rows {
            matched.insert(decode_oid(&row?)?);
        }
    }

    // Pass 2: compressed inline blobs, decompressed host-side.
    {
        let mut stmt = repo.conn().prepare(
            "SELECT oid, data, total_size, compression FROM objects \
             WHERE kind = ?1 AND data IS NOT NULL AND compression != 0",
        )?;
        let rows = stmt.query_map([ObjectKind::Blob as i64], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        for row in rows {
            let (oid, stored, total_size, compression) = row?;
            let method = Compression::from_i64(compression)
                .ok_or_else(|| Error::Corrupt(format!("unknown compression tag {compression}")))?;
            let raw = compress::decompress(method, &stored, total_size as usize, repo.dicts())?;
            if contains(&raw, query) {
                matched.insert(decode_oid(&oid)?);
            }
        }
    }

    // Passes 3 and 4: chunk rows, SQL for uncompressed, host-side for
    // compressed. Together they cover every within-chunk match.
    let mut hit_chunks: HashSet<i64> = HashSet::new();
    {
        let mut stmt = repo
            .conn()
            .prepare("SELECT rowid FROM chunks WHERE compression = 0 AND instr(data, ?1) > 0")?;
        let rows = stmt.query_map([query], |row| row.get::<_, i64>(0))?;
        for row in rows {
            hit_chunks.insert(row?);
        }
    }
    {
        let mut stmt = repo
            .conn()
            .prepare("SELECT rowid, data, raw_size, compression FROM chunks WHERE compression != 0")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        for row in rows {
            let (rowid, stored, raw_size, compression) = row?;
            let method = Compression::from_i64(compression)
                .ok_or_else(|| Error::Corrupt(format!("unknown compression tag {compression}")))?;
            let raw = compress::decompress(method, &stored, raw_size as usize, repo.dicts())?;
            if contains(&raw, query) {
                hit_chunks.insert(rowid);
            }
        }
    }

    // Reverse map chunk hits to objects; stream the rest for matches that
    // straddle a boundary.
    let store = ObjectStore::new(repo);
    let chunked: HashMap<ObjectId, Vec<i64>> = {
        let mut stmt = repo.conn().prepare(
            "SELECT oid, chunk_refs FROM objects WHERE kind = ?1 AND chunk_refs IS NOT NULL",
        )?;
        let rows = stmt.query_map([ObjectKind::Blob as i64], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (oid, refs) = row?;
            map.insert(decode_oid(&oid)?, varint::unpack_refs(&refs)?);
        }
        map
    };
    for (oid, refs) in chunked {
        if refs.iter().any(|rowid| hit_chunks.contains(rowid)) {
            matched.insert(oid);
        } else if query.len() > 1 && straddles_boundary(&store, &refs, query)? {
            matched.insert(oid);
        }
    }

    let mut out: Vec<ObjectId> = matched.into_iter().collect();
    out.sort();
    Ok(out)
}

/// Walk an object's chunks in order with an overlap window one byte
/// shorter than the query, so only boundary-straddling matches can fire.
/// Memory stays near a single decompressed chunk.
fn straddles_boundary(store: &ObjectStore<'_>, refs: &[i64], query: &[u8]) -> Result<bool> {
    let keep = query.len() - 1;
    let mut carry: Vec<u8> = Vec::new();
    for rowid in refs {
        let chunk = store.fetch_chunk(*rowid)?;
        let mut window = carry;
        window.extend_from_slice(&chunk);
        if contains(&window, query) {
            return Ok(true);
        }
        carry = window.split_off(window.len().saturating_sub(keep));
    }
    Ok(false)
}

fn all_blob_ids(repo: &Repository) -> Result<Vec<ObjectId>> {
    let mut stmt = repo
        .conn()
        .prepare("SELECT oid FROM objects WHERE kind = ?1 ORDER BY oid")?;
    let rows = stmt.query_map([ObjectKind::Blob as i64], |row| row.get::<_, Vec<u8>>(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(decode_oid(&row?)?);
    }
    Ok(ids)
}

fn decode_oid(bytes: &[u8]) -> Result<ObjectId> {
    ObjectId::from_bytes(bytes)
        .ok_or_else(|| Error::Corrupt(format!("{}-byte object id", bytes.len())))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
