//! Object store: content-addressed object rows with a chunk layer
//! underneath.
//!
//! Blobs large enough to chunk are split by the chunker, each chunk
//! interned once by its SHA-256, and the object row keeps only the packed
//! rowid list. Everything else (and small or unchunkable blobs) is stored
//! inline on the object row, compressed with the repository's active
//! method.

use std::collections::HashMap;

use rusqlite::{params, params_from_iter, OptionalExtension, Transaction};

use crate::chunker::{self, Layout};
use crate::codec::{compress, varint, Compression, DictSlot};
use crate::error::{Error, Result};
use crate::model::{ChunkId, ObjectId, ObjectKind, RawObject};
use crate::repo::Repository;
use crate::store::search;

/// Rowids resolved per `IN (...)` batch, comfortably under SQLite's bound
/// parameter limit.
const CHUNK_FETCH_BATCH: usize = 512;

/// Handle to the object half of a repository. Borrowed from the
/// [`Repository`]; one connection, no background work.
pub struct ObjectStore<'repo> {
    repo: &'repo Repository,
}

impl<'repo> ObjectStore<'repo> {
    pub(crate) fn new(repo: &'repo Repository) -> Self {
        ObjectStore { repo }
    }

    /// Insert or replace one object, committing immediately.
    pub fn add_object(&self, obj: &RawObject) -> Result<ObjectId> {
        let tx = self.repo.conn().unchecked_transaction()?;
        let id = self.write_object(&tx, obj)?;
        tx.commit()?;
        Ok(id)
    }

    /// Insert or replace many objects atomically in one transaction.
    ///
    /// This is the ingestion path for unpacked packfiles: the collaborator
    /// that inflates a pack feeds objects through here so the whole pack
    /// becomes visible at once.
    pub fn add_objects<I>(&self, objects: I) -> Result<Vec<ObjectId>>
    where
        I: IntoIterator<Item = RawObject>,
    {
        let tx = self.repo.conn().unchecked_transaction()?;
        let mut ids = Vec::new();
        for obj in objects {
            ids.push(self.write_object(&tx, &obj)?);
        }
        tx.commit()?;
        tracing::debug!(count = ids.len(), "committed object batch");
        Ok(ids)
    }

    pub fn contains(&self, id: &ObjectId) -> Result<bool> {
        let found: Option<i64> = self
            .repo
            .conn()
            .query_row(
                "SELECT 1 FROM objects WHERE oid = ?1",
                [id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Fetch an object's kind and fully reassembled raw bytes.
    pub fn get_raw(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>)> {
        let row = self.load_row(id)?;
        let total = row.total_size as usize;
        if let Some(stored) = row.data {
            let raw = compress::decompress(row.compression, &stored, total, self.repo.dicts())?;
            return Ok((row.kind, raw));
        }

        let refs_blob = row
            .chunk_refs
            .ok_or_else(|| Error::Corrupt(format!("object {id} has neither data nor chunk refs")))?;
        let refs = varint::unpack_refs(&refs_blob)?;
        let chunks = self.fetch_chunks(&refs)?;
        let mut out = Vec::with_capacity(total);
        for rowid in &refs {
            let chunk = chunks
                .get(rowid)
                .ok_or_else(|| Error::Corrupt(format!("chunk rowid {rowid} missing")))?;
            out.extend_from_slice(chunk);
        }
        if out.len() != total {
            return Err(Error::Corrupt(format!(
                "object {id} reassembled to {} bytes, row says {total}",
                out.len()
            )));
        }
        Ok((row.kind, out))
    }

    /// Read `len` raw bytes starting at `offset` without reassembling the
    /// whole object. The range is clamped to the object's size; an offset
    /// at or past the end yields an empty buffer.
    pub fn get_raw_range(&self, id: &ObjectId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let row = self.load_row(id)?;
        let total = row.total_size as u64;
        let start = offset.min(total);
        let end = offset.saturating_add(len).min(total);
        if start >= end {
            return Ok(Vec::new());
        }

        if let Some(stored) = row.data {
            let raw =
                compress::decompress(row.compression, &stored, total as usize, self.repo.dicts())?;
            return Ok(raw[start as usize..end as usize].to_vec());
        }

        let refs_blob = row
            .chunk_refs
            .ok_or_else(|| Error::Corrupt(format!("object {id} has neither data nor chunk refs")))?;
        let refs = varint::unpack_refs(&refs_blob)?;
        let sizes = self.fetch_chunk_sizes(&refs)?;
        let mut starts = Vec::with_capacity(refs.len());
        let mut pos = 0u64;
        for rowid in &refs {
            let size = sizes
                .get(rowid)
                .ok_or_else(|| Error::Corrupt(format!("chunk rowid {rowid} missing")))?;
            starts.push(pos);
            pos += size;
        }
        if pos != total {
            return Err(Error::Corrupt(format!(
                "object {id} chunk sizes sum to {pos}, row says {total}"
            )));
        }

        // Covered span: last chunk starting at or before `start` through
        // the last chunk starting before `end`.
        let first = starts.partition_point(|&s| s <= start) - 1;
        let stop = starts.partition_point(|&s| s < end);

        // One chunk at a time keeps peak memory near a single chunk.
        let mut out = Vec::with_capacity((end - start) as usize);
        for (i, rowid) in refs[first..stop].iter().enumerate() {
            let chunk = self.fetch_chunk(*rowid)?;
            let chunk_start = starts[first + i];
            let lo = start.saturating_sub(chunk_start) as usize;
            let hi = ((end - chunk_start) as usize).min(chunk.len());
            out.extend_from_slice(&chunk[lo..hi]);
        }
        Ok(out)
    }

    /// Raw (uncompressed) size of an object.
    pub fn get_size(&self, id: &ObjectId) -> Result<u64> {
        let size: Option<i64> = self
            .repo
            .conn()
            .query_row(
                "SELECT total_size FROM objects WHERE oid = ?1",
                [id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        size.map(|s| s as u64).ok_or(Error::ObjectNotFound(*id))
    }

    /// All object ids, order unspecified. Only the id column is read.
    pub fn ids(&self) -> Result<Vec<ObjectId>> {
        let mut stmt = self.repo.conn().prepare("SELECT oid FROM objects")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            let bytes = row?;
            ids.push(
                ObjectId::from_bytes(&bytes)
                    .ok_or_else(|| Error::Corrupt(format!("{}-byte object id", bytes.len())))?,
            );
        }
        Ok(ids)
    }

    /// Ids of blobs whose raw content contains `query` as a byte
    /// substring.
    pub fn search_content(&self, query: &[u8]) -> Result<Vec<ObjectId>> {
        search::search(self.repo, query)
    }

    fn write_object(&self, tx: &Transaction<'_>, obj: &RawObject) -> Result<ObjectId> {
        let id = obj.id();
        let method = self.repo.active_compression();

        match chunker::layout(obj.kind, &obj.data) {
            Layout::Inline => {
                let dict = match obj.kind {
                    ObjectKind::Commit => self.repo.dicts().for_slot(DictSlot::Commit),
                    ObjectKind::Tree => self.repo.dicts().for_slot(DictSlot::Tree),
                    // Inline blobs and tags stay dictionary-free.
                    ObjectKind::Blob | ObjectKind::Tag => None,
                };
                let (stored, stored_method) = encode(method, &obj.data, dict)?;
                tx.execute(
                    "INSERT OR REPLACE INTO objects \
                     (oid, kind, data, chunk_refs, total_size, compression) \
                     VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
                    params![
                        id.as_bytes().as_slice(),
                        obj.kind as i64,
                        stored,
                        obj.data.len() as i64,
                        stored_method as i64
                    ],
                )?;
                tracing::debug!(oid = %id, size = obj.data.len(), "stored inline object");
            }
            Layout::Chunked(spans) => {
                let mut rowids = Vec::with_capacity(spans.len());
                for span in &spans {
                    let raw = &obj.data[span.offset..span.offset + span.len];
                    rowids.push(self.intern_chunk(tx, &span.id, raw, method)?);
                }
                let packed = varint::pack_refs(&rowids);
                tx.execute(
                    "INSERT OR REPLACE INTO objects \
                     (oid, kind, data, chunk_refs, total_size, compression) \
                     VALUES (?1, ?2, NULL, ?3, ?4, 0)",
                    params![
                        id.as_bytes().as_slice(),
                        obj.kind as i64,
                        packed,
                        obj.data.len() as i64
                    ],
                )?;
                tracing::debug!(
                    oid = %id,
                    size = obj.data.len(),
                    chunks = rowids.len(),
                    "stored chunked object"
                );
            }
        }
        Ok(id)
    }

    /// Intern one chunk, returning its rowid. Existing chunks are left
    /// untouched so their rowid (and any packed reference to it) is
    /// stable.
    fn intern_chunk(
        &self,
        tx: &Transaction<'_>,
        id: &ChunkId,
        raw: &[u8],
        method: Compression,
    ) -> Result<i64> {
        let existing: Option<i64> = tx
            .query_row(
                "SELECT rowid FROM chunks WHERE chunk_id = ?1",
                [id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(rowid) = existing {
            return Ok(rowid);
        }

        let dict = match method {
            Compression::Zstd => self.repo.dicts().for_slot(DictSlot::Chunk),
            _ => None,
        };
        let (stored, stored_method) = encode(method, raw, dict)?;
        tx.execute(
            "INSERT OR IGNORE INTO chunks (chunk_id, data, compression, raw_size) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                id.as_bytes().as_slice(),
                stored,
                stored_method as i64,
                raw.len() as i64
            ],
        )?;
        let rowid = tx.query_row(
            "SELECT rowid FROM chunks WHERE chunk_id = ?1",
            [id.as_bytes().as_slice()],
            |row| row.get(0),
        )?;
        Ok(rowid)
    }

    fn load_row(&self, id: &ObjectId) -> Result<ObjectRow> {
        let row = self
            .repo
            .conn()
            .query_row(
                "SELECT kind, data, chunk_refs, total_size, compression \
                 FROM objects WHERE oid = ?1",
                [id.as_bytes().as_slice()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        let (kind, data, chunk_refs, total_size, compression) =
            row.ok_or(Error::ObjectNotFound(*id))?;
        Ok(ObjectRow {
            kind: ObjectKind::from_i64(kind)
                .ok_or_else(|| Error::Corrupt(format!("unknown object kind tag {kind}")))?,
            data,
            chunk_refs,
            total_size,
            compression: Compression::from_i64(compression)
                .ok_or_else(|| Error::Corrupt(format!("unknown compression tag {compression}")))?,
        })
    }

    /// Fetch and decompress the given chunk rowids, deduplicated.
    fn fetch_chunks(&self, refs: &[i64]) -> Result<HashMap<i64, Vec<u8>>> {
        let mut unique = refs.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let mut map = HashMap::with_capacity(unique.len());
        for batch in unique.chunks(CHUNK_FETCH_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(",");
            let sql = format!(
                "SELECT rowid, data, compression, raw_size FROM chunks \
                 WHERE rowid IN ({placeholders})"
            );
            let mut stmt = self.repo.conn().prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(batch.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;
            for row in rows {
                let (rowid, stored, compression, raw_size) = row?;
                let method = Compression::from_i64(compression).ok_or_else(|| {
                    Error::Corrupt(format!("unknown compression tag {compression}"))
                })?;
                let raw =
                    compress::decompress(method, &stored, raw_size as usize, self.repo.dicts())?;
                map.insert(rowid, raw);
            }
        }
        Ok(map)
    }

    pub(crate) fn fetch_chunk(&self, rowid: i64) -> Result<Vec<u8>> {
        let row: Option<(Vec<u8>, i64, i64)> = self
            .repo
            .conn()
            .query_row(
                "SELECT data, compression, raw_size FROM chunks WHERE rowid = ?1",
                [rowid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (stored, compression, raw_size) =
            row.ok_or_else(|| Error::Corrupt(format!("chunk rowid {rowid} missing")))?;
        let method = Compression::from_i64(compression)
            .ok_or_else(|| Error::Corrupt(format!("unknown compression tag {compression}")))?;
        compress::decompress(method, &stored, raw_size as usize, self.repo.dicts())
    }

    fn fetch_chunk_sizes(&self, refs: &[i64]) -> Result<HashMap<i64, u64>> {
        let mut unique = refs.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let mut map = HashMap::with_capacity(unique.len());
        for batch in unique.chunks(CHUNK_FETCH_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(",");
            let sql =
                format!("SELECT rowid, raw_size FROM chunks WHERE rowid IN ({placeholders})");
            let mut stmt = self.repo.conn().prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(batch.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (rowid, raw_size) = row?;
                map.insert(rowid, raw_size as u64);
            }
        }
        Ok(map)
    }
}

struct ObjectRow {
    kind: ObjectKind,
    data: Option<Vec<u8>>,
    chunk_refs: Option<Vec<u8>>,
    total_size: i64,
    compression: Compression,
}

/// Compress `raw` with the active method, falling back to identity when
/// compression does not shrink the payload.
fn encode(method: Compression, raw: &[u8], dict: Option<&[u8]>) -> Result<(Vec<u8>, Compression)> {
    if method == Compression::None {
        return Ok((raw.to_vec(), Compression::None));
    }
    let packed = compress::compress(method, raw, dict)?;
    if packed.len() < raw.len() {
        Ok((packed, method))
    } else {
        Ok((raw.to_vec(), Compression::None))
    }
}
