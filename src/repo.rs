//! Repository lifecycle: open/create/close, engine settings, and the
//! named-file passthrough (config, description, compression
//! dictionaries).
//!
//! A repository handle exclusively owns one database connection. The
//! object and ref stores borrow the handle and are valid only while it
//! lives; use one handle per thread.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::codec::{varint, Compression, DictionarySet};
use crate::error::{Error, Result};
use crate::model::ObjectKind;
use crate::schema;
use crate::store::{ObjectStore, RefStore};

/// Named-file paths reserved by the engine.
pub const CONFIG_FILE: &str = "config";
pub const DESCRIPTION_FILE: &str = "description";
pub const INFO_EXCLUDE_FILE: &str = "info/exclude";
pub const ZSTD_DICT_COMMIT: &str = "_zstd_dict_commit";
pub const ZSTD_DICT_TREE: &str = "_zstd_dict_tree";
pub const ZSTD_DICT_CHUNK: &str = "_zstd_dict_chunk";
/// Single untyped dictionary slot honored for repositories written
/// before the per-kind slots existed.
pub const ZSTD_DICT_LEGACY: &str = "_zstd_dict";

const DEFAULT_HEAD_TARGET: &str = "refs/heads/master";
const DEFAULT_CONFIG: &[u8] =
    b"[core]\n\trepositoryformatversion = 0\n\tfilemode = true\n\tbare = true\n";
const DEFAULT_DESCRIPTION: &[u8] =
    b"Unnamed repository; edit this file 'description' to name the repository.\n";
const DEFAULT_EXCLUDE: &[u8] =
    b"# Lines that start with '#' are comments.\n# Exclude patterns, one per line.\n";

/// Rows sampled per table when training compression dictionaries.
const DICT_SAMPLE_LIMIT: usize = 4096;

/// An open bare repository backed by a single database file.
#[derive(Debug)]
pub struct Repository {
    path: PathBuf,
    conn: Connection,
    compression: Compression,
    dicts: DictionarySet,
}

impl Repository {
    /// Open an existing repository database, migrating its schema forward
    /// if it is from an older engine.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(Error::NotARepository(path));
        }
        let conn = Connection::open(&path)?;
        let opened = schema::apply_connection_pragmas(&conn).and_then(|()| {
            // An existing engine database is required here: a parseable
            // SQLite file without the metadata table belongs to someone
            // else and must not be adopted by bootstrapping a schema
            // into it. Schema creation happens only in `init_bare`.
            if !schema::has_metadata_table(&conn)? {
                return Err(Error::NotARepository(path.clone()));
            }
            schema::ensure_migrated(&conn)
        });
        if let Err(err) = opened {
            // A file that SQLite cannot read at all is not an engine
            // database either, however it got there.
            return Err(match err {
                Error::Database(rusqlite::Error::SqliteFailure(inner, _))
                    if inner.code == rusqlite::ErrorCode::NotADatabase =>
                {
                    Error::NotARepository(path)
                }
                other => other,
            });
        }

        let mut repo = Repository {
            path,
            conn,
            compression: Compression::None,
            dicts: DictionarySet::empty(),
        };
        repo.compression = repo.read_compression_setting()?;
        repo.reload_dictionaries()?;
        tracing::info!(
            path = %repo.path.display(),
            compression = repo.compression.name(),
            "opened repository"
        );
        Ok(repo)
    }

    /// Create a fresh bare repository at `path`.
    pub fn init_bare(path: impl AsRef<Path>, compression: Compression) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(Error::AlreadyExists(path));
        }
        let conn = Connection::open(&path)?;
        schema::apply_connection_pragmas(&conn)?;
        schema::create_current(&conn)?;

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('compression', ?1)",
            [compression.name()],
        )?;
        // HEAD starts as an unborn branch, like a fresh `git init --bare`;
        // no reflog entry until the first real mutation.
        tx.execute(
            "INSERT INTO refs (name, value) VALUES (?1, ?2)",
            params![
                "HEAD".as_bytes(),
                format!("ref: {DEFAULT_HEAD_TARGET}").as_bytes()
            ],
        )?;
        for (file, contents) in [
            (CONFIG_FILE, DEFAULT_CONFIG),
            (DESCRIPTION_FILE, DEFAULT_DESCRIPTION),
            (INFO_EXCLUDE_FILE, DEFAULT_EXCLUDE),
        ] {
            tx.execute(
                "INSERT INTO named_files (path, data) VALUES (?1, ?2)",
                params![file, contents],
            )?;
        }
        tx.commit()?;

        tracing::info!(
            path = %path.display(),
            compression = compression.name(),
            "initialized bare repository"
        );
        Ok(Repository {
            path,
            conn,
            compression,
            dicts: DictionarySet::empty(),
        })
    }

    /// Close the handle, surfacing any final database error.
    /// Dropping the handle closes it too, discarding such errors.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| Error::from(err))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn objects(&self) -> ObjectStore<'_> {
        ObjectStore::new(self)
    }

    pub fn refs(&self) -> RefStore<'_> {
        RefStore::new(self)
    }

    /// The engine is bare by design; there is never an index.
    pub fn open_index(&self) -> Result<()> {
        Err(Error::NoIndex)
    }

    /// Compression method applied to new writes.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Switch the compression method for new writes. Existing rows keep
    /// the method they were written with.
    pub fn set_compression(&mut self, method: Compression) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('compression', ?1)",
            [method.name()],
        )?;
        self.compression = method;
        Ok(())
    }

    /// Raw bytes of the repository's config file (opaque to the engine).
    pub fn config(&self) -> Result<Vec<u8>> {
        Ok(self.named_file(CONFIG_FILE)?.unwrap_or_default())
    }

    pub fn set_config(&mut self, data: &[u8]) -> Result<()> {
        self.put_named_file(CONFIG_FILE, data)
    }

    pub fn description(&self) -> Result<Vec<u8>> {
        Ok(self.named_file(DESCRIPTION_FILE)?.unwrap_or_default())
    }

    pub fn set_description(&mut self, data: &[u8]) -> Result<()> {
        self.put_named_file(DESCRIPTION_FILE, data)
    }

    /// Read a named file stored inside the repository database.
    pub fn named_file(&self, file: &str) -> Result<Option<Vec<u8>>> {
        let data: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT data FROM named_files WHERE path = ?1",
                [file],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    /// Write a named file. Rewriting a dictionary slot reloads the
    /// in-memory dictionary set.
    pub fn put_named_file(&mut self, file: &str, data: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO named_files (path, data) VALUES (?1, ?2)",
            params![file, data],
        )?;
        if matches!(
            file,
            ZSTD_DICT_COMMIT | ZSTD_DICT_TREE | ZSTD_DICT_CHUNK | ZSTD_DICT_LEGACY
        ) {
            self.reload_dictionaries()?;
        }
        Ok(())
    }

    /// Delete every chunk row no packed reference list points at.
    ///
    /// Replacing objects can strand chunks; nothing reclaims them
    /// automatically. This maintenance pass is only ever run explicitly.
    pub fn sweep_orphan_chunks(&self) -> Result<usize> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let mut referenced: HashSet<i64> = HashSet::new();
        {
            let mut stmt =
                tx.prepare("SELECT chunk_refs FROM objects WHERE chunk_refs IS NOT NULL")?;
            let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
            for row in rows {
                referenced.extend(varint::unpack_refs(&row?)?);
            }
        }

        let orphans: Vec<i64> = {
            let mut stmt = tx.prepare("SELECT rowid FROM chunks")?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            let mut orphans = Vec::new();
            for row in rows {
                let rowid = row?;
                if !referenced.contains(&rowid) {
                    orphans.push(rowid);
                }
            }
            orphans
        };
        {
            let mut stmt = tx.prepare("DELETE FROM chunks WHERE rowid = ?1")?;
            for rowid in &orphans {
                stmt.execute([rowid])?;
            }
        }
        tx.commit()?;

        tracing::info!(removed = orphans.len(), "swept orphan chunks");
        Ok(orphans.len())
    }

    /// Train per-kind zstd dictionaries from stored commits, trees, and
    /// chunks, and install them into their named-file slots. Slots whose
    /// sample pool is too small to train from are skipped.
    pub fn train_dictionaries(&mut self, max_dict_size: usize) -> Result<()> {
        let jobs = [
            (ZSTD_DICT_COMMIT, self.object_samples(ObjectKind::Commit)?),
            (ZSTD_DICT_TREE, self.object_samples(ObjectKind::Tree)?),
            (ZSTD_DICT_CHUNK, self.chunk_samples()?),
        ];
        for (slot, samples) in jobs {
            match zstd::dict::from_samples(&samples, max_dict_size) {
                Ok(dict) => {
                    self.put_named_file(slot, &dict)?;
                    tracing::info!(slot, samples = samples.len(), "trained dictionary");
                }
                Err(err) => {
                    tracing::warn!(slot, samples = samples.len(), %err, "dictionary not trained");
                }
            }
        }
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn active_compression(&self) -> Compression {
        self.compression
    }

    pub(crate) fn dicts(&self) -> &DictionarySet {
        &self.dicts
    }

    fn read_compression_setting(&self) -> Result<Compression> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'compression'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(name) => Compression::from_name(&name)
                .ok_or_else(|| Error::Corrupt(format!("unknown compression setting {name:?}"))),
            None => Ok(Compression::None),
        }
    }

    fn reload_dictionaries(&mut self) -> Result<()> {
        self.dicts = DictionarySet::new(
            self.named_file(ZSTD_DICT_COMMIT)?,
            self.named_file(ZSTD_DICT_TREE)?,
            self.named_file(ZSTD_DICT_CHUNK)?,
            self.named_file(ZSTD_DICT_LEGACY)?,
        );
        Ok(())
    }

    fn object_samples(&self, kind: ObjectKind) -> Result<Vec<Vec<u8>>> {
        let mut stmt = self.conn.prepare(
            "SELECT data, total_size, compression FROM objects \
             WHERE kind = ?1 AND data IS NOT NULL LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![kind as i64, DICT_SAMPLE_LIMIT as i64], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut samples = Vec::new();
        for row in rows {
            let (stored, total_size, compression) = row?;
            let method = Compression::from_i64(compression)
                .ok_or_else(|| Error::Corrupt(format!("unknown compression tag {compression}")))?;
            samples.push(crate::codec::compress::decompress(
                method,
                &stored,
                total_size as usize,
                &self.dicts,
            )?);
        }
        Ok(samples)
    }

    fn chunk_samples(&self) -> Result<Vec<Vec<u8>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data, raw_size, compression FROM chunks LIMIT ?1")?;
        let rows = stmt.query_map([DICT_SAMPLE_LIMIT as i64], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut samples = Vec::new();
        for row in rows {
            let (stored, raw_size, compression) = row?;
            let method = Compression::from_i64(compression)
                .ok_or_else(|| Error::Corrupt(format!("unknown compression tag {compression}")))?;
            samples.push(crate::codec::compress::decompress(
                method,
                &stored,
                raw_size as usize,
                &self.dicts,
            )?);
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::varint::pack_refs;
    use crate::model::{ChunkId, ObjectId, RawObject};
    use crate::test_util::scratch_repo;

    #[test]
    fn test_init_seeds_head_and_named_files() {
        let (_dir, repo) = scratch_repo(Compression::Zstd);
        assert_eq!(repo.refs().get("HEAD").unwrap(), "ref: refs/heads/master");
        assert!(repo.config().unwrap().starts_with(b"[core]"));
        assert!(!repo.description().unwrap().is_empty());
        assert!(repo.named_file(INFO_EXCLUDE_FILE).unwrap().is_some());
        assert_eq!(repo.compression(), Compression::Zstd);
    }

    #[test]
    fn test_open_index_always_fails() {
        let (_dir, repo) = scratch_repo(Compression::None);
        assert!(matches!(repo.open_index(), Err(Error::NoIndex)));
    }

    #[test]
    fn test_open_missing_path_is_not_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        let err = Repository::open(dir.path().join("absent.db")).unwrap_err();
        assert!(matches!(err, Error::NotARepository(_)));
    }

    #[test]
    fn test_open_non_database_file_is_not_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, b"definitely not a database").unwrap();
        assert!(matches!(
            Repository::open(&path),
            Err(Error::NotARepository(_))
        ));
    }

    #[test]
    fn test_open_foreign_database_is_refused_and_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)")
                .unwrap();
        }

        // A perfectly valid SQLite file that is not an engine database.
        assert!(matches!(
            Repository::open(&path),
            Err(Error::NotARepository(_))
        ));

        // The refusal must not have bootstrapped a schema into the file.
        let conn = Connection::open(&path).unwrap();
        assert!(!crate::schema::has_metadata_table(&conn).unwrap());
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'objects'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[test]
    fn test_open_empty_file_is_not_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.db");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            Repository::open(&path),
            Err(Error::NotARepository(_))
        ));
        // Still no engine schema afterwards.
        let conn = Connection::open(&path).unwrap();
        assert!(!crate::schema::has_metadata_table(&conn).unwrap());
    }

    #[test]
    fn test_init_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.db");
        Repository::init_bare(&path, Compression::None).unwrap();
        assert!(matches!(
            Repository::init_bare(&path, Compression::None),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_reopen_preserves_settings_and_objects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.db");
        let id;
        {
            let repo = Repository::init_bare(&path, Compression::Zlib).unwrap();
            id = repo
                .objects()
                .add_object(&RawObject::new(ObjectKind::Blob, b"persisted\n".repeat(900)))
                .unwrap();
            repo.close().unwrap();
        }
        let repo = Repository::open(&path).unwrap();
        assert_eq!(repo.compression(), Compression::Zlib);
        assert_eq!(
            repo.objects().get_raw(&id).unwrap().1,
            b"persisted\n".repeat(900)
        );
    }

    #[test]
    fn test_set_compression_applies_to_new_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.db");
        let mut repo = Repository::init_bare(&path, Compression::None).unwrap();
        repo.set_compression(Compression::Zstd).unwrap();

        let id = repo
            .objects()
            .add_object(&RawObject::new(ObjectKind::Commit, b"x\n".repeat(400)))
            .unwrap();
        let compression: i64 = repo
            .conn()
            .query_row(
                "SELECT compression FROM objects WHERE oid = ?1",
                [id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(compression, Compression::Zstd as i64);

        // And the setting survives a reopen.
        repo.close().unwrap();
        let repo = Repository::open(&path).unwrap();
        assert_eq!(repo.compression(), Compression::Zstd);
    }

    #[test]
    fn test_config_passthrough() {
        let (_dir, mut repo) = scratch_repo(Compression::None);
        repo.set_config(b"[core]\n\tbare = true\n\tcustom = 1\n").unwrap();
        assert_eq!(repo.config().unwrap(), b"[core]\n\tbare = true\n\tcustom = 1\n");
        repo.set_description(b"engine under test\n").unwrap();
        assert_eq!(repo.description().unwrap(), b"engine under test\n");
    }

    /// End-to-end migration: a v7-era file with hex chunk ids opens,
    /// migrates, and every chunked object still reassembles.
    #[test]
    fn test_open_migrates_old_schema_and_objects_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.db");

        let payload: Vec<u8> = (0..50u32)
            .flat_map(|i| format!("content line {i}\n").into_bytes())
            .collect();
        let halves = [&payload[..400], &payload[400..]];
        let oid = ObjectId::for_object(ObjectKind::Blob, &payload);
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                r#"
                CREATE TABLE objects (
                    oid         BLOB PRIMARY KEY,
                    kind        INTEGER NOT NULL,
                    data        BLOB,
                    chunk_refs  BLOB,
                    total_size  INTEGER NOT NULL,
                    compression INTEGER NOT NULL DEFAULT 0,
                    CHECK ((data IS NULL) != (chunk_refs IS NULL))
                );
                CREATE TABLE chunks (
                    chunk_id    TEXT PRIMARY KEY,
                    data        BLOB NOT NULL,
                    compression INTEGER NOT NULL DEFAULT 0,
                    raw_size    INTEGER NOT NULL
                );
                CREATE TABLE refs (name BLOB PRIMARY KEY, value BLOB NOT NULL);
                CREATE TABLE named_files (path TEXT PRIMARY KEY, data BLOB NOT NULL);
                CREATE TABLE metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);
                INSERT INTO metadata (key, value) VALUES ('schema_version', '7');
                INSERT INTO metadata (key, value) VALUES ('compression', 'none');
                "#,
            )
            .unwrap();
            // Gappy rowids, as deletions would leave behind.
            let rowids = [3i64, 17];
            for (rowid, half) in rowids.iter().zip(halves) {
                conn.execute(
                    "INSERT INTO chunks (rowid, chunk_id, data, compression, raw_size) \
                     VALUES (?1, ?2, ?3, 0, ?4)",
                    params![rowid, ChunkId::for_bytes(half).hex(), half, half.len() as i64],
                )
                .unwrap();
            }
            conn.execute(
                "INSERT INTO objects (oid, kind, chunk_refs, total_size, compression) \
                 VALUES (?1, 3, ?2, ?3, 0)",
                params![
                    oid.as_bytes().as_slice(),
                    pack_refs(&rowids),
                    payload.len() as i64
                ],
            )
            .unwrap();
        }

        let repo = Repository::open(&path).unwrap();
        let (kind, raw) = repo.objects().get_raw(&oid).unwrap();
        assert_eq!(kind, ObjectKind::Blob);
        assert_eq!(raw, payload);
        assert_eq!(repo.objects().get_raw_range(&oid, 398, 4).unwrap(), &payload[398..402]);
    }

    #[test]
    fn test_sweep_removes_only_orphans() {
        let (_dir, repo) = scratch_repo(Compression::None);
        let store = repo.objects();

        let keep = store
            .add_object(&RawObject::new(ObjectKind::Blob, b"kept line\n".repeat(2000)))
            .unwrap();
        let doomed = store
            .add_object(&RawObject::new(ObjectKind::Blob, b"doomed line\n".repeat(2000)))
            .unwrap();

        // Drop the second object row outright; its chunks are now orphans.
        repo.conn()
            .execute(
                "DELETE FROM objects WHERE oid = ?1",
                [doomed.as_bytes().as_slice()],
            )
            .unwrap();

        let removed = repo.sweep_orphan_chunks().unwrap();
        assert!(removed > 0);
        assert_eq!(
            store.get_raw(&keep).unwrap().1,
            b"kept line\n".repeat(2000)
        );
        // A second sweep finds nothing.
        assert_eq!(repo.sweep_orphan_chunks().unwrap(), 0);
    }

    #[test]
    fn test_trained_dictionaries_are_installed_and_used() {
        let (_dir, mut repo) = scratch_repo(Compression::Zstd);

        let commits: Vec<RawObject> = (0..600u32)
            .map(|i| {
                RawObject::new(
                    ObjectKind::Commit,
                    format!(
                        "tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
                         author A U Thor <author@example.com> 17000{i:05} +0000\n\
                         commit message number {i}\n"
                    ),
                )
            })
            .collect();
        repo.objects().add_objects(commits.clone()).unwrap();

        repo.train_dictionaries(4096).unwrap();
        assert!(repo.named_file(ZSTD_DICT_COMMIT).unwrap().is_some());

        // New commits still roundtrip, now through the dictionary.
        let extra = RawObject::new(
            ObjectKind::Commit,
            &b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\nfinal\n"[..],
        );
        let id = repo.objects().add_object(&extra).unwrap();
        assert_eq!(repo.objects().get_raw(&id).unwrap().1, extra.data);

        // Reopening reloads the dictionaries from their named files.
        let path = repo.path().to_path_buf();
        repo.close().unwrap();
        let repo = Repository::open(&path).unwrap();
        assert_eq!(repo.objects().get_raw(&id).unwrap().1, extra.data);
    }
}
