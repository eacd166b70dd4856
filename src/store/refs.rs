//! Reference store: branches, tags, symbolic refs, the peeled-ref cache,
//! and the append-only reflog.
//!
//! Every mutation is a compare-and-swap executed inside one immediate
//! transaction; the reflog row for a successful mutation commits
//! atomically with it. A failed compare appends nothing.

use chrono::Local;
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};

use crate::error::{Error, Result};
use crate::model::{ObjectId, ZERO_ID};
use crate::repo::Repository;

/// Identity recorded in the reflog when the caller does not supply one.
pub const DEFAULT_COMMITTER: &str = "braid <braid@localhost>";

/// Prefix marking a symbolic ref value.
pub const SYMREF_PREFIX: &str = "ref: ";

/// Symbolic chains longer than this are considered broken.
const MAX_SYMREF_DEPTH: usize = 5;

/// One reflog row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflogEntry {
    pub ref_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub committer: String,
    pub timestamp: i64,
    pub tz_offset: i32,
    pub message: String,
}

/// Handle to the ref half of a repository.
pub struct RefStore<'repo> {
    repo: &'repo Repository,
}

impl<'repo> RefStore<'repo> {
    pub(crate) fn new(repo: &'repo Repository) -> Self {
        RefStore { repo }
    }

    /// Raw value of a ref: either 40 hex digits or `ref: <target>`.
    pub fn get(&self, name: &str) -> Result<String> {
        self.try_get(name)?
            .ok_or_else(|| Error::RefNotFound(name.to_owned()))
    }

    fn try_get(&self, name: &str) -> Result<Option<String>> {
        let value: Option<Vec<u8>> = self
            .repo
            .conn()
            .query_row(
                "SELECT value FROM refs WHERE name = ?1",
                [name.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        value
            .map(|v| {
                String::from_utf8(v)
                    .map_err(|_| Error::Corrupt(format!("non-utf8 value for ref {name:?}")))
            })
            .transpose()
    }

    /// Follow symbolic refs until an object id is reached.
    pub fn resolve(&self, name: &str) -> Result<ObjectId> {
        let mut current = name.to_owned();
        for _ in 0..MAX_SYMREF_DEPTH {
            let value = self.get(&current)?;
            match value.strip_prefix(SYMREF_PREFIX) {
                Some(target) => current = target.to_owned(),
                None => {
                    return ObjectId::from_hex(&value).ok_or_else(|| {
                        Error::Corrupt(format!("ref {current:?} holds malformed id {value:?}"))
                    })
                }
            }
        }
        Err(Error::Corrupt(format!(
            "symbolic ref chain from {name:?} exceeds {MAX_SYMREF_DEPTH} hops"
        )))
    }

    /// All ref names, sorted.
    pub fn list_all(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .repo
            .conn()
            .prepare("SELECT name FROM refs ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut names = Vec::new();
        for row in rows {
            let bytes = row?;
            names.push(
                String::from_utf8(bytes)
                    .map_err(|_| Error::Corrupt("non-utf8 ref name".into()))?,
            );
        }
        Ok(names)
    }

    /// Compare-and-swap a ref to `new`.
    ///
    /// `old = None` sets unconditionally; `old = ZERO_ID` (forty zeros)
    /// requires the ref to be absent. Returns whether the swap happened.
    pub fn set_if_equals(
        &self,
        name: &str,
        old: Option<&str>,
        new: &str,
        committer: Option<&str>,
        message: &str,
    ) -> Result<bool> {
        let tx = self.begin()?;
        let current = self.current(&tx, name)?;
        if !cas_matches(old, current.as_deref()) {
            return Ok(false); // dropping the tx rolls it back
        }
        tx.execute(
            "INSERT OR REPLACE INTO refs (name, value) VALUES (?1, ?2)",
            params![name.as_bytes(), new.as_bytes()],
        )?;
        append_reflog(&tx, name, current.as_deref(), Some(new), committer, message)?;
        tx.commit()?;
        tracing::debug!(name, new, "updated ref");
        Ok(true)
    }

    /// Create a ref only if it does not exist yet.
    pub fn add_if_new(
        &self,
        name: &str,
        value: &str,
        committer: Option<&str>,
        message: &str,
    ) -> Result<bool> {
        let tx = self.begin()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO refs (name, value) VALUES (?1, ?2)",
            params![name.as_bytes(), value.as_bytes()],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        append_reflog(&tx, name, None, Some(value), committer, message)?;
        tx.commit()?;
        tracing::debug!(name, value, "created ref");
        Ok(true)
    }

    /// Delete a ref, optionally requiring its current value to equal
    /// `old` first. Returns whether the delete happened.
    pub fn remove_if_equals(
        &self,
        name: &str,
        old: Option<&str>,
        committer: Option<&str>,
        message: &str,
    ) -> Result<bool> {
        let tx = self.begin()?;
        let current = self.current(&tx, name)?;
        if !cas_matches(old, current.as_deref()) {
            return Ok(false);
        }
        tx.execute("DELETE FROM refs WHERE name = ?1", [name.as_bytes()])?;
        tx.execute(
            "DELETE FROM peeled_refs WHERE name = ?1",
            [name.as_bytes()],
        )?;
        append_reflog(&tx, name, current.as_deref(), None, committer, message)?;
        tx.commit()?;
        tracing::debug!(name, "removed ref");
        Ok(true)
    }

    /// Point `name` at another ref symbolically.
    pub fn set_symbolic(
        &self,
        name: &str,
        target: &str,
        committer: Option<&str>,
        message: &str,
    ) -> Result<()> {
        let value = format!("{SYMREF_PREFIX}{target}");
        let tx = self.begin()?;
        let current = self.current(&tx, name)?;
        tx.execute(
            "INSERT OR REPLACE INTO refs (name, value) VALUES (?1, ?2)",
            params![name.as_bytes(), value.as_bytes()],
        )?;
        append_reflog(&tx, name, current.as_deref(), Some(&value), committer, message)?;
        tx.commit()?;
        Ok(())
    }

    /// Ultimate object id of a ref, using the peeled-tag cache when the
    /// ref has an entry there.
    pub fn get_peeled(&self, name: &str) -> Result<ObjectId> {
        let cached: Option<Vec<u8>> = self
            .repo
            .conn()
            .query_row(
                "SELECT value FROM peeled_refs WHERE name = ?1",
                [name.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        match cached {
            Some(value) => {
                let hex = String::from_utf8(value)
                    .map_err(|_| Error::Corrupt(format!("non-utf8 peeled value for {name:?}")))?;
                ObjectId::from_hex(&hex).ok_or_else(|| {
                    Error::Corrupt(format!("malformed peeled id {hex:?} for {name:?}"))
                })
            }
            None => self.resolve(name),
        }
    }

    /// Record the peeled object id for an annotated-tag ref. Peeling a
    /// tag requires parsing its payload, which is the caller's object
    /// model's job; the engine only caches the result.
    pub fn set_peeled(&self, name: &str, id: &ObjectId) -> Result<()> {
        self.repo.conn().execute(
            "INSERT OR REPLACE INTO peeled_refs (name, value) VALUES (?1, ?2)",
            params![name.as_bytes(), id.hex().as_bytes()],
        )?;
        Ok(())
    }

    /// Reflog entries for one ref, oldest first.
    pub fn log(&self, name: &str) -> Result<Vec<ReflogEntry>> {
        let mut stmt = self.repo.conn().prepare(
            "SELECT ref_name, old_value, new_value, committer, timestamp, tz_offset, message \
             FROM reflog WHERE ref_name = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([name.as_bytes()], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, Option<Vec<u8>>>(1)?,
                row.get::<_, Option<Vec<u8>>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i32>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (ref_name, old, new, committer, timestamp, tz_offset, message) = row?;
            entries.push(ReflogEntry {
                ref_name: String::from_utf8(ref_name)
                    .map_err(|_| Error::Corrupt("non-utf8 ref name in reflog".into()))?,
                old_value: decode_opt(old)?,
                new_value: decode_opt(new)?,
                committer,
                timestamp,
                tz_offset,
                message,
            });
        }
        Ok(entries)
    }

    fn begin(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            self.repo.conn(),
            TransactionBehavior::Immediate,
        )?)
    }

    fn current(&self, tx: &Transaction<'_>, name: &str) -> Result<Option<String>> {
        let value: Option<Vec<u8>> = tx
            .query_row(
                "SELECT value FROM refs WHERE name = ?1",
                [name.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        value
            .map(|v| {
                String::from_utf8(v)
                    .map_err(|_| Error::Corrupt(format!("non-utf8 value for ref {name:?}")))
            })
            .transpose()
    }
}

/// CAS predicate: `None` matches anything, `ZERO_ID` matches only
/// absence, otherwise the current value must equal `old` exactly.
fn cas_matches(old: Option<&str>, current: Option<&str>) -> bool {
    match old {
        None => true,
        Some(expected) if expected == ZERO_ID.hex() => current.is_none(),
        Some(expected) => current == Some(expected),
    }
}

fn append_reflog(
    tx: &Transaction<'_>,
    name: &str,
    old: Option<&str>,
    new: Option<&str>,
    committer: Option<&str>,
    message: &str,
) -> Result<()> {
    let now = Local::now();
    tx.execute(
        "INSERT INTO reflog \
         (ref_name, old_value, new_value, committer, timestamp, tz_offset, message) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            name.as_bytes(),
            old.map(str::as_bytes),
            new.map(str::as_bytes),
            committer.unwrap_or(DEFAULT_COMMITTER),
            now.timestamp(),
            now.offset().local_minus_utc(),
            message
        ],
    )?;
    Ok(())
}

fn decode_opt(value: Option<Vec<u8>>) -> Result<Option<String>> {
    value
        .map(|v| {
            String::from_utf8(v).map_err(|_| Error::Corrupt("non-utf8 value in reflog".into()))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Compression;
    use crate::model::{ObjectKind, RawObject};
    use crate::test_util::scratch_repo;

    fn id_of(byte: u8) -> String {
        ObjectId::for_object(ObjectKind::Blob, &[byte]).hex()
    }

    #[test]
    fn test_missing_ref_is_not_found() {
        let (_dir, repo) = scratch_repo(Compression::None);
        let refs = repo.refs();
        assert!(matches!(
            refs.get("refs/heads/missing"),
            Err(Error::RefNotFound(name)) if name == "refs/heads/missing"
        ));
    }

    #[test]
    fn test_unconditional_set_and_get() {
        let (_dir, repo) = scratch_repo(Compression::None);
        let refs = repo.refs();
        let a = id_of(1);
        assert!(refs
            .set_if_equals("refs/heads/main", None, &a, None, "branch: created")
            .unwrap());
        assert_eq!(refs.get("refs/heads/main").unwrap(), a);
        assert_eq!(refs.resolve("refs/heads/main").unwrap().hex(), a);
    }

    #[test]
    fn test_cas_failure_changes_nothing() {
        let (_dir, repo) = scratch_repo(Compression::None);
        let refs = repo.refs();
        let (a, b, c) = (id_of(1), id_of(2), id_of(3));
        refs.set_if_equals("refs/heads/main", None, &a, None, "created")
            .unwrap();
        let logged_before = refs.log("refs/heads/main").unwrap().len();

        let swapped = refs
            .set_if_equals("refs/heads/main", Some(&b), &c, None, "should fail")
            .unwrap();
        assert!(!swapped);
        assert_eq!(refs.get("refs/heads/main").unwrap(), a);
        assert_eq!(refs.log("refs/heads/main").unwrap().len(), logged_before);
    }

    #[test]
    fn test_cas_success_swings_the_ref() {
        let (_dir, repo) = scratch_repo(Compression::None);
        let refs = repo.refs();
        let (a, b) = (id_of(1), id_of(2));
        refs.set_if_equals("refs/heads/main", None, &a, None, "created")
            .unwrap();
        assert!(refs
            .set_if_equals("refs/heads/main", Some(&a), &b, None, "fast-forward")
            .unwrap());
        assert_eq!(refs.get("refs/heads/main").unwrap(), b);
    }

    #[test]
    fn test_zero_id_means_must_not_exist() {
        let (_dir, repo) = scratch_repo(Compression::None);
        let refs = repo.refs();
        let zero = ZERO_ID.hex();
        let a = id_of(1);
        assert!(refs
            .set_if_equals("refs/tags/v1", Some(&zero), &a, None, "tag: v1")
            .unwrap());
        // Now it exists, so the same call must fail.
        assert!(!refs
            .set_if_equals("refs/tags/v1", Some(&zero), &a, None, "tag: v1 again")
            .unwrap());
    }

    #[test]
    fn test_add_if_new() {
        let (_dir, repo) = scratch_repo(Compression::None);
        let refs = repo.refs();
        let a = id_of(1);
        assert!(refs.add_if_new("refs/tags/v1", &a, None, "tag: v1").unwrap());
        assert!(!refs.add_if_new("refs/tags/v1", &id_of(2), None, "dup").unwrap());
        assert_eq!(refs.get("refs/tags/v1").unwrap(), a);
    }

    #[test]
    fn test_remove_if_equals() {
        let (_dir, repo) = scratch_repo(Compression::None);
        let refs = repo.refs();
        let a = id_of(1);
        refs.add_if_new("refs/heads/gone", &a, None, "created").unwrap();

        assert!(!refs
            .remove_if_equals("refs/heads/gone", Some(&id_of(2)), None, "wrong old")
            .unwrap());
        assert!(refs.get("refs/heads/gone").is_ok());

        assert!(refs
            .remove_if_equals("refs/heads/gone", Some(&a), None, "branch: deleted")
            .unwrap());
        assert!(matches!(
            refs.get("refs/heads/gone"),
            Err(Error::RefNotFound(_))
        ));

        let log = refs.log("refs/heads/gone").unwrap();
        let last = log.last().unwrap();
        assert_eq!(last.old_value.as_deref(), Some(a.as_str()));
        assert_eq!(last.new_value, None);
    }

    #[test]
    fn test_symbolic_refs_resolve_through() {
        let (_dir, repo) = scratch_repo(Compression::None);
        let refs = repo.refs();
        let a = id_of(1);
        refs.set_if_equals("refs/heads/main", None, &a, None, "created")
            .unwrap();
        refs.set_symbolic("HEAD", "refs/heads/main", None, "checkout: main")
            .unwrap();

        assert_eq!(refs.get("HEAD").unwrap(), "ref: refs/heads/main");
        assert_eq!(refs.resolve("HEAD").unwrap().hex(), a);
    }

    #[test]
    fn test_symbolic_loop_is_rejected() {
        let (_dir, repo) = scratch_repo(Compression::None);
        let refs = repo.refs();
        refs.set_symbolic("refs/a", "refs/b", None, "loop").unwrap();
        refs.set_symbolic("refs/b", "refs/a", None, "loop").unwrap();
        assert!(matches!(refs.resolve("refs/a"), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_reflog_records_mutations_in_order() {
        let (_dir, repo) = scratch_repo(Compression::None);
        let refs = repo.refs();
        let (a, b) = (id_of(1), id_of(2));
        refs.set_if_equals("refs/heads/main", None, &a, None, "created")
            .unwrap();
        refs.set_if_equals(
            "refs/heads/main",
            Some(&a),
            &b,
            Some("A U Thor <author@example.com>"),
            "fast-forward",
        )
        .unwrap();

        let log = refs.log("refs/heads/main").unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].old_value, None);
        assert_eq!(log[0].new_value.as_deref(), Some(a.as_str()));
        assert_eq!(log[0].committer, DEFAULT_COMMITTER);
        assert_eq!(log[1].old_value.as_deref(), Some(a.as_str()));
        assert_eq!(log[1].new_value.as_deref(), Some(b.as_str()));
        assert_eq!(log[1].committer, "A U Thor <author@example.com>");
        assert_eq!(log[1].message, "fast-forward");
        assert!(log[1].timestamp >= log[0].timestamp);
    }

    #[test]
    fn test_peeled_cache_and_fallback() {
        let (_dir, repo) = scratch_repo(Compression::None);
        let refs = repo.refs();
        let commit = repo
            .objects()
            .add_object(&RawObject::new(ObjectKind::Commit, &b"c"[..]))
            .unwrap();
        let tag = repo
            .objects()
            .add_object(&RawObject::new(ObjectKind::Tag, &b"t"[..]))
            .unwrap();

        refs.add_if_new("refs/tags/v1", &tag.hex(), None, "tag: v1")
            .unwrap();
        // No cache entry yet: falls back to the ref's own target.
        assert_eq!(refs.get_peeled("refs/tags/v1").unwrap(), tag);

        refs.set_peeled("refs/tags/v1", &commit).unwrap();
        assert_eq!(refs.get_peeled("refs/tags/v1").unwrap(), commit);
    }

    #[test]
    fn test_list_all_is_sorted() {
        let (_dir, repo) = scratch_repo(Compression::None);
        let refs = repo.refs();
        for name in ["refs/tags/z", "refs/heads/b", "refs/heads/a"] {
            refs.add_if_new(name, &id_of(9), None, "created").unwrap();
        }
        let names = refs.list_all().unwrap();
        // HEAD is seeded by init_bare.
        assert_eq!(
            names,
            vec!["HEAD", "refs/heads/a", "refs/heads/b", "refs/tags/z"]
        );
    }
}
