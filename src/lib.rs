//! braid: a bare git repository inside a single SQLite file.
//!
//! The engine stores objects, refs, reflog, and repository config files
//! in one embedded database. Large blobs are split by content-defined
//! chunking and deduplicated across versions; chunks and inline payloads
//! are optionally compressed (zlib, or zstd with trained per-kind
//! dictionaries). Refs mutate through linearizable compare-and-swap with
//! an append-only reflog.
//!
//! The engine is a storage backend, not a git implementation: callers
//! hand it already-parsed objects and ref values, and it hands back raw
//! bytes. Wire protocols, packfile parsing, and working-tree semantics
//! live with the caller. Repositories are always bare; [`Repository::open_index`]
//! fails with [`Error::NoIndex`].
//!
//! ```no_run
//! use braid::{Compression, ObjectKind, RawObject, Repository};
//!
//! # fn main() -> braid::Result<()> {
//! let repo = Repository::init_bare("project.db", Compression::Zstd)?;
//! let id = repo
//!     .objects()
//!     .add_object(&RawObject::new(ObjectKind::Blob, &b"hello world"[..]))?;
//! let (_kind, bytes) = repo.objects().get_raw(&id)?;
//! assert_eq!(bytes, b"hello world");
//! # Ok(())
//! # }
//! ```

pub mod chunker;
pub mod codec;
pub mod error;
pub mod model;
pub mod repo;
pub mod schema;
pub mod store;

pub use codec::Compression;
pub use error::{Error, Result};
pub use model::{ChunkId, ObjectId, ObjectKind, RawObject, ZERO_ID};
pub use repo::Repository;
pub use store::{ObjectStore, RefStore, ReflogEntry};
