//! Error handling for the storage engine.
//!
//! Everything public returns [`Result`]. Lock contention surfaces as
//! [`Error::Busy`] after the connection's busy timeout; callers may retry.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::ObjectId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The path does not hold an engine database.
    #[error("not a braid repository: {}", .0.display())]
    NotARepository(PathBuf),

    /// `init_bare` was pointed at an existing file.
    #[error("repository already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// The on-disk schema is newer than this engine, or too old to migrate.
    #[error("schema version {found} is outside the supported range {min}..={max}")]
    UnsupportedSchemaVersion { found: u32, min: u32, max: u32 },

    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    #[error("ref {0:?} not found")]
    RefNotFound(String),

    /// The database write lock could not be taken within the busy timeout.
    #[error("database is busy")]
    Busy,

    /// A packed chunk reference list failed to decode.
    #[error("corrupt chunk reference list: {0}")]
    CorruptReferenceList(&'static str),

    /// Stored rows contradict each other (missing chunk, bad hex id, size drift).
    #[error("storage integrity error: {0}")]
    Corrupt(String),

    /// The engine is bare; there is no index to open.
    #[error("bare repository has no index")]
    NoIndex,

    #[error("compression error: {0}")]
    Compression(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(inner, _)
                if matches!(
                    inner.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                Error::Busy
            }
            _ => Error::Database(err),
        }
    }
}
