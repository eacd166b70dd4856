//! Object model shared across the engine.
//!
//! Object ids are SHA-1 over the canonical git framing
//! `"<kind> <len>\0" || payload`; chunk ids are SHA-256 over raw
//! (pre-compression) chunk bytes, so a chunk keeps its identity no matter
//! which codec stored it.

use std::fmt;

use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Marker id meaning "this ref should not exist" in compare-and-swap calls.
pub const ZERO_ID: ObjectId = ObjectId([0u8; 20]);

/// 20-byte SHA-1 object id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(ObjectId(arr))
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 40 {
            return None;
        }
        let bytes = hex::decode(s).ok()?;
        Self::from_bytes(&bytes)
    }

    /// Id of an object with the given kind and payload.
    pub fn for_object(kind: ObjectKind, data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("{} {}\0", kind.name(), data.len()).as_bytes());
        hasher.update(data);
        ObjectId(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.hex())
    }
}

/// 32-byte SHA-256 chunk id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId([u8; 32]);

impl ChunkId {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(ChunkId(arr))
    }

    /// Id of a chunk, always computed over raw uncompressed bytes.
    pub fn for_bytes(raw: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(raw);
        ChunkId(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.hex())
    }
}

/// The four git object kinds.
/// Matches the `kind` column in the `objects` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum ObjectKind {
    Commit = 1,
    Tree = 2,
    Blob = 3,
    Tag = 4,
}

impl ObjectKind {
    /// Convert from the database integer tag.
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(ObjectKind::Commit),
            2 => Some(ObjectKind::Tree),
            3 => Some(ObjectKind::Blob),
            4 => Some(ObjectKind::Tag),
            _ => None,
        }
    }

    /// Name as it appears in git object framing.
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
            ObjectKind::Tag => "tag",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "commit" => Some(ObjectKind::Commit),
            "tree" => Some(ObjectKind::Tree),
            "blob" => Some(ObjectKind::Blob),
            "tag" => Some(ObjectKind::Tag),
            _ => None,
        }
    }
}

/// An object as handed to the engine: kind plus raw payload bytes.
///
/// The caller's object model is responsible for producing canonical
/// payloads (commit text, tree entries, ...); the engine only frames them
/// for hashing and stores the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObject {
    pub kind: ObjectKind,
    pub data: Vec<u8>,
}

impl RawObject {
    pub fn new(kind: ObjectKind, data: impl Into<Vec<u8>>) -> Self {
        RawObject {
            kind,
            data: data.into(),
        }
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::for_object(self.kind, &self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_id_matches_git() {
        // `echo -n "hello world" | git hash-object --stdin`
        let blob = RawObject::new(ObjectKind::Blob, &b"hello world"[..]);
        assert_eq!(blob.id().hex(), "95d09f2b10159347eece71399a7e2e907ea3df4f");
    }

    #[test]
    fn test_chunk_id_is_sha256_of_raw_bytes() {
        let id = ChunkId::for_bytes(b"hello world");
        assert_eq!(
            id.hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_object_id_hex_roundtrip() {
        let id = ObjectId::for_object(ObjectKind::Tree, b"");
        let parsed = ObjectId::from_hex(&id.hex()).unwrap();
        assert_eq!(id, parsed);
        assert!(ObjectId::from_hex("xyz").is_none());
        assert!(ObjectId::from_hex(&"0".repeat(39)).is_none());
    }

    #[test]
    fn test_zero_id() {
        assert!(ZERO_ID.is_zero());
        assert_eq!(ZERO_ID.hex(), "0".repeat(40));
        assert!(!ObjectId::for_object(ObjectKind::Blob, b"x").is_zero());
    }

    #[test]
    fn test_kind_tags_roundtrip() {
        for kind in [
            ObjectKind::Commit,
            ObjectKind::Tree,
            ObjectKind::Blob,
            ObjectKind::Tag,
        ] {
            assert_eq!(ObjectKind::from_i64(kind as i64), Some(kind));
            assert_eq!(ObjectKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ObjectKind::from_i64(0), None);
        assert_eq!(ObjectKind::from_name("blobby"), None);
    }
}
