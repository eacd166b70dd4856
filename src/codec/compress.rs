//! Compression dispatch: identity, zlib deflate, and zstd with trained
//! dictionaries.
//!
//! Zstd frames carry the id of the dictionary they were built with. On
//! decompression the frame header is inspected and the matching loaded
//! dictionary is used; a frame with dictionary id 0 decompresses without
//! one. Up to three trained dictionaries exist, keyed by object kind
//! (commit, tree, chunk), plus one legacy untyped slot.

use std::io::Read;

use flate2::read::{ZlibDecoder, ZlibEncoder};

use crate::error::{Error, Result};

const ZSTD_LEVEL: i32 = 3;
const ZLIB_LEVEL: u32 = 6;

/// A stored compression method.
/// Matches the `compression` columns and the `compression` metadata key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Compression {
    None = 0,
    Zlib = 1,
    Zstd = 2,
}

impl Compression {
    /// Convert from the database integer tag.
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Compression::None),
            1 => Some(Compression::Zlib),
            2 => Some(Compression::Zstd),
            _ => None,
        }
    }

    /// Name as stored under the `compression` metadata key.
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zlib => "zlib",
            Compression::Zstd => "zstd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Compression::None),
            "zlib" => Some(Compression::Zlib),
            "zstd" => Some(Compression::Zstd),
            _ => None,
        }
    }
}

/// Which trained dictionary a payload is eligible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictSlot {
    Commit,
    Tree,
    Chunk,
}

/// Trained zstd dictionaries loaded from the repository's named files.
///
/// Read-only for the lifetime of a repository handle; reloaded when a
/// dictionary named file is rewritten.
#[derive(Debug, Default)]
pub struct DictionarySet {
    commit: Option<Vec<u8>>,
    tree: Option<Vec<u8>>,
    chunk: Option<Vec<u8>>,
    legacy: Option<Vec<u8>>,
}

impl DictionarySet {
    pub fn empty() -> Self {
        DictionarySet::default()
    }

    pub fn new(
        commit: Option<Vec<u8>>,
        tree: Option<Vec<u8>>,
        chunk: Option<Vec<u8>>,
        legacy: Option<Vec<u8>>,
    ) -> Self {
        DictionarySet {
            commit,
            tree,
            chunk,
            legacy,
        }
    }

    /// Dictionary to compress a payload in `slot` with, if any.
    /// Falls back to the legacy untyped dictionary.
    pub fn for_slot(&self, slot: DictSlot) -> Option<&[u8]> {
        let typed = match slot {
            DictSlot::Commit => self.commit.as_deref(),
            DictSlot::Tree => self.tree.as_deref(),
            DictSlot::Chunk => self.chunk.as_deref(),
        };
        typed.or(self.legacy.as_deref())
    }

    /// Dictionary whose embedded id matches a frame's dictionary id.
    fn by_frame_id(&self, dict_id: Option<std::num::NonZero<u32>>) -> Option<&[u8]> {
        [
            self.commit.as_deref(),
            self.tree.as_deref(),
            self.chunk.as_deref(),
            self.legacy.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find(|dict| zstd::zstd_safe::get_dict_id_from_dict(dict) == dict_id)
    }
}

/// Compress `raw` with `method`, optionally using a trained dictionary
/// (zstd only).
pub fn compress(method: Compression, raw: &[u8], dict: Option<&[u8]>) -> Result<Vec<u8>> {
    match method {
        Compression::None => Ok(raw.to_vec()),
        Compression::Zlib => {
            let mut out = Vec::with_capacity(raw.len() / 2 + 16);
            ZlibEncoder::new(raw, flate2::Compression::new(ZLIB_LEVEL))
                .read_to_end(&mut out)
                .map_err(|e| Error::Compression(e.to_string()))?;
            Ok(out)
        }
        Compression::Zstd => {
            let out = match dict {
                Some(dict) => zstd::bulk::Compressor::with_dictionary(ZSTD_LEVEL, dict)
                    .and_then(|mut enc| enc.compress(raw)),
                None => zstd::bulk::compress(raw, ZSTD_LEVEL),
            };
            out.map_err(|e| Error::Compression(e.to_string()))
        }
    }
}

/// Decompress `stored` back to `raw_size` bytes.
///
/// `raw_size` comes from the row's recorded uncompressed length; the
/// result is checked against it.
pub fn decompress(
    method: Compression,
    stored: &[u8],
    raw_size: usize,
    dicts: &DictionarySet,
) -> Result<Vec<u8>> {
    let out = match method {
        Compression::None => stored.to_vec(),
        Compression::Zlib => {
            let mut out = Vec::with_capacity(raw_size);
            ZlibDecoder::new(stored)
                .read_to_end(&mut out)
                .map_err(|e| Error::Compression(e.to_string()))?;
            out
        }
        Compression::Zstd => {
            let dict_id = zstd::zstd_safe::get_dict_id_from_frame(stored);
            let result = if dict_id.is_none() {
                zstd::bulk::decompress(stored, raw_size)
            } else {
                let dict = dicts.by_frame_id(dict_id).ok_or_else(|| {
                    Error::Compression(format!(
                        "no loaded dictionary with id {}",
                        dict_id.map_or(0, |id| id.get())
                    ))
                })?;
                zstd::bulk::Decompressor::with_dictionary(dict)
                    .and_then(|mut dec| dec.decompress(stored, raw_size))
            };
            result.map_err(|e| Error::Compression(e.to_string()))?
        }
    };
    if out.len() != raw_size {
        return Err(Error::Corrupt(format!(
            "decompressed to {} bytes, expected {}",
            out.len(),
            raw_size
        )));
    }
    Ok(out)
}
