//! Byte-level codecs: packed chunk reference lists and compression.

pub mod compress;
pub mod varint;

pub use compress::{Compression, DictSlot, DictionarySet};
pub use varint::{pack_refs, unpack_refs};
