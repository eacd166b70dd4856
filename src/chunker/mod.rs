//! Content-defined chunking of blob payloads.
//!
//! Only blobs are chunked; commits, trees, and tags always go inline.
//! Text-looking blobs are cut on line boundaries so that line-local edits
//! shift few chunks; binary blobs go through FastCDC. A blob that would
//! produce a single chunk is stored inline instead.

mod binary;
mod text;

use crate::model::{ChunkId, ObjectKind};

/// Blobs below this size are always stored inline.
pub const INLINE_THRESHOLD: usize = 4096;

/// How many leading bytes are sniffed for a null byte to classify a blob
/// as binary.
const BINARY_SNIFF_WINDOW: usize = 8000;

/// One chunk of a blob: a span over the original payload plus its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub offset: usize,
    pub len: usize,
    pub id: ChunkId,
}

/// Storage layout decision for one object payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    Inline,
    Chunked(Vec<ChunkSpan>),
}

/// Decide how an object payload is stored.
pub fn layout(kind: ObjectKind, data: &[u8]) -> Layout {
    if kind != ObjectKind::Blob || data.len() < INLINE_THRESHOLD {
        return Layout::Inline;
    }

    let cuts = if is_binary(data) {
        binary::cut_points(data)
    } else {
        text::cut_points(data)
    };
    if cuts.len() <= 1 {
        return Layout::Inline;
    }

    let spans = cuts
        .into_iter()
        .map(|(offset, len)| ChunkSpan {
            offset,
            len,
            id: ChunkId::for_bytes(&data[offset..offset + len]),
        })
        .collect();
    Layout::Chunked(spans)
}

fn is_binary(data: &[u8]) -> bool {
    let window = &data[..data.len().min(BINARY_SNIFF_WINDOW)];
    window.contains(&0)
}
