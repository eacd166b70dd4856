//! Line-aware CDC for text blobs.
//!
//! The payload is walked line by line (newline kept with its line). A cut
//! is made after a line when at least three lines have accumulated and the
//! line's CRC32 has its low three bits clear, giving an expected chunk
//! length of a few hundred bytes of source text. A cut is forced once the
//! accumulated bytes reach the inline threshold.

/// Cut mask: a line ends a chunk when `crc32(line) & CUT_MASK == 0`.
const CUT_MASK: u32 = 0x7;

/// Minimum lines per chunk before a content cut is allowed.
const MIN_LINES: usize = 3;

/// Accumulated byte count that forces a cut.
const MAX_BYTES: usize = 4096;

/// Cut a text payload into contiguous `(offset, len)` spans.
pub(super) fn cut_points(data: &[u8]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut lines = 0;
    let mut pos = 0;

    while pos < data.len() {
        let end = match data[pos..].iter().position(|&b| b == b'\n') {
            Some(nl) => pos + nl + 1,
            None => data.len(),
        };
        let line = &data[pos..end];
        lines += 1;

        let cut_here = lines >= MIN_LINES && crc32fast::hash(line) & CUT_MASK == 0;
        if cut_here || end - start >= MAX_BYTES {
            spans.push((start, end - start));
            start = end;
            lines = 0;
        }
        pos = end;
    }

    if start < data.len() {
        spans.push((start, data.len() - start));
    }
    spans
}
