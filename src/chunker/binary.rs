//! FastCDC chunking for binary blobs.

use fastcdc::v2020::FastCDC;

pub(super) const MIN_SIZE: u32 = 2048;
pub(super) const AVG_SIZE: u32 = 8192;
pub(super) const MAX_SIZE: u32 = 65536;

/// Cut a binary payload into contiguous `(offset, len)` spans.
pub(super) fn cut_points(data: &[u8]) -> Vec<(usize, usize)> {
    FastCDC::new(data, MIN_SIZE, AVG_SIZE, MAX_SIZE)
        .map(|chunk| (chunk.offset, chunk.length))
        .collect()
}
