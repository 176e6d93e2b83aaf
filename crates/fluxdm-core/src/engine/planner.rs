//! Segment planner - splits a resource into byte ranges

use fluxdm_types::{Segment, UNKNOWN_END};

/// Compute the segments for a resource
///
/// With a known size and Range support the resource is split into
/// `clamp(total / chunk_size, 1, max_connections)` contiguous ranges whose
/// lengths differ by at most one byte. Otherwise a single segment covers the
/// whole stream, ending at [`UNKNOWN_END`] when the size is unknown.
/// An empty resource yields no segments.
pub fn plan_segments(
    total_size: Option<u64>,
    supports_ranges: bool,
    max_connections: u32,
    chunk_size: u64,
) -> Vec<Segment> {
    let total = match total_size {
        Some(0) => return Vec::new(),
        Some(total) => total,
        None => return vec![Segment::new(0, 0, UNKNOWN_END)],
    };

    if !supports_ranges {
        return vec![Segment::new(0, 0, total - 1)];
    }

    let count = segment_count(total, max_connections, chunk_size);
    let base = total / count;
    let remainder = total % count;

    let mut segments = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for i in 0..count {
        // The first `remainder` segments absorb one extra byte each
        let len = base + u64::from(i < remainder);
        segments.push(Segment::new(i as u32, start, start + len - 1));
        start += len;
    }

    segments
}

fn segment_count(total: u64, max_connections: u32, chunk_size: u64) -> u64 {
    let by_chunk = total / chunk_size.max(1);
    by_chunk.clamp(1, u64::from(max_connections.max(1))).min(total)
}
