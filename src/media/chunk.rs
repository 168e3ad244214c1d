//! Raw-chunk cache for pushed-FLV (camera) ingest
//!
//! The camera path broadcasts the POST body as-is, without tag framing, so
//! the fast-start cache is a ring of recent byte chunks rather than a GOP.
//! Semantics are deliberately weaker than [`super::gop::GopCache`]: a late
//! joiner may see a partial picture until the upstream's next keyframe.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

/// Ring of recently-received byte chunks, bounded by chunk count, total
/// bytes, and age.
#[derive(Debug)]
pub struct ChunkCache {
    chunks: VecDeque<(Bytes, Instant)>,
    total_bytes: usize,
    max_chunks: usize,
    max_bytes: usize,
    max_age: Duration,
}

impl ChunkCache {
    pub fn new(max_chunks: usize, max_bytes: usize, max_age: Duration) -> Self {
        Self {
            chunks: VecDeque::with_capacity(max_chunks.min(256)),
            total_bytes: 0,
            max_chunks,
            max_bytes,
            max_age,
        }
    }

    /// Add a chunk, evicting from the front to stay within bounds.
    ///
    /// A chunk whose first byte carries the keyframe nibble resets the ring,
    /// so replay for new viewers tends to start near a keyframe. This is a
    /// guess, not framing: chunk boundaries are arbitrary.
    pub fn push(&mut self, chunk: Bytes) {
        if looks_like_keyframe(&chunk) {
            self.chunks.clear();
            self.total_bytes = 0;
        }

        self.total_bytes += chunk.len();
        self.chunks.push_back((chunk, Instant::now()));
        self.evict();
    }

    fn evict(&mut self) {
        let now = Instant::now();
        while self.chunks.len() > 1 {
            let Some((front, at)) = self.chunks.front() else {
                break;
            };
            let over_count = self.chunks.len() > self.max_chunks;
            let over_bytes = self.total_bytes > self.max_bytes;
            let expired = now.duration_since(*at) > self.max_age;
            if !(over_count || over_bytes || expired) {
                break;
            }
            self.total_bytes -= front.len();
            self.chunks.pop_front();
        }
    }

    /// Ordered copy of the cached chunks for a new viewer.
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.chunks.iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn size(&self) -> usize {
        self.total_bytes
    }
}

/// Keyframe heuristic over a raw chunk: FLV video FrameType lives in the
/// high nibble of the first payload byte, and chunks that begin at a tag
/// payload start with it.
fn looks_like_keyframe(chunk: &[u8]) -> bool {
    chunk.first().map(|b| b >> 4 == 1).unwrap_or(false)
}
