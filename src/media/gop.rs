//! GOP (Group of Pictures) cache for late-joiner support
//!
//! When a new viewer attaches to a running stream, playback can only start
//! from a keyframe. The cache keeps the tags from the most recent keyframe
//! up to the newest tag received, so a late joiner gets a decodable replay
//! immediately instead of waiting out the rest of the current GOP.
//!
//! Timestamps in the cache are the ORIGINAL upstream timestamps; rebasing
//! happens per viewer at enqueue time, which keeps one cache reusable
//! across viewers attaching at different moments.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::flv::FramedTag;

#[derive(Debug, Clone)]
struct CachedTag {
    tag: FramedTag,
    cached_at: Instant,
}

/// Keyframe-aligned tag cache with a bounded time window.
///
/// Invariants:
/// - a new keyframe resets the cache to contain only that keyframe;
/// - non-keyframes are appended in arrival order;
/// - eviction drops tags older than the window but never the latest
///   keyframe or anything after it.
#[derive(Debug)]
pub struct GopCache {
    tags: VecDeque<CachedTag>,
    /// Index of the most recent keyframe, if any
    last_keyframe: Option<usize>,
    window: Duration,
    bytes: usize,
}

impl GopCache {
    /// Create a cache with the default 5 second window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(5))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            tags: VecDeque::with_capacity(256),
            last_keyframe: None,
            window,
            bytes: 0,
        }
    }

    /// Add a tag. A keyframe starts a fresh GOP.
    pub fn push(&mut self, tag: FramedTag) {
        if tag.is_keyframe {
            self.tags.clear();
            self.bytes = 0;
            self.last_keyframe = Some(0);
        }

        self.bytes += tag.len();
        self.tags.push_back(CachedTag {
            tag,
            cached_at: Instant::now(),
        });

        self.evict_expired();
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        let keep_from = self.last_keyframe.unwrap_or(usize::MAX);

        let mut removed = 0;
        while let Some(front) = self.tags.front() {
            if removed >= keep_from {
                break;
            }
            if now.duration_since(front.cached_at) <= self.window {
                break;
            }
            self.bytes -= front.tag.len();
            self.tags.pop_front();
            removed += 1;
        }

        if removed > 0 {
            self.last_keyframe = self.last_keyframe.map(|i| i - removed);
        }
    }

    /// Snapshot the replay block: tags from the most recent keyframe to the
    /// newest tag. Empty until a keyframe has been seen.
    pub fn replay(&self) -> Vec<FramedTag> {
        let Some(start) = self.last_keyframe else {
            return Vec::new();
        };
        self.tags.iter().skip(start).map(|c| c.tag.clone()).collect()
    }

    /// Whether a replay block is available.
    pub fn has_keyframe(&self) -> bool {
        self.last_keyframe.is_some()
    }

    /// Drop everything, e.g. after an upstream reconnect.
    pub fn clear(&mut self) {
        self.tags.clear();
        self.last_keyframe = None;
        self.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Total cached bytes.
    pub fn size(&self) -> usize {
        self.bytes
    }

    /// Timestamps of the oldest and newest cached tags.
    pub fn timestamp_range(&self) -> Option<(u32, u32)> {
        let first = self.tags.front()?.tag.timestamp;
        let last = self.tags.back()?.tag.timestamp;
        Some((first, last))
    }
}

impl Default for GopCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::flv::FlvTag;
    use bytes::Bytes;

    fn make_tag(timestamp: u32, is_keyframe: bool) -> FramedTag {
        let first = if is_keyframe { 0x14 } else { 0x24 };
        FramedTag::from_tag(&FlvTag::video(
            timestamp,
            Bytes::from(vec![first, 0x01, 0x02]),
        ))
    }

    fn make_audio(timestamp: u32) -> FramedTag {
        FramedTag::from_tag(&FlvTag::audio(timestamp, Bytes::from(vec![0xAF, 0x01])))
    }

    #[test]
    fn test_keyframe_resets_cache() {
        let mut cache = GopCache::new();

        cache.push(make_tag(0, true));
        cache.push(make_tag(40, false));
        cache.push(make_audio(46));
        assert_eq!(cache.len(), 3);

        cache.push(make_tag(2000, true));
        assert_eq!(cache.len(), 1);
        assert!(cache.replay()[0].is_keyframe);
    }

    #[test]
    fn test_replay_starts_at_keyframe() {
        let mut cache = GopCache::new();

        // Frames before any keyframe are cached but not replayable
        cache.push(make_tag(0, false));
        cache.push(make_audio(10));
        assert!(!cache.has_keyframe());
        assert!(cache.replay().is_empty());

        cache.push(make_tag(40, true));
        cache.push(make_tag(80, false));

        let replay = cache.replay();
        assert_eq!(replay.len(), 2);
        assert!(replay[0].is_keyframe);
        assert_eq!(replay[0].timestamp, 40);
        assert_eq!(replay[1].timestamp, 80);
    }

    #[test]
    fn test_replay_preserves_original_timestamps() {
        let mut cache = GopCache::new();
        cache.push(make_tag(10_000, true));
        cache.push(make_audio(10_023));
        cache.push(make_tag(10_040, false));

        let replay = cache.replay();
        assert_eq!(
            replay.iter().map(|t| t.timestamp).collect::<Vec<_>>(),
            vec![10_000, 10_023, 10_040]
        );
    }

    #[test]
    fn test_eviction_preserves_keyframe() {
        let mut cache = GopCache::with_window(Duration::from_millis(0));

        cache.push(make_tag(0, true));
        cache.push(make_tag(40, false));
        // With a zero window everything before the keyframe would expire,
        // but the keyframe and what follows it must survive.
        cache.push(make_audio(46));

        assert!(cache.has_keyframe());
        let replay = cache.replay();
        assert!(replay[0].is_keyframe);
        assert_eq!(replay.len(), 3);
    }

    #[test]
    fn test_eviction_drops_pre_keyframe_tags() {
        let mut cache = GopCache::with_window(Duration::from_millis(0));

        // No keyframe yet: expired tags can all go
        cache.push(make_audio(0));
        cache.push(make_audio(23));
        assert!(cache.len() <= 1); // the push that triggered eviction survives its own arrival

        cache.push(make_tag(46, true));
        assert_eq!(cache.replay().len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut cache = GopCache::new();
        cache.push(make_tag(0, true));
        cache.push(make_tag(40, false));

        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.has_keyframe());
        assert_eq!(cache.size(), 0);
        assert!(cache.replay().is_empty());
    }

    #[test]
    fn test_size_accounting() {
        let mut cache = GopCache::new();
        assert_eq!(cache.size(), 0);

        let tag = make_tag(0, true);
        let expected = tag.len();
        cache.push(tag);
        cache.push(make_tag(40, false));
        assert!(cache.size() >= expected);

        cache.push(make_tag(2000, true));
        assert_eq!(cache.size(), cache.replay().iter().map(|t| t.len()).sum::<usize>());
    }

    #[test]
    fn test_timestamp_range() {
        let mut cache = GopCache::new();
        assert!(cache.timestamp_range().is_none());

        cache.push(make_tag(100, true));
        cache.push(make_tag(140, false));
        assert_eq!(cache.timestamp_range(), Some((100, 140)));
    }
}
