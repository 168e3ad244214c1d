//! Per-viewer timestamp rebasing
//!
//! A viewer that attaches mid-stream receives cached tags whose upstream
//! timestamps started at some arbitrary wall-clock offset. Rebasing rewrites
//! every outgoing tag so the viewer sees a locally-monotonic timeline that
//! begins near 0 and keeps audio and video in phase.
//!
//! Rebasing is purely per-viewer and applied at enqueue time; the caches
//! keep original timestamps.

use bytes::Bytes;

use super::flv::{patch_timestamp, FlvTagType, FramedTag};

/// Nominal AAC frame duration used when clamping audio jumps.
pub const AUDIO_FRAME_MS: u32 = 23;
/// Nominal 25 fps frame duration used when clamping video jumps.
pub const VIDEO_FRAME_MS: u32 = 40;
/// Forward jumps beyond this are treated as upstream glitches and clamped.
pub const MAX_FORWARD_JUMP_MS: u32 = 500;

/// Rebase state for one viewer of an FLV broker.
///
/// Single-writer: only the broker's fan-out path touches a given viewer's
/// state, one tag at a time.
#[derive(Debug, Clone, Default)]
pub struct TimestampRebase {
    /// Global base timestamp: min of the audio and video bases in the
    /// replay block, or the first live tag seen when there was no replay.
    base: Option<u32>,
    last_audio: Option<u32>,
    last_video: Option<u32>,
}

impl TimestampRebase {
    /// Fresh state with no base; the first media tag establishes it.
    pub fn new() -> Self {
        Self::default()
    }

    /// State anchored at a known base, as computed over a replay block.
    pub fn with_base(base: u32) -> Self {
        Self {
            base: Some(base),
            last_audio: None,
            last_video: None,
        }
    }

    /// Forget everything. Used when the upstream reconnects and the viewer
    /// timeline restarts near 0.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn base(&self) -> Option<u32> {
        self.base
    }

    /// Compute the outgoing timestamp for a tag.
    ///
    /// Guard rails, per media kind with its own frame duration:
    /// - backwards jump (`new < last`) clamps to `last + frame`;
    /// - forward jump over 500 ms clamps to `last + frame`;
    /// - original below the global base clamps the same way (or 0 when the
    ///   viewer has not emitted yet).
    ///
    /// Script tags always emit 0.
    pub fn rebase(&mut self, tag_type: FlvTagType, original: u32) -> u32 {
        let frame = match tag_type {
            FlvTagType::Audio => AUDIO_FRAME_MS,
            FlvTagType::Video => VIDEO_FRAME_MS,
            FlvTagType::Script => return 0,
        };

        let base = *self.base.get_or_insert(original);
        let last = match tag_type {
            FlvTagType::Audio => self.last_audio,
            FlvTagType::Video => self.last_video,
            FlvTagType::Script => unreachable!(),
        };

        let mut adjusted = if original >= base {
            original - base
        } else {
            // Upstream went below the base: fall back to steady increments
            match last {
                Some(last) => last + frame,
                None => 0,
            }
        };

        if let Some(last) = last {
            if adjusted < last || adjusted - last > MAX_FORWARD_JUMP_MS {
                adjusted = last + frame;
            }
        }

        match tag_type {
            FlvTagType::Audio => self.last_audio = Some(adjusted),
            FlvTagType::Video => self.last_video = Some(adjusted),
            FlvTagType::Script => unreachable!(),
        }

        adjusted
    }

    /// Rebase a framed tag: copy its bytes and patch the 4 timestamp bytes.
    pub fn apply(&mut self, tag: &FramedTag) -> Bytes {
        let adjusted = self.rebase(tag.tag_type, tag.timestamp);
        if adjusted == tag.timestamp {
            return tag.bytes.clone();
        }
        let mut buf = tag.bytes.to_vec();
        patch_timestamp(&mut buf, adjusted);
        Bytes::from(buf)
    }
}

/// Global base for a replay block: the minimum original timestamp across
/// its media tags. Sequence headers are part of the prologue timeline and
/// do not move the base.
pub fn replay_base(replay: &[FramedTag]) -> Option<u32> {
    replay
        .iter()
        .filter(|t| !t.is_sequence_header && t.tag_type != FlvTagType::Script)
        .map(|t| t.timestamp)
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::flv::FlvTag;

    fn audio(ts: u32) -> FramedTag {
        FramedTag::from_tag(&FlvTag::audio(ts, Bytes::from_static(&[0xAF, 0x01])))
    }

    fn video(ts: u32) -> FramedTag {
        FramedTag::from_tag(&FlvTag::video(ts, Bytes::from_static(&[0x27, 0x01])))
    }

    #[test]
    fn test_late_joiner_rebase() {
        // Cache keyframe at 10_000 ms, tail at 10_400 ms
        let replay = vec![video(10_000), audio(10_023), video(10_040), video(10_400)];
        let base = replay_base(&replay).unwrap();
        assert_eq!(base, 10_000);

        let mut rebase = TimestampRebase::with_base(base);
        let out: Vec<u32> = replay
            .iter()
            .map(|t| rebase.rebase(t.tag_type, t.timestamp))
            .collect();

        assert_eq!(out, vec![0, 23, 40, 400]);

        // Live tags continue with the upstream's original deltas
        assert_eq!(rebase.rebase(FlvTagType::Video, 10_440), 440);
        assert_eq!(rebase.rebase(FlvTagType::Audio, 10_046), 46);
    }

    #[test]
    fn test_backwards_jump_clamps() {
        let mut rebase = TimestampRebase::with_base(1000);
        assert_eq!(rebase.rebase(FlvTagType::Video, 1400), 400);
        // Upstream jumps back
        assert_eq!(rebase.rebase(FlvTagType::Video, 1100), 440);
        assert_eq!(rebase.rebase(FlvTagType::Audio, 1046), 46);
        assert_eq!(rebase.rebase(FlvTagType::Audio, 1000), 69);
    }

    #[test]
    fn test_forward_jump_clamps() {
        let mut rebase = TimestampRebase::with_base(0);
        assert_eq!(rebase.rebase(FlvTagType::Video, 40), 40);
        // 0 <= delta <= 500 passes through
        assert_eq!(rebase.rebase(FlvTagType::Video, 540), 540);
        // Over 500 ms clamps to last + 40
        assert_eq!(rebase.rebase(FlvTagType::Video, 2000), 580);
        // And recovers incrementally afterwards
        assert_eq!(rebase.rebase(FlvTagType::Video, 2040), 620);
    }

    #[test]
    fn test_below_base_clamps() {
        let mut rebase = TimestampRebase::with_base(5000);
        // Nothing emitted yet and original below base: emit 0
        assert_eq!(rebase.rebase(FlvTagType::Audio, 4000), 0);
        // Emitted once: steady increment
        assert_eq!(rebase.rebase(FlvTagType::Audio, 4010), 23);
    }

    #[test]
    fn test_script_always_zero() {
        let mut rebase = TimestampRebase::with_base(1000);
        assert_eq!(rebase.rebase(FlvTagType::Script, 99_999), 0);
        // Does not disturb media state
        assert_eq!(rebase.rebase(FlvTagType::Video, 1040), 40);
    }

    #[test]
    fn test_audio_video_independent_monotonic() {
        let mut rebase = TimestampRebase::with_base(0);
        let mut last_audio = 0;
        let mut last_video = 0;
        for i in 0..50u32 {
            let a = rebase.rebase(FlvTagType::Audio, i * 23);
            let v = rebase.rebase(FlvTagType::Video, i * 40);
            assert!(a >= last_audio);
            assert!(v >= last_video);
            last_audio = a;
            last_video = v;
        }
    }

    #[test]
    fn test_lazy_base_from_first_tag() {
        let mut rebase = TimestampRebase::new();
        // First media tag establishes the base: fresh near-0 timeline
        assert_eq!(rebase.rebase(FlvTagType::Video, 88_000), 0);
        assert_eq!(rebase.rebase(FlvTagType::Video, 88_040), 40);
    }

    #[test]
    fn test_reset_starts_fresh_timeline() {
        let mut rebase = TimestampRebase::with_base(0);
        assert_eq!(rebase.rebase(FlvTagType::Video, 9000), 0);
        assert_eq!(rebase.rebase(FlvTagType::Video, 9040), 40);

        // Upstream reconnected with a new timeline
        rebase.reset();
        assert_eq!(rebase.rebase(FlvTagType::Video, 123_456), 0);
        assert_eq!(rebase.rebase(FlvTagType::Video, 123_496), 40);
    }

    #[test]
    fn test_apply_patches_bytes() {
        let tag = video(10_040);
        let mut rebase = TimestampRebase::with_base(10_000);
        let out = rebase.apply(&tag);
        assert_eq!(crate::media::flv::read_timestamp(&out), Some(40));
        // Only the timestamp bytes differ
        assert_eq!(out.len(), tag.bytes.len());
        assert_eq!(&out[11..], &tag.bytes[11..]);
    }

    #[test]
    fn test_apply_zero_copy_when_unchanged() {
        let tag = video(40);
        let mut rebase = TimestampRebase::with_base(0);
        let out = rebase.apply(&tag);
        assert_eq!(crate::media::flv::read_timestamp(&out), Some(40));
    }

    #[test]
    fn test_replay_base_skips_prologue_tags() {
        let header = FramedTag::from_tag(&FlvTag::video(0, Bytes::from_static(&[0x17, 0x00])));
        let replay = vec![header, video(10_000), audio(10_023)];
        assert_eq!(replay_base(&replay), Some(10_000));
    }

    #[test]
    fn test_replay_base_empty() {
        assert_eq!(replay_base(&[]), None);
    }
}
