//! HLS mirroring support
//!
//! This module provides:
//! - M3U8 master/media playlist parsing and local playlist synthesis
//! - the fixed-capacity segment ring backing the replayable window

pub mod playlist;
pub mod ring;

pub use playlist::{MediaEntry, MediaPlaylist, Variant};
pub use ring::{Segment, SegmentRing};
