//! Media handling for the FLV relay paths
//!
//! This module provides:
//! - FLV tag parsing, framing, and keyframe detection
//! - the streaming parser with replay-prologue capture
//! - the keyframe-aligned GOP cache and the raw-chunk camera cache
//! - per-viewer timestamp rebasing

pub mod chunk;
pub mod flv;
pub mod gop;
pub mod parser;
pub mod timestamp;

pub use chunk::ChunkCache;
pub use flv::{FlvTag, FlvTagType, FramedTag, VideoFrameType};
pub use gop::GopCache;
pub use parser::{FlvReader, Prologue};
pub use timestamp::{replay_base, TimestampRebase};
