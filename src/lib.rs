//! # relay-rs
//!
//! A live-streaming pull-and-republish relay: one server that ingests live
//! video from upstream sources, buffers a small sliding window in memory,
//! and fans the stream out to many concurrent viewers over HTTP.
//!
//! Three wire formats are handled:
//! - **HTTP-FLV pull** — the relay opens a long-lived GET against an
//!   upstream FLV URL, parses tags, and keeps a keyframe-aligned GOP cache
//!   so late joiners fast-start with a rebased near-zero timeline.
//! - **HTTP-FLV push** — an uploader (e.g. ffmpeg pointing a camera) POSTs
//!   raw FLV bytes; chunks are cached and fanned out as-is.
//! - **HLS** — the relay polls an upstream M3U8 playlist, mirrors new
//!   segments into a short ring, and serves a rewritten local playlist.
//!
//! In every path the relay hides the unreliable upstream from viewers and
//! decouples slow viewers from ingest: each viewer owns a bounded queue,
//! enqueue is non-blocking, and a viewer that cannot keep up loses frames
//! without stalling its peers.
//!
//! ## Quick start
//!
//! ```no_run
//! use relay_rs::server::{RelayConfig, RelayServer};
//!
//! # async fn example() -> relay_rs::error::Result<()> {
//! let server = RelayServer::new(RelayConfig::default());
//! server.add_flv_stream("room1", "http://upstream.example/live/room1.flv");
//! server.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Viewers then attach at `/live/flv/room1/<client-id>`.

pub mod error;
pub mod hls;
pub mod media;
pub mod relay;
pub mod server;

pub use error::{RelayError, Result};
pub use relay::{Broadcaster, HlsBroker, PulledFlvBroker, PushedFlvBroker};
pub use server::{RelayConfig, RelayServer};
