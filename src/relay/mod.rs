//! Stream relay engine
//!
//! One broker per stream key owns ingest, cache, and fan-out for that
//! stream; one [`Broadcaster`] per protocol maps keys to brokers; one
//! [`client::Viewer`] per connected viewer owns the bounded queue that
//! isolates it from its peers.
//!
//! # Architecture
//!
//! ```text
//!                 Broadcaster<PulledFlvBroker>          (one per protocol)
//!                ┌────────────────────────────┐
//!                │ "room1" → PulledFlvBroker  │
//!                │   prologue + GopCache      │
//!                │   clients: id → Viewer     │
//!                └─────────┬──────────────────┘
//!                          │ try_send per viewer (never blocks)
//!          ┌───────────────┼───────────────┐
//!          ▼               ▼               ▼
//!     [Viewer a]      [Viewer b]      [Viewer c]
//!     queue → ViewerStream → HTTP response body
//! ```

pub mod client;
pub mod hls;
pub mod pulled;
pub mod pushed;
pub mod registry;

pub use client::{Viewer, ViewerStream};
pub use hls::{HlsBroker, HlsBrokerStats, HlsConfig};
pub use pulled::{PulledBrokerStats, PulledFlvBroker, PulledFlvConfig};
pub use pushed::{PushedBrokerStats, PushedFlvBroker, PushedFlvConfig};
pub use registry::Broadcaster;
