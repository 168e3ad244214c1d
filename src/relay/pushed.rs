//! Pushed-FLV (camera) broker
//!
//! Accepts raw FLV bytes from an uploader's POST body and fans the chunks
//! out to attached viewers. There is no header-parse gate on this path:
//! chunks are cached and broadcast as-is, and fast start is best-effort
//! (the chunk ring resets on a keyframe guess, so a late joiner usually
//! lands near a decodable point but may wait for the upstream's next
//! keyframe).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;
use crate::media::chunk::ChunkCache;

use super::client::{Viewer, ViewerStream};

/// Tunables for the camera ingest path.
#[derive(Debug, Clone)]
pub struct PushedFlvConfig {
    /// Per-viewer queue capacity (entries)
    pub client_queue_capacity: usize,
    /// Chunk ring bounds
    pub cache_max_chunks: usize,
    pub cache_max_bytes: usize,
    pub cache_max_age: Duration,
    /// How long the broker stays available after the uploader's EOF, so
    /// viewers drain to a graceful end-of-stream instead of a reset
    pub ingest_grace: Duration,
}

impl Default for PushedFlvConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: 1024,
            cache_max_chunks: 150,
            cache_max_bytes: 4 * 1024 * 1024,
            cache_max_age: Duration::from_secs(3),
            ingest_grace: Duration::from_secs(10),
        }
    }
}

impl PushedFlvConfig {
    pub fn client_queue_capacity(mut self, capacity: usize) -> Self {
        self.client_queue_capacity = capacity;
        self
    }

    pub fn cache_bounds(mut self, max_chunks: usize, max_bytes: usize, max_age: Duration) -> Self {
        self.cache_max_chunks = max_chunks;
        self.cache_max_bytes = max_bytes;
        self.cache_max_age = max_age;
        self
    }

    pub fn ingest_grace(mut self, grace: Duration) -> Self {
        self.ingest_grace = grace;
        self
    }
}

/// Stats snapshot for one pushed-FLV broker.
#[derive(Debug, Clone, Serialize)]
pub struct PushedBrokerStats {
    pub stream: String,
    pub viewers: usize,
    pub ingest_ended: bool,
    pub bytes_ingested: u64,
    pub chunks_relayed: u64,
    pub cached_chunks: usize,
    pub cached_bytes: usize,
    pub frames_dropped: u64,
}

/// One relay for one camera upload.
pub struct PushedFlvBroker {
    key: String,
    config: PushedFlvConfig,

    cache: Mutex<ChunkCache>,
    clients: Mutex<HashMap<String, Arc<Viewer>>>,
    client_closed: mpsc::UnboundedSender<String>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
    ended: AtomicBool,

    bytes_ingested: AtomicU64,
    chunks_relayed: AtomicU64,
}

impl PushedFlvBroker {
    /// Construct the broker and start its status task. Ingest is driven by
    /// the HTTP handler through [`PushedFlvBroker::ingest`].
    pub fn spawn(key: impl Into<String>, config: PushedFlvConfig) -> Arc<Self> {
        let (client_closed_tx, client_closed_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(4);

        let broker = Arc::new(Self {
            key: key.into(),
            cache: Mutex::new(ChunkCache::new(
                config.cache_max_chunks,
                config.cache_max_bytes,
                config.cache_max_age,
            )),
            config,
            clients: Mutex::new(HashMap::new()),
            client_closed: client_closed_tx,
            shutdown: shutdown_tx,
            closed: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            bytes_ingested: AtomicU64::new(0),
            chunks_relayed: AtomicU64::new(0),
        });

        tokio::spawn(Arc::clone(&broker).status_loop(client_closed_rx));

        broker
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Whether the uploader has finished; the broker lingers for the
    /// configured grace period afterwards.
    pub fn ingest_ended(&self) -> bool {
        self.ended.load(Ordering::Relaxed)
    }

    pub fn ingest_grace(&self) -> Duration {
        self.config.ingest_grace
    }

    /// Consume the upload body, caching and broadcasting each chunk.
    ///
    /// Returns Ok on the uploader's clean EOF. A body read error also ends
    /// ingest but is reported so the HTTP layer can answer accordingly.
    pub async fn ingest<S, E>(&self, mut body: S) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        tracing::info!(stream = %self.key, "camera ingest started");

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                chunk = body.next() => match chunk {
                    Some(Ok(chunk)) => {
                        if chunk.is_empty() {
                            continue;
                        }
                        self.bytes_ingested.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                        self.relay_chunk(chunk);
                    }
                    Some(Err(err)) => {
                        tracing::warn!(stream = %self.key, error = %err, "camera body read error");
                        break;
                    }
                    None => break,
                },
            }
        }

        self.ended.store(true, Ordering::Relaxed);
        tracing::info!(
            stream = %self.key,
            bytes = self.bytes_ingested.load(Ordering::Relaxed),
            "camera ingest ended"
        );
        Ok(())
    }

    /// Attach a viewer: current cache contents first, then live chunks.
    pub fn attach(&self, client_id: &str) -> Result<ViewerStream> {
        if self.is_closed() {
            return Err(crate::error::RelayError::NotFound(format!(
                "stream '{}'",
                self.key
            )));
        }

        let (viewer, rx) = Viewer::new(client_id, self.config.client_queue_capacity);
        for chunk in self.cache.lock().unwrap().snapshot() {
            viewer.send_initial(chunk)?;
        }

        tracing::info!(stream = %self.key, client = %client_id, "viewer attached");

        self.clients
            .lock()
            .unwrap()
            .insert(client_id.to_string(), Arc::new(viewer));

        Ok(ViewerStream::new(
            client_id,
            rx,
            self.shutdown.subscribe(),
            self.client_closed.clone(),
        ))
    }

    /// Detach a viewer. Idempotent.
    pub fn remove_client(&self, client_id: &str) {
        if self.clients.lock().unwrap().remove(client_id).is_some() {
            tracing::info!(stream = %self.key, client = %client_id, "viewer removed");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Stop the broker and release all viewers. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(stream = %self.key, "broker closing");
        let _ = self.shutdown.send(());
        self.clients.lock().unwrap().clear();
    }

    pub fn stats(&self) -> PushedBrokerStats {
        let cache = self.cache.lock().unwrap();
        let clients = self.clients.lock().unwrap();
        PushedBrokerStats {
            stream: self.key.clone(),
            viewers: clients.len(),
            ingest_ended: self.ingest_ended(),
            bytes_ingested: self.bytes_ingested.load(Ordering::Relaxed),
            chunks_relayed: self.chunks_relayed.load(Ordering::Relaxed),
            cached_chunks: cache.len(),
            cached_bytes: cache.size(),
            frames_dropped: clients.values().map(|v| v.dropped()).sum(),
        }
    }

    fn relay_chunk(&self, chunk: Bytes) {
        self.cache.lock().unwrap().push(chunk.clone());
        self.chunks_relayed.fetch_add(1, Ordering::Relaxed);

        let viewers: Vec<Arc<Viewer>> = self.clients.lock().unwrap().values().cloned().collect();
        for viewer in viewers {
            viewer.enqueue(chunk.clone());
        }
    }

    async fn status_loop(self: Arc<Self>, mut client_closed: mpsc::UnboundedReceiver<String>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                id = client_closed.recv() => match id {
                    Some(id) => self.remove_client(&id),
                    None => break,
                },
            }
        }
    }
}
