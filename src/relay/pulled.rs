//! Pulled-FLV broker
//!
//! Maintains one outbound connection to an upstream HTTP-FLV URL, parses
//! tags off it, keeps the keyframe-aligned GOP cache current, and fans tags
//! out to attached viewers. Upstream disruptions are absorbed here:
//! viewers stay connected across reconnects and simply see a fresh
//! near-zero timeline once the stream resumes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::header;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::io::StreamReader;

use crate::error::{RelayError, Result};
use crate::media::flv::FramedTag;
use crate::media::gop::GopCache;
use crate::media::parser::FlvReader;
use crate::media::timestamp::{replay_base, TimestampRebase};

use super::client::{Viewer, ViewerStream};

/// Tunables for the pulled-FLV ingest path.
#[derive(Debug, Clone)]
pub struct PulledFlvConfig {
    /// Per-viewer queue capacity (entries)
    pub client_queue_capacity: usize,
    /// GOP cache eviction window
    pub gop_window: Duration,
    /// Deadline for the initial-tag capture after connecting
    pub header_deadline: Duration,
    /// First reconnect delay; doubles up to `backoff_cap`
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Consecutive failed reconnects tolerated after a successful handshake
    /// before the broker terminates itself
    pub retry_budget: u32,
}

impl Default for PulledFlvConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: 1024,
            gop_window: Duration::from_secs(5),
            header_deadline: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            retry_budget: 10,
        }
    }
}

impl PulledFlvConfig {
    pub fn client_queue_capacity(mut self, capacity: usize) -> Self {
        self.client_queue_capacity = capacity;
        self
    }

    pub fn gop_window(mut self, window: Duration) -> Self {
        self.gop_window = window;
        self
    }

    pub fn header_deadline(mut self, deadline: Duration) -> Self {
        self.header_deadline = deadline;
        self
    }

    pub fn backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }
}

/// Stats snapshot for one pulled-FLV broker.
#[derive(Debug, Clone, Serialize)]
pub struct PulledBrokerStats {
    pub stream: String,
    pub upstream_url: String,
    pub viewers: usize,
    pub ready: bool,
    pub tags_relayed: u64,
    pub upstream_sessions: u64,
    pub gop_tags: usize,
    pub gop_bytes: usize,
    pub frames_dropped: u64,
}

/// One relay for one upstream FLV URL.
pub struct PulledFlvBroker {
    key: String,
    upstream_url: Mutex<String>,
    http: reqwest::Client,
    config: PulledFlvConfig,

    /// Captured replay prologue for the current upstream session
    prologue: RwLock<Option<Bytes>>,
    gop: Mutex<GopCache>,

    clients: Mutex<HashMap<String, Arc<Viewer>>>,
    /// Viewer streams report their id here on drop
    client_closed: mpsc::UnboundedSender<String>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,

    tags_relayed: AtomicU64,
    upstream_sessions: AtomicU64,
}

impl PulledFlvBroker {
    /// Construct the broker and start its ingest and status tasks.
    ///
    /// `on_terminate` runs once when ingest definitively ends (retry budget
    /// exhausted or a fatal error); the composition root uses it to drop
    /// the registry entry.
    pub fn spawn(
        key: impl Into<String>,
        upstream_url: impl Into<String>,
        http: reqwest::Client,
        config: PulledFlvConfig,
        on_terminate: Option<Box<dyn FnOnce() + Send>>,
    ) -> Arc<Self> {
        let (client_closed_tx, client_closed_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(4);

        let broker = Arc::new(Self {
            key: key.into(),
            upstream_url: Mutex::new(upstream_url.into()),
            http,
            gop: Mutex::new(GopCache::with_window(config.gop_window)),
            config,
            prologue: RwLock::new(None),
            clients: Mutex::new(HashMap::new()),
            client_closed: client_closed_tx,
            shutdown: shutdown_tx,
            closed: AtomicBool::new(false),
            tags_relayed: AtomicU64::new(0),
            upstream_sessions: AtomicU64::new(0),
        });

        tokio::spawn(Arc::clone(&broker).status_loop(client_closed_rx));
        tokio::spawn(Arc::clone(&broker).ingest_loop(on_terminate));

        broker
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Whether a new viewer can fast-start right now.
    pub fn ready(&self) -> bool {
        !self.is_closed()
            && self.prologue.read().unwrap().is_some()
            && self.gop.lock().unwrap().has_keyframe()
    }

    /// Switch the upstream source; takes effect on the next (re)connect.
    pub fn update_source_url(&self, url: impl Into<String>) {
        let url = url.into();
        tracing::info!(stream = %self.key, url = %url, "upstream source updated");
        *self.upstream_url.lock().unwrap() = url;
    }

    /// Attach a viewer: prologue first, then the keyframe-aligned replay
    /// rebased to a near-zero timeline, then live fan-out.
    pub fn attach(&self, client_id: &str) -> Result<ViewerStream> {
        if self.is_closed() {
            return Err(RelayError::NotFound(format!("stream '{}'", self.key)));
        }

        let prologue = self
            .prologue
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| RelayError::UpstreamUnavailable("prologue not captured yet".into()))?;

        let (viewer, rx) = Viewer::new(client_id, self.config.client_queue_capacity);
        viewer.send_initial(prologue)?;

        let replay = self.gop.lock().unwrap().replay();
        let mut rebase = match replay_base(&replay) {
            Some(base) => TimestampRebase::with_base(base),
            None => TimestampRebase::new(),
        };
        for tag in &replay {
            viewer.send_initial(rebase.apply(tag))?;
        }
        viewer.set_rebase(rebase);

        tracing::info!(
            stream = %self.key,
            client = %client_id,
            replay_tags = replay.len(),
            "viewer attached"
        );

        let prev = self
            .clients
            .lock()
            .unwrap()
            .insert(client_id.to_string(), Arc::new(viewer));
        if prev.is_some() {
            tracing::debug!(stream = %self.key, client = %client_id, "replaced viewer session");
        }

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

    /// Stop ingest and release all viewers. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(stream = %self.key, "broker closing");
        let _ = self.shutdown.send(());
        // Dropping the queue senders wakes and ends every viewer stream
        self.clients.lock().unwrap().clear();
    }

    pub fn stats(&self) -> PulledBrokerStats {
        let gop = self.gop.lock().unwrap();
        let clients = self.clients.lock().unwrap();
        PulledBrokerStats {
            stream: self.key.clone(),
            upstream_url: self.upstream_url.lock().unwrap().clone(),
            viewers: clients.len(),
            ready: !self.is_closed()
                && self.prologue.read().unwrap().is_some()
                && gop.has_keyframe(),
            tags_relayed: self.tags_relayed.load(Ordering::Relaxed),
            upstream_sessions: self.upstream_sessions.load(Ordering::Relaxed),
            gop_tags: gop.len(),
            gop_bytes: gop.size(),
            frames_dropped: clients.values().map(|v| v.dropped()).sum(),
        }
    }

    fn snapshot_viewers(&self) -> Vec<Arc<Viewer>> {
        self.clients.lock().unwrap().values().cloned().collect()
    }

    /// Cache a tag and fan it out, rebasing per viewer. Never blocks.
    fn relay_tag(&self, tag: FramedTag) {
        self.gop.lock().unwrap().push(tag.clone());
        self.tags_relayed.fetch_add(1, Ordering::Relaxed);

        for viewer in self.snapshot_viewers() {
            viewer.enqueue_rebased(&tag);
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

    async fn ingest_loop(self: Arc<Self>, on_terminate: Option<Box<dyn FnOnce() + Send>>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = self.config.backoff_base;
        let mut handshaken = false;
        let mut retries: u32 = 0;

        loop {
            if self.is_closed() {
                break;
            }

            let mut session_started = false;
            match self.connect_and_relay(&mut shutdown, &mut session_started).await {
                Ok(()) => break, // shutdown requested
                Err(err) => {
                    if session_started {
                        handshaken = true;
                        backoff = self.config.backoff_base;
                        retries = 0;
                    }

                    if !err.is_retryable() {
                        tracing::error!(stream = %self.key, error = %err, "ingest failed, giving up");
                        break;
                    }
                    if handshaken {
                        retries += 1;
                        if retries > self.config.retry_budget {
                            tracing::error!(
                                stream = %self.key,
                                retries,
                                "retry budget exhausted, stopping ingest"
                            );
                            break;
                        }
                    }

                    tracing::warn!(
                        stream = %self.key,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "upstream error, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.backoff_cap);
                }
            }
        }

        self.close();
        if let Some(terminate) = on_terminate {
            terminate();
        }
    }

    /// One upstream session: handshake, prologue capture, tag loop.
    /// Returns Ok only when shutdown was requested.
    async fn connect_and_relay(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
        session_started: &mut bool,
    ) -> Result<()> {
        let url = self.upstream_url.lock().unwrap().clone();
        tracing::info!(stream = %self.key, url = %url, "dialing upstream");

        let response = self
            .http
            .get(&url)
            .header(header::CONNECTION, "keep-alive")
            .header(header::ACCEPT, "*/*")
            .header(header::ACCEPT_ENCODING, "identity")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::UpstreamUnavailable(format!(
                "upstream answered {status}"
            )));
        }

        let body = response
            .bytes_stream()
            .map_err(std::io::Error::other);
        let mut reader = FlvReader::new(StreamReader::new(body));

        let prologue = reader.read_prologue(self.config.header_deadline).await?;

        // A new upstream session starts a new timeline: replay state from
        // the previous one must not leak into it.
        self.gop.lock().unwrap().clear();
        for viewer in self.snapshot_viewers() {
            viewer.reset_timeline();
        }
        *self.prologue.write().unwrap() = Some(prologue.bytes.clone());

        *session_started = true;
        self.upstream_sessions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            stream = %self.key,
            prologue_bytes = prologue.bytes.len(),
            "upstream handshake complete"
        );

        if let Some(first) = prologue.first_media {
            self.relay_tag(FramedTag::from_tag(&first));
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                tag = reader.next_tag() => {
                    let tag = tag?;
                    self.relay_tag(FramedTag::from_tag(&tag));
                }
            }
        }
    }
}
