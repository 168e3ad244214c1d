//! HLS broker
//!
//! Mirrors a remote HLS stream locally with a short replayable window: the
//! poll loop re-fetches the upstream media playlist, downloads segments it
//! has not seen, and keeps the most recent few in a ring. Viewers get a
//! rewritten playlist whose segment URLs point back at the relay.
//!
//! The served playlist is stream-scoped; the client id in viewer URLs is
//! informational only.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use url::Url;

use crate::error::{RelayError, Result};
use crate::hls::playlist::{is_master, parse_master, parse_media, render_local, resolve, select_variant};
use crate::hls::ring::{Segment, SegmentRing};

/// Tunables for the HLS mirror path.
#[derive(Debug, Clone)]
pub struct HlsConfig {
    /// Media playlist poll cadence
    pub poll_interval: Duration,
    /// Segment ring capacity
    pub ring_capacity: usize,
    /// Case-insensitive substring used to pick a master-playlist variant;
    /// highest bandwidth wins when unset or unmatched
    pub variant_preference: Option<String>,
    /// Per-request timeout for playlist polls and segment downloads
    pub request_timeout: Duration,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(800),
            ring_capacity: 3,
            variant_preference: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl HlsConfig {
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    pub fn variant_preference(mut self, preference: impl Into<String>) -> Self {
        self.variant_preference = Some(preference.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Stats snapshot for one HLS broker.
#[derive(Debug, Clone, Serialize)]
pub struct HlsBrokerStats {
    pub stream: String,
    pub upstream_url: String,
    pub media_url: Option<String>,
    pub segments: usize,
    pub seq_start: u64,
    pub last_seq: Option<u64>,
    pub target_duration: f64,
    pub discontinuity: bool,
    pub polls: u64,
    pub downloads: u64,
}

struct HlsState {
    ring: SegmentRing,
    target_duration: f64,
    /// Sticky once the upstream advertises any discontinuity
    discontinuity: bool,
    updated_at: Instant,
}

/// Bounded memory of upstream URIs already downloaded.
struct SeenUris {
    set: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl SeenUris {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap: cap.max(8),
        }
    }

    fn contains(&self, uri: &str) -> bool {
        self.set.contains(uri)
    }

    fn insert(&mut self, uri: String) {
        if self.set.insert(uri.clone()) {
            self.order.push_back(uri);
            while self.order.len() > self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }
}

/// One mirror for one upstream HLS URL.
pub struct HlsBroker {
    key: String,
    http: reqwest::Client,
    config: HlsConfig,

    upstream_url: Url,
    /// Resolved media playlist URL, once bootstrap succeeded
    media_url: RwLock<Option<Url>>,
    state: RwLock<HlsState>,
    seen: Mutex<SeenUris>,
    /// Fallback local sequence counter for playlists without MEDIA-SEQUENCE
    next_seq: AtomicU64,

    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,

    polls: AtomicU64,
    downloads: AtomicU64,
}

impl HlsBroker {
    /// Construct the broker and start its poll task.
    pub fn spawn(
        key: impl Into<String>,
        upstream_url: Url,
        http: reqwest::Client,
        config: HlsConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(4);

        let broker = Arc::new(Self {
            key: key.into(),
            http,
            upstream_url,
            media_url: RwLock::new(None),
            state: RwLock::new(HlsState {
                ring: SegmentRing::new(config.ring_capacity),
                target_duration: 6.0,
                discontinuity: false,
                updated_at: Instant::now(),
            }),
            seen: Mutex::new(SeenUris::new(config.ring_capacity * 8)),
            config,
            next_seq: AtomicU64::new(0),
            shutdown: shutdown_tx,
            closed: AtomicBool::new(false),
            polls: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
        });

        tokio::spawn(Arc::clone(&broker).poll_loop());

        broker
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Stop polling. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(stream = %self.key, "broker closing");
        let _ = self.shutdown.send(());
    }

    /// Synthesize the local media playlist for the current window.
    pub fn playlist(&self, base_path: &str) -> String {
        let state = self.state.read().unwrap();
        render_local(
            &state.ring.snapshot(),
            state.ring.seq_start(),
            state.target_duration,
            state.discontinuity,
            base_path,
        )
    }

    /// Look up a cached segment by local file name.
    pub fn segment(&self, local_name: &str) -> Result<Segment> {
        self.state
            .read()
            .unwrap()
            .ring
            .find(local_name)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(format!("segment '{local_name}'")))
    }

    pub fn segment_count(&self) -> usize {
        self.state.read().unwrap().ring.len()
    }

    pub fn stats(&self) -> HlsBrokerStats {
        let state = self.state.read().unwrap();
        HlsBrokerStats {
            stream: self.key.clone(),
            upstream_url: self.upstream_url.to_string(),
            media_url: self
                .media_url
                .read()
                .unwrap()
                .as_ref()
                .map(|u| u.to_string()),
            segments: state.ring.len(),
            seq_start: state.ring.seq_start(),
            last_seq: state.ring.last_seq(),
            target_duration: state.target_duration,
            discontinuity: state.discontinuity,
            polls: self.polls.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            if let Err(err) = self.poll_once().await {
                tracing::warn!(stream = %self.key, error = %err, "hls poll failed");
            }
        }
    }

    /// One poll cycle: refresh the media playlist and download any unseen
    /// segments. Individual segment failures are skipped, never fatal.
    async fn poll_once(&self) -> Result<()> {
        let media_url = {
            let cached = self.media_url.read().unwrap().clone();
            match cached {
                Some(url) => url,
                None => self.bootstrap().await?,
            }
        };

        let text = self.fetch_text(media_url.clone()).await?;
        self.polls.fetch_add(1, Ordering::Relaxed);

        let playlist = parse_media(&text);
        if let Some(target) = playlist.target_duration {
            self.state.write().unwrap().target_duration = target;
        }

        for (offset, entry) in playlist.entries.iter().enumerate() {
            let absolute = resolve(&media_url, &entry.uri)?;
            if self.seen.lock().unwrap().contains(absolute.as_str()) {
                continue;
            }

            let seq = match playlist.media_sequence {
                Some(start) => start + offset as u64,
                None => self.next_seq.fetch_add(1, Ordering::Relaxed),
            };

            let data = match self.fetch_bytes(absolute.clone()).await {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!(
                        stream = %self.key,
                        uri = %absolute,
                        error = %err,
                        "segment download failed, skipping"
                    );
                    continue;
                }
            };
            self.downloads.fetch_add(1, Ordering::Relaxed);

            let segment = Segment {
                seq,
                local_name: Segment::local_name_for(seq, absolute.as_str()),
                uri: absolute.to_string(),
                data,
                duration: entry.duration,
                discontinuity: entry.discontinuity,
                fetched_at: Instant::now(),
            };

            tracing::debug!(
                stream = %self.key,
                seq,
                local = %segment.local_name,
                bytes = segment.data.len(),
                "segment mirrored"
            );

            {
                let mut state = self.state.write().unwrap();
                if entry.discontinuity {
                    state.discontinuity = true;
                }
                state.ring.push(segment);
                state.updated_at = Instant::now();
            }
            self.seen.lock().unwrap().insert(absolute.to_string());
            self.next_seq.fetch_max(seq + 1, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Resolve the upstream URL to a media playlist URL: master playlists
    /// go through variant selection, media playlists are used as-is.
    async fn bootstrap(&self) -> Result<Url> {
        let text = self.fetch_text(self.upstream_url.clone()).await?;

        let media = if is_master(&text) {
            let variants = parse_master(&text);
            let chosen = select_variant(&variants, self.config.variant_preference.as_deref())
                .ok_or_else(|| RelayError::Parse("master playlist has no variants".into()))?;
            tracing::info!(
                stream = %self.key,
                variant = %chosen.uri,
                bandwidth = chosen.bandwidth,
                "selected hls variant"
            );
            resolve(&self.upstream_url, &chosen.uri)?
        } else {
            self.upstream_url.clone()
        };

        *self.media_url.write().unwrap() = Some(media.clone());
        Ok(media)
    }

    async fn fetch_text(&self, url: Url) -> Result<String> {
        let response = self
            .http
            .get(url)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::UpstreamUnavailable(format!(
                "upstream answered {status}"
            )));
        }
        Ok(response.text().await?)
    }

    async fn fetch_bytes(&self, url: Url) -> Result<bytes::Bytes> {
        let response = self
            .http
            .get(url)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::UpstreamUnavailable(format!(
                "upstream answered {status}"
            )));
        }
        Ok(response.bytes().await?)
    }
}
