//! Viewer sessions and their response streams
//!
//! One [`Viewer`] exists per connected HTTP viewer. It owns the enqueue
//! side of a bounded byte queue; the dequeue side backs the HTTP response
//! body as a [`ViewerStream`]. The broker never blocks on a viewer: a full
//! queue drops the frame for that viewer only.
//!
//! Lifecycle is channel-based to keep broker ↔ viewer ownership acyclic:
//! the viewer stream sends its id into the broker's client-closed channel
//! on drop, and observes broker shutdown through a receive-only broadcast.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{broadcast, mpsc};

use crate::error::{RelayError, Result};
use crate::media::flv::FramedTag;
use crate::media::timestamp::TimestampRebase;

/// Broker-side handle for one attached viewer.
#[derive(Debug)]
pub struct Viewer {
    id: String,
    queue: mpsc::Sender<Bytes>,
    /// Per-viewer rebase state. Single-writer: only the broker's fan-out
    /// path locks it, one tag at a time.
    rebase: Mutex<TimestampRebase>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Viewer {
    /// Create a viewer with a bounded queue, returning the dequeue side.
    pub fn new(id: impl Into<String>, queue_capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        (
            Self {
                id: id.into(),
                queue: tx,
                rebase: Mutex::new(TimestampRebase::new()),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Enqueue the attach-time prologue/replay block. Unlike live fan-out
    /// this must not drop, so a full queue fails the attach.
    pub fn send_initial(&self, bytes: Bytes) -> Result<()> {
        self.queue
            .try_send(bytes)
            .map_err(|_| RelayError::WriteFailed(self.id.clone()))?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Non-blocking enqueue of a live frame; drops when the queue is full.
    pub fn enqueue(&self, bytes: Bytes) {
        match self.queue.try_send(bytes) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    tracing::debug!(client = %self.id, dropped, "slow viewer, dropping frame");
                }
            }
        }
    }

    /// Rebase a tag onto this viewer's timeline and enqueue it.
    pub fn enqueue_rebased(&self, tag: &FramedTag) {
        let bytes = self.rebase.lock().unwrap().apply(tag);
        self.enqueue(bytes);
    }

    /// Install rebase state carried over from the attach-time replay.
    pub fn set_rebase(&self, rebase: TimestampRebase) {
        *self.rebase.lock().unwrap() = rebase;
    }

    /// Forget the timeline, e.g. after the broker reconnected upstream.
    pub fn reset_timeline(&self) {
        self.rebase.lock().unwrap().reset();
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The dequeue side of a viewer queue, shaped as a byte stream for
/// `Body::from_stream`.
///
/// The stream ends when any of the three cancellation sources fires: the
/// queue is closed (viewer removed or broker shut down), the broker-close
/// broadcast fires, or the response body is dropped (viewer went away). On
/// drop it reports the viewer id so the broker can clean up; removal on the
/// broker side is idempotent.
pub struct ViewerStream {
    id: String,
    rx: mpsc::Receiver<Bytes>,
    shutdown: broadcast::Receiver<()>,
    departed: mpsc::UnboundedSender<String>,
}

impl ViewerStream {
    pub fn new(
        id: impl Into<String>,
        rx: mpsc::Receiver<Bytes>,
        shutdown: broadcast::Receiver<()>,
        departed: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            id: id.into(),
            rx,
            shutdown,
            departed,
        }
    }
}

impl Stream for ViewerStream {
    type Item = std::result::Result<Bytes, std::convert::Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Drain queued bytes first so a closing broker's tail still reaches
        // the viewer; brokers drop the queue senders on close, which wakes
        // a parked stream through `rx`.
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => return Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }

        match self.shutdown.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Closed) => Poll::Ready(None),
            Err(_) => Poll::Pending,
        }
    }
}

impl Drop for ViewerStream {
    fn drop(&mut self) {
        let _ = self.departed.send(self.id.clone());
    }
}
