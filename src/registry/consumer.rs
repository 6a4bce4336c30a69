//! Per-viewer delivery pipeline
//!
//! A consumer is split in two halves, created together by [`channel`]:
//!
//! - [`Subscriber`] lives in the broadcaster's subscriber set. `enqueue` runs
//!   on the publisher's task under the broadcaster's read lock and never waits:
//!   it is an admission check plus a `try_send`.
//! - [`Consumer`] is owned by the viewer connection. `drain` writes the startup
//!   headers, then frames and writes queued units until the queue closes or
//!   the sink fails.
//!
//! Each consumer keeps its own framing state so every viewer sees a timeline
//! and a previous-tag-size chain that start at its own join point.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::{Error, Result};
use crate::media::encoder::{render_header, RenderError, TagPrefix, TAG_PREFIX_SIZE};
use crate::media::MediaUnit;
use crate::stats::ConsumerStats;

use super::broadcaster::{StreamHeaders, SubscriberId};
use super::config::{ConsumerConfig, MAX_UNITS_LIMIT};
use super::key::StreamKey;

/// Outcome of offering a unit to a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Unit was appended to the queue
    Queued,
    /// Queue is over its unit or byte limit; the unit was discarded
    Dropped,
    /// Consumer is closed or its viewer is gone
    Closed,
}

/// Occupancy and delivery counters shared by both halves
#[derive(Debug, Default)]
struct QueueState {
    queued_units: AtomicUsize,
    queued_bytes: AtomicUsize,
    delivered_units: AtomicU64,
    delivered_bytes: AtomicU64,
    dropped_units: AtomicU64,
    skipped_units: AtomicU64,
    overloaded: AtomicBool,
    closed: AtomicBool,
}

impl QueueState {
    fn reserve(&self, bytes: usize) {
        self.queued_units.fetch_add(1, Ordering::AcqRel);
        self.queued_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    fn release(&self, bytes: usize) {
        self.queued_units.fetch_sub(1, Ordering::AcqRel);
        self.queued_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            queued_units: self.queued_units.load(Ordering::Acquire),
            queued_bytes: self.queued_bytes.load(Ordering::Acquire),
            delivered_units: self.delivered_units.load(Ordering::Relaxed),
            delivered_bytes: self.delivered_bytes.load(Ordering::Relaxed),
            dropped_units: self.dropped_units.load(Ordering::Relaxed),
            skipped_units: self.skipped_units.load(Ordering::Relaxed),
        }
    }
}

/// Create the two halves of a consumer
pub(crate) fn channel(
    id: SubscriberId,
    key: StreamKey,
    headers: Arc<StreamHeaders>,
    config: ConsumerConfig,
) -> (Subscriber, Consumer) {
    let config = ConsumerConfig {
        max_units: config.max_units.clamp(1, MAX_UNITS_LIMIT),
        ..config
    };
    let (tx, rx) = mpsc::channel(config.max_units);
    let state = Arc::new(QueueState::default());

    let subscriber = Subscriber {
        id,
        key: key.clone(),
        tx,
        state: Arc::clone(&state),
        config,
    };
    let consumer = Consumer {
        id,
        key,
        headers,
        rx,
        state,
        framer: Framer::default(),
        started: false,
    };
    (subscriber, consumer)
}

/// Broadcaster-side half of a consumer
pub(crate) struct Subscriber {
    id: SubscriberId,
    key: StreamKey,
    tx: mpsc::Sender<MediaUnit>,
    state: Arc<QueueState>,
    config: ConsumerConfig,
}

impl Subscriber {
    pub(crate) fn id(&self) -> SubscriberId {
        self.id
    }

    /// Offer a unit to this consumer without waiting
    ///
    /// The newest unit is the one dropped when the queue is over either limit;
    /// queued units are never evicted.
    pub(crate) fn enqueue(&self, unit: &MediaUnit) -> Admission {
        let state = &self.state;
        if state.closed.load(Ordering::Acquire) {
            return Admission::Closed;
        }

        let queued_units = state.queued_units.load(Ordering::Acquire);
        let queued_bytes = state.queued_bytes.load(Ordering::Acquire);
        if queued_units >= self.config.max_units || queued_bytes > self.config.max_bytes {
            self.record_drop(queued_units, queued_bytes);
            return Admission::Dropped;
        }

        let bytes = unit.payload_len();
        state.reserve(bytes);
        match self.tx.try_send(unit.clone()) {
            Ok(()) => {
                if state.overloaded.swap(false, Ordering::Relaxed) {
                    tracing::info!(
                        stream = %self.key,
                        subscriber = %self.id,
                        "Consumer queue recovered"
                    );
                }
                Admission::Queued
            }
            Err(TrySendError::Full(_)) => {
                state.release(bytes);
                self.record_drop(queued_units, queued_bytes);
                Admission::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                state.release(bytes);
                if !state.closed.swap(true, Ordering::AcqRel) {
                    tracing::debug!(
                        stream = %self.key,
                        subscriber = %self.id,
                        "Viewer dropped without unsubscribing"
                    );
                }
                Admission::Closed
            }
        }
    }

    fn record_drop(&self, queued_units: usize, queued_bytes: usize) {
        self.state.dropped_units.fetch_add(1, Ordering::Relaxed);
        if !self.state.overloaded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                stream = %self.key,
                subscriber = %self.id,
                queued_units = queued_units,
                queued_bytes = queued_bytes,
                "Consumer queue full, dropping units"
            );
        } else {
            tracing::trace!(subscriber = %self.id, "Drop unit");
        }
    }

    /// Refuse further units
    ///
    /// The queue itself closes when this half is dropped, which lets the
    /// viewer drain what is already queued and then finish.
    pub(crate) fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
    }
}

/// Per-viewer framing state
///
/// The first delivered unit is rendered against a zero baseline and then
/// becomes the baseline for every later unit.
#[derive(Debug, Default)]
struct Framer {
    baseline: Option<u32>,
    previous_payload_len: Option<u32>,
}

impl Framer {
    fn frame(&mut self, unit: &MediaUnit) -> std::result::Result<TagPrefix, RenderError> {
        let relative = unit.timestamp.saturating_sub(self.baseline.unwrap_or(0));
        let prefix = render_header(relative, self.previous_payload_len, unit)?;

        self.baseline.get_or_insert(unit.timestamp);
        self.previous_payload_len = Some(unit.payload_len() as u32);
        Ok(prefix)
    }
}

/// Viewer-side half of a consumer
pub struct Consumer {
    id: SubscriberId,
    key: StreamKey,
    headers: Arc<StreamHeaders>,
    rx: mpsc::Receiver<MediaUnit>,
    state: Arc<QueueState>,
    framer: Framer,
    started: bool,
}

impl Consumer {
    /// Handle for [`super::Broadcaster::unsubscribe`]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Key of the stream this consumer is attached to
    pub fn stream_key(&self) -> &StreamKey {
        &self.key
    }

    /// Whether the broadcaster has stopped feeding this consumer
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ConsumerStats {
        self.state.snapshot()
    }

    /// Write the stream to `sink` until the queue closes
    ///
    /// Returns `Ok(())` once the queue is closed and empty. A failed write ends
    /// the loop with [`Error::Delivery`]; the caller must still unsubscribe.
    pub async fn drain<W>(&mut self, sink: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.started {
            self.write_startup(sink).await?;
            self.started = true;
        }

        while let Some(unit) = self.rx.recv().await {
            let bytes = unit.payload_len();
            self.state.release(bytes);

            let prefix = match self.framer.frame(&unit) {
                Ok(prefix) => prefix,
                Err(e) => {
                    self.state.skipped_units.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        stream = %self.key,
                        subscriber = %self.id,
                        error = %e,
                        "Skipping unit"
                    );
                    continue;
                }
            };

            write_tag(sink, &prefix, &unit).await?;
            if self.state.queued_units.load(Ordering::Acquire) == 0 {
                sink.flush().await.map_err(Error::Delivery)?;
            }

            self.state.delivered_units.fetch_add(1, Ordering::Relaxed);
            self.state
                .delivered_bytes
                .fetch_add((TAG_PREFIX_SIZE + bytes) as u64, Ordering::Relaxed);
        }

        self.state.closed.store(true, Ordering::Release);
        tracing::debug!(
            stream = %self.key,
            subscriber = %self.id,
            "Consumer queue closed"
        );
        Ok(())
    }

    /// Container header, metadata, then the cached sequence headers
    ///
    /// All startup tags are stamped 0 and carry a previous size of 0.
    async fn write_startup<W>(&mut self, sink: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let headers = Arc::clone(&self.headers);
        let metadata = headers.metadata.as_ref().ok_or(Error::MissingMetadata)?;

        sink.write_all(&headers.container)
            .await
            .map_err(Error::Delivery)?;

        let startup = std::iter::once(metadata)
            .chain(headers.audio_sequence_header.as_ref())
            .chain(headers.video_sequence_header.as_ref());
        for unit in startup {
            let prefix = render_header(0, None, unit)?;
            write_tag(sink, &prefix, unit).await?;
        }

        sink.flush().await.map_err(Error::Delivery)?;
        tracing::debug!(
            stream = %self.key,
            subscriber = %self.id,
            "Startup headers sent"
        );
        Ok(())
    }
}

async fn write_tag<W>(sink: &mut W, prefix: &TagPrefix, unit: &MediaUnit) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    sink.write_all(prefix).await.map_err(Error::Delivery)?;
    sink.write_all(&unit.payload)
        .await
        .map_err(Error::Delivery)
}
