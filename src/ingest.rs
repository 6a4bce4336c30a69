//! Publishing an FLV source into the registry
//!
//! The startup headers are collected from the head of the source: the first
//! script tag and the first AAC/AVC sequence headers seen before any ordinary
//! media unit. Once an ordinary unit arrives the stream is created and every
//! unit from then on (mid-stream sequence headers included) is published as
//! is. The stream is removed when the source ends or fails.

use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::media::{FlvReader, MediaUnit, TagKind};
use crate::registry::{Broadcaster, StreamHeaders, StreamKey, StreamRegistry};

/// Ingest options
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestConfig {
    /// Pace units by their timestamps instead of publishing as fast as the
    /// source reads; used to replay a file as if it were live
    pub realtime: bool,
}

impl IngestConfig {
    /// Enable realtime pacing
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

/// Summary of a finished ingest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Units handed to the broadcaster
    pub published_units: u64,
    /// Units cached as startup headers
    pub header_units: u64,
}

/// Publish an FLV source under `key` until it ends
pub async fn publish_flv<R>(
    registry: &StreamRegistry,
    key: &StreamKey,
    reader: &mut FlvReader<R>,
    config: IngestConfig,
) -> Result<IngestSummary>
where
    R: AsyncRead + Unpin,
{
    let container = reader.read_header().await?;
    let mut headers = StreamHeaders::uninitialized(container);
    let mut summary = IngestSummary::default();

    let first = loop {
        let Some(unit) = reader.next_unit().await? else {
            break None;
        };
        match unit.kind {
            TagKind::Script if headers.metadata.is_none() => headers.metadata = Some(unit),
            TagKind::Audio
                if headers.audio_sequence_header.is_none() && unit.is_aac_sequence_header() =>
            {
                headers.audio_sequence_header = Some(unit)
            }
            TagKind::Video
                if headers.video_sequence_header.is_none() && unit.is_avc_sequence_header() =>
            {
                headers.video_sequence_header = Some(unit)
            }
            _ => break Some(unit),
        }
        summary.header_units += 1;
    };

    if first.is_none() && headers.metadata.is_none() {
        return Err(Error::MissingMetadata);
    }
    if headers.metadata.is_none() {
        tracing::warn!(stream = %key, "Stream has no metadata tag, viewers will be refused");
    }

    let broadcaster = registry.create(key, headers).await?;
    tracing::info!(stream = %key, header_units = summary.header_units, "Ingest started");

    let result = pump(reader, first, &broadcaster, config, &mut summary).await;

    registry.remove(key).await;
    match result {
        Ok(()) => {
            tracing::info!(
                stream = %key,
                published_units = summary.published_units,
                "Ingest finished"
            );
            Ok(summary)
        }
        Err(e) => {
            tracing::warn!(stream = %key, error = %e, "Ingest failed");
            Err(e)
        }
    }
}

async fn pump<R>(
    reader: &mut FlvReader<R>,
    first: Option<MediaUnit>,
    broadcaster: &Broadcaster,
    config: IngestConfig,
    summary: &mut IngestSummary,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(first) = first else {
        return Ok(());
    };

    let mut pacer = config.realtime.then(|| Pacer::new(first.timestamp));
    let mut next = Some(first);
    while let Some(unit) = next {
        if let Some(ref mut pacer) = pacer {
            pacer.wait(unit.timestamp).await;
        }
        broadcaster.publish(unit).await;
        summary.published_units += 1;
        next = reader.next_unit().await?;
    }
    Ok(())
}

/// Sleeps until a unit's timestamp is due relative to the first unit
struct Pacer {
    start: Instant,
    base: u32,
}

impl Pacer {
    fn new(base: u32) -> Self {
        Self {
            start: Instant::now(),
            base,
        }
    }

    async fn wait(&mut self, timestamp: u32) {
        let offset = Duration::from_millis(timestamp.saturating_sub(self.base) as u64);
        tokio::time::sleep_until(self.start + offset).await;
    }
}
