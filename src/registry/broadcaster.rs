//! Per-stream fan-out
//!
//! A [`Broadcaster`] holds the stream's cached startup headers and the set of
//! attached consumers. `publish` walks the set under the read side of the
//! lock; `subscribe`, `unsubscribe` and `close` take the write side, so the
//! set never changes while a unit is being fanned out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use slab::Slab;
use tokio::sync::RwLock;

use crate::media::MediaUnit;
use crate::stats::BroadcasterStats;

use super::config::ConsumerConfig;
use super::consumer::{self, Admission, Consumer, Subscriber};
use super::error::RegistryError;
use super::key::StreamKey;

/// Startup headers every viewer receives before live units
///
/// Set once when the stream is created and read without locking afterwards.
#[derive(Debug, Clone)]
pub struct StreamHeaders {
    /// FLV file header
    pub container: Bytes,
    /// onMetaData script tag; viewers are refused while this is missing
    pub metadata: Option<MediaUnit>,
    /// AAC AudioSpecificConfig, when the stream carries audio
    pub audio_sequence_header: Option<MediaUnit>,
    /// AVC decoder configuration, when the stream carries video
    pub video_sequence_header: Option<MediaUnit>,
}

impl StreamHeaders {
    pub fn new(container: Bytes, metadata: MediaUnit) -> Self {
        Self {
            container,
            metadata: Some(metadata),
            audio_sequence_header: None,
            video_sequence_header: None,
        }
    }

    /// Headers of a stream that has not sent its metadata tag
    pub fn uninitialized(container: Bytes) -> Self {
        Self {
            container,
            metadata: None,
            audio_sequence_header: None,
            video_sequence_header: None,
        }
    }

    pub fn with_audio_sequence_header(mut self, unit: MediaUnit) -> Self {
        self.audio_sequence_header = Some(unit);
        self
    }

    pub fn with_video_sequence_header(mut self, unit: MediaUnit) -> Self {
        self.video_sequence_header = Some(unit);
        self
    }
}

/// Handle identifying one consumer within its broadcaster
///
/// `slot` indexes the subscriber arena; `serial` is never reused, so a stale
/// handle cannot remove whoever took over the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId {
    slot: usize,
    serial: u64,
}

impl SubscriberId {
    pub(crate) fn new(slot: usize, serial: u64) -> Self {
        Self { slot, serial }
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.slot, self.serial)
    }
}

struct SubscriberSet {
    slots: Slab<Subscriber>,
    next_serial: u64,
    closed: bool,
}

/// Fan-out point for one live stream
pub struct Broadcaster {
    key: StreamKey,
    headers: Arc<StreamHeaders>,
    config: ConsumerConfig,
    subscribers: RwLock<SubscriberSet>,
    published_units: AtomicU64,
}

impl Broadcaster {
    /// Create a broadcaster with default consumer limits
    pub fn new(key: StreamKey, headers: StreamHeaders) -> Self {
        Self::with_config(key, headers, ConsumerConfig::default())
    }

    /// Create a broadcaster whose consumers use `config`
    pub fn with_config(key: StreamKey, headers: StreamHeaders, config: ConsumerConfig) -> Self {
        Self {
            key,
            headers: Arc::new(headers),
            config,
            subscribers: RwLock::new(SubscriberSet {
                slots: Slab::new(),
                next_serial: 0,
                closed: false,
            }),
            published_units: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn headers(&self) -> &StreamHeaders {
        &self.headers
    }

    /// Attach a new consumer using the broadcaster's default limits
    pub async fn subscribe(&self) -> Result<Consumer, RegistryError> {
        self.subscribe_with(self.config).await
    }

    /// Attach a new consumer with its own limits
    ///
    /// Fails with `StreamNotFound` while no metadata tag is cached and with
    /// `StreamClosed` once the publisher is gone.
    pub async fn subscribe_with(&self, config: ConsumerConfig) -> Result<Consumer, RegistryError> {
        if self.headers.metadata.is_none() {
            return Err(RegistryError::StreamNotFound(self.key.clone()));
        }

        let mut guard = self.subscribers.write().await;
        let set = &mut *guard;
        if set.closed {
            return Err(RegistryError::StreamClosed(self.key.clone()));
        }

        let serial = set.next_serial;
        set.next_serial += 1;

        let entry = set.slots.vacant_entry();
        let id = SubscriberId::new(entry.key(), serial);
        let (subscriber, consumer) =
            consumer::channel(id, self.key.clone(), Arc::clone(&self.headers), config);
        entry.insert(subscriber);

        tracing::info!(
            stream = %self.key,
            subscriber = %id,
            subscribers = set.slots.len(),
            "Subscriber added"
        );

        Ok(consumer)
    }

    /// Detach a consumer
    ///
    /// Once this returns no later `publish` reaches the consumer. Its queue is
    /// closed, so a waiting `drain` delivers what is already queued and then
    /// returns. Returns `false` if the handle was already removed.
    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = {
            let mut set = self.subscribers.write().await;
            let current = set.slots.get(id.slot).map(|s| s.id()) == Some(id);
            if current {
                Some(set.slots.remove(id.slot))
            } else {
                None
            }
        };

        match removed {
            Some(subscriber) => {
                subscriber.close();
                tracing::info!(stream = %self.key, subscriber = %id, "Subscriber removed");
                true
            }
            None => {
                tracing::debug!(stream = %self.key, subscriber = %id, "Unknown subscriber");
                false
            }
        }
    }

    /// Fan a unit out to every attached consumer
    ///
    /// Never waits on a consumer: a full queue drops the unit for that
    /// consumer only. Returns how many consumers queued it.
    ///
    /// Consumers whose viewer dropped them without unsubscribing are removed
    /// once the fan-out is done.
    pub async fn publish(&self, unit: MediaUnit) -> usize {
        self.published_units.fetch_add(1, Ordering::Relaxed);

        let mut queued = 0;
        let mut gone = Vec::new();
        {
            let set = self.subscribers.read().await;
            for (_, subscriber) in set.slots.iter() {
                match subscriber.enqueue(&unit) {
                    Admission::Queued => queued += 1,
                    Admission::Dropped => {}
                    Admission::Closed => gone.push(subscriber.id()),
                }
            }
        }

        for id in gone {
            self.unsubscribe(id).await;
        }
        queued
    }

    /// Publisher is gone: detach everyone and refuse new viewers
    ///
    /// Every consumer's queue is closed; their `drain` loops finish after
    /// delivering what they already hold.
    pub async fn close(&self) {
        let detached: Vec<Subscriber> = {
            let mut set = self.subscribers.write().await;
            if set.closed {
                return;
            }
            set.closed = true;
            set.slots.drain().collect()
        };

        for subscriber in &detached {
            subscriber.close();
        }

        tracing::info!(
            stream = %self.key,
            subscribers = detached.len(),
            "Broadcaster closed"
        );
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.slots.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.subscribers.read().await.closed
    }

    pub async fn stats(&self) -> BroadcasterStats {
        let set = self.subscribers.read().await;
        BroadcasterStats {
            subscriber_count: set.slots.len(),
            published_units: self.published_units.load(Ordering::Relaxed),
            closed: set.closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::Error;
    use crate::media::encoder::flv_header;
    use crate::media::FlvReader;

    fn broadcaster() -> Broadcaster {
        let headers = StreamHeaders::new(
            flv_header(false, true),
            MediaUnit::script(0, Bytes::from_static(b"meta")),
        );
        Broadcaster::new(StreamKey::new("live", "test_stream"), headers)
    }

    fn video(timestamp: u32, len: usize) -> MediaUnit {
        MediaUnit::video(timestamp, Bytes::from(vec![0x27; len]))
    }

    /// Expected bytes for one tag: prefix then payload
    fn tag(prev: u32, size: u32, ts: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = prev.to_be_bytes().to_vec();
        buf.push(9);
        buf.extend_from_slice(&size.to_be_bytes()[1..]);
        buf.extend_from_slice(&ts.to_be_bytes()[1..]);
        buf.push((ts >> 24) as u8);
        buf.extend_from_slice(&[0, 0, 0]);
        buf.extend_from_slice(payload);
        buf
    }

    fn startup() -> Vec<u8> {
        let mut buf = flv_header(false, true).to_vec();
        buf.extend_from_slice(&[0, 0, 0, 0, 18, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0]);
        buf.extend_from_slice(b"meta");
        buf
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let broadcaster = broadcaster();

        assert_eq!(broadcaster.publish(video(0, 1)).await, 0);
        assert_eq!(broadcaster.stats().await.published_units, 1);
    }

    #[tokio::test]
    async fn test_subscribe_requires_metadata() {
        let broadcaster = Broadcaster::new(
            StreamKey::new("live", "bare"),
            StreamHeaders::uninitialized(flv_header(false, true)),
        );

        let result = broadcaster.subscribe().await;
        assert!(matches!(result, Err(RegistryError::StreamNotFound(_))));
        assert_eq!(broadcaster.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_then_rebase() {
        let broadcaster = broadcaster();
        let mut consumer = broadcaster.subscribe().await.unwrap();

        let a = Bytes::from(vec![0xA0; 10]);
        assert_eq!(broadcaster.publish(MediaUnit::video(1000, a.clone())).await, 1);

        let mut out = Vec::new();
        let waited =
            tokio::time::timeout(Duration::from_millis(50), consumer.drain(&mut out)).await;
        assert!(waited.is_err(), "drain should block once the queue is empty");

        let mut expected = startup();
        expected.extend(tag(0, 10, 1000, &a));
        assert_eq!(out, expected);

        let b = Bytes::from(vec![0xB0; 20]);
        broadcaster.publish(MediaUnit::video(1040, b.clone())).await;
        broadcaster.unsubscribe(consumer.id()).await;

        let mut rest = Vec::new();
        consumer.drain(&mut rest).await.unwrap();
        assert_eq!(rest, tag(21, 20, 40, &b));
    }

    #[tokio::test]
    async fn test_late_joiner_sees_only_later_units() {
        let broadcaster = broadcaster();
        let mut early = broadcaster.subscribe().await.unwrap();

        broadcaster.publish(video(0, 3)).await;
        broadcaster.publish(video(40, 3)).await;
        let mut late = broadcaster.subscribe().await.unwrap();
        broadcaster.publish(video(80, 5)).await;
        broadcaster.close().await;

        let mut early_out = Vec::new();
        early.drain(&mut early_out).await.unwrap();
        let mut late_out = Vec::new();
        late.drain(&mut late_out).await.unwrap();

        assert_eq!(early.stats().delivered_units, 3);
        assert_eq!(late.stats().delivered_units, 1);

        // Late joiner's first unit carries its absolute timestamp
        let mut expected = startup();
        expected.extend(tag(0, 5, 80, &[0x27; 5]));
        assert_eq!(late_out, expected);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broadcaster = broadcaster();
        let mut consumer = broadcaster.subscribe().await.unwrap();
        let _other = broadcaster.subscribe().await.unwrap();

        broadcaster.publish(video(0, 1)).await;
        assert!(broadcaster.unsubscribe(consumer.id()).await);
        assert_eq!(broadcaster.publish(video(40, 1)).await, 1);

        let mut out = Vec::new();
        consumer.drain(&mut out).await.unwrap();
        assert_eq!(consumer.stats().delivered_units, 1);
        assert!(consumer.is_closed());
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_remove_new_subscriber() {
        let broadcaster = broadcaster();
        let first = broadcaster.subscribe().await.unwrap();
        let stale = first.id();
        assert!(broadcaster.unsubscribe(stale).await);

        // Reuses the freed slot
        let second = broadcaster.subscribe().await.unwrap();
        assert_ne!(second.id(), stale);

        assert!(!broadcaster.unsubscribe(stale).await);
        assert_eq!(broadcaster.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_overload_drops_newest() {
        let broadcaster = broadcaster();
        let mut consumer = broadcaster
            .subscribe_with(ConsumerConfig::default().max_units(1))
            .await
            .unwrap();

        assert_eq!(broadcaster.publish(video(0, 4)).await, 1);
        assert_eq!(broadcaster.publish(video(40, 4)).await, 0);
        broadcaster.unsubscribe(consumer.id()).await;

        let mut out = Vec::new();
        consumer.drain(&mut out).await.unwrap();

        let stats = consumer.stats();
        assert_eq!(stats.delivered_units, 1);
        assert_eq!(stats.dropped_units, 1);

        let mut expected = startup();
        expected.extend(tag(0, 4, 0, &[0x27; 4]));
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_slow_consumer_does_not_affect_others() {
        let broadcaster = broadcaster();
        let _slow = broadcaster
            .subscribe_with(ConsumerConfig::default().max_units(2))
            .await
            .unwrap();
        let mut fast = broadcaster.subscribe().await.unwrap();

        for i in 0..10 {
            broadcaster.publish(video(i * 40, 2)).await;
        }
        broadcaster.close().await;

        let mut out = Vec::new();
        fast.drain(&mut out).await.unwrap();
        assert_eq!(fast.stats().delivered_units, 10);
        assert_eq!(fast.stats().dropped_units, 0);
    }

    #[tokio::test]
    async fn test_close_refuses_new_viewers() {
        let broadcaster = broadcaster();
        let mut consumer = broadcaster.subscribe().await.unwrap();

        broadcaster.close().await;
        assert!(broadcaster.is_closed().await);
        assert_eq!(broadcaster.subscriber_count().await, 0);
        assert_eq!(broadcaster.publish(video(0, 1)).await, 0);

        let result = broadcaster.subscribe().await;
        assert!(matches!(result, Err(RegistryError::StreamClosed(_))));

        let mut out = Vec::new();
        consumer.drain(&mut out).await.unwrap();
        assert_eq!(out, startup());
    }

    #[tokio::test]
    async fn test_failed_viewer_isolated() {
        let broadcaster = broadcaster();
        let mut broken = broadcaster.subscribe().await.unwrap();
        let mut healthy = broadcaster.subscribe().await.unwrap();

        broadcaster.publish(video(0, 2)).await;

        let mut sink = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))
            .build();
        let result = broken.drain(&mut sink).await;
        assert!(matches!(result, Err(Error::Delivery(_))));
        broadcaster.unsubscribe(broken.id()).await;

        broadcaster.publish(video(40, 2)).await;
        broadcaster.close().await;

        let mut out = Vec::new();
        healthy.drain(&mut out).await.unwrap();
        assert_eq!(healthy.stats().delivered_units, 2);
    }

    #[tokio::test]
    async fn test_dropped_consumer_removed_on_publish() {
        let broadcaster = broadcaster();
        let dropped = broadcaster.subscribe().await.unwrap();
        let _kept = broadcaster.subscribe().await.unwrap();
        drop(dropped);

        assert_eq!(broadcaster.publish(video(0, 1)).await, 1);
        assert_eq!(broadcaster.subscriber_count().await, 1);
        assert_eq!(broadcaster.publish(video(40, 1)).await, 1);
    }

    #[tokio::test]
    async fn test_subscribe_with_unbounded_units() {
        let config = ConsumerConfig {
            max_units: usize::MAX,
            ..ConsumerConfig::default()
        };
        let broadcaster = broadcaster();
        let consumer = broadcaster.subscribe_with(config).await.unwrap();

        assert_eq!(broadcaster.publish(video(0, 1)).await, 1);
        assert_eq!(consumer.stats().queued_units, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unsubscribe_while_publishing() {
        let broadcaster = Arc::new(broadcaster());
        let mut consumer = broadcaster.subscribe().await.unwrap();

        let publisher = {
            let broadcaster = Arc::clone(&broadcaster);
            tokio::spawn(async move {
                for i in 0..5000u32 {
                    broadcaster.publish(video(i * 10, 1)).await;
                    tokio::task::yield_now().await;
                }
            })
        };

        while consumer.stats().queued_units < 10 {
            tokio::task::yield_now().await;
        }
        assert!(broadcaster.unsubscribe(consumer.id()).await);

        let seen = consumer.stats();
        let admitted = seen.queued_units as u64 + seen.delivered_units;
        publisher.await.unwrap();
        let after = consumer.stats();
        assert_eq!(after.queued_units as u64 + after.delivered_units, admitted);
        assert_eq!(after.dropped_units, 0);

        let mut out = Vec::new();
        consumer.drain(&mut out).await.unwrap();
        assert_eq!(consumer.stats().delivered_units, admitted);

        // Units come out in publish order with no gaps
        let mut reader = FlvReader::new(&out[..]);
        reader.read_header().await.unwrap();
        assert!(reader.next_unit().await.unwrap().unwrap().is_script());
        let mut expected = 0u32;
        while let Some(unit) = reader.next_unit().await.unwrap() {
            assert_eq!(unit.timestamp, expected * 10);
            expected += 1;
        }
        assert_eq!(expected as u64, admitted);
    }

    #[tokio::test]
    async fn test_concurrent_publish_and_subscribe() {
        let broadcaster = Arc::new(broadcaster());

        let publisher = {
            let broadcaster = Arc::clone(&broadcaster);
            tokio::spawn(async move {
                for i in 0..200u32 {
                    broadcaster.publish(video(i, 1)).await;
                    tokio::task::yield_now().await;
                }
                broadcaster.close().await;
            })
        };

        let mut viewers = Vec::new();
        for _ in 0..8 {
            let broadcaster = Arc::clone(&broadcaster);
            viewers.push(tokio::spawn(async move {
                let mut consumer = match broadcaster.subscribe().await {
                    Ok(consumer) => consumer,
                    Err(_) => return 0,
                };
                let mut out = Vec::new();
                consumer.drain(&mut out).await.unwrap();
                consumer.stats().delivered_units
            }));
        }

        publisher.await.unwrap();
        for viewer in viewers {
            assert!(viewer.await.unwrap() <= 200);
        }
        assert_eq!(broadcaster.subscriber_count().await, 0);
    }
}
