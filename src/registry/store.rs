//! Stream registry implementation
//!
//! Maps stream keys to their broadcasters. A stream is created when its
//! publisher starts and removed when the publisher goes away; removal closes
//! the broadcaster so attached viewers finish instead of waiting forever.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::stats::BroadcasterStats;

use super::broadcaster::{Broadcaster, StreamHeaders};
use super::config::RegistryConfig;
use super::consumer::Consumer;
use super::error::RegistryError;
use super::key::StreamKey;

/// Central registry for all active streams
///
/// Thread-safe via `RwLock`. Lookups by viewers take the read side; only
/// stream creation and removal take the write side.
pub struct StreamRegistry {
    /// Map of stream key to its broadcaster
    streams: RwLock<HashMap<StreamKey, Arc<Broadcaster>>>,

    /// Configuration
    config: RegistryConfig,
}

impl StreamRegistry {
    /// Create a new stream registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new stream registry with custom configuration
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Create the broadcaster for a newly started stream
    ///
    /// Returns an error if the key already has a live publisher.
    pub async fn create(
        &self,
        key: &StreamKey,
        headers: StreamHeaders,
    ) -> Result<Arc<Broadcaster>, RegistryError> {
        let mut streams = self.streams.write().await;

        if streams.contains_key(key) {
            return Err(RegistryError::StreamAlreadyPublishing(key.clone()));
        }

        let has_metadata = headers.metadata.is_some();
        let broadcaster = Arc::new(Broadcaster::with_config(
            key.clone(),
            headers,
            self.config.consumer,
        ));
        streams.insert(key.clone(), Arc::clone(&broadcaster));

        tracing::info!(
            stream = %key,
            metadata = has_metadata,
            streams = streams.len(),
            "Stream created"
        );

        Ok(broadcaster)
    }

    /// Find the broadcaster for a stream
    pub async fn lookup(&self, key: &StreamKey) -> Result<Arc<Broadcaster>, RegistryError> {
        self.streams
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::StreamNotFound(key.clone()))
    }

    /// Look a stream up and attach a consumer to it
    pub async fn subscribe(&self, key: &StreamKey) -> Result<Consumer, RegistryError> {
        let broadcaster = self.lookup(key).await?;
        broadcaster.subscribe().await
    }

    /// Remove a stream whose publisher went away
    ///
    /// The broadcaster is closed before it is returned.
    pub async fn remove(&self, key: &StreamKey) -> Option<Arc<Broadcaster>> {
        let removed = self.streams.write().await.remove(key);

        if let Some(ref broadcaster) = removed {
            broadcaster.close().await;
            tracing::info!(stream = %key, "Stream removed");
        } else {
            tracing::debug!(stream = %key, "Remove of unknown stream");
        }

        removed
    }

    /// Check if a stream exists
    pub async fn stream_exists(&self, key: &StreamKey) -> bool {
        self.streams.read().await.contains_key(key)
    }

    /// Get total number of streams
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Get stream statistics
    pub async fn get_stream_stats(&self, key: &StreamKey) -> Option<BroadcasterStats> {
        let broadcaster = self.streams.read().await.get(key).cloned()?;
        Some(broadcaster.stats().await)
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::media::encoder::flv_header;
    use crate::media::MediaUnit;
    use crate::registry::ConsumerConfig;

    fn headers() -> StreamHeaders {
        StreamHeaders::new(
            flv_header(true, true),
            MediaUnit::script(0, Bytes::from_static(b"meta")),
        )
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "test_stream");

        registry.create(&key, headers()).await.unwrap();
        assert!(registry.stream_exists(&key).await);
        assert_eq!(registry.stream_count().await, 1);

        let broadcaster = registry.lookup(&key).await.unwrap();
        assert_eq!(broadcaster.key(), &key);

        // Can't start a second publisher on the same key
        let result = registry.create(&key, headers()).await;
        assert!(matches!(
            result,
            Err(RegistryError::StreamAlreadyPublishing(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_unknown_stream() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "missing");

        assert!(matches!(
            registry.lookup(&key).await,
            Err(RegistryError::StreamNotFound(_))
        ));
        assert!(matches!(
            registry.subscribe(&key).await,
            Err(RegistryError::StreamNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "test_stream");
        let broadcaster = registry.create(&key, headers()).await.unwrap();

        let _consumer = registry.subscribe(&key).await.unwrap();
        let queued = broadcaster
            .publish(MediaUnit::video(0, Bytes::from_static(&[0x17, 0x01])))
            .await;
        assert_eq!(queued, 1);

        let stats = registry.get_stream_stats(&key).await.unwrap();
        assert_eq!(stats.subscriber_count, 1);
        assert_eq!(stats.published_units, 1);
    }

    #[tokio::test]
    async fn test_remove_closes_consumers() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "test_stream");
        let broadcaster = registry.create(&key, headers()).await.unwrap();
        let mut consumer = registry.subscribe(&key).await.unwrap();

        let removed = registry.remove(&key).await.unwrap();
        assert!(Arc::ptr_eq(&removed, &broadcaster));
        assert!(removed.is_closed().await);
        assert!(!registry.stream_exists(&key).await);
        assert!(registry.get_stream_stats(&key).await.is_none());

        // Drain returns once the startup headers are out
        let mut out = Vec::new();
        consumer.drain(&mut out).await.unwrap();
        assert!(!out.is_empty());

        assert!(registry.remove(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_recreate_after_remove() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "test_stream");

        registry.create(&key, headers()).await.unwrap();
        registry.remove(&key).await;
        assert!(registry.create(&key, headers()).await.is_ok());
    }

    #[tokio::test]
    async fn test_config_applies_to_consumers() {
        let config = RegistryConfig::default().consumer(ConsumerConfig::default().max_units(1));
        let registry = StreamRegistry::with_config(config);
        let key = StreamKey::new("live", "test_stream");
        let broadcaster = registry.create(&key, headers()).await.unwrap();
        let consumer = registry.subscribe(&key).await.unwrap();

        broadcaster.publish(MediaUnit::video(0, Bytes::from_static(&[0x27]))).await;
        broadcaster.publish(MediaUnit::video(1, Bytes::from_static(&[0x27]))).await;

        assert_eq!(consumer.stats().dropped_units, 1);
    }
}
