//! flv-relay: live FLV fan-out
//!
//! One ingested stream is fanned out to any number of viewers. Each viewer
//! gets its own bounded queue and its own framing state, so it receives a
//! well-formed FLV stream starting at its own join point, and a slow viewer
//! only ever loses its own units.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use flv_relay::ingest::{publish_flv, IngestConfig};
//! use flv_relay::media::FlvReader;
//! use flv_relay::registry::{StreamKey, StreamRegistry};
//!
//! # async fn run() -> flv_relay::Result<()> {
//! let registry = Arc::new(StreamRegistry::new());
//! let key = StreamKey::new("live", "cam1");
//!
//! // Publisher side
//! let file = tokio::fs::File::open("cam1.flv").await?;
//! let ingest = {
//!     let registry = Arc::clone(&registry);
//!     let key = key.clone();
//!     tokio::spawn(async move {
//!         let mut reader = FlvReader::new(file);
//!         publish_flv(&registry, &key, &mut reader, IngestConfig::default()).await
//!     })
//! };
//!
//! // Viewer side
//! let broadcaster = registry.lookup(&key).await?;
//! let mut consumer = broadcaster.subscribe().await?;
//! let mut sink = tokio::io::sink();
//! let result = consumer.drain(&mut sink).await;
//! broadcaster.unsubscribe(consumer.id()).await;
//! result?;
//! # let _ = ingest.await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod ingest;
pub mod media;
pub mod registry;
pub mod stats;

pub use error::{Error, Result};
pub use media::MediaUnit;
pub use registry::{Broadcaster, Consumer, StreamKey, StreamRegistry};
