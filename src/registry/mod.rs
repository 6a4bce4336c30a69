//! Stream registry and per-stream fan-out
//!
//! The registry maps stream keys to broadcasters. Each broadcaster fans the
//! publisher's units out to its consumers, one bounded queue per viewer.
//!
//! # Architecture
//!
//! ```text
//!                      Arc<StreamRegistry>
//!                 ┌──────────────────────────┐
//!                 │ streams: HashMap<Key,    │
//!                 │   Arc<Broadcaster> {     │
//!                 │     headers,             │
//!                 │     subscribers: Slab,   │
//!                 │   }                      │
//!                 │ >                        │
//!                 └────────────┬─────────────┘
//!                              │
//!      ┌───────────────────────┼───────────────────────┐
//!      │                       │                       │
//!      ▼                       ▼                       ▼
//! [Publisher]              [Consumer]              [Consumer]
//! publish(unit)            drain(sink)             drain(sink)
//!      │                       ▲                       ▲
//!      └──► enqueue() ──► mpsc queue ──────────────────┘
//! ```
//!
//! `enqueue` never waits: when a viewer's queue is over its unit or byte limit
//! the newest unit is dropped for that viewer only.
//!
//! # Zero-Copy Design
//!
//! `bytes::Bytes` uses reference counting, so all consumers share the same
//! payload allocation. Only the 15 byte tag prefix is rendered per viewer.

pub mod broadcaster;
pub mod config;
pub mod consumer;
pub mod error;
pub mod key;
pub mod store;

pub use broadcaster::{Broadcaster, StreamHeaders, SubscriberId};
pub use config::{
    ConsumerConfig, RegistryConfig, DEFAULT_MAX_BYTES, DEFAULT_MAX_UNITS, MAX_UNITS_LIMIT,
};
pub use consumer::{Admission, Consumer};
pub use error::RegistryError;
pub use key::StreamKey;
pub use store::StreamRegistry;
