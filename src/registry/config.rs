//! Registry and consumer configuration

/// Default queue depth before a consumer starts dropping units
pub const DEFAULT_MAX_UNITS: usize = 4096 * 8;

/// Default cumulative queued payload before a consumer starts dropping units
pub const DEFAULT_MAX_BYTES: usize = 20 * 1024 * 1024;

/// Largest queue depth the underlying channel can hold
pub const MAX_UNITS_LIMIT: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Per-consumer admission limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Queue depth (in units) before new units are dropped
    pub max_units: usize,

    /// Queued payload bytes before new units are dropped
    pub max_bytes: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_units: DEFAULT_MAX_UNITS,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl ConsumerConfig {
    /// Set the queue depth limit
    ///
    /// Clamped to `1..=MAX_UNITS_LIMIT`.
    pub fn max_units(mut self, max: usize) -> Self {
        self.max_units = max.clamp(1, MAX_UNITS_LIMIT);
        self
    }

    /// Set the queued payload byte limit
    pub fn max_bytes(mut self, max: usize) -> Self {
        self.max_bytes = max;
        self
    }
}

/// Configuration for the stream registry
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Limits given to every consumer of streams this registry creates
    pub consumer: ConsumerConfig,
}

impl RegistryConfig {
    /// Set the consumer limits
    pub fn consumer(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = consumer;
        self
    }
}
