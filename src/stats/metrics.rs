//! Statistics for consumers and broadcasters

/// Point-in-time view of one consumer's queue and delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Units currently waiting in the queue
    pub queued_units: usize,
    /// Payload bytes currently waiting in the queue
    pub queued_bytes: usize,
    /// Units written to the sink (startup headers excluded)
    pub delivered_units: u64,
    /// Bytes written to the sink, framing included
    pub delivered_bytes: u64,
    /// Units rejected by admission control
    pub dropped_units: u64,
    /// Units skipped because they could not be framed
    pub skipped_units: u64,
}

impl ConsumerStats {
    /// Fraction of offered units that were dropped, in percent
    pub fn drop_rate(&self) -> f32 {
        let offered = self.delivered_units
            + self.skipped_units
            + self.dropped_units
            + self.queued_units as u64;
        if offered > 0 {
            (self.dropped_units as f32 / offered as f32) * 100.0
        } else {
            0.0
        }
    }
}

/// Point-in-time view of a broadcaster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcasterStats {
    /// Number of attached consumers
    pub subscriber_count: usize,
    /// Units handed to `publish` since creation
    pub published_units: u64,
    /// Whether the publisher has gone away
    pub closed: bool,
}
