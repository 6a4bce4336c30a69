//! Registry error types
//!
//! Error types for stream registry and broadcaster operations.

use super::key::StreamKey;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Stream not found, or not initialized with a metadata tag
    StreamNotFound(StreamKey),
    /// Stream already has a publisher
    StreamAlreadyPublishing(StreamKey),
    /// Publisher is gone; the stream accepts no new viewers
    StreamClosed(StreamKey),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::StreamNotFound(key) => write!(f, "Stream not found: {}", key),
            RegistryError::StreamAlreadyPublishing(key) => {
                write!(f, "Stream already has a publisher: {}", key)
            }
            RegistryError::StreamClosed(key) => write!(f, "Stream closed: {}", key),
        }
    }
}

impl std::error::Error for RegistryError {}
