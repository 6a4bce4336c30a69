//! Crate error types
//!
//! Overload is deliberately absent: a dropped unit is reported through
//! [`crate::registry::Admission`], not as an error.

use std::io;

use crate::media::encoder::RenderError;
use crate::registry::RegistryError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the relay
#[derive(Debug)]
pub enum Error {
    /// Stream lookup or subscription failed
    Registry(RegistryError),
    /// A startup header could not be framed
    Render(RenderError),
    /// Writing to a viewer's sink failed
    Delivery(io::Error),
    /// Reading ingest input failed
    Io(io::Error),
    /// Ingest input is not a well-formed FLV stream
    InvalidFlv(&'static str),
    /// Stream ended before any metadata tag was seen
    MissingMetadata,
}

impl Error {
    /// Whether this error ended a single viewer rather than a stream
    pub fn is_delivery(&self) -> bool {
        matches!(self, Error::Delivery(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Registry(e) => write!(f, "Registry error: {}", e),
            Error::Render(e) => write!(f, "Render error: {}", e),
            Error::Delivery(e) => write!(f, "Delivery failed: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::InvalidFlv(reason) => write!(f, "Invalid FLV: {}", reason),
            Error::MissingMetadata => write!(f, "Stream has no metadata tag"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Registry(e) => Some(e),
            Error::Render(e) => Some(e),
            Error::Delivery(e) | Error::Io(e) => Some(e),
            Error::InvalidFlv(_) | Error::MissingMetadata => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Error::Registry(e)
    }
}

impl From<RenderError> for Error {
    fn from(e: RenderError) -> Self {
        Error::Render(e)
    }
}
