//! Stream identifiers

/// Unique identifier for a stream (app + stream name)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    /// Application name (e.g., "live")
    pub app: String,
    /// Stream name/key (e.g., "stream_key_123")
    pub name: String,
}

impl StreamKey {
    /// Create a new stream key
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
        }
    }

    /// Parse an `app/name` path as sent by HTTP-FLV players
    ///
    /// Leading slashes and a trailing `.flv` are ignored.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.trim_start_matches('/');
        let path = path.strip_suffix(".flv").unwrap_or(path);
        let (app, name) = path.split_once('/')?;
        if app.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(app, name))
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.app, self.name)
    }
}
