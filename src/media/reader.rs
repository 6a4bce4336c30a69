//! FLV stream reader
//!
//! Turns an FLV byte stream (a file, or an HTTP-FLV / pipe source) into the
//! container header and a sequence of [`MediaUnit`]s. This is the ingest side
//! of the relay; the tag layout mirrors [`super::encoder`].

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::encoder::{
    flv_header, FLAG_AUDIO, FLAG_VIDEO, FLV_HEADER_SIZE, FLV_SIGNATURE, TAG_HEADER_SIZE,
};
use super::flv::{MediaUnit, TagKind};
use crate::error::{Error, Result};

/// Reads FLV tags from an async byte source
pub struct FlvReader<R> {
    inner: R,
    header_read: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FlvReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            header_read: false,
            eof: false,
        }
    }

    /// Read and validate the file header
    ///
    /// Returns a normalized 9 byte header carrying the source's A/V flags.
    /// Any extra header bytes announced by the data offset and the leading
    /// PreviousTagSize0 are consumed.
    pub async fn read_header(&mut self) -> Result<Bytes> {
        let mut header = [0u8; FLV_HEADER_SIZE];
        self.inner.read_exact(&mut header).await?;

        if header[0..3] != FLV_SIGNATURE {
            return Err(Error::InvalidFlv("bad signature"));
        }

        let flags = header[4];
        let data_offset =
            u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        if data_offset < FLV_HEADER_SIZE {
            return Err(Error::InvalidFlv("data offset shorter than header"));
        }

        // Skip header extension, then PreviousTagSize0
        let skip = (data_offset - FLV_HEADER_SIZE) as u64 + 4;
        let mut extra = (&mut self.inner).take(skip);
        let skipped = tokio::io::copy(&mut extra, &mut tokio::io::sink()).await?;
        if skipped != skip {
            return Err(Error::InvalidFlv("truncated header"));
        }

        self.header_read = true;
        Ok(flv_header(flags & FLAG_AUDIO != 0, flags & FLAG_VIDEO != 0))
    }

    /// Read the next tag
    ///
    /// Returns `Ok(None)` when the source ends on a tag boundary.
    pub async fn next_unit(&mut self) -> Result<Option<MediaUnit>> {
        if !self.header_read {
            self.read_header().await?;
        }
        if self.eof {
            return Ok(None);
        }

        let mut header = [0u8; TAG_HEADER_SIZE];
        if self.inner.read(&mut header[..1]).await? == 0 {
            self.eof = true;
            return Ok(None);
        }
        self.inner.read_exact(&mut header[1..]).await?;

        let kind = TagKind::from_byte(header[0]);
        let data_size = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
        let timestamp = u32::from_be_bytes([header[7], header[4], header[5], header[6]]);

        let mut payload = vec![0u8; data_size];
        self.inner.read_exact(&mut payload).await?;

        // Trailing PreviousTagSize; a source cut right after the last body is tolerated
        let mut trailer = [0u8; 4];
        match self.inner.read_exact(&mut trailer).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => self.eof = true,
            Err(e) => return Err(e.into()),
        }

        Ok(Some(MediaUnit::new(kind, timestamp, Bytes::from(payload))))
    }
}
