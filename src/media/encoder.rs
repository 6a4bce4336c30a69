//! FLV tag framing
//!
//! Every unit written to a viewer is preceded by a 15 byte prefix: the size of
//! the tag sent before it, then the 11 byte FLV tag header.
//!
//! ```text
//! +-------------+---------+-------------+-----------+--------+-------------+
//! | PrevSize(4) | Type(1) | DataSize(3) | TS low(3) | TS hi(1)| StreamID(3) |
//! +-------------+---------+-------------+-----------+--------+-------------+
//! ```
//!
//! A stream starts with the 9 byte file header; the previous-size field of the
//! first tag after it plays the role of PreviousTagSize0.

use bytes::Bytes;

use super::flv::{MediaUnit, TagKind, TAG_TYPE_AUDIO, TAG_TYPE_SCRIPT, TAG_TYPE_VIDEO};

/// FLV file signature: "FLV" in ASCII
pub const FLV_SIGNATURE: [u8; 3] = [0x46, 0x4C, 0x56];

/// FLV version (always 1)
pub const FLV_VERSION: u8 = 0x01;

/// FLV file header is always 9 bytes
pub const FLV_HEADER_SIZE: usize = 9;

/// Size of the tag header that follows the previous-size field
pub const TAG_HEADER_SIZE: usize = 11;

/// Previous-size field plus tag header
pub const TAG_PREFIX_SIZE: usize = 4 + TAG_HEADER_SIZE;

/// Largest payload the 24-bit DataSize field can describe
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

/// Header flag bits announcing audio/video tags
pub(crate) const FLAG_AUDIO: u8 = 0x04;
pub(crate) const FLAG_VIDEO: u8 = 0x01;

/// Rendered prefix for one tag
pub type TagPrefix = [u8; TAG_PREFIX_SIZE];

/// Reason a unit could not be framed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// Tag type the container has no encoding for
    UnknownTagKind(u8),
    /// Payload does not fit the 24-bit size field
    PayloadTooLarge(usize),
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::UnknownTagKind(b) => write!(f, "Unknown tag kind: {}", b),
            RenderError::PayloadTooLarge(len) => write!(f, "Payload too large: {} bytes", len),
        }
    }
}

impl std::error::Error for RenderError {}

/// Build the 9 byte FLV file header
pub fn flv_header(has_audio: bool, has_video: bool) -> Bytes {
    let mut flags = 0u8;
    if has_audio {
        flags |= FLAG_AUDIO;
    }
    if has_video {
        flags |= FLAG_VIDEO;
    }

    let mut header = Vec::with_capacity(FLV_HEADER_SIZE);
    header.extend_from_slice(&FLV_SIGNATURE);
    header.push(FLV_VERSION);
    header.push(flags);
    header.extend_from_slice(&(FLV_HEADER_SIZE as u32).to_be_bytes());
    Bytes::from(header)
}

/// Render the tag prefix for `unit`
///
/// `relative_timestamp` is written as the tag timestamp. `previous_payload_len`
/// is the payload length of the tag this consumer sent before; `None` means
/// nothing was sent yet and encodes a previous size of 0.
pub fn render_header(
    relative_timestamp: u32,
    previous_payload_len: Option<u32>,
    unit: &MediaUnit,
) -> Result<TagPrefix, RenderError> {
    let tag_type = match unit.kind {
        TagKind::Audio => TAG_TYPE_AUDIO,
        TagKind::Video => TAG_TYPE_VIDEO,
        TagKind::Script => TAG_TYPE_SCRIPT,
        TagKind::Unknown(b) => return Err(RenderError::UnknownTagKind(b)),
    };

    let data_size = unit.payload_len();
    if data_size > MAX_PAYLOAD_SIZE {
        return Err(RenderError::PayloadTooLarge(data_size));
    }
    let data_size = data_size as u32;

    let previous_size = previous_payload_len
        .map(|len| len.saturating_add(TAG_HEADER_SIZE as u32))
        .unwrap_or(0);

    let mut buf = [0u8; TAG_PREFIX_SIZE];
    buf[0..4].copy_from_slice(&previous_size.to_be_bytes());
    buf[4] = tag_type;

    // Data size (24-bit BE)
    buf[5] = (data_size >> 16) as u8;
    buf[6] = (data_size >> 8) as u8;
    buf[7] = data_size as u8;

    // Timestamp: lower 24 bits, then upper 8 bits (extension byte)
    buf[8] = (relative_timestamp >> 16) as u8;
    buf[9] = (relative_timestamp >> 8) as u8;
    buf[10] = relative_timestamp as u8;
    buf[11] = (relative_timestamp >> 24) as u8;

    // Stream ID is always 0; buf[12..15] stays zeroed
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flv_header_flags() {
        assert_eq!(
            &flv_header(true, true)[..],
            &[0x46, 0x4C, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09]
        );
        assert_eq!(flv_header(true, false)[4], 0x04);
        assert_eq!(flv_header(false, true)[4], 0x01);
        assert_eq!(flv_header(false, false)[4], 0x00);
    }

    #[test]
    fn test_render_first_tag() {
        let unit = MediaUnit::video(1000, Bytes::from(vec![0u8; 10]));
        let prefix = render_header(1000, None, &unit).unwrap();

        assert_eq!(
            prefix,
            [
                0x00, 0x00, 0x00, 0x00, // previous size
                0x09, // video
                0x00, 0x00, 0x0A, // data size
                0x00, 0x03, 0xE8, // timestamp 1000
                0x00, // extended timestamp
                0x00, 0x00, 0x00, // stream id
            ]
        );
    }

    #[test]
    fn test_render_previous_size_includes_header() {
        let unit = MediaUnit::video(1040, Bytes::from(vec![0u8; 20]));
        let prefix = render_header(40, Some(10), &unit).unwrap();

        assert_eq!(&prefix[0..4], &21u32.to_be_bytes());
        assert_eq!(&prefix[5..8], &[0x00, 0x00, 0x14]);
        assert_eq!(&prefix[8..12], &[0x00, 0x00, 0x28, 0x00]);
    }

    #[test]
    fn test_render_zero_length_previous() {
        // A previous tag with an empty body still had an 11 byte header
        let unit = MediaUnit::audio(0, Bytes::new());
        let prefix = render_header(0, Some(0), &unit).unwrap();
        assert_eq!(&prefix[0..4], &11u32.to_be_bytes());
    }

    #[test]
    fn test_render_previous_size_saturates() {
        let unit = MediaUnit::video(0, Bytes::from_static(&[0x27]));
        let prefix = render_header(0, Some(u32::MAX - 5), &unit).unwrap();
        assert_eq!(&prefix[0..4], &u32::MAX.to_be_bytes());
    }

    #[test]
    fn test_render_extended_timestamp() {
        let unit = MediaUnit::audio(0, Bytes::from_static(&[0xAF, 0x01]));
        let prefix = render_header(0x1234_5678, None, &unit).unwrap();

        assert_eq!(prefix[4], 0x08);
        assert_eq!(&prefix[8..12], &[0x34, 0x56, 0x78, 0x12]);
    }

    #[test]
    fn test_render_script_tag() {
        let unit = MediaUnit::script(0, Bytes::from_static(b"meta"));
        let prefix = render_header(0, None, &unit).unwrap();
        assert_eq!(prefix[4], 18);
        assert_eq!(&prefix[5..8], &[0x00, 0x00, 0x04]);
    }

    #[test]
    fn test_render_unknown_kind_fails() {
        let unit = MediaUnit::new(TagKind::Unknown(3), 0, Bytes::from_static(&[1, 2]));
        assert_eq!(
            render_header(0, None, &unit),
            Err(RenderError::UnknownTagKind(3))
        );
    }

    #[test]
    fn test_render_oversized_payload_fails() {
        let unit = MediaUnit::video(0, Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]));
        assert_eq!(
            render_header(0, None, &unit),
            Err(RenderError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1))
        );
    }
}
