//! FLV media units
//!
//! A [`MediaUnit`] is one decoded FLV tag: its kind, its absolute timestamp and
//! the raw tag body. Units are produced once by ingest and then shared,
//! read-only, by every consumer they are fanned out to.
//!
//! Video tag body:
//! ```text
//! +----------+----------+
//! | FrameType| CodecID  | CodecData...
//! | (4 bits) | (4 bits) |
//! +----------+----------+
//! ```
//!
//! Audio tag body:
//! ```text
//! +-----------+---------+----------+----------+
//! |SoundFormat|SoundRate|SoundSize |SoundType | AudioData...
//! | (4 bits)  | (2 bits)| (1 bit)  | (1 bit)  |
//! +-----------+---------+----------+----------+
//! ```

use bytes::Bytes;

/// FLV tag type byte for audio
pub const TAG_TYPE_AUDIO: u8 = 8;
/// FLV tag type byte for video
pub const TAG_TYPE_VIDEO: u8 = 9;
/// FLV tag type byte for script data (onMetaData)
pub const TAG_TYPE_SCRIPT: u8 = 18;

/// Kind of a media unit
///
/// Ingest may hand over tag types this relay does not understand; those are
/// kept as `Unknown` so the framing step can skip them instead of the parser
/// having to guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    Audio,
    Video,
    Script,
    Unknown(u8),
}

impl TagKind {
    pub fn from_byte(b: u8) -> Self {
        // Upper bits carry the filter/reserved flags.
        match b & 0x1F {
            TAG_TYPE_AUDIO => TagKind::Audio,
            TAG_TYPE_VIDEO => TagKind::Video,
            TAG_TYPE_SCRIPT => TagKind::Script,
            _ => TagKind::Unknown(b),
        }
    }
}

/// One timestamped FLV tag
///
/// Cheap to clone: the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUnit {
    /// Tag kind
    pub kind: TagKind,
    /// Absolute timestamp in milliseconds
    pub timestamp: u32,
    /// Tag body (including codec headers)
    pub payload: Bytes,
}

/// Video codec id of AVC (H.264)
pub const VIDEO_CODEC_AVC: u8 = 7;
/// Audio sound format of AAC
pub const AUDIO_FORMAT_AAC: u8 = 10;

/// Video frame type of a keyframe
const FRAME_TYPE_KEY: u8 = 1;
/// Video frame type of a server-generated keyframe
const FRAME_TYPE_GENERATED_KEY: u8 = 4;

/// AVCPacketType / AACPacketType of a sequence header
const PACKET_TYPE_SEQUENCE_HEADER: u8 = 0;

impl MediaUnit {
    pub fn new(kind: TagKind, timestamp: u32, payload: Bytes) -> Self {
        Self {
            kind,
            timestamp,
            payload,
        }
    }

    /// Create a video unit
    pub fn video(timestamp: u32, payload: Bytes) -> Self {
        Self::new(TagKind::Video, timestamp, payload)
    }

    /// Create an audio unit
    pub fn audio(timestamp: u32, payload: Bytes) -> Self {
        Self::new(TagKind::Audio, timestamp, payload)
    }

    /// Create a script data unit (onMetaData)
    pub fn script(timestamp: u32, payload: Bytes) -> Self {
        Self::new(TagKind::Script, timestamp, payload)
    }

    pub fn is_video(&self) -> bool {
        self.kind == TagKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind == TagKind::Audio
    }

    pub fn is_script(&self) -> bool {
        self.kind == TagKind::Script
    }

    /// Payload length in bytes
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// First body byte of a non-empty unit of the given kind
    fn lead_byte(&self, kind: TagKind) -> Option<u8> {
        if self.kind == kind {
            self.payload.first().copied()
        } else {
            None
        }
    }

    /// Second body byte: AVCPacketType / AACPacketType
    fn packet_type(&self) -> Option<u8> {
        self.payload.get(1).copied()
    }

    /// Video frame type (upper 4 bits of the first byte)
    pub fn frame_type(&self) -> Option<u8> {
        self.lead_byte(TagKind::Video).map(|b| b >> 4)
    }

    /// Video codec id (lower 4 bits of the first byte)
    pub fn video_codec_id(&self) -> Option<u8> {
        self.lead_byte(TagKind::Video).map(|b| b & 0x0F)
    }

    /// Audio sound format (upper 4 bits of the first byte)
    pub fn sound_format(&self) -> Option<u8> {
        self.lead_byte(TagKind::Audio).map(|b| b >> 4)
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(
            self.frame_type(),
            Some(FRAME_TYPE_KEY | FRAME_TYPE_GENERATED_KEY)
        )
    }

    /// AVCDecoderConfigurationRecord carrier
    pub fn is_avc_sequence_header(&self) -> bool {
        self.video_codec_id() == Some(VIDEO_CODEC_AVC)
            && self.packet_type() == Some(PACKET_TYPE_SEQUENCE_HEADER)
    }

    /// AudioSpecificConfig carrier
    pub fn is_aac_sequence_header(&self) -> bool {
        self.sound_format() == Some(AUDIO_FORMAT_AAC)
            && self.packet_type() == Some(PACKET_TYPE_SEQUENCE_HEADER)
    }

    /// Codec initialization data of either media type
    pub fn is_sequence_header(&self) -> bool {
        self.is_avc_sequence_header() || self.is_aac_sequence_header()
    }
}
