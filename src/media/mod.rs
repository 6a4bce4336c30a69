//! Media handling for the relay
//!
//! This module provides:
//! - The media unit type and codec inspection helpers
//! - FLV tag framing for viewers
//! - FLV stream reading for ingest

pub mod encoder;
pub mod flv;
pub mod reader;

pub use encoder::{flv_header, render_header, RenderError, TagPrefix};
pub use flv::{MediaUnit, TagKind};
pub use reader::FlvReader;
