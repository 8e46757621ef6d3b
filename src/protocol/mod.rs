//! Protocol module - dock event wire format and decoding.
//!
//! This module implements the event layer carried over a link:
//! - 16-byte header encoding/decoding and command tags
//! - [`DockEvent`] value type with padded and segmented payloads
//! - [`EventBuffer`] for accumulating partial reads

mod event;
mod event_buffer;
mod wire_format;

pub use event::{DockEvent, DEFAULT_STREAM_SEGMENT_SIZE};
pub use event_buffer::{Decoded, EventBuffer};
pub use wire_format::{
    commands, padding_for, status, EventHeader, Tag, DEFAULT_MAX_PAYLOAD_SIZE, EVENT_HEADER_SIZE,
    INDETERMINATE_LENGTH, NEWT_EVENT_CLASS, SEGMENT_PREFIX_SIZE, TOOLKIT_EVENT_ID,
};
