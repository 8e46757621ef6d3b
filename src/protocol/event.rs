//! Dock event value type.
//!
//! An event is a command tag plus an optional payload. Events with a known
//! payload size carry it in the header; indeterminate events announce
//! `0xFFFFFFFF` and stream their payload in length-prefixed segments.
//!
//! # Example
//!
//! ```
//! use newtdock::protocol::{commands, status, DockEvent};
//!
//! let reply = DockEvent::with_value(commands::RESULT, status::OK);
//! assert_eq!(reply.length(), 4);
//! assert_eq!(reply.value(), Some(0));
//!
//! let bytes = reply.encode();
//! assert_eq!(&bytes[8..12], b"rslt");
//! ```

use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{
    padding_for, EventHeader, Tag, EVENT_HEADER_SIZE, INDETERMINATE_LENGTH, SEGMENT_PREFIX_SIZE,
};
use crate::error::{DockError, Result};

/// Segment size used for streamed payloads unless configured otherwise.
pub const DEFAULT_STREAM_SEGMENT_SIZE: usize = 240;

/// A complete dock event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockEvent {
    header: EventHeader,
    payload: BytesMut,
}

/// Header length for a payload of `len` bytes.
fn payload_length(len: usize) -> Result<u32> {
    match u32::try_from(len) {
        Ok(length) if length != INDETERMINATE_LENGTH => Ok(length),
        _ => Err(DockError::Protocol(format!(
            "payload of {} bytes is too large for one event",
            len
        ))),
    }
}

impl DockEvent {
    /// Bare command with no payload.
    pub fn new(tag: Tag) -> Self {
        Self {
            header: EventHeader::new(tag, 0),
            payload: BytesMut::new(),
        }
    }

    /// Command carrying one big-endian 32-bit integer.
    pub fn with_value(tag: Tag, value: i32) -> Self {
        Self {
            header: EventHeader::new(tag, 4),
            payload: BytesMut::from(&value.to_be_bytes()[..]),
        }
    }

    /// Command carrying `data` with its length in the header.
    ///
    /// Fails when the length does not fit below the streamed-payload sentinel.
    pub fn with_data(tag: Tag, data: impl AsRef<[u8]>) -> Result<Self> {
        let data = data.as_ref();
        Ok(Self {
            header: EventHeader::new(tag, payload_length(data.len())?),
            payload: BytesMut::from(data),
        })
    }

    /// Command whose payload is streamed in segments.
    pub fn indeterminate(tag: Tag) -> Self {
        Self {
            header: EventHeader::new(tag, INDETERMINATE_LENGTH),
            payload: BytesMut::new(),
        }
    }

    /// Append to an indeterminate payload.
    pub fn add_indeterminate_data(&mut self, data: &[u8]) {
        debug_assert!(self.is_indeterminate());
        self.payload.extend_from_slice(data);
    }

    /// Command carrying the contents of a file.
    pub async fn from_file(tag: Tag, path: impl AsRef<Path>) -> Result<Self> {
        let data = tokio::fs::read(path.as_ref()).await?;
        Self::with_data(tag, data)
    }

    /// Reassemble an event read off the wire.
    pub fn from_parts(header: EventHeader, payload: BytesMut) -> Self {
        Self { header, payload }
    }

    #[inline]
    pub fn header(&self) -> &EventHeader {
        &self.header
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        self.header.tag
    }

    /// Command tag as text, e.g. `"cnnt"`.
    pub fn command(&self) -> String {
        self.header.tag.to_string()
    }

    /// Header length field; `0xFFFFFFFF` for streamed payloads.
    #[inline]
    pub fn length(&self) -> u32 {
        self.header.length
    }

    #[inline]
    pub fn is_indeterminate(&self) -> bool {
        self.header.is_indeterminate()
    }

    /// Payload bytes actually carried.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn data_len(&self) -> usize {
        self.payload.len()
    }

    /// Leading 32-bit integer of the payload, as carried by `rslt`.
    pub fn value(&self) -> Option<i32> {
        let bytes: [u8; 4] = self.payload.get(..4)?.try_into().ok()?;
        Some(i32::from_be_bytes(bytes))
    }

    /// Bytes on the wire, including padding and stream segments.
    pub fn encoded_len(&self, segment_size: usize) -> usize {
        let len = self.payload.len();
        if !self.is_indeterminate() {
            return EVENT_HEADER_SIZE + len + padding_for(len);
        }
        let segment_size = segment_size.max(1);
        let full = len / segment_size;
        let tail = len % segment_size;
        let mut total = EVENT_HEADER_SIZE + SEGMENT_PREFIX_SIZE;
        total += full * (SEGMENT_PREFIX_SIZE + segment_size + padding_for(segment_size));
        if tail > 0 {
            total += SEGMENT_PREFIX_SIZE + tail + padding_for(tail);
        }
        total
    }

    /// Encode with the default stream segment size.
    pub fn encode(&self) -> Bytes {
        self.encode_with_segment_size(DEFAULT_STREAM_SEGMENT_SIZE)
    }

    pub fn encode_with_segment_size(&self, segment_size: usize) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len(segment_size));
        self.encode_into(&mut buf, segment_size);
        buf.freeze()
    }

    /// Append the encoded event to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut, segment_size: usize) {
        buf.put_slice(&self.header.encode());
        if !self.is_indeterminate() {
            buf.put_slice(&self.payload);
            buf.put_bytes(0, padding_for(self.payload.len()));
            return;
        }
        for segment in self.payload.chunks(segment_size.max(1)) {
            buf.put_u32(segment.len() as u32);
            buf.put_slice(segment);
            buf.put_bytes(0, padding_for(segment.len()));
        }
        buf.put_u32(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands;

    #[test]
    fn test_bare_command_layout() {
        let bytes = DockEvent::new(commands::CONNECT).encode();
        assert_eq!(&bytes[..], b"newtntp cnnt\0\0\0\0");
    }

    #[test]
    fn test_value_is_big_endian() {
        let event = DockEvent::with_value(commands::SET_TIMEOUT, -2);
        assert_eq!(event.payload(), &[0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(event.value(), Some(-2));
    }

    #[test]
    fn test_data_is_padded() {
        let event = DockEvent::with_data(commands::TEXT, b"hello").unwrap();
        let bytes = event.encode();

        assert_eq!(event.length(), 5);
        assert_eq!(bytes.len(), 16 + 8);
        assert_eq!(&bytes[16..21], b"hello");
        assert_eq!(&bytes[21..], &[0, 0, 0]);
        assert_eq!(event.encoded_len(DEFAULT_STREAM_SEGMENT_SIZE), bytes.len());
    }

    #[test]
    fn test_indeterminate_segments() {
        let mut event = DockEvent::indeterminate(commands::OBJECT);
        event.add_indeterminate_data(b"abcdef");
        event.add_indeterminate_data(b"g");
        let bytes = event.encode_with_segment_size(4);

        let mut expected = EventHeader::new(commands::OBJECT, INDETERMINATE_LENGTH)
            .encode()
            .to_vec();
        expected.extend_from_slice(&[0, 0, 0, 4, b'a', b'b', b'c', b'd']);
        expected.extend_from_slice(&[0, 0, 0, 3, b'e', b'f', b'g', 0]);
        expected.extend_from_slice(&[0, 0, 0, 0]);

        assert_eq!(&bytes[..], &expected[..]);
        assert_eq!(event.encoded_len(4), expected.len());
    }

    #[test]
    fn test_empty_indeterminate_is_just_terminator() {
        let event = DockEvent::indeterminate(commands::CODE);
        assert_eq!(event.encode().len(), 16 + 4);
    }

    #[test]
    fn test_payload_length_stays_below_sentinel() {
        assert_eq!(payload_length(0).unwrap(), 0);
        assert_eq!(payload_length(0xFFFF_FFFE).unwrap(), 0xFFFF_FFFE);
        assert!(matches!(
            payload_length(INDETERMINATE_LENGTH as usize),
            Err(DockError::Protocol(_))
        ));
        if let Some(len) = (INDETERMINATE_LENGTH as usize).checked_add(2) {
            assert!(payload_length(len).is_err());
        }
    }

    #[test]
    fn test_value_of_short_payload() {
        assert_eq!(DockEvent::with_data(commands::RESULT, [1, 2]).unwrap().value(), None);
        assert_eq!(DockEvent::new(commands::RESULT).value(), None);
    }

    #[tokio::test]
    async fn test_from_file() {
        let path = std::env::temp_dir().join(format!("newtdock-event-{}", std::process::id()));
        tokio::fs::write(&path, b"package bytes").await.unwrap();

        let event = DockEvent::from_file(commands::LOAD_PACKAGE, &path).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(event.command(), "pkg ");
        assert_eq!(event.payload(), b"package bytes");
        assert_eq!(event.length(), 13);
    }

    #[tokio::test]
    async fn test_from_missing_file() {
        let result = DockEvent::from_file(commands::LOAD_PACKAGE, "/nonexistent/newtdock").await;
        assert!(matches!(result, Err(DockError::Io(_))));
    }
}
