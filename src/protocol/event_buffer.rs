//! Event buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for buffer management. Decoding is a cursor that
//! never waits: [`EventBuffer::poll_decode`] hands out the header as soon as
//! 16 bytes are present and then payload chunks as they arrive, returning
//! `None` whenever it needs more input.
//!
//! - `WaitingForHeader`: need 16 bytes
//! - `WaitingForPayload`: fixed-length payload (plus padding) in progress
//! - `WaitingForSegmentLength` / `WaitingForSegment`: streamed payload
//!
//! An event with foreign class/id or an oversized payload is reported once as
//! an error and its payload skipped, so the stream stays in sync.
//!
//! # Example
//!
//! ```
//! use newtdock::protocol::{commands, DockEvent, EventBuffer};
//!
//! let mut buffer = EventBuffer::new();
//! let bytes = DockEvent::with_value(commands::RESULT, 0).encode();
//!
//! assert!(buffer.push(&bytes[..10]).unwrap().is_empty());
//! let events = buffer.push(&bytes[10..]).unwrap();
//! assert_eq!(events[0].tag(), commands::RESULT);
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::event::DockEvent;
use super::wire_format::{
    padding_for, EventHeader, DEFAULT_MAX_PAYLOAD_SIZE, EVENT_HEADER_SIZE, SEGMENT_PREFIX_SIZE,
};
use crate::error::{DockError, Result};

/// Largest up-front allocation for an incoming payload.
const MAX_PREALLOCATION: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForPayload { remaining: u32, padding: u8 },
    WaitingForSegmentLength,
    WaitingForSegment { remaining: u32, padding: u8 },
}

/// One step of decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Header(EventHeader),
    /// Payload bytes in arrival order.
    Data(Bytes),
    /// The event announced by the last header is complete.
    End,
}

/// Buffer for accumulating incoming bytes and extracting complete events.
pub struct EventBuffer {
    buffer: BytesMut,
    state: State,
    max_payload_size: u32,
    /// Event being assembled by `next_event`.
    current: Option<(EventHeader, BytesMut)>,
    /// Payload of a rejected event is being skipped.
    discarding: bool,
    /// Rejection held back by `push` so the events ahead of it are returned.
    deferred: Option<DockError>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            state: State::WaitingForHeader,
            max_payload_size,
            current: None,
            discarding: false,
            deferred: None,
        }
    }

    /// Push data into the buffer and extract all complete events.
    ///
    /// Stops at the first rejected event. Events decoded ahead of it are
    /// returned and the rejection is reported by the next call; bytes after
    /// it stay buffered and are decoded by the call after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<DockEvent>> {
        self.extend(data);
        if let Some(e) = self.deferred.take() {
            return Err(e);
        }
        let mut events = Vec::new();
        loop {
            match self.next_event() {
                Ok(Some(event)) => events.push(event),
                Ok(None) => break,
                Err(e) if events.is_empty() => return Err(e),
                Err(e) => {
                    self.deferred = Some(e);
                    break;
                }
            }
        }
        Ok(events)
    }

    /// Append data without decoding.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Assemble the next complete event, if the buffer holds one.
    pub fn next_event(&mut self) -> Result<Option<DockEvent>> {
        loop {
            match self.poll_decode()? {
                None => return Ok(None),
                Some(Decoded::Header(header)) => {
                    let capacity = if header.is_indeterminate() {
                        0
                    } else {
                        (header.length as usize).min(MAX_PREALLOCATION)
                    };
                    self.current = Some((header, BytesMut::with_capacity(capacity)));
                }
                Some(Decoded::Data(data)) => {
                    let Some((header, payload)) = self.current.as_mut() else {
                        continue;
                    };
                    payload.extend_from_slice(&data);
                    if payload.len() > self.max_payload_size as usize {
                        let (tag, len) = (header.tag, payload.len());
                        self.current = None;
                        self.discarding = true;
                        return Err(DockError::Protocol(format!(
                            "streamed payload of '{}' exceeds maximum {} ({} bytes so far)",
                            tag, self.max_payload_size, len
                        )));
                    }
                }
                Some(Decoded::End) => {
                    if let Some((header, payload)) = self.current.take() {
                        return Ok(Some(DockEvent::from_parts(header, payload)));
                    }
                }
            }
        }
    }

    /// Advance the decoding cursor by one step.
    pub fn poll_decode(&mut self) -> Result<Option<Decoded>> {
        loop {
            let step = match self.state {
                State::WaitingForHeader => return self.decode_header(),
                State::WaitingForPayload { remaining, padding } => {
                    match self.take_payload(remaining, padding) {
                        None => return Ok(None),
                        Some((Some(data), left)) => {
                            self.state = State::WaitingForPayload {
                                remaining: left,
                                padding,
                            };
                            Decoded::Data(data)
                        }
                        Some((None, _)) => {
                            self.state = State::WaitingForHeader;
                            Decoded::End
                        }
                    }
                }
                State::WaitingForSegmentLength => {
                    if self.buffer.len() < SEGMENT_PREFIX_SIZE {
                        return Ok(None);
                    }
                    let len = self.buffer.get_u32();
                    if len == 0 {
                        self.state = State::WaitingForHeader;
                        Decoded::End
                    } else {
                        self.state = State::WaitingForSegment {
                            remaining: len,
                            padding: padding_for(len as usize) as u8,
                        };
                        continue;
                    }
                }
                State::WaitingForSegment { remaining, padding } => {
                    match self.take_payload(remaining, padding) {
                        None => return Ok(None),
                        Some((Some(data), left)) => {
                            self.state = State::WaitingForSegment {
                                remaining: left,
                                padding,
                            };
                            Decoded::Data(data)
                        }
                        Some((None, _)) => {
                            self.state = State::WaitingForSegmentLength;
                            continue;
                        }
                    }
                }
            };
            match step {
                Decoded::Data(_) if self.discarding => continue,
                Decoded::End if self.discarding => {
                    self.discarding = false;
                    continue;
                }
                step => return Ok(Some(step)),
            }
        }
    }

    fn decode_header(&mut self) -> Result<Option<Decoded>> {
        let Some(header) = EventHeader::decode(&self.buffer) else {
            return Ok(None);
        };
        self.buffer.advance(EVENT_HEADER_SIZE);

        self.state = if header.is_indeterminate() {
            State::WaitingForSegmentLength
        } else {
            State::WaitingForPayload {
                remaining: header.length,
                padding: padding_for(header.length as usize) as u8,
            }
        };

        if let Err(e) = header.validate(self.max_payload_size) {
            tracing::debug!("skipping rejected '{}' event: {}", header.tag, e);
            self.discarding = true;
            return Err(e);
        }
        Ok(Some(Decoded::Header(header)))
    }

    /// Take up to `remaining` payload bytes.
    ///
    /// Returns `None` when nothing can be consumed yet, `Some((Some(data),
    /// left))` for a chunk, or `Some((None, 0))` once the payload and its
    /// padding have been consumed.
    fn take_payload(&mut self, remaining: u32, padding: u8) -> Option<(Option<Bytes>, u32)> {
        if remaining == 0 {
            if self.buffer.len() < padding as usize {
                return None;
            }
            self.buffer.advance(padding as usize);
            return Some((None, 0));
        }
        let n = self.buffer.len().min(remaining as usize);
        if n == 0 {
            return None;
        }
        let data = self.buffer.split_to(n).freeze();
        Some((Some(data), remaining - n as u32))
    }

    /// Whether an event header has been seen but its payload is incomplete.
    pub fn is_partial(&self) -> bool {
        !matches!(self.state, State::WaitingForHeader) || !self.buffer.is_empty()
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
        self.current = None;
        self.discarding = false;
        self.deferred = None;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
            State::WaitingForSegmentLength => "WaitingForSegmentLength",
            State::WaitingForSegment { .. } => "WaitingForSegment",
        }
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBuffer")
            .field("buffered", &self.buffer.len())
            .field("state", &self.state)
            .field("discarding", &self.discarding)
            .finish()
    }
}
