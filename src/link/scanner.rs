//! Byte-level frame scanner.
//!
//! Pulls raw bytes out of the inbound ring, strips the start/end sequences and
//! DLE stuffing, and stages the unescaped body in the frame ring. When the CRC
//! trailer has been read the staged body is published with a marker whose aux
//! value says whether the checksum matched, so the engine can pull exactly one
//! frame at a time and drop corrupt ones without copying them.
//!
//! All state survives between calls: a DLE at the very end of one read is
//! remembered in `escaped`, and a byte that terminated a broken frame is kept
//! in `stacked` so it can be replayed as a possible start of the next one.

use super::crc::Crc16;
use super::frame::{DLE, ETX, MAX_FRAME_SIZE, STX, SYN};
use crate::buffer::CircleBuffer;
use crate::error::{DockError, Result};

/// Marker aux value for a frame whose CRC matched.
pub const CRC_OK: u32 = 1;
/// Marker aux value for a frame whose CRC did not match.
pub const CRC_BAD: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Matching SYN DLE STX; `matched` bytes seen so far.
    AwaitSync { matched: u8 },
    /// Reading header bytes; `remaining` is unknown until the length byte.
    InHeader { remaining: Option<u8> },
    InBody,
    /// DLE ETX seen, reading the two CRC bytes.
    InTrailer { low: Option<u8> },
}

#[derive(Debug)]
pub struct FrameScanner {
    state: State,
    escaped: bool,
    stacked: Option<u8>,
    crc: Crc16,
    body_len: usize,
    max_body: usize,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::with_max_body(MAX_FRAME_SIZE)
    }

    pub fn with_max_body(max_body: usize) -> Self {
        Self {
            state: State::AwaitSync { matched: 0 },
            escaped: false,
            stacked: None,
            crc: Crc16::new(),
            body_len: 0,
            max_body,
        }
    }

    /// Forget any partially scanned frame.
    pub fn reset(&mut self) {
        self.state = State::AwaitSync { matched: 0 };
        self.escaped = false;
        self.stacked = None;
        self.crc.reset();
        self.body_len = 0;
    }

    /// Whether the scanner is between frames.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::AwaitSync { matched: 0 }) && self.stacked.is_none()
    }

    fn resync(&mut self, replay: Option<u8>) {
        self.state = State::AwaitSync { matched: 0 };
        self.escaped = false;
        self.body_len = 0;
        self.stacked = replay;
    }

    fn next_raw(&mut self, raw: &mut CircleBuffer) -> Option<u8> {
        match self.stacked.take() {
            Some(byte) => Some(byte),
            None => raw.get_next_byte().ok(),
        }
    }

    fn stage(&mut self, frames: &mut CircleBuffer, byte: u8) -> bool {
        if self.body_len >= self.max_body {
            tracing::debug!("link frame exceeds {} bytes, resyncing", self.max_body);
            self.resync(None);
            return false;
        }
        if frames.put_next_possible(byte).is_err() {
            tracing::debug!("frame ring full, dropping frame");
            self.resync(None);
            return false;
        }
        self.crc.update_byte(byte);
        self.body_len += 1;
        true
    }

    /// Scan raw bytes until one frame is complete or the raw ring is empty.
    ///
    /// Returns `true` when a frame (good or bad CRC) was published to
    /// `frames`. The caller should drain `frames` and call again.
    pub fn scan(&mut self, raw: &mut CircleBuffer, frames: &mut CircleBuffer) -> Result<bool> {
        while let Some(byte) = self.next_raw(raw) {
            match self.state {
                State::AwaitSync { matched } => {
                    self.state = match (matched, byte) {
                        (0, SYN) => State::AwaitSync { matched: 1 },
                        (1, DLE) => State::AwaitSync { matched: 2 },
                        (2, STX) => {
                            frames.put_next_start();
                            self.crc.reset();
                            self.body_len = 0;
                            self.escaped = false;
                            State::InHeader { remaining: None }
                        }
                        (_, SYN) => State::AwaitSync { matched: 1 },
                        _ => State::AwaitSync { matched: 0 },
                    };
                }
                State::InHeader { .. } | State::InBody => {
                    if self.escaped {
                        self.escaped = false;
                        match byte {
                            DLE => {}
                            ETX => {
                                if !matches!(self.state, State::InBody) {
                                    tracing::debug!("link frame ended inside its header");
                                    self.resync(None);
                                    continue;
                                }
                                self.crc.update_byte(ETX);
                                self.state = State::InTrailer { low: None };
                                continue;
                            }
                            other => {
                                tracing::debug!(
                                    "unexpected DLE {:#04x} inside link frame, resyncing",
                                    other
                                );
                                self.resync(Some(other));
                                continue;
                            }
                        }
                    } else if byte == DLE {
                        self.escaped = true;
                        continue;
                    }

                    if !self.stage(frames, byte) {
                        continue;
                    }
                    let current = self.state;
                    if current == (State::InHeader { remaining: None }) && byte == 0 {
                        tracing::debug!("link header length is zero, resyncing");
                        self.resync(None);
                        continue;
                    }
                    self.state = match current {
                        State::InHeader { remaining: None } => State::InHeader {
                            remaining: Some(byte),
                        },
                        State::InHeader {
                            remaining: Some(1),
                        } => State::InBody,
                        State::InHeader {
                            remaining: Some(n),
                        } => State::InHeader {
                            remaining: Some(n - 1),
                        },
                        other => other,
                    };
                }
                State::InTrailer { low: None } => {
                    self.state = State::InTrailer { low: Some(byte) };
                }
                State::InTrailer { low: Some(low) } => {
                    let received = u16::from_le_bytes([low, byte]);
                    let computed = self.crc.value();
                    let aux = if received == computed { CRC_OK } else { CRC_BAD };
                    if aux == CRC_BAD {
                        tracing::debug!(
                            "{}",
                            DockError::CrcMismatch {
                                expected: computed,
                                got: received,
                            }
                        );
                    }
                    self.resync(None);
                    match frames.put_next_eom(aux) {
                        Ok(()) => return Ok(true),
                        Err(DockError::MarkersFull) => {
                            tracing::debug!("frame markers full, dropping frame");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(false)
    }
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}
