//! Dock event wire format.
//!
//! Every event starts with a 16-byte header:
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │ Class    │ Id       │ Tag      │ Length   │
//! │ 'newt'   │ 'ntp '   │ command  │ uint32 BE│
//! └──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! The payload follows, padded with zeroes so the next header starts on a
//! 4-byte boundary. A length of `0xFFFFFFFF` announces a streamed payload:
//! a run of segments, each a big-endian `u32` length, the data and padding,
//! terminated by a zero-length segment.
//!
//! All multi-byte integers are Big Endian.

use std::fmt;

use crate::error::{DockError, Result};

/// Header size in bytes (fixed, exactly 16).
pub const EVENT_HEADER_SIZE: usize = 16;

/// Length sentinel for a streamed payload.
pub const INDETERMINATE_LENGTH: u32 = 0xFFFF_FFFF;

/// Default maximum payload size (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Size of a streamed segment's length prefix.
pub const SEGMENT_PREFIX_SIZE: usize = 4;

/// Event class shared by every dock event.
pub const NEWT_EVENT_CLASS: Tag = Tag::new(*b"newt");

/// Event id of the toolkit protocol.
pub const TOOLKIT_EVENT_ID: Tag = Tag::new(*b"ntp ");

/// Four-character code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub [u8; 4]);

impl Tag {
    pub const fn new(code: [u8; 4]) -> Self {
        Self(code)
    }

    pub const fn from_u32(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    pub const fn as_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl From<&[u8; 4]> for Tag {
    fn from(code: &[u8; 4]) -> Self {
        Self(*code)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag('{}')", self)
    }
}

/// Toolkit protocol commands.
pub mod commands {
    use super::Tag;

    // Newton -> desktop
    pub const CONNECT: Tag = Tag::new(*b"cnnt");
    pub const DOWNLOAD: Tag = Tag::new(*b"dpkg");
    pub const TEXT: Tag = Tag::new(*b"text");
    pub const RESULT: Tag = Tag::new(*b"rslt");
    pub const EOM: Tag = Tag::new(*b"teom");
    pub const ENTER_BREAK_LOOP: Tag = Tag::new(*b"eext");
    pub const EXIT_BREAK_LOOP: Tag = Tag::new(*b"bext");
    pub const EXCEPTION_ERROR: Tag = Tag::new(*b"eerr");
    pub const EXCEPTION_MESSAGE: Tag = Tag::new(*b"estr");
    pub const EXCEPTION_REF: Tag = Tag::new(*b"eref");

    // Desktop -> Newton
    pub const OK: Tag = Tag::new(*b"okln");
    pub const EXECUTE: Tag = Tag::new(*b"lscb");
    pub const SET_TIMEOUT: Tag = Tag::new(*b"stou");
    pub const DELETE_PACKAGE: Tag = Tag::new(*b"pkgX");
    pub const LOAD_PACKAGE: Tag = Tag::new(*b"pkg ");

    // Either direction
    pub const OBJECT: Tag = Tag::new(*b"fobj");
    pub const CODE: Tag = Tag::new(*b"code");
    pub const TERMINATE: Tag = Tag::new(*b"term");
}

/// Status codes carried in `rslt` payloads.
pub mod status {
    pub const OK: i32 = 0;

    const DOCKER: i32 = -28000;
    pub const BAD_STORE_SIGNATURE: i32 = DOCKER - 1;
    pub const BAD_ENTRY: i32 = DOCKER - 2;
    pub const ABORTED: i32 = DOCKER - 3;
    pub const BAD_QUERY: i32 = DOCKER - 4;
    pub const READ_ENTRY_ERROR: i32 = DOCKER - 5;
    pub const BAD_CURRENT_SOUP: i32 = DOCKER - 6;
    pub const BAD_COMMAND_LENGTH: i32 = DOCKER - 7;
    pub const ENTRY_NOT_FOUND: i32 = DOCKER - 8;
    pub const BAD_CONNECTION: i32 = DOCKER - 9;
    pub const FILE_NOT_FOUND: i32 = DOCKER - 10;
    pub const INCOMPATIBLE_PROTOCOL: i32 = DOCKER - 11;
    pub const PROTOCOL_ERROR: i32 = DOCKER - 12;
    pub const DOCKING_CANCELED: i32 = DOCKER - 13;
    pub const STORE_NOT_FOUND: i32 = DOCKER - 14;
    pub const SOUP_NOT_FOUND: i32 = DOCKER - 15;
    pub const BAD_HEADER: i32 = DOCKER - 16;
    pub const OUT_OF_MEMORY: i32 = DOCKER - 17;
    pub const NEWTON_VERSION_TOO_NEW: i32 = DOCKER - 18;
    pub const PACKAGE_CANT_LOAD: i32 = DOCKER - 19;
    pub const PROTOCOL_EXT_ALREADY_REGISTERED: i32 = DOCKER - 20;
    pub const REMOTE_IMPORT_ERROR: i32 = DOCKER - 21;
    pub const BAD_PASSWORD: i32 = DOCKER - 22;
    pub const RETRY_PASSWORD: i32 = DOCKER - 23;
    pub const IDLE_TOO_LONG: i32 = DOCKER - 24;
    pub const OUT_OF_POWER: i32 = DOCKER - 25;
    pub const BAD_CURSOR: i32 = DOCKER - 26;
    pub const ALREADY_BUSY: i32 = DOCKER - 27;
    pub const DESKTOP_ERROR: i32 = DOCKER - 28;
    pub const CANT_CONNECT_TO_MODEM: i32 = DOCKER - 29;
    pub const DISCONNECTED: i32 = DOCKER - 30;
    pub const ACCESS_DENIED: i32 = DOCKER - 31;

    const PLATFORM: i32 = DOCKER - 100;
    pub const DISCONNECT_DURING_READ: i32 = PLATFORM;
    pub const READ_FAILED: i32 = PLATFORM - 1;
    pub const COMMUNICATIONS_TOOL_NOT_FOUND: i32 = PLATFORM - 2;
    pub const INVALID_MODEM_TOOL_VERSION: i32 = PLATFORM - 3;
    pub const CARD_NOT_INSTALLED: i32 = PLATFORM - 4;
    pub const BROWSER_FILE_NOT_FOUND: i32 = PLATFORM - 5;
    pub const BROWSER_VOLUME_NOT_FOUND: i32 = PLATFORM - 6;
    pub const BROWSER_PATH_NOT_FOUND: i32 = PLATFORM - 7;
}

/// Bytes of zero padding after `len` payload bytes.
#[inline]
pub const fn padding_for(len: usize) -> usize {
    (4 - (len & 3)) & 3
}

/// Decoded event header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub class: Tag,
    pub id: Tag,
    /// Command code.
    pub tag: Tag,
    /// Payload length, or [`INDETERMINATE_LENGTH`].
    pub length: u32,
}

impl EventHeader {
    /// Create a toolkit protocol header.
    pub fn new(tag: Tag, length: u32) -> Self {
        Self {
            class: NEWT_EVENT_CLASS,
            id: TOOLKIT_EVENT_ID,
            tag,
            length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use newtdock::protocol::{commands, EventHeader};
    ///
    /// let bytes = EventHeader::new(commands::CONNECT, 0).encode();
    /// assert_eq!(&bytes[..12], b"newtntp cnnt");
    /// assert_eq!(&bytes[12..], &[0, 0, 0, 0]);
    /// ```
    pub fn encode(&self) -> [u8; EVENT_HEADER_SIZE] {
        let mut buf = [0u8; EVENT_HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `EVENT_HEADER_SIZE` (16 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= EVENT_HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.class.0);
        buf[4..8].copy_from_slice(&self.id.0);
        buf[8..12].copy_from_slice(&self.tag.0);
        buf[12..16].copy_from_slice(&self.length.to_be_bytes());
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < EVENT_HEADER_SIZE {
            return None;
        }
        let tag = |i: usize| Tag([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Some(Self {
            class: tag(0),
            id: tag(4),
            tag: tag(8),
            length: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// Check the header belongs to the toolkit protocol and its payload is
    /// within bounds.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.class != NEWT_EVENT_CLASS || self.id != TOOLKIT_EVENT_ID {
            return Err(DockError::ProtocolMismatch {
                class: self.class,
                id: self.id,
            });
        }
        if !self.is_indeterminate() && self.length > max_payload_size {
            return Err(DockError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.length, max_payload_size
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn is_indeterminate(&self) -> bool {
        self.length == INDETERMINATE_LENGTH
    }
}
