//! MNP-style link layer for unreliable byte streams.
//!
//! - [`Crc16`]: frame checksum
//! - [`LinkFrame`]: frame bodies and wire framing
//! - [`FrameScanner`]: delimiter scanning and DLE unstuffing
//! - [`LinkEngine`]: link establishment, ARQ and timers

mod crc;
mod engine;
mod frame;
mod scanner;

pub use crc::Crc16;
pub use engine::{DisconnectReason, LinkEngine, LinkEvent, LinkState, LinkStats, Role};
pub use frame::{
    write_framed, FrameKind, LinkFrame, DLE, ETX, FRAME_START, MAX_FRAME_SIZE, MAX_PACKET_SIZE,
    STX, SYN,
};
pub use scanner::{FrameScanner, CRC_BAD, CRC_OK};
