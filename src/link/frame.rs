//! Link frame bodies and wire framing.
//!
//! Every frame on the wire looks like this:
//!
//! ```text
//! ┌──────────────┬──────────┬──────┬──────────────────┬─────────┬──────────┐
//! │ SYN DLE STX  │ hdr len  │ type │ header params /  │ DLE ETX │ CRC16    │
//! │ 16 10 02     │ 1 byte   │      │ data (DLE → DLE  │ 10 03   │ lo, hi   │
//! │              │          │      │ DLE)             │         │          │
//! └──────────────┴──────────┴──────┴──────────────────┴─────────┴──────────┘
//! ```
//!
//! The header length byte counts the header bytes that follow it, so LT data
//! starts at `body[hdr_len + 1]`. The CRC covers the unescaped body and the
//! ETX byte.

use bytes::{BufMut, Bytes, BytesMut};

use super::crc::Crc16;
use crate::error::{DockError, Result};

pub const SYN: u8 = 0x16;
pub const DLE: u8 = 0x10;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// Frame start sequence.
pub const FRAME_START: [u8; 3] = [SYN, DLE, STX];

/// Largest data field carried by one LT frame.
pub const MAX_PACKET_SIZE: usize = 256;

/// Worst-case escaped frame size for a full packet.
pub const MAX_FRAME_SIZE: usize = MAX_PACKET_SIZE * 2 + 10;

/// Disconnect reason byte for a user-requested teardown.
pub const DISCONNECT_USER_REQUEST: u8 = 0xFF;

/// LR header as sent by the legacy desktop stack. Byte 16 carries the
/// window size and bytes 19..21 the N401 value; both are patched per link.
const LR_HEADER: [u8; 24] = [
    23, 0x01, 0x02, // header length, LR, constant parameter
    0x01, 0x06, 0x01, 0x00, 0x00, 0x00, 0x00, 0xFF, // parameter 1
    0x02, 0x01, 0x02, // framing mode
    0x03, 0x01, 0x08, // window (k)
    0x04, 0x02, 0x40, 0x00, // N401
    0x08, 0x01, 0x03, // data phase optimisation
];
const LR_WINDOW_OFFSET: usize = 16;
const LR_MAX_INFO_OFFSET: usize = 19;

/// N401 advertised in LR; the usable packet size is agreed by LN/LNA.
pub const LR_DEFAULT_MAX_INFO: u16 = 64;

const PARAM_WINDOW: u8 = 0x03;
const PARAM_MAX_INFO: u8 = 0x04;
const PARAM_PACKET_SIZE: u8 = 0x01;

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// LR
    LinkRequest = 1,
    /// LD
    LinkDisconnect = 2,
    /// LT
    LinkTransfer = 4,
    /// LA
    LinkAck = 5,
    /// LN
    LinkNegotiate = 6,
    /// LNA
    LinkNegotiateAck = 7,
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::LinkRequest),
            2 => Some(Self::LinkDisconnect),
            4 => Some(Self::LinkTransfer),
            5 => Some(Self::LinkAck),
            6 => Some(Self::LinkNegotiate),
            7 => Some(Self::LinkNegotiateAck),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::LinkRequest => "LR",
            Self::LinkDisconnect => "LD",
            Self::LinkTransfer => "LT",
            Self::LinkAck => "LA",
            Self::LinkNegotiate => "LN",
            Self::LinkNegotiateAck => "LNA",
        }
    }
}

/// A parsed link frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFrame {
    Request { window: u8, max_info: u16 },
    Disconnect { reason: u8 },
    Transfer { sequence: u8, data: Bytes },
    Ack { sequence: u8, credit: u8 },
    Negotiate { sequence: u8, packet_size: u16 },
    NegotiateAck { sequence: u8, packet_size: u16 },
}

impl LinkFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Request { .. } => FrameKind::LinkRequest,
            Self::Disconnect { .. } => FrameKind::LinkDisconnect,
            Self::Transfer { .. } => FrameKind::LinkTransfer,
            Self::Ack { .. } => FrameKind::LinkAck,
            Self::Negotiate { .. } => FrameKind::LinkNegotiate,
            Self::NegotiateAck { .. } => FrameKind::LinkNegotiateAck,
        }
    }

    /// Sequence number carried by the frame, zero for LR and LD.
    pub fn sequence(&self) -> u8 {
        match self {
            Self::Transfer { sequence, .. }
            | Self::Ack { sequence, .. }
            | Self::Negotiate { sequence, .. }
            | Self::NegotiateAck { sequence, .. } => *sequence,
            Self::Request { .. } | Self::Disconnect { .. } => 0,
        }
    }

    /// Parse an unescaped frame body (header length byte onwards, CRC and
    /// delimiters already stripped).
    pub fn parse(body: Bytes) -> Result<Self> {
        if body.len() < 2 {
            return Err(DockError::Protocol(format!(
                "link frame too short ({} bytes)",
                body.len()
            )));
        }
        let header_len = body[0] as usize;
        if header_len == 0 || header_len + 1 > body.len() {
            return Err(DockError::Protocol(format!(
                "link header length {} exceeds frame of {} bytes",
                header_len,
                body.len()
            )));
        }
        let header = &body[1..header_len + 1];

        let kind = FrameKind::from_byte(header[0]).ok_or_else(|| {
            DockError::Protocol(format!("unknown link frame type {:#04x}", header[0]))
        })?;

        let frame = match kind {
            FrameKind::LinkRequest => {
                let mut window = 1;
                let mut max_info = MAX_PACKET_SIZE as u16;
                // Parameters are type/length/value triples after the constant.
                let mut params = header.get(2..).unwrap_or_default();
                while params.len() >= 2 {
                    let (ptype, plen) = (params[0], params[1] as usize);
                    let Some(value) = params.get(2..2 + plen) else {
                        break;
                    };
                    match (ptype, value) {
                        (PARAM_WINDOW, [k, ..]) => window = *k,
                        (PARAM_MAX_INFO, [lo, hi, ..]) => {
                            max_info = u16::from_le_bytes([*lo, *hi])
                        }
                        _ => {}
                    }
                    params = &params[2 + plen..];
                }
                Self::Request { window, max_info }
            }
            FrameKind::LinkDisconnect => Self::Disconnect {
                reason: header.get(3).copied().unwrap_or(DISCONNECT_USER_REQUEST),
            },
            FrameKind::LinkTransfer => Self::Transfer {
                sequence: field(header, 1, kind)?,
                data: body.slice(header_len + 1..),
            },
            FrameKind::LinkAck => Self::Ack {
                sequence: field(header, 1, kind)?,
                credit: header.get(2).copied().unwrap_or(1),
            },
            FrameKind::LinkNegotiate | FrameKind::LinkNegotiateAck => {
                let sequence = field(header, 1, kind)?;
                let packet_size = match header.get(2..5) {
                    Some([PARAM_PACKET_SIZE, hi, lo]) => u16::from_be_bytes([*hi, *lo]),
                    _ => MAX_PACKET_SIZE as u16,
                };
                if kind == FrameKind::LinkNegotiate {
                    Self::Negotiate {
                        sequence,
                        packet_size,
                    }
                } else {
                    Self::NegotiateAck {
                        sequence,
                        packet_size,
                    }
                }
            }
        };
        Ok(frame)
    }

    /// Encode the unescaped body.
    pub fn encode_body(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(LR_HEADER.len());
        match self {
            Self::Request { window, max_info } => {
                body.put_slice(&LR_HEADER);
                body[LR_WINDOW_OFFSET] = *window;
                body[LR_MAX_INFO_OFFSET..LR_MAX_INFO_OFFSET + 2]
                    .copy_from_slice(&max_info.to_le_bytes());
            }
            Self::Disconnect { reason } => {
                body.put_slice(&[4, FrameKind::LinkDisconnect as u8, 0x01, 0x01, *reason]);
            }
            Self::Transfer { sequence, data } => {
                body.reserve(data.len() + 3);
                body.put_slice(&[2, FrameKind::LinkTransfer as u8, *sequence]);
                body.put_slice(data);
            }
            Self::Ack { sequence, credit } => {
                body.put_slice(&[3, FrameKind::LinkAck as u8, *sequence, *credit]);
            }
            Self::Negotiate {
                sequence,
                packet_size,
            }
            | Self::NegotiateAck {
                sequence,
                packet_size,
            } => {
                let [hi, lo] = packet_size.to_be_bytes();
                body.put_slice(&[
                    5,
                    self.kind() as u8,
                    *sequence,
                    PARAM_PACKET_SIZE,
                    hi,
                    lo,
                ]);
            }
        }
        body
    }

    /// Encode the complete escaped frame ready for the transport.
    pub fn to_wire(&self) -> Bytes {
        let body = self.encode_body();
        let mut out = BytesMut::with_capacity(body.len() * 2 + 8);
        write_framed(&body, &mut out);
        out.freeze()
    }
}

fn field(header: &[u8], index: usize, kind: FrameKind) -> Result<u8> {
    header.get(index).copied().ok_or_else(|| {
        DockError::Protocol(format!("{} header missing sequence byte", kind.name()))
    })
}

/// Wrap an unescaped body with the start sequence, DLE stuffing, the end
/// sequence and the CRC trailer.
pub fn write_framed(body: &[u8], out: &mut BytesMut) {
    let mut crc = Crc16::new();
    out.put_slice(&FRAME_START);
    for &byte in body {
        if byte == DLE {
            out.put_u8(DLE);
        }
        out.put_u8(byte);
    }
    crc.update(body);
    crc.update_byte(ETX);
    out.put_slice(&[DLE, ETX]);
    out.put_slice(&crc.bytes());
}
