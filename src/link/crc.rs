//! Running CRC-16 used by the link framing.
//!
//! The link uses CRC-16/ARC (polynomial 0x8005 reflected, zero initial
//! value, no final xor). The checksum covers the unescaped frame body and the
//! terminating ETX byte, and goes on the wire low byte first.

use crc::{Crc, Digest, CRC_16_ARC};

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Incremental CRC-16 accumulator.
#[derive(Clone)]
pub struct Crc16 {
    digest: Digest<'static, u16>,
}

impl Crc16 {
    pub fn new() -> Self {
        Self {
            digest: CRC16.digest(),
        }
    }

    /// Zero the running value.
    pub fn reset(&mut self) {
        self.digest = CRC16.digest();
    }

    pub fn update_byte(&mut self, byte: u8) {
        self.digest.update(&[byte]);
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    /// Current checksum value.
    pub fn value(&self) -> u16 {
        self.digest.clone().finalize()
    }

    /// Checksum bytes in wire order.
    pub fn bytes(&self) -> [u8; 2] {
        self.value().to_le_bytes()
    }

    /// One-shot checksum of `data`.
    pub fn checksum(data: &[u8]) -> u16 {
        CRC16.checksum(data)
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Crc16 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Crc16({:#06x})", self.value())
    }
}
