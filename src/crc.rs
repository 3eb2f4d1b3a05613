// SPDX-License-Identifier: MIT OR Apache-2.0
//! CRC-16/XMODEM and CRC-32 primitives (component C2).
//!
//! The bulk checksums (used once a whole header or subpacket is in hand)
//! go through the `crc` crate's table-backed `Crc<u16>`/`Crc<u32>`, same as
//! the teacher crate. The incremental `update` functions mirror
//! `updcrc`/`UPDC32` from `original_source/src/zm.c`, which the framer's
//! lookahead-based subpacket reader needs: a terminator byte can only be
//! recognized after it's been read, so the CRC has to be foldable one byte
//! at a time without waiting for a complete buffer.

use crate::consts::CRC32_CHECK;
use crc::{Crc, CRC_16_XMODEM, CRC_32_ISO_HDLC};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Running CRC-16/XMODEM accumulator. No initial value, finalized by
/// folding in two zero bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Crc16(u16);

impl Crc16 {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn update(&mut self, byte: u8) {
        self.0 = crc16_update(byte, self.0);
    }

    pub fn update_slice(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.update(b);
        }
    }

    /// Raw accumulator value, the CRC-16 to place on the wire after a
    /// payload (and any trailing type byte) has been folded in.
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Folds in the two finalizing zero bytes and returns the result, which
    /// is zero iff everything folded in (payload plus the trailing CRC
    /// bytes) was received intact.
    pub fn finalize_check(self) -> u16 {
        crc16_update(0, crc16_update(0, self.0))
    }

    pub fn checksum(data: &[u8]) -> u16 {
        CRC16.checksum(data)
    }
}

/// Running CRC-32 accumulator, initial value 0xFFFFFFFF, complemented at
/// finalize time.
#[derive(Clone, Copy, Debug)]
pub struct Crc32(u32);

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32 {
    pub fn new() -> Self {
        Self(0xFFFF_FFFF)
    }

    pub fn update(&mut self, byte: u8) {
        self.0 = crc32_update(byte, self.0);
    }

    pub fn update_slice(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.update(b);
        }
    }

    /// Raw accumulator value, used when folding in the trailing CRC bytes
    /// read off the wire: the check constant is reached once those bytes
    /// are included, without complementing.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Complements the accumulator to produce the CRC-32 value to place on
    /// the wire.
    pub fn finalize(self) -> u32 {
        !self.0
    }

    pub fn checksum(data: &[u8]) -> u32 {
        CRC32.checksum(data)
    }
}

/// Byte-at-a-time CRC-16/XMODEM update (poly 0x1021), equivalent to the
/// original's `updcrc`.
pub fn crc16_update(byte: u8, crc: u16) -> u16 {
    let mut crc = crc ^ ((byte as u16) << 8);
    for _ in 0..8 {
        crc = if crc & 0x8000 != 0 {
            (crc << 1) ^ 0x1021
        } else {
            crc << 1
        };
    }
    crc
}

/// Byte-at-a-time CRC-32 update (poly 0xEDB88320), equivalent to the
/// original's `UPDC32`.
pub fn crc32_update(byte: u8, crc: u32) -> u32 {
    let mut crc = crc ^ byte as u32;
    for _ in 0..8 {
        crc = if crc & 1 != 0 {
            (crc >> 1) ^ 0xEDB8_8320
        } else {
            crc >> 1
        };
    }
    crc
}
