// SPDX-License-Identifier: MIT OR Apache-2.0
//! Data subpacket framing (component C4, data half): escape-encoded
//! payload, terminator byte, and trailing CRC.
//!
//! `Packet` is grounded on the teacher's stale `src/subpacket.rs::Type`
//! (same four terminator values, same `TryFrom`/`Display` shape); the
//! read/write bodies are grounded on `zm_send_data`/`zm_send_data32` and
//! `zm_receive_data`/`zm_read_data32` in `original_source/src/zm.c`, which
//! fold the CRC in byte-at-a-time alongside the escape decode rather than
//! buffering first and hashing after.

use core::convert::TryFrom;
use std::fmt;
use std::io::Write;

use crate::consts::*;
use crate::crc::{Crc16, Crc32};
use crate::error::Error;
use crate::escape::{self, Decoded, Encoder};
use crate::frame::Encoding;
use crate::reader::{ByteSource, Deadline};

#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Packet {
    /// End of frame, no more data follows in this subpacket run.
    ZCRCE = ZCRCE,
    /// End of subpacket, more data follows, no acknowledgment expected.
    ZCRCG = ZCRCG,
    /// End of subpacket, receiver should send a ZACK in reply.
    ZCRCQ = ZCRCQ,
    /// End of subpacket, receiver should send a ZACK and an XON before more
    /// data is sent (the windowed-flow-control checkpoint).
    ZCRCW = ZCRCW,
}

const PACKETS: &[Packet] = &[Packet::ZCRCE, Packet::ZCRCG, Packet::ZCRCQ, Packet::ZCRCW];

impl TryFrom<u8> for Packet {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        PACKETS
            .iter()
            .find(|p| **p as u8 == value)
            .copied()
            .ok_or(Error::BadEscape)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#02x}", *self as u8)
    }
}

/// The result of reading one data subpacket: the payload bytes plus the
/// terminator that ended it, or a `Can` if the peer aborted mid-subpacket.
pub enum Subpacket {
    Data(Vec<u8>, Packet),
    Can,
}

/// Encodes `data` as one data subpacket, with a CRC matching `encoding`,
/// and writes it to `port`. Following a `ZCRCW` terminator with an XON
/// matches the original's windowed-checkpoint behavior: the sender won't
/// resume until the receiver flips the line back on.
pub fn write_subpacket<W: Write>(
    port: &mut W,
    encoder: &mut Encoder,
    encoding: Encoding,
    kind: Packet,
    data: &[u8],
) -> Result<(), Error> {
    if data.len() > MAX_SUBPACKET {
        return Err(Error::SubpacketTooLong);
    }

    let mut out = Vec::with_capacity(data.len() + 16);
    encoder.encode_slice(data, |b| out.push(b));
    out.push(ZDLE);
    out.push(kind as u8);

    match encoding {
        Encoding::Bin32 => {
            let mut crc = Crc32::new();
            crc.update_slice(data);
            crc.update(kind as u8);
            let crc_bytes = crc.finalize().to_le_bytes();
            encoder.encode_slice(&crc_bytes, |b| out.push(b));
        }
        _ => {
            let mut crc = Crc16::new();
            crc.update_slice(data);
            crc.update(kind as u8);
            encoder.encode_slice(&crc.raw().to_be_bytes(), |b| out.push(b));
        }
    }

    port.write_all(&out)?;
    if kind == Packet::ZCRCW {
        port.write_all(&[XON])?;
    }
    port.flush()?;
    Ok(())
}

/// Reads one data subpacket from `reader`, decoding escapes and verifying
/// the trailing CRC against `encoding`. Stops at the first terminator byte,
/// same as `zm_receive_data`'s lookahead: the CRC is folded in as bytes
/// arrive rather than recomputed over a finished buffer.
pub fn read_subpacket<R: ByteSource>(
    reader: &mut R,
    deadline: Deadline,
    encoding: Encoding,
) -> Result<Subpacket, Error> {
    let mut data = Vec::new();
    let mut crc16 = Crc16::new();
    let mut crc32 = Crc32::new();

    loop {
        match escape::decode_next(reader, deadline)? {
            Decoded::Byte(b) => {
                if data.len() >= MAX_SUBPACKET {
                    return Err(Error::SubpacketTooLong);
                }
                data.push(b);
                crc16.update(b);
                crc32.update(b);
            }
            Decoded::Can => return Ok(Subpacket::Can),
            Decoded::Terminator(kind) => {
                crc16.update(kind as u8);
                crc32.update(kind as u8);
                verify_trailer(reader, deadline, encoding, crc16, crc32)?;
                return Ok(Subpacket::Data(data, kind));
            }
        }
    }
}

fn verify_trailer<R: ByteSource>(
    reader: &mut R,
    deadline: Deadline,
    encoding: Encoding,
    mut crc16: Crc16,
    mut crc32: Crc32,
) -> Result<(), Error> {
    match encoding {
        Encoding::Bin32 => {
            for _ in 0..4 {
                crc32.update(read_escaped_byte(reader, deadline)?);
            }
            if crc32.raw() != CRC32_CHECK {
                return Err(Error::Crc);
            }
        }
        _ => {
            for _ in 0..2 {
                crc16.update(read_escaped_byte(reader, deadline)?);
            }
            if crc16.finalize_check() != 0 {
                return Err(Error::Crc);
            }
        }
    }
    Ok(())
}

fn read_escaped_byte<R: ByteSource>(reader: &mut R, deadline: Deadline) -> Result<u8, Error> {
    match escape::decode_next(reader, deadline)? {
        Decoded::Byte(b) => Ok(b),
        Decoded::Terminator(_) => Err(Error::BadEscape),
        Decoded::Can => Err(Error::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::tests::slice_source;

    #[rstest::rstest]
    #[case(Encoding::Bin, Packet::ZCRCW)]
    #[case(Encoding::Bin32, Packet::ZCRCE)]
    #[case(Encoding::Bin32, Packet::ZCRCQ)]
    fn subpacket_round_trips(#[case] encoding: Encoding, #[case] kind: Packet) {
        let payload = b"the quick brown fox jumps over the lazy dog";
        let mut encoder = Encoder::new(false);
        let mut wire = Vec::new();
        write_subpacket(&mut wire, &mut encoder, encoding, kind, payload).unwrap();

        let mut src = slice_source(&wire);
        match read_subpacket(&mut src, Deadline::none(), encoding).unwrap() {
            Subpacket::Data(data, got_kind) => {
                assert_eq!(data, payload);
                assert_eq!(got_kind, kind);
            }
            Subpacket::Can => panic!("expected data, got cancel"),
        }
    }

    #[test]
    fn zcrcw_terminator_is_followed_by_xon() {
        let mut encoder = Encoder::new(false);
        let mut wire = Vec::new();
        write_subpacket(&mut wire, &mut encoder, Encoding::Bin, Packet::ZCRCW, b"hi").unwrap();
        assert_eq!(*wire.last().unwrap(), XON);
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let mut encoder = Encoder::new(false);
        let mut wire = Vec::new();
        write_subpacket(
            &mut wire,
            &mut encoder,
            Encoding::Bin32,
            Packet::ZCRCE,
            b"payload",
        )
        .unwrap();
        wire[2] ^= 0xFF;

        let mut src = slice_source(&wire);
        let result = read_subpacket(&mut src, Deadline::none(), Encoding::Bin32);
        assert!(matches!(result, Err(Error::Crc) | Err(Error::Timeout)));
    }

    #[test]
    fn oversized_payload_is_rejected_on_write() {
        let mut encoder = Encoder::new(false);
        let mut wire = Vec::new();
        let data = vec![0u8; MAX_SUBPACKET + 1];
        let result = write_subpacket(&mut wire, &mut encoder, Encoding::Bin, Packet::ZCRCG, &data);
        assert!(matches!(result, Err(Error::SubpacketTooLong)));
    }

    #[test]
    fn can_mid_subpacket_is_reported() {
        let data = [CAN, CAN, CAN, CAN];
        let mut src = slice_source(&data);
        let result = read_subpacket(&mut src, Deadline::none(), Encoding::Bin);
        assert!(matches!(result, Ok(Subpacket::Can)));
    }
}
