// SPDX-License-Identifier: MIT OR Apache-2.0
//! Header framing: hex, binary (CRC-16) and binary32 (CRC-32) headers
//! (component C4, header half).
//!
//! `Header`/`Encoding`/`Frame` are grounded directly on
//! `examples/Dr-Emann-zmodem2/src/lib.rs`'s types of the same name; the
//! read-side garbage-skip/CAN-cascade handling is grounded on
//! `zm_get_header` in `original_source/src/zm.c`, which the teacher's
//! `read_zpad` only partially reproduces (no garbage budget, no CAN
//! handling before ZPAD is seen).

use core::convert::TryFrom;
use std::fmt;
use std::io::Write;

use crate::consts::*;
use crate::crc::{Crc16, Crc32};
use crate::error::Error;
use crate::escape::{self, Decoded, Encoder};
use crate::reader::{ByteSource, Deadline};

#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Bin = ZBIN,
    Hex = ZHEX,
    Bin32 = ZBIN32,
}

impl TryFrom<u8> for Encoding {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            ZBIN => Ok(Encoding::Bin),
            ZHEX => Ok(Encoding::Hex),
            ZBIN32 => Ok(Encoding::Bin32),
            _ => Err(Error::UnexpectedFrame),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#02x}", *self as u8)
    }
}

/// ZMODEM header types, in the order they're assigned on the wire.
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Request receive init.
    ZRQINIT = 0,
    /// Receive init.
    ZRINIT = 1,
    /// Send init sequence (optional).
    ZSINIT = 2,
    /// ACK to the above.
    ZACK = 3,
    /// File name from sender.
    ZFILE = 4,
    /// To sender: skip this file.
    ZSKIP = 5,
    /// Last packet was garbled.
    ZNAK = 6,
    /// Abort batch transfers.
    ZABORT = 7,
    /// Finish session.
    ZFIN = 8,
    /// Resume data transmission at this position.
    ZRPOS = 9,
    /// Data packet(s) follow.
    ZDATA = 10,
    /// End of file.
    ZEOF = 11,
    /// Fatal read or write error detected.
    ZFERR = 12,
    /// Request for file CRC, and the response.
    ZCRC = 13,
    /// Receiver's challenge.
    ZCHALLENGE = 14,
    /// Request is complete.
    ZCOMPL = 15,
    /// Other end canceled session with CAN*5.
    ZCAN = 16,
    /// Request for free bytes on filesystem.
    ZFREECNT = 17,
    /// Command from sending program.
    ZCOMMAND = 18,
    /// Output to standard error, data follows.
    ZSTDERR = 19,
}

const FRAMES: &[Frame] = &[
    Frame::ZRQINIT,
    Frame::ZRINIT,
    Frame::ZSINIT,
    Frame::ZACK,
    Frame::ZFILE,
    Frame::ZSKIP,
    Frame::ZNAK,
    Frame::ZABORT,
    Frame::ZFIN,
    Frame::ZRPOS,
    Frame::ZDATA,
    Frame::ZEOF,
    Frame::ZFERR,
    Frame::ZCRC,
    Frame::ZCHALLENGE,
    Frame::ZCOMPL,
    Frame::ZCAN,
    Frame::ZFREECNT,
    Frame::ZCOMMAND,
    Frame::ZSTDERR,
];

impl TryFrom<u8> for Frame {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        FRAMES
            .iter()
            .find(|f| **f as u8 == value)
            .copied()
            .ok_or(Error::UnexpectedFrame)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

bitflags::bitflags! {
    /// Capability flags carried in a ZRINIT header's payload.
    pub struct Zrinit: u8 {
        const CANFDX = 0x01;
        const CANOVIO = 0x02;
        const CANBRK = 0x04;
        const CANCRY = 0x08;
        const CANLZW = 0x10;
        const CANFC32 = 0x20;
        const ESCCTL = 0x40;
        const ESC8 = 0x80;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub encoding: Encoding,
    pub frame: Frame,
    pub payload: [u8; 4],
}

impl Header {
    pub const fn new(encoding: Encoding, frame: Frame) -> Self {
        Self {
            encoding,
            frame,
            payload: [0; 4],
        }
    }

    pub const fn with_count(mut self, count: u32) -> Self {
        self.payload = count.to_le_bytes();
        self
    }

    pub const fn with_flags(mut self, flags: [u8; 4]) -> Self {
        self.payload = flags;
        self
    }

    pub fn count(&self) -> u32 {
        u32::from_le_bytes(self.payload)
    }

    /// Writes this header to `port`, choosing the on-wire framing from
    /// `self.encoding`. `encoder` carries the AfterAmpersand state across
    /// calls, same as a real serial line's running escape state.
    pub fn write<W: Write>(&self, port: &mut W, encoder: &mut Encoder) -> Result<(), Error> {
        let mut body = Vec::with_capacity(5);
        body.push(self.frame as u8);
        body.extend_from_slice(&self.payload);

        let mut out = Vec::with_capacity(20);
        out.push(ZPAD);
        if self.encoding == Encoding::Hex {
            out.push(ZPAD);
        }
        out.push(ZDLE);

        match self.encoding {
            Encoding::Bin32 => {
                out.push(ZBIN32);
                let mut crc = Crc32::new();
                crc.update_slice(&body);
                let crc_bytes = crc.finalize().to_le_bytes();
                encoder.encode_slice(&body, |b| out.push(b));
                encoder.encode_slice(&crc_bytes, |b| out.push(b));
            }
            Encoding::Bin => {
                out.push(ZBIN);
                let crc_bytes = Crc16::checksum(&body).to_be_bytes();
                encoder.encode_slice(&body, |b| out.push(b));
                encoder.encode_slice(&crc_bytes, |b| out.push(b));
            }
            Encoding::Hex => {
                out.push(ZHEX);
                let crc_bytes = Crc16::checksum(&body).to_be_bytes();
                out.extend_from_slice(hex::encode(&body).as_bytes());
                out.extend_from_slice(hex::encode(&crc_bytes).as_bytes());
                out.push(b'\r');
                out.push(b'\n');
                if self.frame != Frame::ZACK && self.frame != Frame::ZFIN {
                    out.push(XON);
                }
            }
        }

        port.write_all(&out)?;
        if self.frame != Frame::ZDATA {
            port.flush()?;
        }
        log::trace!("-> {} {} {:?}", self.encoding, self.frame, self.payload);
        Ok(())
    }

    /// Reads the next header from `reader`. Skips intro garbage up to
    /// `garbage_budget` bytes and tracks CAN×5 cascades seen from any
    /// position in the scan.
    pub fn read<R: ByteSource>(
        reader: &mut R,
        deadline: Deadline,
        escape_all_controls: bool,
        garbage_budget: u32,
    ) -> Result<Header, Error> {
        let mut budget = garbage_budget;
        loop {
            match Self::try_read_once(reader, deadline, escape_all_controls, &mut budget)? {
                Some(header) => {
                    log::trace!(
                        "<- {} {} {:?}",
                        header.encoding,
                        header.frame,
                        header.payload
                    );
                    return Ok(header);
                }
                None => continue,
            }
        }
    }

    fn try_read_once<R: ByteSource>(
        reader: &mut R,
        deadline: Deadline,
        escape_all_controls: bool,
        budget: &mut u32,
    ) -> Result<Option<Header>, Error> {
        if !skip_to_zpad(reader, deadline, budget)? {
            return Ok(None);
        }
        let mut c = escape::read_filtered(reader, deadline, escape_all_controls)?;
        while c == ZPAD {
            c = escape::read_filtered(reader, deadline, escape_all_controls)?;
        }
        if c == CAN {
            return if consume_can_cascade(reader, deadline)? {
                Err(Error::Cancelled)
            } else {
                Ok(None)
            };
        }
        if c != ZDLE {
            return Ok(None);
        }

        let selector = escape::read_filtered(reader, deadline, escape_all_controls)?;
        match selector {
            ZBIN => read_binary(reader, deadline, Encoding::Bin).map(Some),
            ZBIN32 => read_binary(reader, deadline, Encoding::Bin32).map(Some),
            ZHEX => read_hex(reader, deadline, escape_all_controls).map(Some),
            CAN => {
                if consume_can_cascade(reader, deadline)? {
                    Err(Error::Cancelled)
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }
}

fn skip_to_zpad<R: ByteSource>(
    reader: &mut R,
    deadline: Deadline,
    budget: &mut u32,
) -> Result<bool, Error> {
    loop {
        let c = reader.getc(deadline)?;
        if c == ZPAD {
            return Ok(true);
        }
        if c == CAN {
            return if consume_can_cascade(reader, deadline)? {
                Err(Error::Cancelled)
            } else {
                Ok(false)
            };
        }
        if *budget == 0 {
            return Err(Error::GarbageOverflow);
        }
        *budget -= 1;
    }
}

/// The caller already consumed one CAN byte; reads up to four more,
/// returning whether the full CAN×5 cascade was observed.
fn consume_can_cascade<R: ByteSource>(reader: &mut R, deadline: Deadline) -> Result<bool, Error> {
    let mut seen = 1u8;
    for _ in 0..4 {
        let c = reader.getc(deadline)?;
        if c == CAN {
            seen += 1;
            if seen >= 5 {
                return Ok(true);
            }
        } else {
            return Ok(false);
        }
    }
    Ok(seen >= 5)
}

fn read_binary<R: ByteSource>(
    reader: &mut R,
    deadline: Deadline,
    encoding: Encoding,
) -> Result<Header, Error> {
    let mut body = [0u8; 5];
    let mut crc32 = Crc32::new();
    let mut crc16 = Crc16::new();
    for slot in body.iter_mut() {
        let b = read_escaped_byte(reader, deadline)?;
        *slot = b;
        crc32.update(b);
        crc16.update(b);
    }
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
    let frame = Frame::try_from(body[0])?;
    let mut payload = [0u8; 4];
    payload.copy_from_slice(&body[1..5]);
    Ok(Header {
        encoding,
        frame,
        payload,
    })
}

fn read_escaped_byte<R: ByteSource>(reader: &mut R, deadline: Deadline) -> Result<u8, Error> {
    match escape::decode_next(reader, deadline)? {
        Decoded::Byte(b) => Ok(b),
        Decoded::Terminator(_) => Err(Error::BadEscape),
        Decoded::Can => Err(Error::Cancelled),
    }
}

fn read_hex<R: ByteSource>(
    reader: &mut R,
    deadline: Deadline,
    escape_all_controls: bool,
) -> Result<Header, Error> {
    let mut body = [0u8; 5];
    let mut crc = Crc16::new();
    for slot in body.iter_mut() {
        let b = read_hex_byte(reader, deadline, escape_all_controls)?;
        *slot = b;
        crc.update(b);
    }
    for _ in 0..2 {
        crc.update(read_hex_byte(reader, deadline, escape_all_controls)?);
    }
    if crc.finalize_check() != 0 {
        return Err(Error::Crc);
    }

    // Discard the CR[LF] trailer (`zm_read_hex_header`).
    let c = escape::read_filtered(reader, deadline, escape_all_controls)?;
    if c == b'\r' {
        let _ = escape::read_filtered(reader, deadline, escape_all_controls);
    }

    let frame = Frame::try_from(body[0])?;
    let mut payload = [0u8; 4];
    payload.copy_from_slice(&body[1..5]);
    Ok(Header {
        encoding: Encoding::Hex,
        frame,
        payload,
    })
}

fn read_hex_byte<R: ByteSource>(
    reader: &mut R,
    deadline: Deadline,
    escape_all_controls: bool,
) -> Result<u8, Error> {
    let hi = hex_nibble(escape::read_filtered(reader, deadline, escape_all_controls)?)?;
    let lo = hex_nibble(escape::read_filtered(reader, deadline, escape_all_controls)?)?;
    Ok((hi << 4) | lo)
}

fn hex_nibble(c: u8) -> Result<u8, Error> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Error::BadEscape),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::tests::slice_source;

    #[rstest::rstest]
    #[case(Encoding::Bin, Frame::ZRQINIT)]
    #[case(Encoding::Bin32, Frame::ZRQINIT)]
    #[case(Encoding::Hex, Frame::ZRINIT)]
    fn header_round_trips(#[case] encoding: Encoding, #[case] frame: Frame) {
        let header = Header::new(encoding, frame).with_flags([1, 2, 3, 4]);
        let mut encoder = Encoder::new(false);
        let mut wire = Vec::new();
        header.write(&mut wire, &mut encoder).unwrap();

        let mut src = slice_source(&wire);
        let decoded = Header::read(&mut src, Deadline::none(), false, 4096).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn hex_header_has_crlf_and_xon_trailer_except_for_zack_and_zfin() {
        let mut encoder = Encoder::new(false);
        let mut wire = Vec::new();
        Header::new(Encoding::Hex, Frame::ZRQINIT)
            .write(&mut wire, &mut encoder)
            .unwrap();
        assert!(wire.ends_with(&[b'\r', b'\n', XON]));

        let mut wire = Vec::new();
        Header::new(Encoding::Hex, Frame::ZFIN)
            .write(&mut wire, &mut encoder)
            .unwrap();
        assert!(wire.ends_with(&[b'\r', b'\n']));
        assert_ne!(*wire.last().unwrap(), XON);
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let mut encoder = Encoder::new(false);
        let mut wire = Vec::new();
        Header::new(Encoding::Bin32, Frame::ZDATA)
            .with_count(42)
            .write(&mut wire, &mut encoder)
            .unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;

        let mut src = slice_source(&wire);
        let result = Header::read(&mut src, Deadline::none(), false, 4096);
        assert!(matches!(result, Err(Error::Crc) | Err(Error::Timeout)));
    }

    #[test]
    fn garbage_before_zpad_is_skipped_within_budget() {
        let mut wire = vec![b'x'; 10];
        let mut encoder = Encoder::new(false);
        Header::new(Encoding::Hex, Frame::ZACK)
            .write(&mut wire, &mut encoder)
            .unwrap();

        let mut src = slice_source(&wire);
        let header = Header::read(&mut src, Deadline::none(), false, 1024).unwrap();
        assert_eq!(header.frame, Frame::ZACK);
    }

    #[test]
    fn garbage_overflow_is_reported() {
        let wire = vec![b'x'; 10];
        let mut src = slice_source(&wire);
        let result = Header::read(&mut src, Deadline::none(), false, 4);
        assert!(matches!(result, Err(Error::GarbageOverflow)));
    }

    #[test]
    fn can_cascade_anywhere_aborts() {
        let wire = [CAN, CAN, CAN, CAN, CAN];
        let mut src = slice_source(&wire);
        let result = Header::read(&mut src, Deadline::none(), false, 4096);
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
