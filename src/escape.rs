// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transparent escape codec (component C3).
//!
//! The teacher crate's `ZDLE_TABLE`/`UNZDLE_TABLE` (see
//! `examples/Dr-Emann-zmodem2/src/lib.rs`) bake CR-escaping in
//! unconditionally, which is a reasonable simplification for a modern
//! byte-clean transport but loses the classic "Telenet `@`-CR" behavior
//! some peers still rely on. This module restores the stateful version,
//! grounded directly on `zsendline`/`zsendline_init`/`zdlread2` in
//! `original_source/src/zm.c`.

use crate::consts::*;
use crate::error::Error;
use crate::reader::{ByteSource, Deadline};
use crate::subpacket::Packet;

/// Escape-class table entry: whether a given byte needs ZDLE-escaping
/// unconditionally, never, or only right after an `@` was sent/seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscapeClass {
    Never,
    Always,
    AfterAmpersand,
}

/// Classifies a byte for the purpose of *sending* it. Mirrors
/// `zsendline_init`'s per-byte table, split out as a pure function since
/// this crate has no static global state.
pub fn classify(byte: u8, escape_all_controls: bool) -> EscapeClass {
    // Bytes outside the control ranges (0x00-0x1F, 0x80-0x9F) are never
    // escaped, matching `if (i & 0140) tab[i] = 0` in the original.
    if byte & 0x60 != 0 {
        return EscapeClass::Never;
    }
    match byte {
        ZDLE | XON | XOFF | (XON | 0x80) | (XOFF | 0x80) => EscapeClass::Always,
        DLE | (DLE | 0x80) => EscapeClass::Always,
        0x0d | 0x8d => {
            if escape_all_controls {
                EscapeClass::Always
            } else {
                EscapeClass::AfterAmpersand
            }
        }
        _ => {
            if escape_all_controls {
                EscapeClass::Always
            } else {
                EscapeClass::Never
            }
        }
    }
}

/// Stateful encoder: tracks the last byte emitted so the AfterAmpersand
/// class can decide whether a CR needs escaping.
#[derive(Clone, Debug)]
pub struct Encoder {
    last_byte: u8,
    escape_all_controls: bool,
}

impl Encoder {
    pub fn new(escape_all_controls: bool) -> Self {
        Self {
            last_byte: 0,
            escape_all_controls,
        }
    }

    pub fn set_escape_all_controls(&mut self, value: bool) {
        self.escape_all_controls = value;
    }

    /// Encodes one byte, pushing one or two output bytes via `sink`.
    pub fn encode_byte(&mut self, byte: u8, mut sink: impl FnMut(u8)) {
        let class = classify(byte, self.escape_all_controls);
        let must_escape = match class {
            EscapeClass::Never => false,
            EscapeClass::Always => true,
            EscapeClass::AfterAmpersand => (self.last_byte & 0x7f) == b'@',
        };
        if must_escape {
            sink(ZDLE);
            sink(byte ^ 0x40);
        } else {
            sink(byte);
        }
        self.last_byte = byte;
    }

    pub fn encode_slice(&mut self, data: &[u8], mut sink: impl FnMut(u8)) {
        for &b in data {
            self.encode_byte(b, &mut sink);
        }
    }
}

/// Outcome of decoding one logical unit from the inner (escaped) stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decoded {
    Byte(u8),
    Terminator(Packet),
    Can,
}

/// Reads and decodes one logical byte from `reader`, honoring escape
/// sequences and the CAN×5 cascade. `reader.getc` is the sole suspension
/// point, so every caller stays interruptable by the same deadline.
pub fn decode_next<R: ByteSource>(reader: &mut R, deadline: Deadline) -> Result<Decoded, Error> {
    let b = reader.getc(deadline)?;
    if b != ZDLE {
        return Ok(Decoded::Byte(b));
    }
    decode_escaped(reader, deadline)
}

fn decode_escaped<R: ByteSource>(reader: &mut R, deadline: Deadline) -> Result<Decoded, Error> {
    loop {
        let mut b = reader.getc(deadline)?;
        let mut can_run = 0u8;
        while b == CAN {
            can_run += 1;
            if can_run == 4 {
                return Ok(Decoded::Can);
            }
            b = reader.getc(deadline)?;
        }
        match b {
            ZCRCE | ZCRCG | ZCRCQ | ZCRCW => {
                return Ok(Decoded::Terminator(
                    Packet::try_from(b).map_err(|_| Error::BadEscape)?,
                ));
            }
            ZRUB0 => return Ok(Decoded::Byte(0x7f)),
            ZRUB1 => return Ok(Decoded::Byte(0xff)),
            XON | XOFF => continue,
            b if (b & 0x60) == 0x40 => return Ok(Decoded::Byte(b ^ 0x40)),
            _ => return Err(Error::BadEscape),
        }
    }
}

/// Reads one *plain* byte (no escape interpretation), dropping XON/XOFF and,
/// when `escape_all_controls` is set, other control bytes. Used by the hex
/// header reader, whose ASCII digits are not themselves escaped but still
/// ride over a possibly XON/XOFF-noisy line (`noxrd7` in the original).
pub fn read_filtered<R: ByteSource>(
    reader: &mut R,
    deadline: Deadline,
    escape_all_controls: bool,
) -> Result<u8, Error> {
    loop {
        let c = reader.getc(deadline)?;
        let masked = c & 0x7f;
        match masked {
            XON | XOFF => continue,
            b'\r' | b'\n' => return Ok(c),
            _ if escape_all_controls && (masked & 0x60) == 0 => continue,
            _ => return Ok(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::tests::slice_source;

    #[test]
    fn never_escapes_printable_bytes() {
        let mut enc = Encoder::new(false);
        let mut out = Vec::new();
        for &b in b"Hello, World! 0123" {
            enc.encode_byte(b, |x| out.push(x));
        }
        assert_eq!(out, b"Hello, World! 0123");
    }

    #[test]
    fn always_escapes_zdle_and_friends() {
        for &b in &[ZDLE, XON, XOFF, DLE] {
            let mut enc = Encoder::new(false);
            let mut out = Vec::new();
            enc.encode_byte(b, |x| out.push(x));
            assert_eq!(out, vec![ZDLE, b ^ 0x40]);
        }
    }

    #[test]
    fn cr_escaped_only_after_at_sign() {
        let mut enc = Encoder::new(false);
        let mut out = Vec::new();
        enc.encode_byte(b'x', |x| out.push(x));
        enc.encode_byte(0x0d, |x| out.push(x));
        assert_eq!(out, vec![b'x', 0x0d]);

        let mut enc = Encoder::new(false);
        let mut out = Vec::new();
        enc.encode_byte(b'@', |x| out.push(x));
        enc.encode_byte(0x0d, |x| out.push(x));
        assert_eq!(out, vec![b'@', ZDLE, 0x0d ^ 0x40]);
    }

    #[test]
    fn escape_all_controls_covers_every_control_byte() {
        let mut enc = Encoder::new(true);
        let mut out = Vec::new();
        enc.encode_byte(0x01, |x| out.push(x));
        assert_eq!(out, vec![ZDLE, 0x01 ^ 0x40]);
    }

    #[test]
    fn decode_inverts_encode_for_every_byte_regardless_of_context() {
        for prev in [0u8, b'@', b'x'] {
            for b in 0u8..=255 {
                let mut enc = Encoder::new(false);
                let mut out = Vec::new();
                enc.encode_byte(prev, |x| out.push(x));
                out.clear();
                enc.encode_byte(b, |x| out.push(x));

                let mut src = slice_source(&out);
                let decoded = decode_next(&mut src, Deadline::none()).unwrap();
                assert_eq!(decoded, Decoded::Byte(b), "byte {:#x} after {:#x}", b, prev);
            }
        }
    }

    #[test]
    fn five_cans_in_a_row_decode_to_can() {
        let data = [ZDLE, CAN, CAN, CAN, CAN];
        let mut src = slice_source(&data);
        assert_eq!(
            decode_next(&mut src, Deadline::none()).unwrap(),
            Decoded::Can
        );
    }

    #[test]
    fn terminator_bytes_decode_to_terminator() {
        for &(byte, packet) in &[
            (ZCRCE, Packet::ZCRCE),
            (ZCRCG, Packet::ZCRCG),
            (ZCRCQ, Packet::ZCRCQ),
            (ZCRCW, Packet::ZCRCW),
        ] {
            let data = [ZDLE, byte];
            let mut src = slice_source(&data);
            assert_eq!(
                decode_next(&mut src, Deadline::none()).unwrap(),
                Decoded::Terminator(packet)
            );
        }
    }
}
