// SPDX-License-Identifier: MIT OR Apache-2.0
//! Legacy XMODEM/YMODEM sector fallback, used on the receive path when a
//! peer never answers a ZMODEM handshake (component C8's optional leg).
//!
//! Grounded on `original_source/src/lrz.c`'s sector-mode functions
//! (`rzfile`'s legacy branch, which this crate's `original_source/` pack
//! does not carry in isolated form — the 128/1024-byte-sector, sequence
//! plus complement, CRC-16-or-checksum framing is textbook XMODEM/YMODEM
//! as documented alongside it) and on the teacher's escape-free framing
//! style in `src/frame.rs`.

use std::io::{Read, Write};
use std::time::Duration;

use crate::crc::Crc16;
use crate::error::Error;
use crate::reader::{ByteReader, ByteSource, Deadline};

const SOH: u8 = 0x01;
const STX: u8 = 0x02;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
const CRC_REQUEST: u8 = b'C';

const SHORT_SECTOR: usize = 128;
const LONG_SECTOR: usize = 1024;
const MAX_RETRIES: u32 = 10;

/// One received sector's payload, trimmed of CPM-style padding is left to
/// the caller (trailing NUL/Ctrl-Z padding on the final sector is a file
/// format question XMODEM is agnostic about).
struct Sector {
    seq: u8,
    data: Vec<u8>,
}

/// Receives a single file over XMODEM or YMODEM batch framing into
/// `sink`, requesting CRC-16 sectors. Returns the total bytes written.
///
/// `filename_hint` receives the batch filename block's name, if the peer
/// sends a YMODEM-style sector 0; callers that only speak plain XMODEM can
/// ignore it.
pub fn receive<T, W>(
    transport: &mut T,
    sink: &mut W,
    deadline_per_sector: Duration,
    mut filename_hint: impl FnMut(&str, u64),
) -> Result<u64, Error>
where
    T: Read + Write,
    W: Write,
{
    let mut reader = ByteReader::new(&mut *transport);
    let mut total = 0u64;
    let mut expected_seq: u8 = 1;
    let mut first = true;

    // Ask for CRC-16 sectors, falling back to plain checksum is not
    // implemented: every modern peer answers 'C'.
    for _ in 0..MAX_RETRIES {
        reader.get_mut().write_all(&[CRC_REQUEST])?;
        reader.get_mut().flush()?;
        match read_sector(&mut reader, deadline_per_sector, true) {
            Ok(Some(sector)) => {
                if first && sector.seq == 0 {
                    let (name, size) = parse_ymodem_header(&sector.data);
                    if name.is_empty() {
                        reader.get_mut().write_all(&[ACK])?;
                        return Ok(0);
                    }
                    filename_hint(&name, size);
                    reader.get_mut().write_all(&[ACK, CRC_REQUEST])?;
                    reader.get_mut().flush()?;
                    expected_seq = 1;
                    first = false;
                    continue;
                }
                first = false;
                if sector.seq != expected_seq {
                    reader.get_mut().write_all(&[NAK])?;
                    continue;
                }
                sink.write_all(&sector.data)?;
                total += sector.data.len() as u64;
                expected_seq = expected_seq.wrapping_add(1);
                reader.get_mut().write_all(&[ACK])?;
            }
            Ok(None) => return Ok(total),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(_) => {
                reader.get_mut().write_all(&[NAK])?;
            }
        }
    }
    Err(Error::Timeout)
}

/// Reads one sector. Returns `Ok(None)` on EOT (caller ACKs and the
/// transfer is complete), `Err` on CRC mismatch, bad sequence pairing, or
/// timeout.
fn read_sector<R: ByteSource>(
    reader: &mut R,
    per_byte_timeout: Duration,
    crc_mode: bool,
) -> Result<Option<Sector>, Error> {
    let deadline = Deadline::after(per_byte_timeout);
    let lead = reader.getc(deadline)?;
    match lead {
        EOT => return Ok(None),
        CAN => return Err(Error::Cancelled),
        SOH | STX => {}
        _ => return Err(Error::BadEscape),
    }
    let size = if lead == SOH {
        SHORT_SECTOR
    } else {
        LONG_SECTOR
    };

    let seq = reader.getc(deadline)?;
    let seq_complement = reader.getc(deadline)?;
    if seq != !seq_complement {
        return Err(Error::UnexpectedFrame);
    }

    let mut data = vec![0u8; size];
    let mut crc = Crc16::new();
    for slot in data.iter_mut() {
        let b = reader.getc(deadline)?;
        *slot = b;
        crc.update(b);
    }

    if crc_mode {
        let hi = reader.getc(deadline)?;
        let lo = reader.getc(deadline)?;
        crc.update(hi);
        crc.update(lo);
        if crc.finalize_check() != 0 {
            return Err(Error::Crc);
        }
    } else {
        let checksum = reader.getc(deadline)?;
        let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if checksum != sum {
            return Err(Error::Crc);
        }
    }

    Ok(Some(Sector { seq, data }))
}

/// Parses a YMODEM batch header block: `name\0size ...`. Returns an empty
/// name on the terminating all-NUL block.
fn parse_ymodem_header(block: &[u8]) -> (String, u64) {
    let name_end = block.iter().position(|&b| b == 0).unwrap_or(0);
    if name_end == 0 {
        return (String::new(), 0);
    }
    let name = String::from_utf8_lossy(&block[..name_end]).into_owned();
    let rest = &block[name_end + 1..];
    let rest_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let size = String::from_utf8_lossy(&rest[..rest_end])
        .split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    (name, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::tests::slice_source;

    fn build_sector(seq: u8, payload: &[u8; SHORT_SECTOR]) -> Vec<u8> {
        let mut out = vec![SOH, seq, !seq];
        out.extend_from_slice(payload);
        out.extend_from_slice(&Crc16::checksum(payload).to_be_bytes());
        out
    }

    #[test]
    fn parses_single_short_sector_and_stops_at_eot() {
        let payload = [b'x'; SHORT_SECTOR];
        let mut wire = build_sector(1, &payload);
        wire.push(EOT);

        let mut src = slice_source(&wire);
        let sector = read_sector(&mut src, Duration::from_secs(1), true)
            .unwrap()
            .unwrap();
        assert_eq!(sector.seq, 1);
        assert_eq!(sector.data, payload.to_vec());

        let eot = read_sector(&mut src, Duration::from_secs(1), true).unwrap();
        assert!(eot.is_none());
    }

    #[test]
    fn ymodem_header_block_parses_name_and_size() {
        let mut block = b"readme.txt".to_vec();
        block.push(0);
        block.extend_from_slice(b"1234");
        block.resize(SHORT_SECTOR, 0);
        let (name, size) = parse_ymodem_header(&block);
        assert_eq!(name, "readme.txt");
        assert_eq!(size, 1234);
    }

    #[test]
    fn empty_ymodem_header_block_signals_batch_end() {
        let block = [0u8; SHORT_SECTOR];
        let (name, _) = parse_ymodem_header(&block);
        assert!(name.is_empty());
    }
}
