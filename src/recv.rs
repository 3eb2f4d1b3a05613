// SPDX-License-Identifier: MIT OR Apache-2.0
//! Receive engine (component C5): drives the `AWAIT_INIT → FILE_INFO →
//! DATA → EOF` cycle for a batch of incoming files.
//!
//! Grounded on this crate's own earlier `State`-enum attempt (the stale
//! version of this file, kept in git history as `SendingZRINIT` /
//! `ProcessingZFILE` / `ReceivingData` / `CheckingData` / `Done`) and on
//! `rzfiles`/`tryz`/`rzfile` in `original_source/src/lrz.c` for the
//! handshake retry counts, the out-of-sync stash drain order, and the
//! `ZEOF` position-mismatch-is-ignored rule.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::consts::*;
use crate::error::Error;
use crate::escape::Encoder;
use crate::file_info::FileInfo;
use crate::frame::{Encoding, Frame, Header, Zrinit};
use crate::io::{FileSink, Sink};
use crate::reader::{cancel, ByteReader, Deadline};
use crate::stash::Stash;
use crate::subpacket::{read_subpacket, Packet, Subpacket};

#[derive(Clone, Copy, Debug)]
pub struct MinBps {
    pub threshold: f64,
    pub sustained_for: Duration,
}

pub struct ReceiveOptions {
    pub escape_all_controls: bool,
    pub garbage_budget: u32,
    pub header_retry_budget: u32,
    pub data_retry_budget: u32,
    pub header_timeout: Duration,
    pub init_retries: u32,
    pub deadline: Option<Duration>,
    pub min_bps: Option<MinBps>,
    pub unlink_on_abort: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            escape_all_controls: false,
            garbage_budget: DEFAULT_ZRWINDOW + DEFAULT_BAUDRATE,
            header_retry_budget: HEADER_RETRY_BUDGET,
            data_retry_budget: DATA_RETRY_BUDGET,
            header_timeout: Duration::from_secs(10),
            init_retries: 10,
            deadline: None,
            min_bps: None,
            unlink_on_abort: true,
        }
    }
}

/// Receives a batch of files into `dir`.
///
/// `approver(name, size, modtime)` decides per-file acceptance; when
/// absent, absolute paths are rejected and relative paths are accepted,
/// overwriting whatever is already there. `tick(name, received, total,
/// bps, eta_min, eta_sec)` is polled after every write; a `false` return
/// aborts that file. `complete(name, error, size, modtime)` fires once per
/// file. Returns the sum of bytes received across every completed file.
pub fn receive<T>(
    transport: &mut T,
    dir: &Path,
    mut approver: Option<&mut dyn FnMut(&str, u64, u64) -> bool>,
    mut tick: impl FnMut(&str, u64, u64, f64, u32, u32) -> bool,
    mut complete: impl FnMut(&str, Option<&Error>, u64, u64),
    options: ReceiveOptions,
) -> Result<u64, Error>
where
    T: Read + Write,
{
    let mut reader = ByteReader::new(&mut *transport);
    let mut encoder = Encoder::new(options.escape_all_controls);
    let mut total = 0u64;
    let deadline_for = |timeout: Duration| Deadline::after(timeout);
    let started = StartClock::new();

    send_zrinit(&mut reader, &mut encoder)?;
    let mut attn: Vec<u8> = Vec::new();
    let mut retries_left = options.init_retries;

    loop {
        if let Some(budget) = options.deadline {
            if started.elapsed() > budget {
                return Err(Error::DeadlineExceeded);
            }
        }

        let header = match Header::read(
            &mut reader,
            deadline_for(options.header_timeout),
            options.escape_all_controls,
            options.garbage_budget,
        ) {
            Ok(h) => h,
            Err(Error::Cancelled) => {
                cancel(reader.get_mut())?;
                return Err(Error::Cancelled);
            }
            Err(Error::Timeout) => {
                if retries_left == 0 {
                    return Err(Error::Timeout);
                }
                retries_left -= 1;
                send_zrinit(&mut reader, &mut encoder)?;
                continue;
            }
            Err(e) if e.is_recoverable() => {
                send_znak(&mut reader, &mut encoder)?;
                continue;
            }
            Err(e) => return Err(e),
        };

        match header.frame {
            Frame::ZRQINIT => send_zrinit(&mut reader, &mut encoder)?,
            Frame::ZSINIT => {
                match read_subpacket(&mut reader, deadline_for(options.header_timeout), header.encoding) {
                    Ok(Subpacket::Data(data, _)) => attn = data,
                    _ => {}
                }
                Header::new(Encoding::Hex, Frame::ZACK).write(reader.get_mut(), &mut encoder)?;
            }
            Frame::ZFREECNT => {
                Header::new(Encoding::Hex, Frame::ZACK)
                    .with_count(u32::MAX)
                    .write(reader.get_mut(), &mut encoder)?;
            }
            Frame::ZFIN => {
                Header::new(Encoding::Hex, Frame::ZFIN).write(reader.get_mut(), &mut encoder)?;
                reader.get_mut().write_all(OO_TRAILER)?;
                reader.get_mut().flush()?;
                return Ok(total);
            }
            Frame::ZFILE => {
                match read_subpacket(&mut reader, deadline_for(options.header_timeout), header.encoding) {
                    Ok(Subpacket::Data(data, _)) => {
                        match receive_one_file(
                            &mut reader,
                            &mut encoder,
                            dir,
                            &data,
                            approver.as_mut().map(|a| &mut **a as &mut dyn FnMut(&str, u64, u64) -> bool),
                            &mut tick,
                            &mut complete,
                            &options,
                            &attn,
                        ) {
                            Ok(n) => total += n,
                            Err(Error::Cancelled) => {
                                cancel(reader.get_mut())?;
                                return Err(Error::Cancelled);
                            }
                            Err(_) => {}
                        }
                        send_zrinit(&mut reader, &mut encoder)?;
                    }
                    _ => send_znak(&mut reader, &mut encoder)?,
                }
            }
            Frame::ZCAN | Frame::ZABORT => {
                cancel(reader.get_mut())?;
                return Err(Error::Cancelled);
            }
            _ => send_znak(&mut reader, &mut encoder)?,
        }
    }
}

fn send_zrinit<T: Read + Write>(reader: &mut ByteReader<T>, encoder: &mut Encoder) -> Result<(), Error> {
    let flags = Zrinit::CANFC32 | Zrinit::CANFDX | Zrinit::CANOVIO;
    let buflen = (DEFAULT_ZRWINDOW as u16).to_le_bytes();
    Header::new(Encoding::Hex, Frame::ZRINIT)
        .with_flags([buflen[0], buflen[1], 0, flags.bits()])
        .write(reader.get_mut(), encoder)
}

fn send_znak<T: Read + Write>(reader: &mut ByteReader<T>, encoder: &mut Encoder) -> Result<(), Error> {
    Header::new(Encoding::Hex, Frame::ZNAK).write(reader.get_mut(), encoder)
}

#[allow(clippy::too_many_arguments)]
fn receive_one_file<T: Read + Write>(
    reader: &mut ByteReader<&mut T>,
    encoder: &mut Encoder,
    dir: &Path,
    zfile_payload: &[u8],
    mut approver: Option<&mut dyn FnMut(&str, u64, u64) -> bool>,
    tick: &mut impl FnMut(&str, u64, u64, f64, u32, u32) -> bool,
    complete: &mut impl FnMut(&str, Option<&Error>, u64, u64),
    options: &ReceiveOptions,
    attn: &[u8],
) -> Result<u64, Error> {
    let info = FileInfo::decode(zfile_payload)?;
    let accept = match approver.as_deref_mut() {
        Some(f) => f(&info.name, info.bytes_total, info.modtime),
        None => !Path::new(&info.name).is_absolute(),
    };
    if !accept {
        Header::new(Encoding::Hex, Frame::ZSKIP).write(reader.get_mut(), encoder)?;
        complete(&info.name, Some(&Error::PolicyRejected), info.bytes_total, info.modtime);
        return Ok(0);
    }

    let dest = resolve_destination(dir, &info.name);
    let mut sink: Box<dyn Sink> = match FileSink::create(&dest, options.unlink_on_abort) {
        Ok(s) => Box::new(s),
        Err(e) => {
            Header::new(Encoding::Hex, Frame::ZSKIP).write(reader.get_mut(), encoder)?;
            complete(&info.name, Some(&e), info.bytes_total, info.modtime);
            return Ok(0);
        }
    };

    let result = receive_file_data(reader, encoder, sink.as_mut(), &info, tick, options, attn);
    match &result {
        Ok(received) => {
            sink.finish(info.modtime, info.mode)?;
            complete(&info.name, None, *received, info.modtime);
            Ok(*received)
        }
        Err(e) => {
            let fatal = matches!(e, Error::Cancelled);
            sink.abort();
            complete(&info.name, Some(e), 0, info.modtime);
            if fatal {
                Err(Error::Cancelled)
            } else {
                Ok(0)
            }
        }
    }
}

fn resolve_destination(dir: &Path, name: &str) -> PathBuf {
    let base = Path::new(name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("received.bin"));
    dir.join(base)
}

#[allow(clippy::too_many_arguments)]
fn receive_file_data<T: Read + Write>(
    reader: &mut ByteReader<&mut T>,
    encoder: &mut Encoder,
    sink: &mut dyn Sink,
    info: &FileInfo,
    tick: &mut impl FnMut(&str, u64, u64, f64, u32, u32) -> bool,
    options: &ReceiveOptions,
    attn: &[u8],
) -> Result<u64, Error> {
    let mut received: u64 = 0;
    let mut stash = Stash::new();
    let mut header_retries = options.header_retry_budget;
    let mut retries = options.data_retry_budget;
    let started = Instant::now();
    let min_bps_since = Instant::now();

    Header::new(Encoding::Hex, Frame::ZRPOS)
        .with_count(received as u32)
        .write(reader.get_mut(), encoder)?;

    loop {
        if let Some(budget) = options.deadline {
            if started.elapsed() > budget {
                return Err(Error::DeadlineExceeded);
            }
        }

        let header = match Header::read(
            reader,
            Deadline::after(options.header_timeout),
            options.escape_all_controls,
            options.garbage_budget,
        ) {
            Ok(h) => h,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                if header_retries == 0 {
                    return Err(e);
                }
                header_retries -= 1;
                if !attn.is_empty() {
                    reader.get_mut().write_all(attn)?;
                }
                Header::new(Encoding::Hex, Frame::ZRPOS)
                    .with_count(received as u32)
                    .write(reader.get_mut(), encoder)?;
                continue;
            }
        };

        match header.frame {
            Frame::ZDATA => {
                let pos = header.count() as u64;
                if pos < received {
                    drain_and_discard(reader, header.encoding)?;
                    continue;
                }
                if pos > received {
                    drain_into_stash(reader, header.encoding, &mut stash, pos)?;
                    continue;
                }
                while let Some(chunk) = stash.take_at(received) {
                    sink.write(&chunk)?;
                    received += chunk.len() as u64;
                }
                stash.prune_to(received);

                loop {
                    match read_subpacket(reader, Deadline::after(options.header_timeout), header.encoding) {
                        Ok(Subpacket::Data(data, kind)) => {
                            sink.write(&data)?;
                            received += data.len() as u64;
                            if let Some(min_bps) = options.min_bps {
                                let elapsed = min_bps_since.elapsed();
                                if elapsed > min_bps.sustained_for {
                                    let bps = received as f64 / elapsed.as_secs_f64().max(0.001);
                                    if bps < min_bps.threshold {
                                        return Err(Error::RateTooLow);
                                    }
                                }
                            }
                            let bps = received as f64 / started.elapsed().as_secs_f64().max(0.001);
                            let remaining = info.bytes_total.saturating_sub(received);
                            let eta = if bps > 0.0 { (remaining as f64 / bps) as u32 } else { 0 };
                            if !tick(&info.name, received, info.bytes_total, bps, eta / 60, eta % 60) {
                                return Err(Error::Aborted);
                            }
                            match kind {
                                Packet::ZCRCG => continue,
                                Packet::ZCRCE => break,
                                Packet::ZCRCQ => {
                                    Header::new(Encoding::Hex, Frame::ZACK)
                                        .with_count(received as u32)
                                        .write(reader.get_mut(), encoder)?;
                                    continue;
                                }
                                Packet::ZCRCW => {
                                    Header::new(Encoding::Hex, Frame::ZACK)
                                        .with_count(received as u32)
                                        .write(reader.get_mut(), encoder)?;
                                    break;
                                }
                            }
                        }
                        Ok(Subpacket::Can) => return Err(Error::Cancelled),
                        Err(e) => {
                            if retries == 0 {
                                return Err(e);
                            }
                            retries -= 1;
                            if !attn.is_empty() {
                                reader.get_mut().write_all(attn)?;
                            }
                            Header::new(Encoding::Hex, Frame::ZRPOS)
                                .with_count(received as u32)
                                .write(reader.get_mut(), encoder)?;
                            break;
                        }
                    }
                }
            }
            Frame::ZEOF => {
                if header.count() as u64 != received {
                    continue;
                }
                return Ok(received);
            }
            Frame::ZCAN | Frame::ZABORT => return Err(Error::Cancelled),
            _ => {
                Header::new(Encoding::Hex, Frame::ZRPOS)
                    .with_count(received as u32)
                    .write(reader.get_mut(), encoder)?;
            }
        }
    }
}

/// Reads and discards a full subpacket run without storing it, for a stale
/// retransmission the receiver has already applied.
fn drain_and_discard<T: Read + Write>(
    reader: &mut ByteReader<&mut T>,
    encoding: Encoding,
) -> Result<(), Error> {
    loop {
        match read_subpacket(reader, Deadline::after(Duration::from_secs(10)), encoding)? {
            Subpacket::Data(_data, kind) => {
                if matches!(kind, Packet::ZCRCE | Packet::ZCRCW) {
                    return Ok(());
                }
            }
            Subpacket::Can => return Err(Error::Cancelled),
        }
    }
}

fn drain_into_stash<T: Read + Write>(
    reader: &mut ByteReader<&mut T>,
    encoding: Encoding,
    stash: &mut Stash,
    pos: u64,
) -> Result<(), Error> {
    let mut cursor = pos;
    loop {
        match read_subpacket(reader, Deadline::after(Duration::from_secs(10)), encoding)? {
            Subpacket::Data(data, kind) => {
                let len = data.len() as u64;
                stash.insert(cursor, data);
                cursor += len;
                if matches!(kind, Packet::ZCRCE | Packet::ZCRCW) {
                    return Ok(());
                }
            }
            Subpacket::Can => return Err(Error::Cancelled),
        }
    }
}

/// Tiny wall-clock anchor so `receive`'s deadline check doesn't depend on
/// the caller threading an `Instant` through every call.
struct StartClock(Instant);

impl StartClock {
    fn new() -> Self {
        Self(Instant::now())
    }

    fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_destination_strips_directory_components() {
        let dir = Path::new("/tmp/incoming");
        let dest = resolve_destination(dir, "../../etc/passwd");
        assert_eq!(dest, dir.join("passwd"));
    }

    #[test]
    fn default_options_match_documented_budgets() {
        let options = ReceiveOptions::default();
        assert_eq!(options.data_retry_budget, DATA_RETRY_BUDGET);
        assert_eq!(options.header_retry_budget, HEADER_RETRY_BUDGET);
    }
}
