// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session orchestrator (component C8): binds the byte reader, framer,
//! receive/send engines and file I/O adapter behind the two public
//! entry points, selects the legacy XMODEM/YMODEM fallback when a peer
//! never answers a ZMODEM handshake, and applies operator policy
//! (min-bps, deadline, restricted paths).
//!
//! The ZMODEM-or-legacy probe is grounded on `tryz`/`wcreceive` in
//! `original_source/src/lrz.c`: the original sends a handful of ZRQINIT
//! headers and, getting nothing but garbage back, falls through to sector
//! mode on the same descriptor. This adapter gets the same effect on a
//! `Read` that cannot be rewound by recording bytes consumed during the
//! probe and replaying them ahead of whatever the legacy reader sees next.

use std::env;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::io::{FileSource, Source};
use crate::recv::{self, MinBps, ReceiveOptions};
use crate::send::{self, FileToSend, SendOptions};
use crate::xmodem;

/// Operator-facing policy for a receive session.
pub struct ReceivePolicy {
    pub min_bps: Option<MinBps>,
    pub deadline: Option<Duration>,
    pub restricted: bool,
    pub allow_legacy_fallback: bool,
    pub header_timeout: Duration,
}

impl Default for ReceivePolicy {
    fn default() -> Self {
        Self {
            min_bps: None,
            deadline: None,
            restricted: restricted_by_environment(),
            allow_legacy_fallback: true,
            header_timeout: Duration::from_secs(10),
        }
    }
}

/// Operator-facing policy for a send session.
pub struct SendPolicy {
    pub deadline: Option<Duration>,
    pub header_timeout: Duration,
    pub max_blklen: usize,
    pub window: usize,
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self {
            deadline: None,
            header_timeout: Duration::from_secs(10),
            max_blklen: crate::consts::BLKLEN_MAX_DEFAULT,
            window: crate::consts::SUBPACKETS_PER_WINDOW,
        }
    }
}

/// `true` when the environment forces restricted (no absolute-path
/// writes, no command execution) mode: `ZMODEM_RESTRICTED` set at all, or
/// `SHELL` naming a restricted shell, matching `zglobal.h`'s `Zrestricted`
/// derivation.
pub fn restricted_by_environment() -> bool {
    if env::var_os("ZMODEM_RESTRICTED").is_some() {
        return true;
    }
    env::var("SHELL")
        .map(|shell| {
            let name = Path::new(&shell)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("");
            matches!(name, "rsh" | "rbash" | "rksh")
        })
        .unwrap_or(false)
}

/// Receives a batch of files into `dest_dir`, trying a ZMODEM handshake
/// first and falling back to XMODEM/YMODEM sector mode when the peer never
/// answers one (and `policy.allow_legacy_fallback` is set).
pub fn receive<T>(
    transport: &mut T,
    dest_dir: &Path,
    policy: &ReceivePolicy,
    mut tick: impl FnMut(&str, u64, u64, f64, u32, u32) -> bool,
    mut complete: impl FnMut(&str, Option<&Error>, u64, u64),
) -> Result<u64, Error>
where
    T: Read + Write,
{
    let options = ReceiveOptions {
        deadline: policy.deadline,
        min_bps: policy.min_bps,
        header_timeout: policy.header_timeout,
        unlink_on_abort: policy.restricted,
        ..ReceiveOptions::default()
    };

    let restricted = policy.restricted;
    let mut approver = move |name: &str, _size: u64, _modtime: u64| -> bool {
        if restricted && Path::new(name).is_absolute() {
            return false;
        }
        true
    };

    let mut tee = Tee::new(&mut *transport);
    match recv::receive(
        &mut tee,
        dest_dir,
        Some(&mut approver),
        &mut tick,
        &mut complete,
        options,
    ) {
        Ok(total) => Ok(total),
        Err(Error::GarbageOverflow) if policy.allow_legacy_fallback => {
            let recorded = tee.into_recorded();
            let mut replay = Replay::new(recorded, transport);

            let staging_path = dest_dir.join(".zmodem-legacy-incoming");
            let mut staging = std::fs::File::create(&staging_path)?;
            let mut received_name = String::new();
            let result = xmodem::receive(
                &mut replay,
                &mut staging,
                policy.header_timeout,
                |name, _size| received_name = name.to_string(),
            );
            drop(staging);

            match result {
                Ok(total) => {
                    let name = if received_name.is_empty() {
                        "unknown".to_string()
                    } else {
                        received_name
                    };
                    let dest_path = resolve_legacy_destination(dest_dir, &name, restricted);
                    std::fs::rename(&staging_path, &dest_path)?;
                    complete(&name, None, total, 0);
                    Ok(total)
                }
                Err(e) => {
                    let _ = std::fs::remove_file(&staging_path);
                    complete("", Some(&e), 0, 0);
                    Err(e)
                }
            }
        }
        Err(e) => Err(e),
    }
}

/// Mirrors `recv::resolve_destination`'s path-traversal defense for the
/// legacy fallback's eventual rename target: only the base name survives,
/// regardless of what the YMODEM batch header claimed.
fn resolve_legacy_destination(dir: &Path, name: &str, _restricted: bool) -> PathBuf {
    let trimmed = Path::new(name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("unknown"));
    dir.join(trimmed)
}

/// Sends `files` over a ZMODEM session.
pub fn send<T>(
    transport: &mut T,
    files: &[PathBuf],
    policy: &SendPolicy,
    mut tick: impl FnMut(&str, u64, u64, f64, u32, u32) -> bool,
    mut complete: impl FnMut(&str, Option<&Error>, u64, u64),
) -> Result<u64, Error>
where
    T: Read + Write,
{
    let mut sources = Vec::with_capacity(files.len());
    for path in files {
        sources.push(FileSource::open(path)?);
    }

    let mut to_send: Vec<FileToSend<'_>> = files
        .iter()
        .zip(sources.iter_mut())
        .map(|(path, source)| FileToSend {
            name: path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unnamed")
                .to_string(),
            source: source as &mut dyn Source,
        })
        .collect();

    let options = SendOptions {
        deadline: policy.deadline,
        header_timeout: policy.header_timeout,
        max_blklen: policy.max_blklen,
        window: policy.window,
        ..SendOptions::default()
    };

    send::send(transport, &mut to_send, &mut tick, &mut complete, options)
}

/// Records every byte read from `inner` so it can be replayed to a
/// fallback reader after the handshake probe gives up.
struct Tee<'a, T> {
    inner: &'a mut T,
    recorded: Vec<u8>,
}

impl<'a, T> Tee<'a, T> {
    fn new(inner: &'a mut T) -> Self {
        Self {
            inner,
            recorded: Vec::new(),
        }
    }

    fn into_recorded(self) -> Vec<u8> {
        self.recorded
    }
}

impl<T: Read> Read for Tee<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.recorded.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

impl<T: Write> Write for Tee<'_, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Replays previously-recorded bytes ahead of whatever `inner` produces
/// next; writes pass straight through.
struct Replay<'a, T> {
    buffered: Cursor<Vec<u8>>,
    inner: &'a mut T,
}

impl<'a, T> Replay<'a, T> {
    fn new(buffered: Vec<u8>, inner: &'a mut T) -> Self {
        Self {
            buffered: Cursor::new(buffered),
            inner,
        }
    }
}

impl<T: Read> Read for Replay<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.buffered.read(buf)?;
        if n > 0 {
            return Ok(n);
        }
        self.inner.read(buf)
    }
}

impl<T: Write> Write for Replay<'_, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor as IoCursor;

    #[test]
    fn restricted_by_environment_reads_zmodem_restricted() {
        env::set_var("ZMODEM_RESTRICTED", "1");
        assert!(restricted_by_environment());
        env::remove_var("ZMODEM_RESTRICTED");
    }

    #[test]
    fn tee_then_replay_reproduces_original_byte_sequence() {
        let mut source = IoCursor::new(b"hello world".to_vec());
        let mut tee = Tee::new(&mut source);
        let mut first = [0u8; 5];
        tee.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"hello");

        let recorded = tee.into_recorded();
        let mut rest_source = IoCursor::new(Vec::new());
        let mut replay = Replay::new(recorded, &mut rest_source);
        let mut all = Vec::new();
        replay.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"hello");
    }
}
