// SPDX-License-Identifier: MIT OR Apache-2.0
//! File sink/source adapters (component C7): positional read/write,
//! truncation at a resume offset, and final mtime/mode application.
//!
//! Grounded on the open/seek/close sequencing in `zm_rzfile`/`zm_close_file`
//! (`original_source/src/lrz.c`) and `zsendfile`/closing logic in
//! `original_source/src/lsz.c`. The original applies `O_SYNC` to the wrong
//! `fcntl` slot (`F_SETFD`, close-on-exec, instead of `F_SETFL`); this
//! adapter does not reproduce that bug; it sets `O_SYNC` at `open` time
//! like any other flag.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Receive-side destination for file bytes.
pub trait Sink {
    /// Appends at the current cursor. Called only in non-decreasing offset
    /// order; the out-of-sync stash is responsible for that ordering.
    fn write(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Repositions the cursor, used once at open time to honor a resume
    /// offset.
    fn seek(&mut self, pos: u64) -> Result<(), Error>;

    /// Finalizes the file: applies `modtime`/`mode` if meaningful for this
    /// sink (a no-op for pipes), then closes.
    fn finish(self: Box<Self>, modtime: u64, mode: u32) -> Result<(), Error>;

    /// Drops the partially-written file; called after a fatal-per-file or
    /// fatal-per-session abort when the destination should not be kept.
    fn abort(self: Box<Self>);
}

/// A plain regular file on disk.
pub struct FileSink {
    path: PathBuf,
    file: File,
    unlink_on_abort: bool,
}

impl FileSink {
    pub fn create(path: impl Into<PathBuf>, unlink_on_abort: bool) -> Result<Self, Error> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(Error::FileOpen)?;
        Ok(Self {
            path,
            file,
            unlink_on_abort,
        })
    }
}

impl Sink for FileSink {
    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.set_len(pos)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>, modtime: u64, mode: u32) -> Result<(), Error> {
        self.file.flush()?;
        apply_metadata(&self.path, modtime, mode)?;
        Ok(())
    }

    fn abort(self: Box<Self>) {
        if self.unlink_on_abort {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
fn apply_metadata(path: &Path, modtime: u64, mode: u32) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;

    let ft = filetime::FileTime::from_unix_time(modtime as i64, 0);
    filetime::set_file_mtime(path, ft)?;
    let perms = std::fs::Permissions::from_mode(mode & 0o7777);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn apply_metadata(path: &Path, modtime: u64, _mode: u32) -> Result<(), Error> {
    let ft = filetime::FileTime::from_unix_time(modtime as i64, 0);
    filetime::set_file_mtime(path, ft)?;
    Ok(())
}

/// Send-side origin of file bytes.
pub trait Source {
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn modtime(&self) -> u64;
    fn mode(&self) -> u32;

    /// Seeks to `pos` and reads up to `buf.len()` bytes, returning the
    /// number actually read (short only at end-of-file).
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize, Error>;

    /// CRC-32 over the first `count` bytes (or the whole file if `count`
    /// is `None`), used to answer a `ZCRC` challenge.
    fn crc32(&mut self, count: Option<u64>) -> Result<u32, Error>;
}

pub struct FileSource {
    file: File,
    len: u64,
    modtime: u64,
    mode: u32,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(Error::FileOpen)?;
        let meta = file.metadata()?;
        let modtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode()
        };
        #[cfg(not(unix))]
        let mode = 0o100644;
        Ok(Self {
            file,
            len: meta.len(),
            modtime,
            mode,
        })
    }
}

impl Source for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn modtime(&self) -> u64 {
        self.modtime
    }

    fn mode(&self) -> u32 {
        self.mode
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize, Error> {
        self.file.seek(SeekFrom::Start(pos))?;
        let mut total = 0;
        while total < buf.len() {
            let n = self.file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn crc32(&mut self, count: Option<u64>) -> Result<u32, Error> {
        let limit = count.unwrap_or(self.len).min(self.len);
        self.file.seek(SeekFrom::Start(0))?;
        let mut crc = crate::crc::Crc32::new();
        let mut buf = [0u8; 8192];
        let mut remaining = limit;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = self.file.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            crc.update_slice(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(crc.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn file_sink_writes_sequentially_and_applies_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut sink: Box<dyn Sink> = Box::new(FileSink::create(&path, true).unwrap());
        sink.write(b"hello").unwrap();
        sink.write(b" world").unwrap();
        sink.finish(1_700_000_000, 0o100640).unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[test]
    fn file_sink_abort_unlinks_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let sink: Box<dyn Sink> = Box::new(FileSink::create(&path, true).unwrap());
        sink.abort();
        assert!(!path.exists());
    }

    #[test]
    fn file_source_reads_at_arbitrary_offsets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        let mut source = FileSource::open(file.path()).unwrap();
        let mut buf = [0u8; 4];
        let n = source.read_at(3, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"3456");
    }

    #[test]
    fn file_source_crc32_matches_bulk_checksum() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"the quick brown fox").unwrap();
        let mut source = FileSource::open(file.path()).unwrap();
        let crc = source.crc32(None).unwrap();
        assert_eq!(crc, crate::crc::Crc32::checksum(b"the quick brown fox"));
    }
}
