// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-transfer file metadata record, and the ZFILE subpacket's
//! NUL-terminated-name-plus-ASCII-tail encoding of it.
//!
//! The name parsing is grounded on the teacher's `ZfileReader` (see
//! `examples/Dr-Emann-zmodem2/src/lib.rs`), which already reaches for
//! `binread`'s `NullString` for this exact shape; the numeric tail is new,
//! grounded on the "size modtime mode program 0 filesleft totalleft"
//! line `zmodem.txt`/`lrz.c` attach after the name.

use binread::{io::Cursor, BinRead, BinReaderExt, NullString};

use crate::error::Error;

#[derive(BinRead)]
#[br(assert(file_name.len() != 0))]
struct NameField {
    file_name: NullString,
}

/// Metadata describing one file in transit, parsed from or serialized into
/// a ZFILE subpacket payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub bytes_total: u64,
    pub modtime: u64,
    pub mode: u32,
    pub files_left: Option<u32>,
    pub bytes_left: Option<u64>,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, bytes_total: u64) -> Self {
        Self {
            name: name.into(),
            bytes_total,
            modtime: 0,
            mode: 0o100644,
            files_left: None,
            bytes_left: None,
        }
    }

    pub fn with_modtime(mut self, modtime: u64) -> Self {
        self.modtime = modtime;
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_remaining(mut self, files_left: u32, bytes_left: u64) -> Self {
        self.files_left = Some(files_left);
        self.bytes_left = Some(bytes_left);
        self
    }

    /// Serializes into the ZFILE subpacket payload: NUL-terminated name
    /// followed by an ASCII tail of
    /// `"size modtime_octal mode_octal 0 filesleft totalleft"`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.name.len() + 32);
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        out.extend_from_slice(
            format!(
                "{} {:o} {:o} 0 {} {}",
                self.bytes_total,
                self.modtime,
                self.mode,
                self.files_left.map(|n| n.to_string()).unwrap_or_default(),
                self.bytes_left.map(|n| n.to_string()).unwrap_or_default(),
            )
            .as_bytes(),
        );
        out
    }

    /// Parses a ZFILE subpacket payload. Every field after the name is
    /// optional, same as the original's `rzfiles` tail: senders that only
    /// care about batch transfers may omit size/modtime/mode entirely.
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(payload);
        let parsed: NameField = cursor
            .read_ne()
            .map_err(|_| Error::UnexpectedFrame)?;
        let name = parsed.file_name.into_string();

        let tail_start = name.len() + 1;
        let tail = payload
            .get(tail_start..)
            .unwrap_or(&[])
            .iter()
            .take_while(|&&b| b != 0)
            .copied()
            .collect::<Vec<u8>>();
        let tail = String::from_utf8_lossy(&tail);
        let mut fields = tail.split_whitespace();

        let bytes_total = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let modtime = fields
            .next()
            .and_then(|s| u64::from_str_radix(s, 8).ok())
            .unwrap_or(0);
        let mode = fields
            .next()
            .and_then(|s| u32::from_str_radix(s, 8).ok())
            .unwrap_or(0o100644);
        let _program_serial = fields.next();
        let files_left = fields.next().and_then(|s| s.parse().ok());
        let bytes_left = fields.next().and_then(|s| s.parse().ok());

        Ok(FileInfo {
            name,
            bytes_total,
            modtime,
            mode,
            files_left,
            bytes_left,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_full_tail() {
        let info = FileInfo::new("report.pdf", 4096)
            .with_modtime(1_700_000_000)
            .with_mode(0o100644)
            .with_remaining(3, 12_345);
        let encoded = info.encode();
        let decoded = FileInfo::decode(&encoded).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn decodes_name_only_payload() {
        let mut payload = b"minimal.bin".to_vec();
        payload.push(0);
        let decoded = FileInfo::decode(&payload).unwrap();
        assert_eq!(decoded.name, "minimal.bin");
        assert_eq!(decoded.bytes_total, 0);
        assert_eq!(decoded.files_left, None);
    }

    #[test]
    fn rejects_empty_name() {
        let payload = [0u8];
        assert!(FileInfo::decode(&payload).is_err());
    }
}
