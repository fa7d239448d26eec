//! Journal file framing.
//!
//! On-disk layout of a journal file:
//! ```text
//! [Header page: 512 bytes]  magic "RKJL", version u32 BE, zero padding
//! [Record 0][Record 1]...[Record N]
//! ```
//! Record frame (version 4):
//! ```text
//! [len: i32 BE][payload: len bytes][crc32c(payload): u32 BE]
//! ```
//! Version 3 files carry no per-record checksum. The payload always
//! begins with `ledger_id: i64 BE, entry_id: i64 BE`.
//!
//! Version gates: meta records carrying a ledger master key require
//! version >= 3; fence meta records require version >= 4. Replayers must
//! reject meta records from files too old to contain them.

use rook_error::{BookieError, Result};
use rook_types::Cx;
use rook_vfs::traits::read_exact_at;
use rook_vfs::VfsFile;

/// Magic bytes at the start of every journal file.
pub const JOURNAL_MAGIC: [u8; 4] = *b"RKJL";

/// Size of the journal file header page.
pub const JOURNAL_HEADER_SIZE: usize = 512;

/// Oldest journal version this bookie reads.
pub const JOURNAL_VERSION_MIN: u32 = 3;
/// Journal version introducing master-key meta records.
pub const JOURNAL_VERSION_V3: u32 = 3;
/// Journal version introducing fence meta records and record checksums.
pub const JOURNAL_VERSION_V4: u32 = 4;
/// Newest journal version this bookie reads.
pub const JOURNAL_VERSION_MAX: u32 = 4;
/// Version written for new journal files.
pub const JOURNAL_VERSION_CURRENT: u32 = JOURNAL_VERSION_V4;

/// Upper bound on a single record's payload; larger lengths are framing
/// damage, not data.
pub const MAX_RECORD_SIZE: usize = 128 * 1024 * 1024;

/// Parsed journal file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub version: u32,
}

impl JournalHeader {
    /// Header for a freshly created journal file.
    #[must_use]
    pub const fn current() -> Self {
        Self {
            version: JOURNAL_VERSION_CURRENT,
        }
    }

    /// Serialize into a full header page.
    #[must_use]
    pub fn to_bytes(self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        buf[..4].copy_from_slice(&JOURNAL_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_be_bytes());
        buf
    }

    /// Parse a header page.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(BookieError::journal_corrupt(format!(
                "journal header too small: {} bytes",
                buf.len()
            )));
        }
        if buf[..4] != JOURNAL_MAGIC {
            return Err(BookieError::journal_corrupt("bad journal magic"));
        }
        let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if !(JOURNAL_VERSION_MIN..=JOURNAL_VERSION_MAX).contains(&version) {
            return Err(BookieError::journal_corrupt(format!(
                "unsupported journal version {version}"
            )));
        }
        Ok(Self { version })
    }
}

/// Encoded size of a record frame at a given version.
#[must_use]
pub fn frame_size(version: u32, payload_len: usize) -> u64 {
    let crc = if version >= JOURNAL_VERSION_V4 { 4 } else { 0 };
    4 + payload_len as u64 + crc
}

/// Append a record frame to `out`.
pub fn encode_record(version: u32, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let len = i32::try_from(payload.len())
        .map_err(|_| BookieError::internal("journal record too large"))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    if version >= JOURNAL_VERSION_V4 {
        out.extend_from_slice(&crc32c::crc32c(payload).to_be_bytes());
    }
    Ok(())
}

/// Outcome of reading one record frame.
#[derive(Debug)]
pub enum RecordRead {
    /// A well-formed record; `next_offset` points at the following frame.
    Complete { payload: Vec<u8>, next_offset: u64 },
    /// Clean end of the record stream (offset is exactly the file size).
    End,
    /// Damaged frame starting at this offset; the tail of the file is
    /// unusable from here on.
    Torn { reason: &'static str },
}

/// Read the record frame starting at `offset`.
///
/// A frame that extends past `file_size`, a non-positive length, or a
/// checksum mismatch all report [`RecordRead::Torn`]; the caller decides
/// whether a torn frame is an expected crash tail or interior corruption.
pub fn read_record_at(
    file: &impl VfsFile,
    cx: &Cx,
    version: u32,
    offset: u64,
    file_size: u64,
) -> Result<RecordRead> {
    if offset >= file_size {
        return Ok(RecordRead::End);
    }
    if file_size - offset < 4 {
        return Ok(RecordRead::Torn {
            reason: "partial record length",
        });
    }
    let mut len_buf = [0u8; 4];
    read_exact_at(file, cx, &mut len_buf, offset)?;
    let len = i32::from_be_bytes(len_buf);
    if len <= 0 {
        return Ok(RecordRead::Torn {
            reason: "non-positive record length",
        });
    }
    #[allow(clippy::cast_sign_loss)]
    let len = len as usize;
    if len > MAX_RECORD_SIZE {
        return Ok(RecordRead::Torn {
            reason: "record length exceeds sanity bound",
        });
    }
    let total = frame_size(version, len);
    if file_size - offset < total {
        return Ok(RecordRead::Torn {
            reason: "record extends past end of file",
        });
    }

    let mut payload = vec![0u8; len];
    read_exact_at(file, cx, &mut payload, offset + 4)?;

    if version >= JOURNAL_VERSION_V4 {
        let mut crc_buf = [0u8; 4];
        read_exact_at(file, cx, &mut crc_buf, offset + 4 + len as u64)?;
        let stored = u32::from_be_bytes(crc_buf);
        if stored != crc32c::crc32c(&payload) {
            return Ok(RecordRead::Torn {
                reason: "record checksum mismatch",
            });
        }
    }

    Ok(RecordRead::Complete {
        payload,
        next_offset: offset + total,
    })
}
