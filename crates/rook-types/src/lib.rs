//! Core identifiers and on-disk codecs shared by every Rookery crate.

pub mod config;
pub mod cx;

pub use config::BookieConfig;
pub use cx::Cx;

use std::fmt;

use rook_error::{BookieError, Result};

/// A ledger identifier.
///
/// Ledgers are created by external clients; the bookie only ever sees ids
/// chosen elsewhere, so the full `i64` range is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct LedgerId(i64);

impl LedgerId {
    /// Wrap a raw ledger id.
    #[inline]
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw i64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An entry identifier within a ledger.
///
/// Real entries carry non-negative ids. Negative values are reserved:
/// the read-path sentinel [`EntryId::LAST`] and the journal-only meta
/// entry ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct EntryId(i64);

impl EntryId {
    /// Read-path sentinel meaning "the highest entry id known".
    pub const LAST: Self = Self(-1);

    /// Journal meta record carrying a ledger's master key.
    pub const METAENTRY_LEDGER_KEY: Self = Self(-0x1000);

    /// Journal meta record marking a ledger fenced.
    pub const METAENTRY_FENCE_KEY: Self = Self(-0x2000);

    /// Wrap a raw entry id.
    #[inline]
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw i64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Whether this id names a journal-only meta record.
    #[inline]
    #[must_use]
    pub const fn is_meta(self) -> bool {
        matches!(self, Self::METAENTRY_LEDGER_KEY | Self::METAENTRY_FENCE_KEY)
    }

    /// Whether this id may appear in the entry log (real entries only).
    #[inline]
    #[must_use]
    pub const fn is_storable(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An entry-log segment id.
///
/// Segment files are named by the id rendered as 8 lowercase hex digits
/// with a `.log` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct LogId(u32);

impl LogId {
    /// Wrap a raw segment id.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The fixed-width lowercase-hex file stem for this segment.
    #[must_use]
    pub fn file_stem(self) -> String {
        format!("{:08x}", self.0)
    }

    /// Parse a fixed-width lowercase-hex file stem.
    #[must_use]
    pub fn parse_file_stem(stem: &str) -> Option<Self> {
        if stem.len() != 8 {
            return None;
        }
        u32::from_str_radix(stem, 16).ok().map(Self)
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Size in bytes of an encoded index slot: `log_id:u32` + `offset:u64`.
pub const ENTRY_LOCATION_SIZE: usize = 12;

/// Stable location of an entry inside the entry log.
///
/// The all-zero encoding is reserved for "absent" in index pages, so a
/// real location never has `log_id == 0 && offset == 0`; entry-log
/// segment ids start at 1 and offsets start past the segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryLocation {
    pub log_id: LogId,
    pub offset: u64,
}

impl EntryLocation {
    /// Encode into a 12-byte big-endian index slot.
    #[must_use]
    pub fn to_slot(self) -> [u8; ENTRY_LOCATION_SIZE] {
        let mut slot = [0u8; ENTRY_LOCATION_SIZE];
        slot[..4].copy_from_slice(&self.log_id.get().to_be_bytes());
        slot[4..].copy_from_slice(&self.offset.to_be_bytes());
        slot
    }

    /// Decode a 12-byte big-endian index slot; `None` for the absent slot.
    #[must_use]
    pub fn from_slot(slot: &[u8; ENTRY_LOCATION_SIZE]) -> Option<Self> {
        let log_id = u32::from_be_bytes([slot[0], slot[1], slot[2], slot[3]]);
        let offset = u64::from_be_bytes([
            slot[4], slot[5], slot[6], slot[7], slot[8], slot[9], slot[10], slot[11],
        ]);
        if log_id == 0 && offset == 0 {
            None
        } else {
            Some(Self {
                log_id: LogId::new(log_id),
                offset,
            })
        }
    }
}

/// Length of the mandatory `(ledger_id, entry_id)` prefix of every entry.
pub const ENTRY_PREFIX_SIZE: usize = 16;

/// Parse the mandatory 16-byte big-endian `(ledger_id, entry_id)` prefix.
pub fn parse_entry_prefix(entry: &[u8]) -> Result<(LedgerId, EntryId)> {
    if entry.len() < ENTRY_PREFIX_SIZE {
        return Err(BookieError::ShortRead {
            expected: ENTRY_PREFIX_SIZE,
            actual: entry.len(),
        });
    }
    let ledger_id = i64::from_be_bytes([
        entry[0], entry[1], entry[2], entry[3], entry[4], entry[5], entry[6], entry[7],
    ]);
    let entry_id = i64::from_be_bytes([
        entry[8], entry[9], entry[10], entry[11], entry[12], entry[13], entry[14], entry[15],
    ]);
    Ok((LedgerId::new(ledger_id), EntryId::new(entry_id)))
}

/// Size in bytes of the encoded last-log-mark file.
pub const LAST_LOG_MARK_SIZE: usize = 12;

/// Durable journal position: every record at or before it has been
/// persisted to both the entry log and the index files.
///
/// Ordered lexicographically on `(journal_id, position)`; the checkpoint
/// protocol guarantees it only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LastLogMark {
    pub journal_id: u32,
    pub position: u64,
}

impl LastLogMark {
    /// Encode as the 12-byte big-endian `(i32, i64)` on-disk form.
    #[allow(clippy::cast_possible_wrap)]
    #[must_use]
    pub fn to_bytes(self) -> [u8; LAST_LOG_MARK_SIZE] {
        let mut buf = [0u8; LAST_LOG_MARK_SIZE];
        buf[..4].copy_from_slice(&(self.journal_id as i32).to_be_bytes());
        buf[4..].copy_from_slice(&(self.position as i64).to_be_bytes());
        buf
    }

    /// Decode the 12-byte on-disk form. Negative fields are invalid.
    #[must_use]
    pub fn from_bytes(buf: &[u8; LAST_LOG_MARK_SIZE]) -> Option<Self> {
        let journal_id = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let position = i64::from_be_bytes([
            buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
        ]);
        if journal_id < 0 || position < 0 {
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        Some(Self {
            journal_id: journal_id as u32,
            position: position as u64,
        })
    }
}

impl fmt::Display for LastLogMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.journal_id, self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_id_file_stem_roundtrip() {
        let id = LogId::new(0xab3);
        assert_eq!(id.file_stem(), "00000ab3");
        assert_eq!(LogId::parse_file_stem("00000ab3"), Some(id));
        assert_eq!(LogId::parse_file_stem("ab3"), None);
        assert_eq!(LogId::parse_file_stem("zzzzzzzz"), None);
    }

    #[test]
    fn entry_location_slot_roundtrip() {
        let loc = EntryLocation {
            log_id: LogId::new(7),
            offset: 0x1234_5678_9abc,
        };
        let slot = loc.to_slot();
        assert_eq!(EntryLocation::from_slot(&slot), Some(loc));
    }

    #[test]
    fn entry_location_zero_slot_is_absent() {
        assert_eq!(
            EntryLocation::from_slot(&[0u8; ENTRY_LOCATION_SIZE]),
            None
        );
    }

    #[test]
    fn entry_prefix_parse() {
        let mut entry = Vec::new();
        entry.extend_from_slice(&42i64.to_be_bytes());
        entry.extend_from_slice(&7i64.to_be_bytes());
        entry.extend_from_slice(b"payload");
        let (lid, eid) = parse_entry_prefix(&entry).unwrap();
        assert_eq!(lid, LedgerId::new(42));
        assert_eq!(eid, EntryId::new(7));

        let err = parse_entry_prefix(&entry[..10]).unwrap_err();
        assert!(matches!(
            err,
            rook_error::BookieError::ShortRead {
                expected: 16,
                actual: 10
            }
        ));
    }

    #[test]
    fn meta_entry_ids() {
        assert_eq!(EntryId::METAENTRY_LEDGER_KEY.get(), -0x1000);
        assert_eq!(EntryId::METAENTRY_FENCE_KEY.get(), -0x2000);
        assert!(EntryId::METAENTRY_LEDGER_KEY.is_meta());
        assert!(!EntryId::LAST.is_meta());
        assert!(!EntryId::METAENTRY_FENCE_KEY.is_storable());
        assert!(EntryId::new(0).is_storable());
    }

    #[test]
    fn mark_ordering_and_roundtrip() {
        let a = LastLogMark {
            journal_id: 1,
            position: 100,
        };
        let b = LastLogMark {
            journal_id: 1,
            position: 200,
        };
        let c = LastLogMark {
            journal_id: 2,
            position: 0,
        };
        assert!(a < b && b < c);

        let bytes = c.to_bytes();
        assert_eq!(LastLogMark::from_bytes(&bytes), Some(c));
    }

    #[test]
    fn mark_rejects_negative_fields() {
        let mut buf = [0u8; LAST_LOG_MARK_SIZE];
        buf[0] = 0x80; // negative journal id
        assert_eq!(LastLogMark::from_bytes(&buf), None);
    }
}
