//! Write-ahead journal: the durability backbone of the bookie.
//!
//! Every mutation is framed into a journal record and group-committed;
//! the acknowledgement handle resolves only after the record's batch
//! fsync returned. On restart the journal is replayed from the persisted
//! last-log-mark to rebuild anything the storage layer had not flushed.

pub mod ack;
pub mod frame;
pub mod journal;
pub mod mark;

pub use ack::Ack;
pub use frame::{
    JournalHeader, RecordRead, JOURNAL_HEADER_SIZE, JOURNAL_MAGIC, JOURNAL_VERSION_CURRENT,
    JOURNAL_VERSION_MAX, JOURNAL_VERSION_MIN, JOURNAL_VERSION_V3, JOURNAL_VERSION_V4,
};
pub use journal::{FatalHook, Journal, JournalConfig, JournalMetrics};
pub use mark::MarkFile;
