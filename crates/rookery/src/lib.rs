//! Public API for the Rookery bookie.
//!
//! A bookie is one storage node of a replicated log service: it persists
//! entries for many independent ledgers behind a write-ahead journal,
//! serves reads from an interleaved entry log via paged per-ledger
//! indexes, and keeps its cluster identity pinned with cookies. Ensemble
//! selection, quorum writes, and ledger recovery are client-side
//! concerns; the bookie only guarantees that what it acknowledged
//! survives.

pub mod bookie;
pub mod cookie;
pub mod format;
pub mod handle;
pub mod meta;
pub mod sync_thread;

pub use bookie::Bookie;
pub use cookie::Cookie;
pub use format::format;
pub use handle::{HandleFactory, LedgerDescriptor};
pub use meta::{InMemoryMetadataClient, InMemoryMetadataService, MetadataClient};
pub use sync_thread::SyncThread;

pub use rook_error::{BookieError, ExitCode, Result};
pub use rook_journal::Ack;
pub use rook_types::{BookieConfig, Cx};
