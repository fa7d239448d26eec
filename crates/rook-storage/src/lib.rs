//! Storage engine for the bookie: ledger directories, the interleaved
//! entry log, the paged per-ledger index with its cache, and the garbage
//! collector / compactor that reclaims dead segments.

pub mod entry_log;
pub mod gc;
pub mod index_file;
pub mod ledger_cache;
pub mod ledger_dirs;
pub mod storage;

pub use entry_log::EntryLogger;
pub use gc::{GarbageCollector, GcConfig, LedgerLiveness};
pub use index_file::LedgerIndexFile;
pub use ledger_cache::LedgerCache;
pub use ledger_dirs::{DirsListener, LedgerDirs};
pub use storage::InterleavedStorage;
