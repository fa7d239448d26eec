//! Composition of the entry log and the ledger cache: the bookie's
//! ledger storage.
//!
//! The write path appends the full entry to the entry log (buffered) and
//! records the returned location in the cache; the read path resolves
//! the location (paging index files in on demand) and reads the payload
//! back. Durability of acknowledged writes is the journal's job; this
//! layer only has to be consistent once `flush` returns.

use rook_error::{BookieError, Result};
use rook_types::{parse_entry_prefix, Cx, EntryId};
use rook_vfs::Vfs;
use tracing::trace;

use crate::entry_log::EntryLogger;
use crate::ledger_cache::LedgerCache;

/// Interleaved ledger storage: one entry log, many ledger indexes.
pub struct InterleavedStorage<V: Vfs> {
    entry_log: EntryLogger<V>,
    cache: LedgerCache<V>,
}

impl<V: Vfs> InterleavedStorage<V> {
    /// Compose storage from its two halves.
    pub fn new(entry_log: EntryLogger<V>, cache: LedgerCache<V>) -> Self {
        Self { entry_log, cache }
    }

    /// The entry log (the compactor reads and rewrites segments).
    #[must_use]
    pub fn entry_log(&self) -> &EntryLogger<V> {
        &self.entry_log
    }

    /// The ledger cache (the compactor swaps locations through it).
    #[must_use]
    pub fn cache(&self) -> &LedgerCache<V> {
        &self.cache
    }

    /// Append an entry (full image including the 16-byte prefix) and
    /// index it. Returns the parsed `(ledger_id, entry_id)`.
    pub fn add_entry(&self, cx: &Cx, entry: &[u8]) -> Result<(i64, i64)> {
        let (ledger_id, entry_id) = parse_entry_prefix(entry)?;
        if !entry_id.is_storable() {
            return Err(BookieError::internal(format!(
                "entry id {entry_id} is not storable"
            )));
        }
        let location = self.entry_log.add_entry(cx, entry)?;
        self.cache
            .put(cx, ledger_id.get(), entry_id.get(), location)?;
        trace!(ledger_id = ledger_id.get(), entry_id = entry_id.get(), ?location, "entry added");
        Ok((ledger_id.get(), entry_id.get()))
    }

    /// Read an entry back. `EntryId::LAST` (-1) resolves to the highest
    /// entry id known for the ledger.
    pub fn read_entry(&self, cx: &Cx, ledger_id: i64, entry_id: i64) -> Result<Vec<u8>> {
        let resolved = if entry_id == EntryId::LAST.get() {
            let last = self.cache.last_entry(cx, ledger_id)?;
            if last < 0 {
                return Err(BookieError::NoEntry {
                    ledger_id,
                    entry_id,
                });
            }
            last
        } else {
            entry_id
        };
        let location = self
            .cache
            .get(cx, ledger_id, resolved)?
            .ok_or(BookieError::NoEntry {
                ledger_id,
                entry_id: resolved,
            })?;
        let entry = self.entry_log.read_entry(cx, location)?;
        let (got_ledger, got_entry) = parse_entry_prefix(&entry)?;
        if got_ledger.get() != ledger_id || got_entry.get() != resolved {
            return Err(BookieError::EntryLogCorrupt {
                detail: format!(
                    "location for ({ledger_id}, {resolved}) holds entry ({got_ledger}, {got_entry})"
                ),
            });
        }
        Ok(entry)
    }

    /// Create-or-verify the ledger with its master key.
    pub fn ensure_ledger(&self, cx: &Cx, ledger_id: i64, master_key: &[u8]) -> Result<()> {
        self.cache.ensure_ledger(cx, ledger_id, master_key)
    }

    /// The ledger's master key.
    pub fn read_master_key(&self, cx: &Cx, ledger_id: i64) -> Result<Vec<u8>> {
        self.cache.read_master_key(cx, ledger_id)
    }

    /// Whether the ledger is fenced.
    pub fn is_fenced(&self, cx: &Cx, ledger_id: i64) -> Result<bool> {
        self.cache.is_fenced(cx, ledger_id)
    }

    /// Fence the ledger. Returns whether this call made the transition.
    pub fn set_fenced(&self, cx: &Cx, ledger_id: i64) -> Result<bool> {
        self.cache.set_fenced(cx, ledger_id)
    }

    /// Drop all local state for a deleted ledger.
    pub fn delete_ledger(&self, cx: &Cx, ledger_id: i64) -> Result<()> {
        self.cache.delete_ledger(cx, ledger_id)
    }

    /// Flush entry log then index cache; on return every previously
    /// acknowledged mutation is durable in both.
    pub fn flush(&self, cx: &Cx) -> Result<()> {
        self.entry_log.flush(cx)?;
        self.cache.flush(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger_dirs::LedgerDirs;
    use rook_vfs::MemoryVfs;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn entry(ledger_id: i64, entry_id: i64, body: &[u8]) -> Vec<u8> {
        let mut e = Vec::with_capacity(16 + body.len());
        e.extend_from_slice(&ledger_id.to_be_bytes());
        e.extend_from_slice(&entry_id.to_be_bytes());
        e.extend_from_slice(body);
        e
    }

    fn setup() -> (MemoryVfs, Cx, InterleavedStorage<MemoryVfs>) {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let dirs = Arc::new(
            LedgerDirs::open(Arc::new(vfs.clone()), &cx, &[PathBuf::from("/l0")], 0.95).unwrap(),
        );
        let entry_log =
            EntryLogger::open(Arc::new(vfs.clone()), Arc::clone(&dirs), &cx, 1 << 20).unwrap();
        let cache = LedgerCache::new(Arc::new(vfs.clone()), dirs, 8192, 64);
        (vfs, cx, InterleavedStorage::new(entry_log, cache))
    }

    #[test]
    fn add_then_read() {
        let (_vfs, cx, storage) = setup();
        storage.ensure_ledger(&cx, 1, b"k").unwrap();
        let e = entry(1, 0, b"hello");
        assert_eq!(storage.add_entry(&cx, &e).unwrap(), (1, 0));
        assert_eq!(storage.read_entry(&cx, 1, 0).unwrap(), e);
    }

    #[test]
    fn last_entry_sentinel() {
        let (_vfs, cx, storage) = setup();
        storage.ensure_ledger(&cx, 1, b"k").unwrap();
        assert!(matches!(
            storage.read_entry(&cx, 1, -1),
            Err(BookieError::NoEntry { .. })
        ));
        for i in 0..5 {
            storage.add_entry(&cx, &entry(1, i, b"x")).unwrap();
        }
        assert_eq!(storage.read_entry(&cx, 1, -1).unwrap(), entry(1, 4, b"x"));
    }

    #[test]
    fn missing_entry_and_ledger_errors() {
        let (_vfs, cx, storage) = setup();
        storage.ensure_ledger(&cx, 1, b"k").unwrap();
        storage.add_entry(&cx, &entry(1, 0, b"x")).unwrap();
        assert!(matches!(
            storage.read_entry(&cx, 1, 9),
            Err(BookieError::NoEntry {
                ledger_id: 1,
                entry_id: 9
            })
        ));
        assert!(matches!(
            storage.read_entry(&cx, 2, 0),
            Err(BookieError::NoLedger { ledger_id: 2 })
        ));
    }

    #[test]
    fn flush_then_crash_preserves_entries() {
        let (vfs, cx, storage) = setup();
        storage.ensure_ledger(&cx, 1, b"k").unwrap();
        let e = entry(1, 0, b"durable");
        storage.add_entry(&cx, &e).unwrap();
        storage.flush(&cx).unwrap();
        vfs.crash();

        let dirs = Arc::new(
            LedgerDirs::open(Arc::new(vfs.clone()), &cx, &[PathBuf::from("/l0")], 0.95).unwrap(),
        );
        let entry_log =
            EntryLogger::open(Arc::new(vfs.clone()), Arc::clone(&dirs), &cx, 1 << 20).unwrap();
        let cache = LedgerCache::new(Arc::new(vfs), dirs, 8192, 64);
        let reopened = InterleavedStorage::new(entry_log, cache);
        assert_eq!(reopened.read_entry(&cx, 1, 0).unwrap(), e);
    }

    #[test]
    fn non_contiguous_entry_ids_are_fine() {
        let (_vfs, cx, storage) = setup();
        storage.ensure_ledger(&cx, 1, b"k").unwrap();
        for id in [3i64, 700, 12] {
            storage.add_entry(&cx, &entry(1, id, b"sparse")).unwrap();
        }
        assert_eq!(storage.read_entry(&cx, 1, 700).unwrap(), entry(1, 700, b"sparse"));
        assert_eq!(storage.read_entry(&cx, 1, -1).unwrap(), entry(1, 700, b"sparse"));
        assert!(matches!(
            storage.read_entry(&cx, 1, 4),
            Err(BookieError::NoEntry { .. })
        ));
    }
}
