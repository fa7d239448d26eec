//! Garbage collection and compaction of entry-log segments.
//!
//! The collector periodically fetches the live-ledger set from the
//! metadata collaborator and, in order:
//! 1. deletes local state (index + pages) of ledgers no longer live;
//! 2. deletes sealed segments whose ledgers-map lists no live ledger;
//! 3. copy-compacts sealed segments whose live-byte ratio is at or below
//!    a threshold: minor and major tiers with independent thresholds
//!    and sweep intervals.
//!
//! Compaction re-appends each live entry through the normal add path and
//! installs the new location with a compare-and-swap, so a concurrent
//! newer write for the same entry id always wins. The old segment is
//! unlinked only after the cache has flushed: a crash mid-compaction
//! leaves either the old segment intact or durable new locations plus a
//! harmless orphan copy.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rook_error::{BookieError, Result};
use rook_types::{Cx, EntryLocation, LogId};
use rook_vfs::Vfs;
use tracing::{debug, info, warn};

use crate::ledger_dirs::sleep_interruptible;
use crate::storage::InterleavedStorage;

/// Source of truth for which ledgers still exist in the cluster.
///
/// A ledger absent from the returned set has been deleted from the
/// metadata service; its local state is reclaimable.
pub trait LedgerLiveness: Send + Sync {
    /// The current live-ledger set.
    fn live_ledgers(&self) -> Result<HashSet<i64>>;
}

/// Collector tuning.
#[derive(Debug, Clone, Copy)]
pub struct GcConfig {
    /// Interval between collection passes.
    pub gc_interval: Duration,
    /// Minor compaction ratio; `<= 0.0` disables the tier.
    pub minor_threshold: f64,
    /// Interval between minor sweeps; zero disables the tier.
    pub minor_interval: Duration,
    /// Major compaction ratio; `<= 0.0` disables the tier.
    pub major_threshold: f64,
    /// Interval between major sweeps; zero disables the tier.
    pub major_interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(1),
            minor_threshold: 0.2,
            minor_interval: Duration::from_secs(3600),
            major_threshold: 0.8,
            major_interval: Duration::from_secs(86400),
        }
    }
}

impl GcConfig {
    fn minor_enabled(&self) -> bool {
        self.minor_threshold > 0.0 && !self.minor_interval.is_zero()
    }

    fn major_enabled(&self) -> bool {
        self.major_threshold > 0.0 && !self.major_interval.is_zero()
    }
}

/// The garbage collector / compactor task.
pub struct GarbageCollector<V: Vfs> {
    storage: Arc<InterleavedStorage<V>>,
    liveness: Arc<dyn LedgerLiveness>,
    cfg: GcConfig,
    thread: Mutex<Option<JoinHandle<()>>>,
    last_minor: Mutex<Option<Instant>>,
    last_major: Mutex<Option<Instant>>,
}

impl<V: Vfs> GarbageCollector<V> {
    /// Create a collector over the storage and liveness source.
    pub fn new(
        storage: Arc<InterleavedStorage<V>>,
        liveness: Arc<dyn LedgerLiveness>,
        cfg: GcConfig,
    ) -> Self {
        Self {
            storage,
            liveness,
            cfg,
            thread: Mutex::new(None),
            last_minor: Mutex::new(None),
            last_major: Mutex::new(None),
        }
    }

    /// Start the background task.
    pub fn start(self: &Arc<Self>, cx: Cx) -> Result<()> {
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("rookery-gc".to_owned())
            .spawn(move || {
                while !cx.is_interrupted() {
                    sleep_interruptible(&cx, this.cfg.gc_interval);
                    if cx.is_interrupted() {
                        break;
                    }
                    match this.run_once(&cx) {
                        Ok(()) | Err(BookieError::Interrupted) => {}
                        Err(err) => warn!(error = %err, "gc pass failed"),
                    }
                }
                debug!("gc thread exiting");
            })
            .map_err(BookieError::Io)?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Join the collector thread (after interrupting its context).
    pub fn shutdown(&self) {
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("gc thread panicked");
            }
        }
    }

    /// One full pass: deletions always, compaction tiers when due.
    pub fn run_once(&self, cx: &Cx) -> Result<()> {
        self.gc_pass(cx)?;
        let now = Instant::now();
        if self.cfg.major_enabled() && tier_due(&self.last_major, now, self.cfg.major_interval) {
            self.compact_pass(cx, self.cfg.major_threshold)?;
            *self.last_major.lock() = Some(now);
            // A major sweep subsumes the minor tier this round.
            *self.last_minor.lock() = Some(now);
        } else if self.cfg.minor_enabled()
            && tier_due(&self.last_minor, now, self.cfg.minor_interval)
        {
            self.compact_pass(cx, self.cfg.minor_threshold)?;
            *self.last_minor.lock() = Some(now);
        }
        Ok(())
    }

    /// Delete dead ledgers' local state and dead sealed segments.
    pub fn gc_pass(&self, cx: &Cx) -> Result<()> {
        let live = self.liveness.live_ledgers()?;

        for ledger_id in self.storage.cache().ledgers(cx)? {
            cx.checkpoint()?;
            if !live.contains(&ledger_id) {
                info!(ledger_id, "ledger deleted from metadata, reclaiming index");
                self.storage.delete_ledger(cx, ledger_id)?;
            }
        }

        for log_id in self.storage.entry_log().sealed_segments(cx)? {
            cx.checkpoint()?;
            let map = self.storage.entry_log().ledgers_map(cx, log_id)?;
            if map.keys().all(|lid| !live.contains(lid)) {
                info!(log_id, "no live ledgers in segment, deleting");
                self.storage.entry_log().delete_segment(cx, log_id)?;
            }
        }
        Ok(())
    }

    /// Compact every sealed segment whose live ratio is at or below
    /// `threshold` (and above zero; fully dead segments are deleted by
    /// the gc pass instead).
    pub fn compact_pass(&self, cx: &Cx, threshold: f64) -> Result<()> {
        let live = self.liveness.live_ledgers()?;
        for log_id in self.storage.entry_log().sealed_segments(cx)? {
            cx.checkpoint()?;
            let map = self.storage.entry_log().ledgers_map(cx, log_id)?;
            let total: u64 = map.values().sum();
            let live_bytes: u64 = map
                .iter()
                .filter(|(lid, _)| live.contains(lid))
                .map(|(_, &b)| b)
                .sum();
            if total == 0 || live_bytes == 0 {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let ratio = live_bytes as f64 / total as f64;
            if ratio <= threshold {
                debug!(log_id, ratio, threshold, "segment eligible for compaction");
                self.compact_segment(cx, log_id, &live)?;
            }
        }
        Ok(())
    }

    fn compact_segment(&self, cx: &Cx, log_id: u32, live: &HashSet<i64>) -> Result<()> {
        let mut copied = 0u64;
        let mut skipped = 0u64;
        self.storage
            .entry_log()
            .scan_segment(cx, log_id, &mut |ledger_id, entry_id, offset, entry| {
                if !live.contains(&ledger_id) {
                    return Ok(());
                }
                let old = EntryLocation {
                    log_id: LogId::new(log_id),
                    offset,
                };
                // Skip entries the index no longer points at (overwritten
                // or already moved); the CAS below is the authority.
                if self.storage.cache().get(cx, ledger_id, entry_id)? != Some(old) {
                    skipped += 1;
                    return Ok(());
                }
                let new = self.storage.entry_log().add_entry(cx, entry)?;
                if self
                    .storage
                    .cache()
                    .update_location_if(cx, ledger_id, entry_id, old, new)?
                {
                    copied += 1;
                } else {
                    skipped += 1;
                }
                Ok(())
            })?;
        // New locations must be durable before the old copies vanish.
        self.storage.flush(cx)?;
        self.storage.entry_log().delete_segment(cx, log_id)?;
        info!(log_id, copied, skipped, "segment compacted");
        Ok(())
    }
}

fn tier_due(last: &Mutex<Option<Instant>>, now: Instant, interval: Duration) -> bool {
    last.lock().map_or(true, |at| now.duration_since(at) >= interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry_log::EntryLogger;
    use crate::ledger_cache::LedgerCache;
    use crate::ledger_dirs::LedgerDirs;
    use rook_vfs::MemoryVfs;
    use std::path::PathBuf;

    struct FixedLiveness(Mutex<HashSet<i64>>);

    impl FixedLiveness {
        fn new(live: &[i64]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(live.iter().copied().collect())))
        }

        fn remove(&self, ledger_id: i64) {
            self.0.lock().remove(&ledger_id);
        }
    }

    impl LedgerLiveness for FixedLiveness {
        fn live_ledgers(&self) -> Result<HashSet<i64>> {
            Ok(self.0.lock().clone())
        }
    }

    fn entry(ledger_id: i64, entry_id: i64, body: &[u8]) -> Vec<u8> {
        let mut e = Vec::with_capacity(16 + body.len());
        e.extend_from_slice(&ledger_id.to_be_bytes());
        e.extend_from_slice(&entry_id.to_be_bytes());
        e.extend_from_slice(body);
        e
    }

    fn setup() -> (MemoryVfs, Cx, Arc<InterleavedStorage<MemoryVfs>>) {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let dirs = Arc::new(
            LedgerDirs::open(Arc::new(vfs.clone()), &cx, &[PathBuf::from("/l0")], 0.95).unwrap(),
        );
        let entry_log =
            EntryLogger::open(Arc::new(vfs.clone()), Arc::clone(&dirs), &cx, 1 << 20).unwrap();
        let cache = LedgerCache::new(Arc::new(vfs.clone()), dirs, 8192, 64);
        (vfs, cx, Arc::new(InterleavedStorage::new(entry_log, cache)))
    }

    fn collector(
        storage: &Arc<InterleavedStorage<MemoryVfs>>,
        liveness: &Arc<FixedLiveness>,
    ) -> GarbageCollector<MemoryVfs> {
        GarbageCollector::new(
            Arc::clone(storage),
            Arc::clone(liveness) as Arc<dyn LedgerLiveness>,
            GcConfig::default(),
        )
    }

    #[test]
    fn dead_ledger_index_is_reclaimed() {
        let (_vfs, cx, storage) = setup();
        let liveness = FixedLiveness::new(&[1, 2]);
        let gc = collector(&storage, &liveness);

        storage.ensure_ledger(&cx, 1, b"k").unwrap();
        storage.ensure_ledger(&cx, 2, b"k").unwrap();
        storage.add_entry(&cx, &entry(1, 0, b"a")).unwrap();
        storage.add_entry(&cx, &entry(2, 0, b"b")).unwrap();
        storage.flush(&cx).unwrap();

        liveness.remove(2);
        gc.gc_pass(&cx).unwrap();

        assert!(matches!(
            storage.read_entry(&cx, 2, 0),
            Err(BookieError::NoLedger { .. })
        ));
        assert!(storage.read_entry(&cx, 1, 0).is_ok());
    }

    #[test]
    fn fully_dead_segment_is_deleted() {
        let (vfs, cx, storage) = setup();
        let liveness = FixedLiveness::new(&[1]);
        let gc = collector(&storage, &liveness);

        storage.ensure_ledger(&cx, 1, b"k").unwrap();
        storage.add_entry(&cx, &entry(1, 0, b"doomed")).unwrap();
        let sealed = storage.entry_log().current_log_id();
        storage.entry_log().roll(&cx).unwrap();
        let path = storage.entry_log().find_segment(&cx, sealed).unwrap().unwrap();

        liveness.remove(1);
        gc.gc_pass(&cx).unwrap();
        assert!(!vfs.exists(&cx, &path).unwrap());
    }

    #[test]
    fn live_segment_survives_gc() {
        let (vfs, cx, storage) = setup();
        let liveness = FixedLiveness::new(&[1, 2]);
        let gc = collector(&storage, &liveness);

        storage.ensure_ledger(&cx, 1, b"k").unwrap();
        storage.ensure_ledger(&cx, 2, b"k").unwrap();
        storage.add_entry(&cx, &entry(1, 0, b"live")).unwrap();
        storage.add_entry(&cx, &entry(2, 0, b"dead-later")).unwrap();
        let sealed = storage.entry_log().current_log_id();
        storage.entry_log().roll(&cx).unwrap();
        let path = storage.entry_log().find_segment(&cx, sealed).unwrap().unwrap();

        liveness.remove(2);
        gc.gc_pass(&cx).unwrap();
        assert!(vfs.exists(&cx, &path).unwrap(), "ledger 1 still lives there");
    }

    #[test]
    fn compaction_preserves_live_entries_and_deletes_segment() {
        let (vfs, cx, storage) = setup();
        let liveness = FixedLiveness::new(&[1, 2]);
        let gc = collector(&storage, &liveness);

        storage.ensure_ledger(&cx, 1, b"k").unwrap();
        storage.ensure_ledger(&cx, 2, b"k").unwrap();
        // Ledger 2 dominates the segment so ledger 1's share is small.
        let keeper0 = entry(1, 0, b"keep-me");
        let keeper1 = entry(1, 1, b"keep-me-too");
        storage.add_entry(&cx, &keeper0).unwrap();
        storage.add_entry(&cx, &keeper1).unwrap();
        for i in 0..64 {
            storage
                .add_entry(&cx, &entry(2, i, &[0xAB; 256]))
                .unwrap();
        }
        let sealed = storage.entry_log().current_log_id();
        storage.entry_log().roll(&cx).unwrap();
        let path = storage.entry_log().find_segment(&cx, sealed).unwrap().unwrap();
        storage.flush(&cx).unwrap();

        // Ledger 2 is deleted; the gc pass reclaims its index, then the
        // compaction pass rewrites the segment for ledger 1.
        liveness.remove(2);
        gc.gc_pass(&cx).unwrap();
        gc.compact_pass(&cx, 0.8).unwrap();

        assert!(!vfs.exists(&cx, &path).unwrap(), "old segment gone");
        assert_eq!(storage.read_entry(&cx, 1, 0).unwrap(), keeper0);
        assert_eq!(storage.read_entry(&cx, 1, 1).unwrap(), keeper1);
    }

    #[test]
    fn high_ratio_segment_not_compacted_by_minor() {
        let (vfs, cx, storage) = setup();
        let liveness = FixedLiveness::new(&[1]);
        let gc = collector(&storage, &liveness);

        storage.ensure_ledger(&cx, 1, b"k").unwrap();
        for i in 0..16 {
            storage.add_entry(&cx, &entry(1, i, &[1; 64])).unwrap();
        }
        let sealed = storage.entry_log().current_log_id();
        storage.entry_log().roll(&cx).unwrap();
        let path = storage.entry_log().find_segment(&cx, sealed).unwrap().unwrap();

        // 100% live: minor threshold 0.2 must leave it alone.
        gc.compact_pass(&cx, 0.2).unwrap();
        assert!(vfs.exists(&cx, &path).unwrap());
    }

    #[test]
    fn crash_after_compaction_flush_is_safe() {
        let (vfs, cx, storage) = setup();
        let liveness = FixedLiveness::new(&[1, 2]);
        let gc = collector(&storage, &liveness);

        storage.ensure_ledger(&cx, 1, b"k").unwrap();
        storage.ensure_ledger(&cx, 2, b"k").unwrap();
        let keeper = entry(1, 0, b"survivor");
        storage.add_entry(&cx, &keeper).unwrap();
        for i in 0..32 {
            storage.add_entry(&cx, &entry(2, i, &[7; 128])).unwrap();
        }
        storage.entry_log().roll(&cx).unwrap();
        storage.flush(&cx).unwrap();

        liveness.remove(2);
        gc.gc_pass(&cx).unwrap();
        gc.compact_pass(&cx, 0.8).unwrap();

        // Power loss after compaction completed.
        vfs.crash();

        let dirs = Arc::new(
            LedgerDirs::open(Arc::new(vfs.clone()), &cx, &[PathBuf::from("/l0")], 0.95).unwrap(),
        );
        let entry_log =
            EntryLogger::open(Arc::new(vfs.clone()), Arc::clone(&dirs), &cx, 1 << 20).unwrap();
        let cache = LedgerCache::new(Arc::new(vfs), dirs, 8192, 64);
        let reopened = InterleavedStorage::new(entry_log, cache);
        assert_eq!(reopened.read_entry(&cx, 1, 0).unwrap(), keeper);
    }
}
