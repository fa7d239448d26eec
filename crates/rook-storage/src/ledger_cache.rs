//! Ledger cache: a bounded dirty-page cache over the per-ledger index
//! files.
//!
//! Pages are keyed `(ledger_id, page_id)`. A miss loads the page from
//! the ledger's index file (synthesizing a zero page where the file has
//! none). Inserts mark the page dirty; dirty pages are written back
//! before they can be evicted. Eviction prefers clean pages in LRU
//! order and falls back to write-and-evict of the oldest dirty page.
//!
//! Concurrency: the page table lock is held only for in-memory work.
//! Flush clones dirty pages under the lock, writes them with only the
//! per-ledger file lock held, then clears the dirty bit only if the
//! page's version is unchanged. Readers see pre- or post-flush state,
//! never a tear, and a racing writer keeps its page dirty for the next
//! flush.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rook_error::{BookieError, Result};
use rook_types::{Cx, EntryLocation, ENTRY_LOCATION_SIZE};
use rook_vfs::Vfs;
use tracing::{debug, trace};

use crate::index_file::{index_rel_path, parse_index_path, LedgerIndexFile};
use crate::ledger_dirs::LedgerDirs;

struct CachedPage {
    data: Vec<u8>,
    dirty: bool,
    version: u64,
    last_use: u64,
}

#[derive(Default)]
struct PageTable {
    pages: HashMap<(i64, u64), CachedPage>,
    tick: u64,
}

/// The bounded index-page cache shared by the write and read paths.
pub struct LedgerCache<V: Vfs> {
    vfs: Arc<V>,
    dirs: Arc<LedgerDirs<V>>,
    page_size: usize,
    page_limit: usize,
    ledgers: Mutex<HashMap<i64, Arc<Mutex<LedgerIndexFile<V>>>>>,
    pages: Mutex<PageTable>,
    /// Ledgers with unsynced page writes (evictions write without sync;
    /// the checkpoint flush must still fsync them).
    needs_sync: Mutex<HashSet<i64>>,
}

impl<V: Vfs> LedgerCache<V> {
    /// Create the cache over a directory pool.
    pub fn new(vfs: Arc<V>, dirs: Arc<LedgerDirs<V>>, page_size: usize, page_limit: usize) -> Self {
        Self {
            vfs,
            dirs,
            page_size,
            page_limit: page_limit.max(1),
            ledgers: Mutex::new(HashMap::new()),
            pages: Mutex::new(PageTable::default()),
            needs_sync: Mutex::new(HashSet::new()),
        }
    }

    fn entries_per_page(&self) -> u64 {
        (self.page_size / ENTRY_LOCATION_SIZE) as u64
    }

    fn find_index_path(&self, cx: &Cx, ledger_id: i64) -> Result<Option<std::path::PathBuf>> {
        let rel = index_rel_path(ledger_id);
        for dir in self.dirs.all_dirs() {
            let path = dir.join(&rel);
            if self.vfs.exists(cx, &path)? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Open (or with `create_key`, create) the ledger's index file.
    fn ledger_handle(
        &self,
        cx: &Cx,
        ledger_id: i64,
        create_key: Option<&[u8]>,
    ) -> Result<Arc<Mutex<LedgerIndexFile<V>>>> {
        if let Some(handle) = self.ledgers.lock().get(&ledger_id) {
            return Ok(Arc::clone(handle));
        }
        let opened = if let Some(path) = self.find_index_path(cx, ledger_id)? {
            LedgerIndexFile::open(self.vfs.as_ref(), cx, &path, ledger_id, self.page_size)?
        } else if let Some(key) = create_key {
            let dir = self.dirs.pick_for_new_file(cx)?;
            let path = dir.join(index_rel_path(ledger_id));
            debug!(ledger_id, path = %path.display(), "creating ledger index");
            LedgerIndexFile::create(self.vfs.as_ref(), cx, &path, ledger_id, key)?
        } else {
            return Err(BookieError::NoLedger { ledger_id });
        };
        let mut ledgers = self.ledgers.lock();
        let handle = ledgers
            .entry(ledger_id)
            .or_insert_with(|| Arc::new(Mutex::new(opened)));
        Ok(Arc::clone(handle))
    }

    /// Make sure the ledger exists, creating its index with `master_key`
    /// on first sight. An existing ledger's key must match.
    pub fn ensure_ledger(&self, cx: &Cx, ledger_id: i64, master_key: &[u8]) -> Result<()> {
        let handle = self.ledger_handle(cx, ledger_id, Some(master_key))?;
        let file = handle.lock();
        if file.master_key() != master_key {
            return Err(BookieError::UnauthorizedAccess { ledger_id });
        }
        Ok(())
    }

    /// The ledger's master key; `NoLedger` when the ledger is unknown.
    pub fn read_master_key(&self, cx: &Cx, ledger_id: i64) -> Result<Vec<u8>> {
        let handle = self.ledger_handle(cx, ledger_id, None)?;
        let key = handle.lock().master_key().to_vec();
        Ok(key)
    }

    /// Whether the ledger is fenced.
    pub fn is_fenced(&self, cx: &Cx, ledger_id: i64) -> Result<bool> {
        let handle = self.ledger_handle(cx, ledger_id, None)?;
        let fenced = handle.lock().is_fenced();
        Ok(fenced)
    }

    /// Fence the ledger; returns whether this call made the transition.
    pub fn set_fenced(&self, cx: &Cx, ledger_id: i64) -> Result<bool> {
        let handle = self.ledger_handle(cx, ledger_id, None)?;
        let changed = handle.lock().set_fenced(cx)?;
        Ok(changed)
    }

    /// Highest entry id known for the ledger, -1 when none.
    pub fn last_entry(&self, cx: &Cx, ledger_id: i64) -> Result<i64> {
        let handle = self.ledger_handle(cx, ledger_id, None)?;
        let last = handle.lock().last_entry();
        Ok(last)
    }

    /// Record `entry_id → location`.
    pub fn put(&self, cx: &Cx, ledger_id: i64, entry_id: i64, location: EntryLocation) -> Result<()> {
        let handle = self.ledger_handle(cx, ledger_id, None)?;
        self.with_slot(cx, &handle, ledger_id, entry_id, |slot| {
            slot.copy_from_slice(&location.to_slot());
            true
        })?;
        handle.lock().note_entry(entry_id);
        self.evict_if_needed(cx)?;
        Ok(())
    }

    /// Look up `entry_id`; `Ok(None)` when the slot is absent.
    pub fn get(&self, cx: &Cx, ledger_id: i64, entry_id: i64) -> Result<Option<EntryLocation>> {
        let handle = self.ledger_handle(cx, ledger_id, None)?;
        let mut out = None;
        self.with_slot(cx, &handle, ledger_id, entry_id, |slot| {
            let raw: &[u8; ENTRY_LOCATION_SIZE] = (&*slot).try_into().expect("slot width");
            out = EntryLocation::from_slot(raw);
            false
        })?;
        self.evict_if_needed(cx)?;
        Ok(out)
    }

    /// Compare-and-swap a slot: install `new` only while the slot still
    /// holds `expect`. Returns whether the swap happened. A concurrent
    /// newer write for the same entry id must win over a compactor.
    pub fn update_location_if(
        &self,
        cx: &Cx,
        ledger_id: i64,
        entry_id: i64,
        expect: EntryLocation,
        new: EntryLocation,
    ) -> Result<bool> {
        let handle = self.ledger_handle(cx, ledger_id, None)?;
        let mut swapped = false;
        self.with_slot(cx, &handle, ledger_id, entry_id, |slot| {
            let raw: &[u8; ENTRY_LOCATION_SIZE] = (&*slot).try_into().expect("slot width");
            if EntryLocation::from_slot(raw) == Some(expect) {
                slot.copy_from_slice(&new.to_slot());
                swapped = true;
                true
            } else {
                false
            }
        })?;
        self.evict_if_needed(cx)?;
        Ok(swapped)
    }

    /// Run `mutate` over the entry's 12-byte slot with the page resident.
    /// `mutate` returns whether it dirtied the page.
    fn with_slot(
        &self,
        cx: &Cx,
        handle: &Arc<Mutex<LedgerIndexFile<V>>>,
        ledger_id: i64,
        entry_id: i64,
        mutate: impl FnOnce(&mut [u8]) -> bool,
    ) -> Result<()> {
        if entry_id < 0 {
            return Err(BookieError::internal(format!(
                "negative entry id {entry_id} has no index slot"
            )));
        }
        #[allow(clippy::cast_sign_loss)]
        let entry = entry_id as u64;
        let page_id = entry / self.entries_per_page();
        let slot = usize::try_from(entry % self.entries_per_page()).expect("slot fits usize");
        let key = (ledger_id, page_id);

        // Fast path: page resident.
        {
            let mut table = self.pages.lock();
            table.tick += 1;
            let tick = table.tick;
            if let Some(page) = table.pages.get_mut(&key) {
                page.last_use = tick;
                let start = slot * ENTRY_LOCATION_SIZE;
                if mutate(&mut page.data[start..start + ENTRY_LOCATION_SIZE]) {
                    page.dirty = true;
                    page.version += 1;
                }
                return Ok(());
            }
        }

        // Miss: load outside the page lock, then install (losing the race
        // to a concurrent loader is fine, use theirs).
        let loaded = handle.lock().read_page(cx, page_id, self.page_size)?;
        let mut table = self.pages.lock();
        table.tick += 1;
        let tick = table.tick;
        let page = table.pages.entry(key).or_insert(CachedPage {
            data: loaded,
            dirty: false,
            version: 0,
            last_use: tick,
        });
        page.last_use = tick;
        let start = slot * ENTRY_LOCATION_SIZE;
        if mutate(&mut page.data[start..start + ENTRY_LOCATION_SIZE]) {
            page.dirty = true;
            page.version += 1;
        }
        Ok(())
    }

    fn evict_if_needed(&self, cx: &Cx) -> Result<()> {
        loop {
            let victim = {
                let mut table = self.pages.lock();
                if table.pages.len() <= self.page_limit {
                    return Ok(());
                }
                // Clean pages first, LRU within each class.
                let clean_lru = table
                    .pages
                    .iter()
                    .filter(|(_, p)| !p.dirty)
                    .min_by_key(|(_, p)| p.last_use)
                    .map(|(&key, _)| key);
                if let Some(key) = clean_lru {
                    table.pages.remove(&key);
                    trace!(ledger_id = key.0, page_id = key.1, "evicted clean page");
                    continue;
                }
                let dirty_lru = table
                    .pages
                    .iter()
                    .min_by_key(|(_, p)| p.last_use)
                    .map(|(&key, p)| (key, p.data.clone(), p.version))
                    .expect("cache over limit implies at least one page");
                dirty_lru
            };
            let ((ledger_id, page_id), data, version) = victim;
            let handle = self.ledger_handle(cx, ledger_id, None)?;
            handle.lock().write_page(cx, page_id, &data, self.page_size)?;
            self.needs_sync.lock().insert(ledger_id);
            let mut table = self.pages.lock();
            if let Some(page) = table.pages.get(&(ledger_id, page_id)) {
                if page.version == version {
                    table.pages.remove(&(ledger_id, page_id));
                    trace!(ledger_id, page_id, "evicted dirty page after write-back");
                }
            }
        }
    }

    /// Write every dirty page to its index file and fsync every touched
    /// file. Must complete before the last-log-mark may advance.
    pub fn flush(&self, cx: &Cx) -> Result<()> {
        let dirty: Vec<((i64, u64), Vec<u8>, u64)> = {
            let table = self.pages.lock();
            table
                .pages
                .iter()
                .filter(|(_, p)| p.dirty)
                .map(|(&k, p)| (k, p.data.clone(), p.version))
                .collect()
        };

        let mut touched: HashSet<i64> = self.needs_sync.lock().drain().collect();
        for ((ledger_id, page_id), data, version) in dirty {
            let handle = match self.ledger_handle(cx, ledger_id, None) {
                Ok(h) => h,
                // Deleted while we flushed; its pages die with it.
                Err(BookieError::NoLedger { .. }) => continue,
                Err(e) => return Err(e),
            };
            handle.lock().write_page(cx, page_id, &data, self.page_size)?;
            touched.insert(ledger_id);
            let mut table = self.pages.lock();
            if let Some(page) = table.pages.get_mut(&(ledger_id, page_id)) {
                if page.version == version {
                    page.dirty = false;
                }
            }
        }

        for ledger_id in touched {
            if let Ok(handle) = self.ledger_handle(cx, ledger_id, None) {
                handle.lock().sync(cx)?;
            }
        }
        Ok(())
    }

    /// Forget the ledger entirely: resident pages, the open handle, and
    /// the on-disk index file.
    pub fn delete_ledger(&self, cx: &Cx, ledger_id: i64) -> Result<()> {
        {
            let mut table = self.pages.lock();
            table.pages.retain(|&(lid, _), _| lid != ledger_id);
        }
        self.needs_sync.lock().remove(&ledger_id);
        self.ledgers.lock().remove(&ledger_id);
        if let Some(path) = self.find_index_path(cx, ledger_id)? {
            self.vfs.delete(cx, &path)?;
            debug!(ledger_id, "ledger index deleted");
        }
        Ok(())
    }

    /// Every ledger known to this bookie: open handles plus the on-disk
    /// index fan-out.
    pub fn ledgers(&self, cx: &Cx) -> Result<Vec<i64>> {
        let mut out: HashSet<i64> = self.ledgers.lock().keys().copied().collect();
        for dir in self.dirs.all_dirs() {
            for sub in self.vfs.read_dir(cx, dir)? {
                let Some(hi) = sub.file_name().and_then(|s| s.to_str()) else {
                    continue;
                };
                if hi.len() != 8 || u32::from_str_radix(hi, 16).is_err() {
                    continue;
                }
                for idx in self.vfs.read_dir(cx, &sub)? {
                    if idx.extension().and_then(|e| e.to_str()) != Some("idx") {
                        continue;
                    }
                    if let Some(lo) = idx.file_stem().and_then(|s| s.to_str()) {
                        if let Some(ledger_id) = parse_index_path(hi, lo) {
                            out.insert(ledger_id);
                        }
                    }
                }
            }
        }
        let mut v: Vec<i64> = out.into_iter().collect();
        v.sort_unstable();
        Ok(v)
    }

    /// Number of resident pages (tests and metrics).
    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.pages.lock().pages.len()
    }
}
