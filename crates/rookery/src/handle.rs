//! Per-ledger descriptors and their interning registry.
//!
//! A [`LedgerDescriptor`] is the in-memory face of one ledger on this
//! bookie: id, master key, fenced flag, and the per-ledger lock the
//! facade holds across `storage add → journal enqueue` so mutations on a
//! ledger are serialized. [`HandleFactory`] interns descriptors and is
//! the single place master keys are checked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rook_error::{BookieError, Result};
use rook_storage::InterleavedStorage;
use rook_types::Cx;
use rook_vfs::Vfs;
use tracing::debug;

/// In-memory state for one ledger.
pub struct LedgerDescriptor<V: Vfs> {
    ledger_id: i64,
    master_key: Vec<u8>,
    fenced: AtomicBool,
    mutation: Mutex<()>,
    storage: Arc<InterleavedStorage<V>>,
}

impl<V: Vfs> LedgerDescriptor<V> {
    fn new(
        ledger_id: i64,
        master_key: Vec<u8>,
        fenced: bool,
        storage: Arc<InterleavedStorage<V>>,
    ) -> Self {
        Self {
            ledger_id,
            master_key,
            fenced: AtomicBool::new(fenced),
            mutation: Mutex::new(()),
            storage,
        }
    }

    /// The ledger id.
    #[must_use]
    pub fn ledger_id(&self) -> i64 {
        self.ledger_id
    }

    /// The ledger's master key.
    #[must_use]
    pub fn master_key(&self) -> &[u8] {
        &self.master_key
    }

    /// Acquire the per-ledger mutation lock.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock()
    }

    /// Whether the ledger is fenced.
    #[must_use]
    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::Acquire)
    }

    /// Fence the ledger, persisting the state bit. Returns whether this
    /// call made the transition.
    pub fn set_fenced(&self, cx: &Cx) -> Result<bool> {
        let changed = self.storage.set_fenced(cx, self.ledger_id)?;
        self.fenced.store(true, Ordering::Release);
        Ok(changed)
    }

    /// Append an entry (callers hold [`LedgerDescriptor::lock`]).
    pub fn add_entry(&self, cx: &Cx, entry: &[u8]) -> Result<(i64, i64)> {
        self.storage.add_entry(cx, entry)
    }

    /// Read an entry; `-1` resolves to the highest entry id known.
    pub fn read_entry(&self, cx: &Cx, entry_id: i64) -> Result<Vec<u8>> {
        self.storage.read_entry(cx, self.ledger_id, entry_id)
    }
}

/// Interning registry of ledger descriptors.
pub struct HandleFactory<V: Vfs> {
    storage: Arc<InterleavedStorage<V>>,
    handles: Mutex<HashMap<i64, Arc<LedgerDescriptor<V>>>>,
}

impl<V: Vfs> HandleFactory<V> {
    /// Create the registry over the ledger storage.
    pub fn new(storage: Arc<InterleavedStorage<V>>) -> Self {
        Self {
            storage,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a writable handle, creating ledger state on first use and
    /// verifying the master key against memory or persistent state.
    pub fn get_handle(
        &self,
        cx: &Cx,
        ledger_id: i64,
        master_key: &[u8],
    ) -> Result<Arc<LedgerDescriptor<V>>> {
        if let Some(handle) = self.handles.lock().get(&ledger_id) {
            if handle.master_key() != master_key {
                return Err(BookieError::UnauthorizedAccess { ledger_id });
            }
            return Ok(Arc::clone(handle));
        }
        // Creates the ledger on first sight; verifies the key otherwise.
        self.storage.ensure_ledger(cx, ledger_id, master_key)?;
        let fenced = self.storage.is_fenced(cx, ledger_id)?;
        let descriptor = Arc::new(LedgerDescriptor::new(
            ledger_id,
            master_key.to_vec(),
            fenced,
            Arc::clone(&self.storage),
        ));
        debug!(ledger_id, fenced, "ledger descriptor created");
        let mut handles = self.handles.lock();
        let entry = handles
            .entry(ledger_id)
            .or_insert_with(|| Arc::clone(&descriptor));
        if entry.master_key() != master_key {
            return Err(BookieError::UnauthorizedAccess { ledger_id });
        }
        Ok(Arc::clone(entry))
    }

    /// Resolve a read-only handle; no master key required.
    pub fn get_read_only_handle(
        &self,
        cx: &Cx,
        ledger_id: i64,
    ) -> Result<Arc<LedgerDescriptor<V>>> {
        if let Some(handle) = self.handles.lock().get(&ledger_id) {
            return Ok(Arc::clone(handle));
        }
        let master_key = self.storage.read_master_key(cx, ledger_id)?;
        let fenced = self.storage.is_fenced(cx, ledger_id)?;
        let descriptor = Arc::new(LedgerDescriptor::new(
            ledger_id,
            master_key,
            fenced,
            Arc::clone(&self.storage),
        ));
        let mut handles = self.handles.lock();
        let entry = handles
            .entry(ledger_id)
            .or_insert_with(|| Arc::clone(&descriptor));
        Ok(Arc::clone(entry))
    }

    /// Drop the descriptor for a deleted ledger.
    pub fn forget(&self, ledger_id: i64) {
        self.handles.lock().remove(&ledger_id);
    }
}
