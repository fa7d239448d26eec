//! The bookie facade: orchestrates startup (cookie check, journal
//! replay), the four client-visible operations (`add_entry`,
//! `recovery_add_entry`, `fence_ledger`, `read_entry`), the read-only
//! transition, and idempotent shutdown.
//!
//! Component ownership is strictly top-down: the facade owns the
//! directory pool, journal, storage, handle registry, checkpointer, and
//! collector. Back-communication (disk health, journal failure, session
//! expiry) arrives through listener hooks that funnel into a single
//! shutdown latch, so a fatal condition anywhere tears the process down
//! exactly once with the right exit code.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rook_error::{BookieError, ExitCode, Result};
use rook_journal::{Ack, Journal, JournalConfig, MarkFile, JOURNAL_VERSION_V3, JOURNAL_VERSION_V4};
use rook_storage::{
    DirsListener, EntryLogger, GarbageCollector, GcConfig, InterleavedStorage, LedgerCache,
    LedgerDirs,
};
use rook_types::{parse_entry_prefix, BookieConfig, Cx, EntryId, LastLogMark};
use rook_vfs::Vfs;
use tracing::{debug, error, info, warn};

use crate::cookie::check_environment;
use crate::handle::HandleFactory;
use crate::meta::{
    LivenessAdapter, MetadataClient, AVAILABLE_PATH, LEDGERS_ROOT, READONLY_PATH,
};
use crate::sync_thread::SyncThread;

/// Funnel for fatal conditions: whoever fires first wins, and shutdown
/// runs on its own thread so callbacks never tear down the component
/// they were called from.
struct ShutdownLatch<V: Vfs> {
    bookie: Mutex<Option<Weak<Bookie<V>>>>,
    triggered: AtomicBool,
}

impl<V: Vfs> ShutdownLatch<V> {
    fn new() -> Self {
        Self {
            bookie: Mutex::new(None),
            triggered: AtomicBool::new(false),
        }
    }

    fn arm(&self, bookie: &Arc<Bookie<V>>) {
        *self.bookie.lock() = Some(Arc::downgrade(bookie));
    }

    fn trigger(&self, code: ExitCode) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(bookie) = self.bookie.lock().as_ref().and_then(Weak::upgrade) else {
            return;
        };
        info!(?code, "fatal condition, triggering bookie shutdown");
        std::thread::spawn(move || {
            bookie.shutdown_with(code);
        });
    }
}

struct BookieDirsListener<V: Vfs> {
    bookie: Weak<Bookie<V>>,
}

impl<V: Vfs> DirsListener for BookieDirsListener<V> {
    fn disk_failed(&self, dir: &std::path::Path) {
        if let Some(bookie) = self.bookie.upgrade() {
            error!(dir = %dir.display(), "ledger directory failed, shutting down");
            bookie.latch.trigger(ExitCode::BookieException);
        }
    }

    fn all_disks_full(&self) {
        if let Some(bookie) = self.bookie.upgrade() {
            bookie.transition_to_read_only();
        }
    }

    fn fatal_error(&self) {
        if let Some(bookie) = self.bookie.upgrade() {
            bookie.latch.trigger(ExitCode::BookieException);
        }
    }
}

/// One storage node of the replicated log service.
pub struct Bookie<V: Vfs> {
    cfg: BookieConfig,
    cx: Cx,
    meta: Arc<dyn MetadataClient>,
    dirs: Arc<LedgerDirs<V>>,
    journal: Arc<Journal<V>>,
    storage: Arc<InterleavedStorage<V>>,
    handles: HandleFactory<V>,
    sync: SyncThread<V>,
    gc: Arc<GarbageCollector<V>>,
    mark_file: Arc<MarkFile<V>>,
    latch: Arc<ShutdownLatch<V>>,
    read_only: AtomicBool,
    running: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_done: Mutex<bool>,
    exit_code: Mutex<ExitCode>,
    /// Ledgers whose master-key record is already in the journal this
    /// incarnation (first sighting writes one so replay can rebuild).
    journaled_keys: Mutex<HashSet<i64>>,
}

impl<V: Vfs> std::fmt::Debug for Bookie<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bookie")
            .field("bookie_id", &self.cfg.bookie_id)
            .finish_non_exhaustive()
    }
}

impl<V: Vfs> Bookie<V> {
    /// Bring up a bookie: validate cookies, replay the journal, start
    /// the background tasks, and register availability.
    pub fn start(
        cfg: BookieConfig,
        vfs: Arc<V>,
        meta: Arc<dyn MetadataClient>,
    ) -> Result<Arc<Self>> {
        let cfg = cfg.validated();
        let cx = Cx::new();
        info!(bookie_id = %cfg.bookie_id, "starting bookie");

        vfs.create_dir_all(&cx, &cfg.journal_dir)?;
        let dirs = Arc::new(LedgerDirs::open(
            Arc::clone(&vfs),
            &cx,
            &cfg.ledger_dirs,
            cfg.disk_usage_threshold,
        )?);

        let mut cookie_dirs: Vec<PathBuf> = vec![cfg.journal_dir.clone()];
        cookie_dirs.extend(dirs.all_dirs().iter().cloned());
        check_environment(vfs.as_ref(), &cx, &cfg, meta.as_ref(), &cookie_dirs)?;

        let journal = Arc::new(Journal::open(
            Arc::clone(&vfs),
            &cx,
            &cfg.journal_dir,
            JournalConfig {
                max_file_size: cfg.journal_max_size,
                max_group_bytes: cfg.journal_max_group_bytes,
                max_group_wait: cfg.journal_max_group_wait,
            },
        )?);
        let entry_log = EntryLogger::open(
            Arc::clone(&vfs),
            Arc::clone(&dirs),
            &cx,
            cfg.entry_log_max_size,
        )?;
        let cache = LedgerCache::new(
            Arc::clone(&vfs),
            Arc::clone(&dirs),
            cfg.index_page_size,
            cfg.index_page_limit,
        );
        let storage = Arc::new(InterleavedStorage::new(entry_log, cache));
        let mark_file = Arc::new(MarkFile::new(Arc::clone(&vfs), dirs.all_dirs().to_vec()));
        let handles = HandleFactory::new(Arc::clone(&storage));

        let latch = Arc::new(ShutdownLatch::new());
        let sync_latch = Arc::clone(&latch);
        let sync = SyncThread::new(
            Arc::clone(&journal),
            Arc::clone(&storage),
            Arc::clone(&mark_file),
            cfg.flush_interval,
            Arc::new(move |_err: &BookieError| sync_latch.trigger(ExitCode::BookieException)),
        );
        let gc = Arc::new(GarbageCollector::new(
            Arc::clone(&storage),
            Arc::new(LivenessAdapter(Arc::clone(&meta))),
            GcConfig {
                gc_interval: cfg.gc_interval,
                minor_threshold: cfg.minor_compaction_threshold,
                minor_interval: cfg.minor_compaction_interval,
                major_threshold: cfg.major_compaction_threshold,
                major_interval: cfg.major_compaction_interval,
            },
        ));

        let bookie = Arc::new(Self {
            cfg,
            cx: cx.clone(),
            meta: Arc::clone(&meta),
            dirs: Arc::clone(&dirs),
            journal: Arc::clone(&journal),
            storage,
            handles,
            sync,
            gc,
            mark_file,
            latch: Arc::clone(&latch),
            read_only: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown_done: Mutex::new(false),
            exit_code: Mutex::new(ExitCode::Ok),
            journaled_keys: Mutex::new(HashSet::new()),
        });
        latch.arm(&bookie);

        // Replay before the writer opens a fresh file for this
        // incarnation.
        let from_mark = bookie.mark_file.load(&cx)?;
        bookie.replay_journal(from_mark)?;
        info!(%from_mark, "journal replay finished");

        let journal_latch = Arc::clone(&latch);
        bookie
            .journal
            .start(Arc::new(move |_err: &BookieError| {
                journal_latch.trigger(ExitCode::BookieException);
            }))?;

        dirs.add_listener(Arc::new(BookieDirsListener {
            bookie: Arc::downgrade(&bookie),
        }));
        dirs.start_checker(cx.clone(), bookie.cfg.disk_check_interval)?;
        bookie.sync.start()?;
        bookie.gc.start(cx.clone())?;
        bookie.running.store(true, Ordering::Release);

        if let Err(err) = bookie.register() {
            error!(error = %err, "could not register availability, shutting down");
            bookie.shutdown_with(ExitCode::ZkRegFail);
            return Err(err);
        }
        let expiry_latch = Arc::clone(&latch);
        meta.on_session_expired(Arc::new(move || {
            expiry_latch.trigger(ExitCode::ZkExpired);
        }));

        info!(bookie_id = %bookie.cfg.bookie_id, "bookie running");
        Ok(bookie)
    }

    fn replay_journal(&self, from_mark: LastLogMark) -> Result<()> {
        let cx = &self.cx;
        self.journal.replay(cx, from_mark, &mut |version, mark, payload| {
            let (ledger_id, entry_id) = parse_entry_prefix(payload)?;
            let lid = ledger_id.get();
            debug!(ledger_id = lid, entry_id = %entry_id, %mark, "replaying record");
            if entry_id == EntryId::METAENTRY_LEDGER_KEY {
                if version < JOURNAL_VERSION_V3 {
                    return Err(BookieError::journal_corrupt(format!(
                        "master-key record in version {version} journal"
                    )));
                }
                let key = parse_master_key_record(payload)?;
                self.storage.ensure_ledger(cx, lid, key)?;
                self.journaled_keys.lock().insert(lid);
            } else if entry_id == EntryId::METAENTRY_FENCE_KEY {
                if version < JOURNAL_VERSION_V4 {
                    return Err(BookieError::journal_corrupt(format!(
                        "fence record in version {version} journal"
                    )));
                }
                match self.storage.set_fenced(cx, lid) {
                    Ok(_) => {}
                    Err(BookieError::NoLedger { .. }) => {
                        debug!(ledger_id = lid, "fence replay for deleted ledger, skipped");
                    }
                    Err(err) => return Err(err),
                }
            } else {
                match self.storage.read_master_key(cx, lid) {
                    Ok(_) => {
                        self.storage.add_entry(cx, payload)?;
                    }
                    Err(BookieError::NoLedger { .. }) => {
                        debug!(ledger_id = lid, "entry replay for deleted ledger, skipped");
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        })
    }

    fn register(&self) -> Result<()> {
        self.meta.create_persistent(LEDGERS_ROOT, b"")?;
        self.meta.create_persistent(AVAILABLE_PATH, b"")?;
        self.meta.create_persistent(READONLY_PATH, b"")?;
        let path = self.registration_path();
        if self.meta.exists(&path)? {
            info!(
                path = %path,
                "previous registration still present, waiting for it to expire"
            );
            if !self
                .meta
                .await_removal(&path, self.cfg.metadata_session_timeout)?
            {
                return Err(BookieError::metadata(format!(
                    "stale registration at {path} did not expire"
                )));
            }
        }
        self.meta.create_ephemeral(&path, b"")?;
        Ok(())
    }

    fn registration_path(&self) -> String {
        format!("{AVAILABLE_PATH}/{}", self.cfg.bookie_id)
    }

    fn readonly_path(&self) -> String {
        format!("{READONLY_PATH}/{}", self.cfg.bookie_id)
    }

    /// Add an entry to a ledger. The returned handle resolves once the
    /// write is journal-durable.
    pub fn add_entry(&self, entry: Vec<u8>, master_key: &[u8]) -> Result<Ack> {
        self.add_internal(entry, master_key, true)
    }

    /// Add an entry even if the ledger is fenced (client-driven recovery
    /// replicating entries onto a quorum).
    pub fn recovery_add_entry(&self, entry: Vec<u8>, master_key: &[u8]) -> Result<Ack> {
        self.add_internal(entry, master_key, false)
    }

    fn add_internal(&self, entry: Vec<u8>, master_key: &[u8], check_fence: bool) -> Result<Ack> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(BookieError::ReadOnly);
        }
        let (ledger_id, _) = parse_entry_prefix(&entry)?;
        let lid = ledger_id.get();
        let result = (|| {
            let handle = self.handles.get_handle(&self.cx, lid, master_key)?;
            let _guard = handle.lock();
            if check_fence && handle.is_fenced() {
                return Err(BookieError::LedgerFenced { ledger_id: lid });
            }
            self.journal_master_key_if_first(lid, master_key)?;
            handle.add_entry(&self.cx, &entry)?;
            self.journal.log_add_entry(entry)
        })();
        match result {
            Err(BookieError::NoWritableDir) => {
                self.transition_to_read_only();
                Err(BookieError::NoWritableDir)
            }
            other => other,
        }
    }

    /// On a ledger's first sighting this incarnation, journal its master
    /// key so replay can rebuild ledger state from the journal alone.
    fn journal_master_key_if_first(&self, ledger_id: i64, master_key: &[u8]) -> Result<()> {
        let mut keys = self.journaled_keys.lock();
        if keys.contains(&ledger_id) {
            return Ok(());
        }
        let mut payload = Vec::with_capacity(20 + master_key.len());
        payload.extend_from_slice(&ledger_id.to_be_bytes());
        payload.extend_from_slice(&EntryId::METAENTRY_LEDGER_KEY.get().to_be_bytes());
        let key_len = u32::try_from(master_key.len())
            .map_err(|_| BookieError::internal("master key too long"))?;
        payload.extend_from_slice(&key_len.to_be_bytes());
        payload.extend_from_slice(master_key);
        // Fire-and-forget: the key record only has to precede the entry
        // records in the journal, and the writer preserves order.
        let _ack = self.journal.log_add_entry(payload)?;
        keys.insert(ledger_id);
        debug!(ledger_id, "master key journaled");
        Ok(())
    }

    /// Fence a ledger. Idempotent: the first transition resolves when
    /// the fence record is durable, later calls resolve immediately.
    pub fn fence_ledger(&self, ledger_id: i64, master_key: &[u8]) -> Result<Ack> {
        let handle = self.handles.get_handle(&self.cx, ledger_id, master_key)?;
        let changed = {
            let _guard = handle.lock();
            handle.set_fenced(&self.cx)?
        };
        if changed {
            debug!(ledger_id, "recording fence in journal");
            let mut payload = Vec::with_capacity(16);
            payload.extend_from_slice(&ledger_id.to_be_bytes());
            payload.extend_from_slice(&EntryId::METAENTRY_FENCE_KEY.get().to_be_bytes());
            self.journal.log_add_entry(payload)
        } else {
            Ok(Ack::done_ok())
        }
    }

    /// Read an entry. `entry_id = -1` means the highest entry known.
    pub fn read_entry(&self, ledger_id: i64, entry_id: i64) -> Result<Vec<u8>> {
        let handle = self.handles.get_read_only_handle(&self.cx, ledger_id)?;
        handle.read_entry(&self.cx, entry_id)
    }

    /// Transition into read-only mode: deregister as writable, register
    /// under the read-only path, refuse future writes, keep serving
    /// reads. CAS-once; a second caller returns immediately.
    pub fn transition_to_read_only(&self) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if self
            .read_only
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if !self.cfg.read_only_mode_enabled {
            warn!("all disks full and read-only mode is disabled, shutting down");
            self.latch.trigger(ExitCode::BookieException);
            return;
        }
        info!("transitioning to read-only mode, serving only reads");
        let result = (|| -> Result<()> {
            self.meta.create_persistent(READONLY_PATH, b"")?;
            self.meta.create_ephemeral(&self.readonly_path(), b"")?;
            self.meta.delete(&self.registration_path())?;
            Ok(())
        })();
        if let Err(err) = result {
            error!(error = %err, "read-only transition failed, shutting down");
            self.latch.trigger(ExitCode::BookieException);
        }
    }

    /// Whether the bookie refuses writes.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Whether the bookie is serving.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The exit code recorded by the first shutdown cause.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        *self.exit_code.lock()
    }

    /// The directory pool (health induction in tests, metrics surfaces).
    #[must_use]
    pub fn ledger_dirs(&self) -> &Arc<LedgerDirs<V>> {
        &self.dirs
    }

    /// The garbage collector (deterministic passes in tests and tools).
    #[must_use]
    pub fn garbage_collector(&self) -> &Arc<GarbageCollector<V>> {
        &self.gc
    }

    /// Graceful shutdown with exit code `Ok`.
    pub fn shutdown(&self) -> ExitCode {
        self.shutdown_with(ExitCode::Ok)
    }

    /// Graceful, idempotent shutdown: drain the journal, run a final
    /// checkpoint, stop background tasks, close the metadata session.
    pub fn shutdown_with(&self, code: ExitCode) -> ExitCode {
        let mut done = self.shutdown_done.lock();
        if *done {
            return *self.exit_code.lock();
        }
        *done = true;
        self.shutting_down.store(true, Ordering::Release);
        *self.exit_code.lock() = code;
        info!(?code, "shutting down bookie");

        // Journal first: no new acknowledgements after this point.
        self.journal.shutdown();
        // Final checkpoint makes everything acknowledged durable in
        // storage and trims the journal.
        self.sync.shutdown();
        // Now interrupt the long-running loops and join them.
        self.cx.interrupt();
        self.gc.shutdown();
        self.dirs.shutdown();
        self.meta.close();
        self.running.store(false, Ordering::Release);
        info!(?code, "bookie shut down");
        code
    }
}

fn parse_master_key_record(payload: &[u8]) -> Result<&[u8]> {
    if payload.len() < 20 {
        return Err(BookieError::journal_corrupt("short master-key record"));
    }
    let key_len =
        u32::from_be_bytes([payload[16], payload[17], payload[18], payload[19]]) as usize;
    if payload.len() < 20 + key_len {
        return Err(BookieError::journal_corrupt("truncated master-key record"));
    }
    Ok(&payload[20..20 + key_len])
}
