//! The journal proper: a single-writer append stream with group commit.
//!
//! Callers enqueue framed records via [`Journal::log_add_entry`] and get
//! an [`Ack`] back; a dedicated writer thread drains the queue in batches,
//! appends one consolidated write per batch, fsyncs once, and only then
//! resolves the batch's handles, in enqueue order.
//!
//! The writer protocol:
//! ```text
//! FILLING ──▶ FLUSHING ──▶ COMPLETE ──▶ FILLING (next batch)
//! ```
//! A batch closes when it reaches the configured byte threshold, the
//! bounded group wait elapses, or shutdown/rollover is requested.
//!
//! Any I/O error in the writer is fatal: the journal must be
//! always-correct, so the writer resolves every pending handle with an
//! error, refuses new records, and fires the fatal hook so the facade can
//! shut the bookie down.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rook_error::{BookieError, Result};
use rook_types::{Cx, LastLogMark};
use rook_vfs::traits::read_exact_at;
use rook_vfs::{OpenFlags, Vfs, VfsFile};
use tracing::{debug, error, info};

use crate::ack::Ack;
use crate::frame::{
    encode_record, read_record_at, JournalHeader, RecordRead, JOURNAL_HEADER_SIZE,
    JOURNAL_VERSION_CURRENT, MAX_RECORD_SIZE,
};

/// Journal tuning knobs, extracted from the bookie configuration.
#[derive(Debug, Clone, Copy)]
pub struct JournalConfig {
    /// Rotate the journal file once it exceeds this many bytes.
    pub max_file_size: u64,
    /// Force a flush once a batch holds this many payload bytes.
    pub max_group_bytes: usize,
    /// Bounded time a batch waits for co-committers before flushing.
    pub max_group_wait: Duration,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_file_size: 2 * 1024 * 1024 * 1024,
            max_group_bytes: 512 * 1024,
            max_group_wait: Duration::from_millis(2),
        }
    }
}

impl JournalConfig {
    /// Clamp out-of-range settings.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if self.max_group_bytes == 0 {
            self.max_group_bytes = 1;
        }
        if self.max_file_size < JOURNAL_HEADER_SIZE as u64 {
            self.max_file_size = JOURNAL_HEADER_SIZE as u64;
        }
        self
    }
}

/// Atomic counters for journal observability.
#[derive(Debug, Default)]
pub struct JournalMetrics {
    /// Records appended (durably).
    pub records_appended: AtomicU64,
    /// Consolidated batch flushes (one fsync each).
    pub batches_flushed: AtomicU64,
    /// Payload bytes made durable.
    pub bytes_appended: AtomicU64,
    /// Journal file rotations.
    pub rotations: AtomicU64,
}

/// Hook fired (once) when the journal writer hits a fatal I/O error.
pub type FatalHook = Arc<dyn Fn(&BookieError) + Send + Sync>;

struct Queued {
    payload: Vec<u8>,
    ack: Ack,
}

#[derive(Default)]
struct QueueState {
    records: VecDeque<Queued>,
    shutdown: bool,
    rollover: bool,
}

struct Shared<V: Vfs> {
    vfs: Arc<V>,
    dir: PathBuf,
    cfg: JournalConfig,
    queue: Mutex<QueueState>,
    cond: Condvar,
    /// Position of the last durable byte: everything at or before this
    /// mark has been fsynced.
    durable: Mutex<LastLogMark>,
    failed: AtomicBool,
    metrics: JournalMetrics,
    fatal_hook: Mutex<Option<FatalHook>>,
}

/// The write-ahead journal for one bookie.
pub struct Journal<V: Vfs> {
    shared: Arc<Shared<V>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    next_file_id: u32,
}

impl<V: Vfs> Journal<V> {
    /// Open the journal directory. Does not start the writer; replay runs
    /// against the existing files first, then [`Journal::start`] opens a
    /// fresh file for this incarnation's writes.
    pub fn open(vfs: Arc<V>, cx: &Cx, dir: &Path, cfg: JournalConfig) -> Result<Self> {
        let cfg = cfg.validated();
        vfs.create_dir_all(cx, dir)?;
        let next_file_id = list_journal_ids(vfs.as_ref(), cx, dir)?
            .last()
            .map_or(1, |max| max + 1);
        let shared = Arc::new(Shared {
            vfs,
            dir: dir.to_path_buf(),
            cfg,
            queue: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
            durable: Mutex::new(LastLogMark {
                journal_id: next_file_id,
                position: JOURNAL_HEADER_SIZE as u64,
            }),
            failed: AtomicBool::new(false),
            metrics: JournalMetrics::default(),
            fatal_hook: Mutex::new(None),
        });
        Ok(Self {
            shared,
            writer: Mutex::new(None),
            next_file_id,
        })
    }

    /// Start the writer thread. `fatal` fires if the writer dies on I/O.
    pub fn start(&self, fatal: FatalHook) -> Result<()> {
        *self.shared.fatal_hook.lock() = Some(fatal);
        // The writer owns a private, never-interrupted context: clean
        // shutdown drains the queue via the shutdown flag, and an
        // interrupt mid-write would be indistinguishable from disk loss.
        let cx = Cx::new();
        let file_id = self.next_file_id;
        let file = open_journal_file(self.shared.as_ref(), &cx, file_id)?;
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("rookery-journal".to_owned())
            .spawn(move || writer_loop(&shared, &cx, file, file_id))
            .map_err(BookieError::Io)?;
        *self.writer.lock() = Some(handle);
        info!(file_id, "journal writer started");
        Ok(())
    }

    /// Enqueue a record; the returned handle resolves after its batch is
    /// durable. The payload must begin with the 16-byte entry prefix.
    pub fn log_add_entry(&self, payload: Vec<u8>) -> Result<Ack> {
        if payload.len() > MAX_RECORD_SIZE {
            return Err(BookieError::internal(format!(
                "journal record too large: {} bytes",
                payload.len()
            )));
        }
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(BookieError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "journal writer has failed",
            )));
        }
        let ack = Ack::pending();
        {
            let mut q = self.shared.queue.lock();
            if q.shutdown {
                return Err(BookieError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "journal is shut down",
                )));
            }
            q.records.push_back(Queued {
                payload,
                ack: ack.clone(),
            });
        }
        self.shared.cond.notify_all();
        Ok(ack)
    }

    /// Current durable position. Safe to publish as the last-log-mark
    /// once the storage layer has flushed.
    #[must_use]
    pub fn now_mark(&self) -> LastLogMark {
        *self.shared.durable.lock()
    }

    /// Ask the writer to rotate to a fresh file at the next safe point.
    pub fn rollover(&self) {
        self.shared.queue.lock().rollover = true;
        self.shared.cond.notify_all();
    }

    /// Whether the writer has failed fatally.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Journal metrics counters.
    #[must_use]
    pub fn metrics(&self) -> &JournalMetrics {
        &self.shared.metrics
    }

    /// Drain outstanding records, fsync, and stop the writer. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut q = self.shared.queue.lock();
            q.shutdown = true;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                error!("journal writer thread panicked during shutdown");
            }
        }
    }

    /// Replay every record at or after `from_mark`.
    ///
    /// `on_record` receives `(file_version, record_mark, payload)`. Damage
    /// in the newest file is an expected crash tail and stops the replay
    /// cleanly; damage in any older file is `JournalCorrupt`.
    pub fn replay(
        &self,
        cx: &Cx,
        from_mark: LastLogMark,
        on_record: &mut dyn FnMut(u32, LastLogMark, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let vfs = self.shared.vfs.as_ref();
        let ids = list_journal_ids(vfs, cx, &self.shared.dir)?;
        let last_id = ids.last().copied();
        for id in ids {
            if id < from_mark.journal_id {
                continue;
            }
            let is_last_file = Some(id) == last_id;
            let path = journal_path(&self.shared.dir, id);
            let file = vfs.open(cx, &path, OpenFlags::read_only())?;
            let size = file.size(cx)?;
            if size < JOURNAL_HEADER_SIZE as u64 {
                if is_last_file {
                    debug!(journal_id = id, "journal file shorter than header, torn tail");
                    break;
                }
                return Err(BookieError::journal_corrupt(format!(
                    "journal file {id:08x} shorter than its header"
                )));
            }
            let mut header_buf = [0u8; JOURNAL_HEADER_SIZE];
            read_exact_at(&file, cx, &mut header_buf, 0)?;
            let header = JournalHeader::from_bytes(&header_buf)?;

            let mut offset = if id == from_mark.journal_id {
                from_mark.position.max(JOURNAL_HEADER_SIZE as u64)
            } else {
                JOURNAL_HEADER_SIZE as u64
            };
            loop {
                cx.checkpoint()?;
                match read_record_at(&file, cx, header.version, offset, size)? {
                    RecordRead::End => break,
                    RecordRead::Complete {
                        payload,
                        next_offset,
                    } => {
                        let mark = LastLogMark {
                            journal_id: id,
                            position: offset,
                        };
                        on_record(header.version, mark, &payload)?;
                        offset = next_offset;
                    }
                    RecordRead::Torn { reason } => {
                        if is_last_file {
                            debug!(
                                journal_id = id,
                                offset, reason, "torn journal tail, replay stops"
                            );
                            return Ok(());
                        }
                        return Err(BookieError::journal_corrupt(format!(
                            "damaged record in interior journal file {id:08x} at {offset}: {reason}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete journal files wholly below the mark. Never truncates inside
    /// a file.
    pub fn trim_to(&self, cx: &Cx, mark: LastLogMark) -> Result<()> {
        let vfs = self.shared.vfs.as_ref();
        for id in list_journal_ids(vfs, cx, &self.shared.dir)? {
            if id < mark.journal_id {
                let path = journal_path(&self.shared.dir, id);
                vfs.delete(cx, &path)?;
                info!(journal_id = id, "trimmed journal file");
            }
        }
        Ok(())
    }
}

fn journal_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{id:08x}.txn"))
}

fn list_journal_ids<V: Vfs + ?Sized>(vfs: &V, cx: &Cx, dir: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for path in vfs.read_dir(cx, dir)? {
        if path.extension().and_then(|e| e.to_str()) != Some("txn") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.len() == 8 {
            if let Ok(id) = u32::from_str_radix(stem, 16) {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn open_journal_file<V: Vfs>(shared: &Shared<V>, cx: &Cx, id: u32) -> Result<V::File> {
    let path = journal_path(&shared.dir, id);
    let mut file = shared.vfs.open(cx, &path, OpenFlags::read_write_create())?;
    file.write_at(cx, &JournalHeader::current().to_bytes(), 0)?;
    file.sync(cx, false)?;
    Ok(file)
}

fn writer_loop<V: Vfs>(shared: &Shared<V>, cx: &Cx, mut file: V::File, mut file_id: u32) {
    let mut offset = JOURNAL_HEADER_SIZE as u64;
    loop {
        let mut batch: Vec<Queued> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut do_rollover = false;
        let mut shutting_down;
        {
            let mut q = shared.queue.lock();
            loop {
                drain_into(&mut q.records, &mut batch, &mut batch_bytes, shared.cfg.max_group_bytes);
                do_rollover |= std::mem::take(&mut q.rollover);
                shutting_down = q.shutdown;
                if !batch.is_empty() || do_rollover || shutting_down {
                    break;
                }
                shared.cond.wait(&mut q);
            }
            // Bounded chance for co-committers to join this batch.
            if !batch.is_empty() && batch_bytes < shared.cfg.max_group_bytes && !shutting_down {
                let deadline = Instant::now() + shared.cfg.max_group_wait;
                while batch_bytes < shared.cfg.max_group_bytes && !q.shutdown {
                    if shared.cond.wait_until(&mut q, deadline).timed_out() {
                        break;
                    }
                    drain_into(
                        &mut q.records,
                        &mut batch,
                        &mut batch_bytes,
                        shared.cfg.max_group_bytes,
                    );
                }
                do_rollover |= std::mem::take(&mut q.rollover);
                shutting_down = q.shutdown;
            }
        }

        if !batch.is_empty() {
            if let Err(err) = flush_batch(shared, cx, &mut file, file_id, &mut offset, &batch) {
                fail_journal(shared, batch, &err);
                return;
            }
            for rec in &batch {
                rec.ack.complete_ok();
            }
        }

        if do_rollover || offset >= shared.cfg.max_file_size {
            file_id += 1;
            match open_journal_file(shared, cx, file_id) {
                Ok(next) => {
                    file = next;
                    offset = JOURNAL_HEADER_SIZE as u64;
                    *shared.durable.lock() = LastLogMark {
                        journal_id: file_id,
                        position: offset,
                    };
                    shared.metrics.rotations.fetch_add(1, Ordering::Relaxed);
                    info!(file_id, "journal rotated");
                }
                Err(err) => {
                    fail_journal(shared, Vec::new(), &err);
                    return;
                }
            }
        }

        if shutting_down && shared.queue.lock().records.is_empty() {
            debug!("journal writer draining complete, exiting");
            return;
        }
    }
}

fn drain_into(
    records: &mut VecDeque<Queued>,
    batch: &mut Vec<Queued>,
    batch_bytes: &mut usize,
    max_bytes: usize,
) {
    while *batch_bytes < max_bytes {
        let Some(rec) = records.pop_front() else {
            break;
        };
        *batch_bytes += rec.payload.len();
        batch.push(rec);
    }
}

fn flush_batch<V: Vfs>(
    shared: &Shared<V>,
    cx: &Cx,
    file: &mut V::File,
    file_id: u32,
    offset: &mut u64,
    batch: &[Queued],
) -> Result<()> {
    let mut buf = Vec::new();
    for rec in batch {
        encode_record(JOURNAL_VERSION_CURRENT, &rec.payload, &mut buf)?;
    }
    file.write_at(cx, &buf, *offset)?;
    file.sync(cx, true)?;
    *offset += buf.len() as u64;
    *shared.durable.lock() = LastLogMark {
        journal_id: file_id,
        position: *offset,
    };
    shared
        .metrics
        .records_appended
        .fetch_add(batch.len() as u64, Ordering::Relaxed);
    shared.metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
    shared
        .metrics
        .bytes_appended
        .fetch_add(buf.len() as u64, Ordering::Relaxed);
    Ok(())
}

/// Resolve every outstanding handle with an error and fire the fatal hook.
/// Batches whose fsync failed never resolve successfully.
fn fail_journal<V: Vfs>(shared: &Shared<V>, batch: Vec<Queued>, err: &BookieError) {
    error!(error = %err, "journal writer failed, initiating bookie shutdown");
    shared.failed.store(true, Ordering::Release);
    let detail = format!("journal writer failed: {err}");
    for rec in batch {
        rec.ack.complete_err(detail.clone());
    }
    let drained: Vec<Queued> = {
        let mut q = shared.queue.lock();
        q.shutdown = true;
        q.records.drain(..).collect()
    };
    for rec in drained {
        rec.ack.complete_err(detail.clone());
    }
    if let Some(hook) = shared.fatal_hook.lock().as_ref() {
        hook(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_vfs::MemoryVfs;

    fn test_config() -> JournalConfig {
        JournalConfig {
            max_file_size: 64 * 1024,
            max_group_bytes: 4 * 1024,
            max_group_wait: Duration::from_millis(1),
        }
    }

    fn record(ledger_id: i64, entry_id: i64, body: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(16 + body.len());
        payload.extend_from_slice(&ledger_id.to_be_bytes());
        payload.extend_from_slice(&entry_id.to_be_bytes());
        payload.extend_from_slice(body);
        payload
    }

    fn open_started(vfs: &MemoryVfs, dir: &str) -> Journal<MemoryVfs> {
        let cx = Cx::new();
        let journal =
            Journal::open(Arc::new(vfs.clone()), &cx, Path::new(dir), test_config()).unwrap();
        journal.start(Arc::new(|_: &BookieError| {})).unwrap();
        journal
    }

    #[test]
    fn ack_resolves_after_flush() {
        let vfs = MemoryVfs::new();
        let journal = open_started(&vfs, "/journal");
        let ack = journal.log_add_entry(record(1, 0, b"hello")).unwrap();
        ack.wait().unwrap();
        assert!(journal.metrics().records_appended.load(Ordering::Relaxed) >= 1);
        journal.shutdown();
    }

    #[test]
    fn acks_resolve_in_enqueue_order() {
        let vfs = MemoryVfs::new();
        let journal = open_started(&vfs, "/journal");
        let acks: Vec<Ack> = (0..50)
            .map(|i| journal.log_add_entry(record(1, i, b"x")).unwrap())
            .collect();
        // Waiting on the last implies all earlier batches flushed too.
        acks.last().unwrap().wait().unwrap();
        journal.shutdown();
        for ack in &acks {
            assert!(ack.is_done());
        }
    }

    #[test]
    fn mark_advances_monotonically() {
        let vfs = MemoryVfs::new();
        let journal = open_started(&vfs, "/journal");
        let before = journal.now_mark();
        journal
            .log_add_entry(record(1, 0, b"payload"))
            .unwrap()
            .wait()
            .unwrap();
        let after = journal.now_mark();
        assert!(after > before);
        journal.shutdown();
    }

    #[test]
    fn replay_returns_written_records() {
        let vfs = MemoryVfs::new();
        let journal = open_started(&vfs, "/journal");
        for i in 0..10 {
            journal
                .log_add_entry(record(7, i, b"body"))
                .unwrap()
                .wait()
                .unwrap();
        }
        journal.shutdown();

        let cx = Cx::new();
        let reopened = Journal::open(
            Arc::new(vfs.clone()),
            &cx,
            Path::new("/journal"),
            test_config(),
        )
        .unwrap();
        let mut seen = Vec::new();
        reopened
            .replay(&cx, LastLogMark::default(), &mut |version, _mark, payload| {
                assert_eq!(version, JOURNAL_VERSION_CURRENT);
                let (lid, eid) = rook_types::parse_entry_prefix(payload).unwrap();
                seen.push((lid.get(), eid.get()));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, (0..10).map(|i| (7, i)).collect::<Vec<_>>());
    }

    #[test]
    fn replay_skips_records_before_mark() {
        let vfs = MemoryVfs::new();
        let journal = open_started(&vfs, "/journal");
        journal
            .log_add_entry(record(1, 0, b"first"))
            .unwrap()
            .wait()
            .unwrap();
        let mark = journal.now_mark();
        journal
            .log_add_entry(record(1, 1, b"second"))
            .unwrap()
            .wait()
            .unwrap();
        journal.shutdown();

        let cx = Cx::new();
        let reopened =
            Journal::open(Arc::new(vfs), &cx, Path::new("/journal"), test_config()).unwrap();
        let mut seen = Vec::new();
        reopened
            .replay(&cx, mark, &mut |_v, _m, payload| {
                let (_, eid) = rook_types::parse_entry_prefix(payload).unwrap();
                seen.push(eid.get());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn torn_tail_in_newest_file_stops_cleanly() {
        let vfs = MemoryVfs::new();
        let journal = open_started(&vfs, "/journal");
        journal
            .log_add_entry(record(1, 0, b"good"))
            .unwrap()
            .wait()
            .unwrap();
        let mark = journal.now_mark();
        journal.shutdown();

        // Hand-write a torn record at the durable tail.
        let cx = Cx::new();
        let path = journal_path(Path::new("/journal"), mark.journal_id);
        let mut f = vfs
            .open(&cx, &path, OpenFlags::read_write_create())
            .unwrap();
        f.write_at(&cx, &100i32.to_be_bytes(), mark.position).unwrap();
        f.write_at(&cx, b"only-a-few-bytes", mark.position + 4)
            .unwrap();
        f.sync(&cx, true).unwrap();
        drop(f);

        let reopened =
            Journal::open(Arc::new(vfs), &cx, Path::new("/journal"), test_config()).unwrap();
        let mut count = 0;
        reopened
            .replay(&cx, LastLogMark::default(), &mut |_v, _m, _p| {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 1, "only the intact record replays");
    }

    #[test]
    fn rollover_and_trim() {
        let vfs = MemoryVfs::new();
        let journal = open_started(&vfs, "/journal");
        journal
            .log_add_entry(record(1, 0, b"in-file-1"))
            .unwrap()
            .wait()
            .unwrap();
        journal.rollover();
        // Rotation happens at the writer's next safe point.
        let deadline = Instant::now() + Duration::from_secs(5);
        while journal.now_mark().journal_id < 2 {
            assert!(Instant::now() < deadline, "journal did not rotate");
            std::thread::sleep(Duration::from_millis(1));
        }
        journal
            .log_add_entry(record(1, 1, b"in-file-2"))
            .unwrap()
            .wait()
            .unwrap();
        let mark = journal.now_mark();
        assert_eq!(mark.journal_id, 2);
        journal.shutdown();

        let cx = Cx::new();
        let reopened = Journal::open(
            Arc::new(vfs.clone()),
            &cx,
            Path::new("/journal"),
            test_config(),
        )
        .unwrap();
        reopened.trim_to(&cx, mark).unwrap();
        let remaining = list_journal_ids(&vfs, &cx, Path::new("/journal")).unwrap();
        assert!(remaining.iter().all(|&id| id >= mark.journal_id));

        // The mark was read after the last flush, so nothing replays.
        let mut seen = Vec::new();
        reopened
            .replay(&cx, mark, &mut |_v, _m, payload| {
                let (_, eid) = rook_types::parse_entry_prefix(payload).unwrap();
                seen.push(eid.get());
                Ok(())
            })
            .unwrap();
        assert!(seen.is_empty());
    }

    #[test]
    fn shutdown_drains_queue() {
        let vfs = MemoryVfs::new();
        let journal = open_started(&vfs, "/journal");
        let acks: Vec<Ack> = (0..20)
            .map(|i| journal.log_add_entry(record(3, i, b"drain")).unwrap())
            .collect();
        journal.shutdown();
        for ack in acks {
            ack.wait().unwrap();
        }
    }

    #[test]
    fn rejects_writes_after_shutdown() {
        let vfs = MemoryVfs::new();
        let journal = open_started(&vfs, "/journal");
        journal.shutdown();
        assert!(journal.log_add_entry(record(1, 0, b"late")).is_err());
    }
}
