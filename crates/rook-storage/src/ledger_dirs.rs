//! Ledger directory pool.
//!
//! Each configured directory gets a `current/` subdirectory holding a
//! `VERSION` file (layout version 3), entry-log segments, the index
//! fan-out, and a last-mark copy. The pool tracks which directories are
//! writable, picks a directory for new files with a bias toward the most
//! free space, and runs a background health check (free-space query plus
//! a write probe). State changes fan out to registered listeners; the
//! facade turns `all_disks_full` into the read-only transition.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rook_error::{BookieError, Result};
use rook_types::Cx;
use rook_vfs::traits::read_exact_at;
use rook_vfs::{OpenFlags, Vfs, VfsFile};
use tracing::{debug, error, info, warn};

/// On-disk layout version written to `current/VERSION`.
pub const LAYOUT_VERSION: u32 = 3;

/// Name of the active subdirectory inside each configured ledger dir.
pub const CURRENT_DIR: &str = "current";

/// Receiver for directory-health transitions.
///
/// Callbacks run on the disk-checker thread (or whichever thread marked
/// the directory); implementations must not block on storage operations.
pub trait DirsListener: Send + Sync {
    /// A directory crossed the usage threshold.
    fn disk_full(&self, _dir: &Path) {}
    /// A directory failed a write probe or I/O operation.
    fn disk_failed(&self, _dir: &Path) {}
    /// No directory is writable, but at least one is healthy (just full).
    fn all_disks_full(&self) {}
    /// Every directory has failed outright.
    fn fatal_error(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirHealth {
    Writable,
    Full,
    Failed,
}

struct DirsState {
    health: Vec<DirHealth>,
    next_rr: usize,
}

/// Pool of ledger directories.
pub struct LedgerDirs<V: Vfs> {
    vfs: Arc<V>,
    /// The `current/` directory of every configured ledger dir.
    dirs: Vec<PathBuf>,
    usage_threshold: f64,
    state: Mutex<DirsState>,
    listeners: Mutex<Vec<Arc<dyn DirsListener>>>,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Vfs> std::fmt::Debug for LedgerDirs<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerDirs")
            .field("dirs", &self.dirs)
            .finish_non_exhaustive()
    }
}

impl<V: Vfs> LedgerDirs<V> {
    /// Open the pool: creates `current/` subdirectories and stamps or
    /// verifies the layout `VERSION` file in each.
    pub fn open(
        vfs: Arc<V>,
        cx: &Cx,
        ledger_dirs: &[PathBuf],
        usage_threshold: f64,
    ) -> Result<Self> {
        if ledger_dirs.is_empty() {
            return Err(BookieError::internal("no ledger directories configured"));
        }
        let mut dirs = Vec::with_capacity(ledger_dirs.len());
        for dir in ledger_dirs {
            let current = dir.join(CURRENT_DIR);
            vfs.create_dir_all(cx, &current)?;
            check_layout_version(vfs.as_ref(), cx, &current)?;
            dirs.push(current);
        }
        let health = vec![DirHealth::Writable; dirs.len()];
        Ok(Self {
            vfs,
            dirs,
            usage_threshold,
            state: Mutex::new(DirsState { health, next_rr: 0 }),
            listeners: Mutex::new(Vec::new()),
            checker: Mutex::new(None),
        })
    }

    /// Register a health listener.
    pub fn add_listener(&self, listener: Arc<dyn DirsListener>) {
        self.listeners.lock().push(listener);
    }

    /// All `current/` directories, regardless of health.
    #[must_use]
    pub fn all_dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Currently writable `current/` directories.
    #[must_use]
    pub fn writable_dirs(&self) -> Vec<PathBuf> {
        let state = self.state.lock();
        self.dirs
            .iter()
            .zip(&state.health)
            .filter(|(_, &h)| h == DirHealth::Writable)
            .map(|(d, _)| d.clone())
            .collect()
    }

    /// Pick a directory for a new file: the writable directory with the
    /// most free space, falling back to round-robin when the backend
    /// cannot report free space.
    pub fn pick_for_new_file(&self, cx: &Cx) -> Result<PathBuf> {
        let candidates: Vec<(usize, PathBuf)> = {
            let state = self.state.lock();
            self.dirs
                .iter()
                .enumerate()
                .filter(|(i, _)| state.health[*i] == DirHealth::Writable)
                .map(|(i, d)| (i, d.clone()))
                .collect()
        };
        if candidates.is_empty() {
            return Err(BookieError::NoWritableDir);
        }

        let mut best: Option<(u64, usize, PathBuf)> = None;
        for (idx, dir) in &candidates {
            if let Some((free, _total)) = self.vfs.free_space(cx, dir)? {
                match &best {
                    Some((best_free, _, _)) if *best_free >= free => {}
                    _ => best = Some((free, *idx, dir.clone())),
                }
            }
        }
        if let Some((_, _, dir)) = best {
            return Ok(dir);
        }

        // No free-space information: plain round-robin.
        let mut state = self.state.lock();
        let pick = state.next_rr % candidates.len();
        state.next_rr = state.next_rr.wrapping_add(1);
        Ok(candidates[pick].1.clone())
    }

    /// Mark a directory failed (I/O error observed).
    pub fn mark_failed(&self, dir: &Path) {
        if self.set_health(dir, DirHealth::Failed) {
            error!(dir = %dir.display(), "ledger directory failed");
            for l in self.listeners.lock().iter() {
                l.disk_failed(dir);
            }
            self.notify_if_unwritable();
        }
    }

    /// Mark a directory full (usage threshold crossed).
    pub fn mark_full(&self, dir: &Path) {
        if self.set_health(dir, DirHealth::Full) {
            warn!(dir = %dir.display(), "ledger directory full");
            for l in self.listeners.lock().iter() {
                l.disk_full(dir);
            }
            self.notify_if_unwritable();
        }
    }

    /// Restore a full directory to writable (usage dropped again). Failed
    /// directories stay failed until restart.
    pub fn mark_writable(&self, dir: &Path) {
        let Some(idx) = self.dirs.iter().position(|d| d == dir) else {
            return;
        };
        let mut state = self.state.lock();
        if state.health[idx] == DirHealth::Full {
            state.health[idx] = DirHealth::Writable;
            info!(dir = %dir.display(), "ledger directory writable again");
        }
    }

    fn set_health(&self, dir: &Path, health: DirHealth) -> bool {
        let Some(idx) = self.dirs.iter().position(|d| d == dir) else {
            return false;
        };
        let mut state = self.state.lock();
        if state.health[idx] == health || state.health[idx] == DirHealth::Failed {
            return false;
        }
        state.health[idx] = health;
        true
    }

    fn notify_if_unwritable(&self) {
        let (any_writable, any_full) = {
            let state = self.state.lock();
            (
                state.health.iter().any(|&h| h == DirHealth::Writable),
                state.health.iter().any(|&h| h == DirHealth::Full),
            )
        };
        if any_writable {
            return;
        }
        let listeners = self.listeners.lock().clone();
        if any_full {
            for l in &listeners {
                l.all_disks_full();
            }
        } else {
            for l in &listeners {
                l.fatal_error();
            }
        }
    }

    /// One health pass over every directory: free-space query plus a
    /// write-and-delete probe.
    pub fn check_dirs(&self, cx: &Cx) -> Result<()> {
        for dir in &self.dirs {
            cx.checkpoint()?;
            match self.check_one(cx, dir) {
                Ok(DirHealth::Writable) => self.mark_writable(dir),
                Ok(DirHealth::Full) => self.mark_full(dir),
                Ok(DirHealth::Failed) | Err(_) => self.mark_failed(dir),
            }
        }
        Ok(())
    }

    fn check_one(&self, cx: &Cx, dir: &Path) -> Result<DirHealth> {
        if let Some((free, total)) = self.vfs.free_space(cx, dir)? {
            if total > 0 {
                #[allow(clippy::cast_precision_loss)]
                let usage = 1.0 - (free as f64 / total as f64);
                if usage > self.usage_threshold {
                    return Ok(DirHealth::Full);
                }
            }
        }
        // Write probe: a directory that cannot take a small durable write
        // cannot take an entry log either.
        let probe = dir.join(".probe");
        let result = (|| -> Result<()> {
            let mut f = self
                .vfs
                .open(cx, &probe, OpenFlags::read_write_create() | OpenFlags::TRUNCATE)?;
            f.write_at(cx, b"rookery-probe", 0)?;
            f.sync(cx, false)?;
            drop(f);
            self.vfs.delete(cx, &probe)?;
            Ok(())
        })();
        match result {
            Ok(()) => Ok(DirHealth::Writable),
            Err(BookieError::Interrupted) => Err(BookieError::Interrupted),
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "write probe failed");
                Ok(DirHealth::Failed)
            }
        }
    }

    /// Start the background disk checker.
    pub fn start_checker(self: &Arc<Self>, cx: Cx, interval: Duration) -> Result<()> {
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("rookery-disk-check".to_owned())
            .spawn(move || {
                loop {
                    sleep_interruptible(&cx, interval);
                    if cx.is_interrupted() {
                        break;
                    }
                    if let Err(err) = this.check_dirs(&cx) {
                        if matches!(err, BookieError::Interrupted) {
                            break;
                        }
                        warn!(error = %err, "disk check pass failed");
                    }
                }
                debug!("disk checker exiting");
            })
            .map_err(BookieError::Io)?;
        *self.checker.lock() = Some(handle);
        Ok(())
    }

    /// Join the checker thread (after interrupting its context).
    pub fn shutdown(&self) {
        if let Some(handle) = self.checker.lock().take() {
            if handle.join().is_err() {
                error!("disk checker thread panicked");
            }
        }
    }
}

/// Sleep in small slices so an interrupt is observed promptly.
pub(crate) fn sleep_interruptible(cx: &Cx, total: Duration) {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() {
        if cx.is_interrupted() {
            return;
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
}

fn check_layout_version<V: Vfs>(vfs: &V, cx: &Cx, current: &Path) -> Result<()> {
    let version_file = current.join("VERSION");
    if vfs.exists(cx, &version_file)? {
        let f = vfs.open(cx, &version_file, OpenFlags::read_only())?;
        let size = f.size(cx)?.min(16);
        let mut buf = vec![0u8; usize::try_from(size).unwrap_or(16)];
        read_exact_at(&f, cx, &mut buf, 0)?;
        let text = String::from_utf8_lossy(&buf);
        let version: u32 = text.trim().parse().map_err(|_| {
            BookieError::internal(format!(
                "unparseable layout VERSION in {}",
                current.display()
            ))
        })?;
        if version < LAYOUT_VERSION {
            return Err(BookieError::internal(format!(
                "directory layout version {version} is older than {LAYOUT_VERSION}, upgrade needed"
            )));
        }
        Ok(())
    } else {
        let mut f = vfs.open(cx, &version_file, OpenFlags::read_write_create())?;
        f.write_at(cx, LAYOUT_VERSION.to_string().as_bytes(), 0)?;
        f.sync(cx, false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_vfs::MemoryVfs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(vfs: &MemoryVfs, n: usize) -> Arc<LedgerDirs<MemoryVfs>> {
        let cx = Cx::new();
        let dirs: Vec<PathBuf> = (0..n).map(|i| PathBuf::from(format!("/l{i}"))).collect();
        Arc::new(LedgerDirs::open(Arc::new(vfs.clone()), &cx, &dirs, 0.95).unwrap())
    }

    #[derive(Default)]
    struct CountingListener {
        full: AtomicUsize,
        failed: AtomicUsize,
        all_full: AtomicUsize,
        fatal: AtomicUsize,
    }

    impl DirsListener for CountingListener {
        fn disk_full(&self, _dir: &Path) {
            self.full.fetch_add(1, Ordering::SeqCst);
        }
        fn disk_failed(&self, _dir: &Path) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        fn all_disks_full(&self) {
            self.all_full.fetch_add(1, Ordering::SeqCst);
        }
        fn fatal_error(&self) {
            self.fatal.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn open_stamps_layout_version() {
        let vfs = MemoryVfs::new();
        let dirs = pool(&vfs, 2);
        let cx = Cx::new();
        for dir in dirs.all_dirs() {
            assert!(vfs.exists(&cx, &dir.join("VERSION")).unwrap());
        }
        // Reopening verifies instead of stamping.
        let _again = pool(&vfs, 2);
    }

    #[test]
    fn old_layout_version_refused() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        vfs.create_dir_all(&cx, Path::new("/old/current")).unwrap();
        let mut f = vfs
            .open(
                &cx,
                Path::new("/old/current/VERSION"),
                OpenFlags::read_write_create(),
            )
            .unwrap();
        f.write_at(&cx, b"2", 0).unwrap();
        drop(f);
        let err = LedgerDirs::open(
            Arc::new(vfs),
            &cx,
            &[PathBuf::from("/old")],
            0.95,
        )
        .unwrap_err();
        assert!(err.to_string().contains("upgrade needed"));
    }

    #[test]
    fn pick_round_robins_without_free_space_info() {
        let vfs = MemoryVfs::new();
        let dirs = pool(&vfs, 3);
        let cx = Cx::new();
        let a = dirs.pick_for_new_file(&cx).unwrap();
        let b = dirs.pick_for_new_file(&cx).unwrap();
        let c = dirs.pick_for_new_file(&cx).unwrap();
        let mut picked = vec![a, b, c];
        picked.sort();
        picked.dedup();
        assert_eq!(picked.len(), 3, "round-robin should cycle all dirs");
    }

    #[test]
    fn full_dirs_are_skipped_then_all_full_fires() {
        let vfs = MemoryVfs::new();
        let dirs = pool(&vfs, 2);
        let cx = Cx::new();
        let listener = Arc::new(CountingListener::default());
        dirs.add_listener(listener.clone());

        let all: Vec<PathBuf> = dirs.all_dirs().to_vec();
        dirs.mark_full(&all[0]);
        assert_eq!(listener.full.load(Ordering::SeqCst), 1);
        assert_eq!(listener.all_full.load(Ordering::SeqCst), 0);
        let picked = dirs.pick_for_new_file(&cx).unwrap();
        assert_eq!(picked, all[1]);

        dirs.mark_full(&all[1]);
        assert_eq!(listener.all_full.load(Ordering::SeqCst), 1);
        assert!(matches!(
            dirs.pick_for_new_file(&cx),
            Err(BookieError::NoWritableDir)
        ));
    }

    #[test]
    fn all_failed_is_fatal_not_full() {
        let vfs = MemoryVfs::new();
        let dirs = pool(&vfs, 2);
        let listener = Arc::new(CountingListener::default());
        dirs.add_listener(listener.clone());
        let all: Vec<PathBuf> = dirs.all_dirs().to_vec();
        dirs.mark_failed(&all[0]);
        dirs.mark_failed(&all[1]);
        assert_eq!(listener.fatal.load(Ordering::SeqCst), 1);
        assert_eq!(listener.all_full.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn full_dir_can_recover_failed_cannot() {
        let vfs = MemoryVfs::new();
        let dirs = pool(&vfs, 2);
        let all: Vec<PathBuf> = dirs.all_dirs().to_vec();
        dirs.mark_full(&all[0]);
        dirs.mark_writable(&all[0]);
        assert_eq!(dirs.writable_dirs().len(), 2);

        dirs.mark_failed(&all[1]);
        dirs.mark_writable(&all[1]);
        assert_eq!(dirs.writable_dirs().len(), 1);
    }

    #[test]
    fn check_dirs_probe_passes_on_memory_vfs() {
        let vfs = MemoryVfs::new();
        let dirs = pool(&vfs, 1);
        let cx = Cx::new();
        dirs.check_dirs(&cx).unwrap();
        assert_eq!(dirs.writable_dirs().len(), 1);
    }
}
