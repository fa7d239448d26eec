//! The sync thread: periodic checkpoints that let the journal shrink.
//!
//! Checkpoint protocol, in order:
//! 1. read the journal's current durable position (`mark_t`);
//! 2. flush the entry log and the ledger cache (flushing more than
//!    strictly needed is fine, never less);
//! 3. publish `mark_t` as the last-log-mark (fan-out to every ledger
//!    dir);
//! 4. trim journal files wholly below the mark.
//!
//! A failed checkpoint leaves the previous mark in place and retries on
//! the next tick; repeated failures escalate through the fatal hook.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rook_error::{BookieError, Result};
use rook_journal::{FatalHook, Journal, MarkFile};
use rook_storage::InterleavedStorage;
use rook_types::Cx;
use rook_vfs::Vfs;
use tracing::{debug, error, warn};

/// Consecutive checkpoint failures tolerated before escalating.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

struct SyncShared<V: Vfs> {
    journal: Arc<Journal<V>>,
    storage: Arc<InterleavedStorage<V>>,
    mark_file: Arc<MarkFile<V>>,
    interval: Duration,
    stop: Mutex<bool>,
    cond: Condvar,
    fatal: FatalHook,
}

/// The checkpointer task.
pub struct SyncThread<V: Vfs> {
    shared: Arc<SyncShared<V>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Vfs> SyncThread<V> {
    /// Create the checkpointer (not yet running).
    pub fn new(
        journal: Arc<Journal<V>>,
        storage: Arc<InterleavedStorage<V>>,
        mark_file: Arc<MarkFile<V>>,
        interval: Duration,
        fatal: FatalHook,
    ) -> Self {
        Self {
            shared: Arc::new(SyncShared {
                journal,
                storage,
                mark_file,
                interval,
                stop: Mutex::new(false),
                cond: Condvar::new(),
                fatal,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Run one checkpoint now.
    pub fn checkpoint(&self, cx: &Cx) -> Result<()> {
        checkpoint(self.shared.as_ref(), cx)
    }

    /// Start the periodic task.
    pub fn start(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("rookery-sync".to_owned())
            .spawn(move || run_loop(&shared))
            .map_err(BookieError::Io)?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the task and run one final checkpoint so everything the
    /// journal acknowledged is durable in storage before it closes.
    pub fn shutdown(&self) {
        {
            let mut stop = self.shared.stop.lock();
            *stop = true;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("sync thread panicked during shutdown");
            }
        }
        // The final flush runs on a private context: shutdown must not
        // interrupt its own last checkpoint.
        let cx = Cx::new();
        if let Err(err) = checkpoint(self.shared.as_ref(), &cx) {
            warn!(error = %err, "final checkpoint failed; journal retained for replay");
        }
    }
}

fn run_loop<V: Vfs>(shared: &SyncShared<V>) {
    let cx = Cx::new();
    let mut failures = 0u32;
    loop {
        {
            let mut stop = shared.stop.lock();
            if !*stop {
                shared.cond.wait_for(&mut stop, shared.interval);
            }
            if *stop {
                debug!("sync thread stopping");
                return;
            }
        }
        match checkpoint(shared, &cx) {
            Ok(()) => failures = 0,
            Err(err) => {
                failures += 1;
                warn!(error = %err, failures, "checkpoint failed, mark not advanced");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    error!("checkpoint failing persistently, escalating");
                    (shared.fatal)(&err);
                    return;
                }
            }
        }
    }
}

fn checkpoint<V: Vfs>(shared: &SyncShared<V>, cx: &Cx) -> Result<()> {
    let mark = shared.journal.now_mark();
    shared.storage.flush(cx)?;
    shared.mark_file.persist(cx, mark)?;
    shared.journal.trim_to(cx, mark)?;
    debug!(%mark, "checkpoint complete");
    Ok(())
}
