//! Durable last-log-mark persistence.
//!
//! The mark is a 12-byte file written into every ledger directory via
//! write-to-temp + atomic rename, so each copy is either the old value or
//! the new value, never a tear. On load, the value a majority of valid
//! copies agree on wins; without a majority the smallest valid copy is
//! used; replaying extra journal records is idempotent, skipping records
//! is not.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rook_error::{BookieError, Result};
use rook_types::{Cx, LastLogMark, LAST_LOG_MARK_SIZE};
use rook_vfs::traits::read_exact_at;
use rook_vfs::{OpenFlags, Vfs, VfsFile};
use tracing::{debug, warn};

/// Filename of the mark inside each ledger `current/` directory.
pub const LAST_MARK_FILE: &str = "lastMark";

/// Persists and loads the last-log-mark across a set of directories.
pub struct MarkFile<V: Vfs> {
    vfs: std::sync::Arc<V>,
    dirs: Vec<PathBuf>,
}

impl<V: Vfs> MarkFile<V> {
    /// `dirs` are the `current/` directories of every ledger dir.
    pub fn new(vfs: std::sync::Arc<V>, dirs: Vec<PathBuf>) -> Self {
        Self { vfs, dirs }
    }

    /// Atomically publish `mark` into every directory.
    ///
    /// Succeeds if at least one copy landed; directories that fail are
    /// logged and skipped (their stale copies lose the quorum on load).
    pub fn persist(&self, cx: &Cx, mark: LastLogMark) -> Result<()> {
        let mut wrote = 0usize;
        for dir in &self.dirs {
            match self.persist_one(cx, dir, mark) {
                Ok(()) => wrote += 1,
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "failed to persist last mark");
                }
            }
        }
        if wrote == 0 {
            return Err(BookieError::internal(
                "failed to persist last mark to any directory",
            ));
        }
        debug!(%mark, copies = wrote, "last mark published");
        Ok(())
    }

    fn persist_one(&self, cx: &Cx, dir: &Path, mark: LastLogMark) -> Result<()> {
        let tmp = dir.join(format!("{LAST_MARK_FILE}.tmp"));
        let dst = dir.join(LAST_MARK_FILE);
        let mut file = self
            .vfs
            .open(cx, &tmp, OpenFlags::read_write_create() | OpenFlags::TRUNCATE)?;
        file.write_at(cx, &mark.to_bytes(), 0)?;
        file.sync(cx, false)?;
        drop(file);
        self.vfs.rename(cx, &tmp, &dst)?;
        Ok(())
    }

    /// Load the mark. Missing or unreadable copies are skipped; with no
    /// valid copy at all the zero mark is returned (full replay).
    pub fn load(&self, cx: &Cx) -> Result<LastLogMark> {
        let mut copies = Vec::new();
        for dir in &self.dirs {
            let path = dir.join(LAST_MARK_FILE);
            match self.load_one(cx, &path) {
                Ok(Some(mark)) => copies.push(mark),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable last mark copy");
                }
            }
        }
        Ok(Self::choose(&copies))
    }

    fn load_one(&self, cx: &Cx, path: &Path) -> Result<Option<LastLogMark>> {
        if !self.vfs.exists(cx, path)? {
            return Ok(None);
        }
        let file = self.vfs.open(cx, path, OpenFlags::read_only())?;
        let mut buf = [0u8; LAST_LOG_MARK_SIZE];
        read_exact_at(&file, cx, &mut buf, 0)?;
        Ok(LastLogMark::from_bytes(&buf))
    }

    fn choose(copies: &[LastLogMark]) -> LastLogMark {
        if copies.is_empty() {
            return LastLogMark::default();
        }
        let mut counts: HashMap<LastLogMark, usize> = HashMap::new();
        for &mark in copies {
            *counts.entry(mark).or_insert(0) += 1;
        }
        let (majority_mark, majority_count) = counts
            .iter()
            .max_by_key(|(_, &count)| count)
            .map(|(&m, &c)| (m, c))
            .unwrap_or_default();
        if majority_count * 2 > copies.len() {
            majority_mark
        } else {
            copies.iter().copied().min().unwrap_or_default()
        }
    }
}
