use std::path::{Path, PathBuf};

use rook_error::Result;
use rook_types::Cx;

bitflags::bitflags! {
    /// How to open a file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 1 << 0;
        /// Open for writing.
        const WRITE = 1 << 1;
        /// Create the file if it does not exist.
        const CREATE = 1 << 2;
        /// Truncate the file to zero length on open.
        const TRUNCATE = 1 << 3;
    }
}

impl OpenFlags {
    /// Read-only open.
    #[must_use]
    pub const fn read_only() -> Self {
        Self::READ
    }

    /// Read-write open, creating the file when absent.
    #[must_use]
    pub const fn read_write_create() -> Self {
        Self::READ.union(Self::WRITE).union(Self::CREATE)
    }
}

/// A filesystem backend.
///
/// Directory-shaped operations live here; byte-shaped operations live on
/// [`VfsFile`]. Implementations must be shareable across the bookie's
/// long-lived threads.
pub trait Vfs: Send + Sync + 'static {
    /// The file handle type produced by this VFS.
    type File: VfsFile;

    /// The name of this VFS (e.g. "unix", "memory").
    fn name(&self) -> &'static str;

    /// Open a file.
    fn open(&self, cx: &Cx, path: &Path, flags: OpenFlags) -> Result<Self::File>;

    /// Delete a file. Deleting a missing file is an error.
    fn delete(&self, cx: &Cx, path: &Path) -> Result<()>;

    /// Whether a file exists at `path`.
    fn exists(&self, cx: &Cx, path: &Path) -> Result<bool>;

    /// Create a directory and any missing parents.
    fn create_dir_all(&self, cx: &Cx, path: &Path) -> Result<()>;

    /// List the entries of a directory (full paths, unordered).
    fn read_dir(&self, cx: &Cx, dir: &Path) -> Result<Vec<PathBuf>>;

    /// Atomically rename `from` to `to`, replacing any existing file.
    fn rename(&self, cx: &Cx, from: &Path, to: &Path) -> Result<()>;

    /// Free and total bytes of the filesystem holding `path`, when the
    /// backend can tell. `None` means "effectively unbounded" (e.g. the
    /// in-memory backend) and disables usage-based health checks.
    fn free_space(&self, cx: &Cx, path: &Path) -> Result<Option<(u64, u64)>> {
        cx.checkpoint()?;
        let _ = path;
        Ok(None)
    }
}

/// An open file handle.
///
/// All I/O is positional; handles carry no cursor, so shared handles may
/// serve concurrent readers. A read past end of file is a short read and
/// the remainder of the buffer is zero-filled.
pub trait VfsFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns bytes read.
    fn read_at(&self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write all of `buf` at `offset`, extending the file as needed.
    fn write_at(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()>;

    /// Truncate (or extend with zeros) to `size` bytes.
    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()>;

    /// Flush file content to stable storage. With `data_only`, metadata
    /// (mtime etc.) may be skipped; sizes must still be durable.
    fn sync(&mut self, cx: &Cx, data_only: bool) -> Result<()>;

    /// Current file size in bytes.
    fn size(&self, cx: &Cx) -> Result<u64>;
}

/// Read exactly `buf.len()` bytes at `offset` or fail with `ShortRead`.
pub fn read_exact_at(file: &impl VfsFile, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<()> {
    let n = file.read_at(cx, buf, offset)?;
    if n < buf.len() {
        return Err(rook_error::BookieError::ShortRead {
            expected: buf.len(),
            actual: n,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flag_helpers() {
        assert!(OpenFlags::read_only().contains(OpenFlags::READ));
        assert!(!OpenFlags::read_only().contains(OpenFlags::WRITE));
        let rwc = OpenFlags::read_write_create();
        assert!(rwc.contains(OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE));
        assert!(!rwc.contains(OpenFlags::TRUNCATE));
    }
}
