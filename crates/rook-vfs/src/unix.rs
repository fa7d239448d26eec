//! Unix VFS backed by `std::fs` with positional I/O.
//!
//! Reads and writes use `FileExt::{read_at, write_at}` so concurrent
//! readers never contend on a shared cursor. Short reads zero-fill the
//! remainder of the buffer per the [`VfsFile`] contract.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use rook_error::{BookieError, Result};
use rook_types::Cx;

use crate::traits::{OpenFlags, Vfs, VfsFile};

/// A VFS backed by the real Unix filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixVfs;

impl UnixVfs {
    /// Create a new Unix VFS instance.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Vfs for UnixVfs {
    type File = UnixFile;

    fn name(&self) -> &'static str {
        "unix"
    }

    fn open(&self, cx: &Cx, path: &Path, flags: OpenFlags) -> Result<Self::File> {
        cx.checkpoint()?;
        let mut opts = OpenOptions::new();
        opts.read(flags.contains(OpenFlags::READ))
            .write(flags.contains(OpenFlags::WRITE))
            .create(flags.contains(OpenFlags::CREATE))
            .truncate(flags.contains(OpenFlags::TRUNCATE));
        let file = opts.open(path)?;
        Ok(UnixFile { file })
    }

    fn delete(&self, cx: &Cx, path: &Path) -> Result<()> {
        cx.checkpoint()?;
        fs::remove_file(path)?;
        Ok(())
    }

    fn exists(&self, cx: &Cx, path: &Path) -> Result<bool> {
        cx.checkpoint()?;
        Ok(path.exists())
    }

    fn create_dir_all(&self, cx: &Cx, path: &Path) -> Result<()> {
        cx.checkpoint()?;
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn read_dir(&self, cx: &Cx, dir: &Path) -> Result<Vec<PathBuf>> {
        cx.checkpoint()?;
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            out.push(entry?.path());
        }
        Ok(out)
    }

    fn rename(&self, cx: &Cx, from: &Path, to: &Path) -> Result<()> {
        cx.checkpoint()?;
        fs::rename(from, to)?;
        Ok(())
    }

    #[allow(clippy::cast_lossless, clippy::unnecessary_cast)]
    fn free_space(&self, cx: &Cx, path: &Path) -> Result<Option<(u64, u64)>> {
        cx.checkpoint()?;
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|e| BookieError::Io(std::io::Error::from(e)))?;
        let frsize = stat.fragment_size() as u64;
        let free = stat.blocks_available() as u64 * frsize;
        let total = stat.blocks() as u64 * frsize;
        Ok(Some((free, total)))
    }
}

/// A file handle on the real filesystem.
#[derive(Debug)]
pub struct UnixFile {
    file: File,
}

impl VfsFile for UnixFile {
    fn read_at(&self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        cx.checkpoint()?;
        let mut total = 0;
        while total < buf.len() {
            let n = self.file.read_at(&mut buf[total..], offset + total as u64)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        // Short read: zero the tail so callers never see stale bytes.
        buf[total..].fill(0);
        Ok(total)
    }

    fn write_at(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        cx.checkpoint()?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()> {
        cx.checkpoint()?;
        self.file.set_len(size)?;
        Ok(())
    }

    fn sync(&mut self, cx: &Cx, data_only: bool) -> Result<()> {
        cx.checkpoint()?;
        if data_only {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn size(&self, cx: &Cx) -> Result<u64> {
        cx.checkpoint()?;
        Ok(self.file.metadata()?.len())
    }
}

impl UnixFile {
    /// Consume the handle, returning the inner [`File`].
    #[must_use]
    pub fn into_inner(self) -> File {
        self.file
    }
}

/// Map a missing-file error into `None` instead of failing.
pub fn open_if_exists<V: Vfs>(
    vfs: &V,
    cx: &Cx,
    path: &Path,
    flags: OpenFlags,
) -> Result<Option<V::File>> {
    match vfs.open(cx, path, flags) {
        Ok(f) => Ok(Some(f)),
        Err(BookieError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_roundtrip_and_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let cx = Cx::new();
        let vfs = UnixVfs::new();

        let mut f = vfs
            .open(&cx, &path, OpenFlags::read_write_create())
            .unwrap();
        f.write_at(&cx, b"hello world", 5).unwrap();
        assert_eq!(f.size(&cx).unwrap(), 16);

        let mut buf = [0xFFu8; 8];
        let n = f.read_at(&cx, &mut buf, 12).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"orld");
        assert_eq!(&buf[4..], &[0, 0, 0, 0], "short-read tail is zeroed");
    }

    #[test]
    fn rename_is_replacing() {
        let dir = tempfile::tempdir().unwrap();
        let cx = Cx::new();
        let vfs = UnixVfs::new();
        let a = dir.path().join("a");
        let b = dir.path().join("b");

        let mut f = vfs.open(&cx, &a, OpenFlags::read_write_create()).unwrap();
        f.write_at(&cx, b"new", 0).unwrap();
        let mut g = vfs.open(&cx, &b, OpenFlags::read_write_create()).unwrap();
        g.write_at(&cx, b"old", 0).unwrap();

        vfs.rename(&cx, &a, &b).unwrap();
        assert!(!vfs.exists(&cx, &a).unwrap());
        let f = vfs.open(&cx, &b, OpenFlags::read_only()).unwrap();
        let mut buf = [0u8; 3];
        f.read_at(&cx, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"new");
    }

    #[test]
    fn open_if_exists_maps_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cx = Cx::new();
        let vfs = UnixVfs::new();
        let missing = dir.path().join("nope");
        assert!(open_if_exists(&vfs, &cx, &missing, OpenFlags::read_only())
            .unwrap()
            .is_none());
    }

    #[test]
    fn interrupt_stops_io() {
        let dir = tempfile::tempdir().unwrap();
        let cx = Cx::new();
        let vfs = UnixVfs::new();
        cx.interrupt();
        let err = vfs
            .open(&cx, &dir.path().join("x"), OpenFlags::read_write_create())
            .unwrap_err();
        assert!(matches!(err, BookieError::Interrupted));
    }
}
