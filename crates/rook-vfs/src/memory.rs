//! In-memory VFS with power-loss simulation.
//!
//! Every file tracks two images: the current bytes and the bytes as of
//! the last `sync`. [`MemoryVfs::crash`] reverts every file to its synced
//! image and forgets files that were never synced, modeling what survives
//! a power cut. Directory operations (create, rename, delete) are treated
//! as immediately durable, which is the strongest behavior journaled
//! filesystems provide and the one the mark/rename protocol relies on.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rook_error::{BookieError, Result};
use rook_types::Cx;

use crate::traits::{OpenFlags, Vfs, VfsFile};

#[derive(Debug, Default)]
struct FileStorage {
    data: Vec<u8>,
    synced: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct MemoryVfsInner {
    files: HashMap<PathBuf, Arc<std::sync::Mutex<FileStorage>>>,
    dirs: HashSet<PathBuf>,
}

/// A shared in-memory filesystem.
///
/// Clones reference the same storage, so a "restarted" bookie opened over
/// a clone sees exactly what the previous incarnation persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryVfs {
    inner: Arc<std::sync::Mutex<MemoryVfsInner>>,
}

fn lock_err() -> BookieError {
    BookieError::internal("MemoryVfs lock poisoned")
}

fn not_found(path: &Path) -> BookieError {
    BookieError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no such file: {}", path.display()),
    ))
}

impl MemoryVfs {
    /// Create a new empty in-memory VFS.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a power cut: every file reverts to its last-synced image;
    /// files never synced disappear. Directories survive.
    pub fn crash(&self) {
        let inner = self.inner.lock().expect("MemoryVfs lock poisoned");
        let mut dead = Vec::new();
        for (path, storage) in &inner.files {
            let mut st = storage.lock().expect("MemoryVfs file lock poisoned");
            match st.synced.take() {
                Some(synced) => {
                    st.data = synced.clone();
                    st.synced = Some(synced);
                }
                None => dead.push(path.clone()),
            }
        }
        drop(inner);
        let mut inner = self.inner.lock().expect("MemoryVfs lock poisoned");
        for path in dead {
            inner.files.remove(&path);
        }
    }

    /// Snapshot what a power cut would leave behind, as an independent
    /// filesystem. The original (and any threads still writing to it) is
    /// untouched; this is the "restart after kill -9" view.
    #[must_use]
    pub fn fork_crashed(&self) -> Self {
        let inner = self.inner.lock().expect("MemoryVfs lock poisoned");
        let mut forked = MemoryVfsInner {
            files: HashMap::new(),
            dirs: inner.dirs.clone(),
        };
        for (path, storage) in &inner.files {
            let st = storage.lock().expect("MemoryVfs file lock poisoned");
            if let Some(synced) = &st.synced {
                forked.files.insert(
                    path.clone(),
                    Arc::new(std::sync::Mutex::new(FileStorage {
                        data: synced.clone(),
                        synced: Some(synced.clone()),
                    })),
                );
            }
        }
        Self {
            inner: Arc::new(std::sync::Mutex::new(forked)),
        }
    }
}

impl Vfs for MemoryVfs {
    type File = MemoryFile;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, cx: &Cx, path: &Path, flags: OpenFlags) -> Result<Self::File> {
        cx.checkpoint()?;
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let storage = if let Some(existing) = inner.files.get(path) {
            Arc::clone(existing)
        } else if flags.contains(OpenFlags::CREATE) {
            let storage = Arc::new(std::sync::Mutex::new(FileStorage::default()));
            inner.files.insert(path.to_path_buf(), Arc::clone(&storage));
            storage
        } else {
            return Err(not_found(path));
        };
        drop(inner);

        if flags.contains(OpenFlags::TRUNCATE) {
            storage.lock().map_err(|_| lock_err())?.data.clear();
        }
        Ok(MemoryFile { storage })
    }

    fn delete(&self, cx: &Cx, path: &Path) -> Result<()> {
        cx.checkpoint()?;
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        inner.files.remove(path).ok_or_else(|| not_found(path))?;
        Ok(())
    }

    fn exists(&self, cx: &Cx, path: &Path) -> Result<bool> {
        cx.checkpoint()?;
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        Ok(inner.files.contains_key(path) || inner.dirs.contains(path))
    }

    fn create_dir_all(&self, cx: &Cx, path: &Path) -> Result<()> {
        cx.checkpoint()?;
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let mut cur = PathBuf::new();
        for part in path.components() {
            cur.push(part);
            inner.dirs.insert(cur.clone());
        }
        Ok(())
    }

    fn read_dir(&self, cx: &Cx, dir: &Path) -> Result<Vec<PathBuf>> {
        cx.checkpoint()?;
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        let mut out: Vec<PathBuf> = inner
            .files
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect();
        out.extend(
            inner
                .dirs
                .iter()
                .filter(|p| p.parent() == Some(dir))
                .cloned(),
        );
        Ok(out)
    }

    fn rename(&self, cx: &Cx, from: &Path, to: &Path) -> Result<()> {
        cx.checkpoint()?;
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let storage = inner.files.remove(from).ok_or_else(|| not_found(from))?;
        // Directory-level operation: durable immediately, so the renamed
        // file's current image becomes its crash image.
        {
            let mut st = storage.lock().map_err(|_| lock_err())?;
            st.synced = Some(st.data.clone());
        }
        inner.files.insert(to.to_path_buf(), storage);
        Ok(())
    }
}

/// A handle to an in-memory file.
#[derive(Debug)]
pub struct MemoryFile {
    storage: Arc<std::sync::Mutex<FileStorage>>,
}

impl VfsFile for MemoryFile {
    fn read_at(&self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        cx.checkpoint()?;
        let st = self.storage.lock().map_err(|_| lock_err())?;
        let offset = usize::try_from(offset).map_err(|_| BookieError::internal("offset overflow"))?;
        if offset >= st.data.len() {
            buf.fill(0);
            return Ok(0);
        }
        let n = buf.len().min(st.data.len() - offset);
        buf[..n].copy_from_slice(&st.data[offset..offset + n]);
        buf[n..].fill(0);
        Ok(n)
    }

    fn write_at(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        cx.checkpoint()?;
        let mut st = self.storage.lock().map_err(|_| lock_err())?;
        let offset = usize::try_from(offset).map_err(|_| BookieError::internal("offset overflow"))?;
        let end = offset + buf.len();
        if st.data.len() < end {
            st.data.resize(end, 0);
        }
        st.data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()> {
        cx.checkpoint()?;
        let mut st = self.storage.lock().map_err(|_| lock_err())?;
        let size = usize::try_from(size).map_err(|_| BookieError::internal("size overflow"))?;
        st.data.resize(size, 0);
        Ok(())
    }

    fn sync(&mut self, cx: &Cx, _data_only: bool) -> Result<()> {
        cx.checkpoint()?;
        let mut st = self.storage.lock().map_err(|_| lock_err())?;
        st.synced = Some(st.data.clone());
        Ok(())
    }

    fn size(&self, cx: &Cx) -> Result<u64> {
        cx.checkpoint()?;
        let st = self.storage.lock().map_err(|_| lock_err())?;
        Ok(st.data.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_rw(vfs: &MemoryVfs, cx: &Cx, path: &str) -> MemoryFile {
        vfs.open(cx, Path::new(path), OpenFlags::read_write_create())
            .unwrap()
    }

    #[test]
    fn write_read_roundtrip() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let mut f = open_rw(&vfs, &cx, "/j/0.txn");
        f.write_at(&cx, b"abcdef", 2).unwrap();
        assert_eq!(f.size(&cx).unwrap(), 8);

        let mut buf = [0u8; 4];
        assert_eq!(f.read_at(&cx, &mut buf, 4).unwrap(), 4);
        assert_eq!(&buf, b"cdef");
    }

    #[test]
    fn crash_loses_unsynced_writes() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let mut f = open_rw(&vfs, &cx, "/data");
        f.write_at(&cx, b"durable", 0).unwrap();
        f.sync(&cx, true).unwrap();
        f.write_at(&cx, b" and lost", 7).unwrap();
        drop(f);

        vfs.crash();

        let f = vfs
            .open(&cx, Path::new("/data"), OpenFlags::read_only())
            .unwrap();
        assert_eq!(f.size(&cx).unwrap(), 7);
        let mut buf = [0u8; 7];
        f.read_at(&cx, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"durable");
    }

    #[test]
    fn crash_drops_never_synced_files() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let mut f = open_rw(&vfs, &cx, "/ephemeral");
        f.write_at(&cx, b"gone", 0).unwrap();
        drop(f);

        vfs.crash();
        assert!(!vfs.exists(&cx, Path::new("/ephemeral")).unwrap());
    }

    #[test]
    fn rename_is_durable_and_replacing() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let mut f = open_rw(&vfs, &cx, "/mark.tmp");
        f.write_at(&cx, b"mark-v2", 0).unwrap();
        drop(f);
        let _ = open_rw(&vfs, &cx, "/mark");

        vfs.rename(&cx, Path::new("/mark.tmp"), Path::new("/mark"))
            .unwrap();
        vfs.crash();

        let f = vfs
            .open(&cx, Path::new("/mark"), OpenFlags::read_only())
            .unwrap();
        let mut buf = [0u8; 7];
        f.read_at(&cx, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"mark-v2");
        assert!(!vfs.exists(&cx, Path::new("/mark.tmp")).unwrap());
    }

    #[test]
    fn read_dir_lists_children_only() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        vfs.create_dir_all(&cx, Path::new("/ledgers/current")).unwrap();
        let _ = open_rw(&vfs, &cx, "/ledgers/current/00000001.log");
        let _ = open_rw(&vfs, &cx, "/ledgers/current/00000002.log");
        let _ = open_rw(&vfs, &cx, "/ledgers/other.txt");

        let mut listed = vfs.read_dir(&cx, Path::new("/ledgers/current")).unwrap();
        listed.sort();
        assert_eq!(
            listed,
            vec![
                PathBuf::from("/ledgers/current/00000001.log"),
                PathBuf::from("/ledgers/current/00000002.log"),
            ]
        );
    }

    #[test]
    fn shared_storage_across_clones() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let mut f = open_rw(&vfs, &cx, "/shared");
        f.write_at(&cx, b"x", 0).unwrap();
        f.sync(&cx, true).unwrap();

        let restarted = vfs.clone();
        assert!(restarted.exists(&cx, Path::new("/shared")).unwrap());
    }
}
