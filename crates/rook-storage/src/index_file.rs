//! Per-ledger index files.
//!
//! One file per ledger, fanned out two levels by the hex halves of the
//! ledger id: `current/<hi 8 hex>/<lo 8 hex>.idx`. Layout:
//! ```text
//! [Header: 1024 bytes]  magic "RKLI", version, state bits, master key
//! [Page 0][Page 1]...   fixed-size pages of 12-byte location slots
//! ```
//! The header carries the ledger's master key and a fenced state bit, so
//! both survive eviction and journal trimming. Slot addressing:
//! `page_id = entry_id / entries_per_page`,
//! `slot = entry_id % entries_per_page`; an all-zero slot means absent.

use std::path::{Path, PathBuf};

use rook_error::{BookieError, Result};
use rook_types::{Cx, EntryLocation, ENTRY_LOCATION_SIZE};
use rook_vfs::traits::read_exact_at;
use rook_vfs::{OpenFlags, Vfs, VfsFile};

/// Magic bytes at the start of every index file.
pub const INDEX_MAGIC: [u8; 4] = *b"RKLI";

/// Size of the index file header.
pub const INDEX_HEADER_SIZE: u64 = 1024;

/// Index format version.
pub const INDEX_VERSION: u32 = 1;

/// Header state bit: the ledger is fenced.
const STATE_FENCED: u32 = 0x1;

/// The header must hold the key after 16 bytes of fixed fields.
pub const MAX_MASTER_KEY_LEN: usize = (INDEX_HEADER_SIZE as usize) - 16;

/// Relative path of a ledger's index file under a `current/` directory.
#[must_use]
pub fn index_rel_path(ledger_id: i64) -> PathBuf {
    #[allow(clippy::cast_sign_loss)]
    let bits = ledger_id as u64;
    let hi = (bits >> 32) as u32;
    let lo = (bits & 0xffff_ffff) as u32;
    PathBuf::from(format!("{hi:08x}")).join(format!("{lo:08x}.idx"))
}

/// Recover a ledger id from the `<hi>/<lo>.idx` path components.
#[must_use]
pub fn parse_index_path(hi: &str, lo_stem: &str) -> Option<i64> {
    if hi.len() != 8 || lo_stem.len() != 8 {
        return None;
    }
    let hi = u32::from_str_radix(hi, 16).ok()?;
    let lo = u32::from_str_radix(lo_stem, 16).ok()?;
    #[allow(clippy::cast_possible_wrap)]
    Some(((u64::from(hi) << 32) | u64::from(lo)) as i64)
}

/// Open handle + cached header state for one ledger's index file.
pub struct LedgerIndexFile<V: Vfs> {
    ledger_id: i64,
    file: V::File,
    master_key: Vec<u8>,
    fenced: bool,
    /// Highest entry id known for this ledger, -1 when none.
    last_entry: i64,
}

impl<V: Vfs> LedgerIndexFile<V> {
    /// Create a fresh index file with the given master key.
    pub fn create(vfs: &V, cx: &Cx, path: &Path, ledger_id: i64, master_key: &[u8]) -> Result<Self> {
        if master_key.len() > MAX_MASTER_KEY_LEN {
            return Err(BookieError::internal("master key too long for index header"));
        }
        if let Some(parent) = path.parent() {
            vfs.create_dir_all(cx, parent)?;
        }
        let file = vfs.open(cx, path, OpenFlags::read_write_create())?;
        let mut this = Self {
            ledger_id,
            file,
            master_key: master_key.to_vec(),
            fenced: false,
            last_entry: -1,
        };
        this.write_header(cx)?;
        Ok(this)
    }

    /// Open an existing index file, recovering header state and the
    /// highest indexed entry id.
    pub fn open(vfs: &V, cx: &Cx, path: &Path, ledger_id: i64, page_size: usize) -> Result<Self> {
        let file = vfs.open(cx, path, OpenFlags::READ | OpenFlags::WRITE)?;
        let mut header = vec![0u8; INDEX_HEADER_SIZE as usize];
        read_exact_at(&file, cx, &mut header, 0)?;
        if header[..4] != INDEX_MAGIC {
            return Err(BookieError::IndexCorrupt {
                detail: format!("ledger {ledger_id}: bad index magic"),
            });
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != INDEX_VERSION {
            return Err(BookieError::IndexCorrupt {
                detail: format!("ledger {ledger_id}: unsupported index version {version}"),
            });
        }
        let state = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        let key_len = u32::from_be_bytes([header[12], header[13], header[14], header[15]]) as usize;
        if key_len > MAX_MASTER_KEY_LEN {
            return Err(BookieError::IndexCorrupt {
                detail: format!("ledger {ledger_id}: master key length {key_len} out of range"),
            });
        }
        let master_key = header[16..16 + key_len].to_vec();
        let mut this = Self {
            ledger_id,
            file,
            master_key,
            fenced: state & STATE_FENCED != 0,
            last_entry: -1,
        };
        this.last_entry = this.scan_last_entry(cx, page_size)?;
        Ok(this)
    }

    fn write_header(&mut self, cx: &Cx) -> Result<()> {
        let mut header = vec![0u8; INDEX_HEADER_SIZE as usize];
        header[..4].copy_from_slice(&INDEX_MAGIC);
        header[4..8].copy_from_slice(&INDEX_VERSION.to_be_bytes());
        let state = if self.fenced { STATE_FENCED } else { 0 };
        header[8..12].copy_from_slice(&state.to_be_bytes());
        let key_len = u32::try_from(self.master_key.len())
            .map_err(|_| BookieError::internal("master key too long"))?;
        header[12..16].copy_from_slice(&key_len.to_be_bytes());
        header[16..16 + self.master_key.len()].copy_from_slice(&self.master_key);
        self.file.write_at(cx, &header, 0)
    }

    /// The ledger this file belongs to.
    #[must_use]
    pub fn ledger_id(&self) -> i64 {
        self.ledger_id
    }

    /// The ledger's master key.
    #[must_use]
    pub fn master_key(&self) -> &[u8] {
        &self.master_key
    }

    /// Whether the ledger is fenced.
    #[must_use]
    pub fn is_fenced(&self) -> bool {
        self.fenced
    }

    /// Fence the ledger, persisting the state bit immediately. Returns
    /// whether this call made the transition.
    pub fn set_fenced(&mut self, cx: &Cx) -> Result<bool> {
        if self.fenced {
            return Ok(false);
        }
        self.fenced = true;
        self.write_header(cx)?;
        self.file.sync(cx, false)?;
        Ok(true)
    }

    /// Highest entry id known, -1 when none.
    #[must_use]
    pub fn last_entry(&self) -> i64 {
        self.last_entry
    }

    /// Raise the known-highest entry id.
    pub fn note_entry(&mut self, entry_id: i64) {
        if entry_id > self.last_entry {
            self.last_entry = entry_id;
        }
    }

    /// Read one index page, zero-filled where the file has no data yet.
    pub fn read_page(&self, cx: &Cx, page_id: u64, page_size: usize) -> Result<Vec<u8>> {
        let mut page = vec![0u8; page_size];
        let offset = INDEX_HEADER_SIZE + page_id * page_size as u64;
        let _ = self.file.read_at(cx, &mut page, offset)?;
        Ok(page)
    }

    /// Write one index page.
    pub fn write_page(&mut self, cx: &Cx, page_id: u64, page: &[u8], page_size: usize) -> Result<()> {
        debug_assert_eq!(page.len(), page_size);
        let offset = INDEX_HEADER_SIZE + page_id * page_size as u64;
        self.file.write_at(cx, page, offset)
    }

    /// Fsync the file.
    pub fn sync(&mut self, cx: &Cx) -> Result<()> {
        self.file.sync(cx, false)
    }

    /// Find the highest entry id with a non-zero slot by scanning pages
    /// back to front.
    fn scan_last_entry(&self, cx: &Cx, page_size: usize) -> Result<i64> {
        let entries_per_page = (page_size / ENTRY_LOCATION_SIZE) as u64;
        let size = self.file.size(cx)?;
        if size <= INDEX_HEADER_SIZE || entries_per_page == 0 {
            return Ok(-1);
        }
        let pages = (size - INDEX_HEADER_SIZE).div_ceil(page_size as u64);
        for page_id in (0..pages).rev() {
            let page = self.read_page(cx, page_id, page_size)?;
            for slot in (0..entries_per_page as usize).rev() {
                let start = slot * ENTRY_LOCATION_SIZE;
                let raw: &[u8; ENTRY_LOCATION_SIZE] = page[start..start + ENTRY_LOCATION_SIZE]
                    .try_into()
                    .map_err(|_| BookieError::internal("slot slice size"))?;
                if EntryLocation::from_slot(raw).is_some() {
                    #[allow(clippy::cast_possible_wrap)]
                    return Ok((page_id * entries_per_page + slot as u64) as i64);
                }
            }
        }
        Ok(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_types::LogId;
    use rook_vfs::MemoryVfs;

    const PAGE: usize = 120; // 10 slots per page

    fn slot_bytes(log_id: u32, offset: u64) -> [u8; ENTRY_LOCATION_SIZE] {
        EntryLocation {
            log_id: LogId::new(log_id),
            offset,
        }
        .to_slot()
    }

    #[test]
    fn fan_out_path_roundtrip() {
        let id = 0x0000_00ab_0000_0cdei64;
        let rel = index_rel_path(id);
        assert_eq!(rel, PathBuf::from("000000ab").join("00000cde.idx"));
        assert_eq!(parse_index_path("000000ab", "00000cde"), Some(id));
        assert_eq!(parse_index_path("xyz", "00000cde"), None);
    }

    #[test]
    fn header_roundtrip_with_key_and_fence() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let path = Path::new("/idx/000000/a.idx");
        let mut f = LedgerIndexFile::create(&vfs, &cx, path, 7, b"secret").unwrap();
        assert_eq!(f.master_key(), b"secret");
        assert!(!f.is_fenced());
        assert!(f.set_fenced(&cx).unwrap());
        assert!(!f.set_fenced(&cx).unwrap(), "second fence is a no-op");

        let reopened = LedgerIndexFile::open(&vfs, &cx, path, 7, PAGE).unwrap();
        assert_eq!(reopened.master_key(), b"secret");
        assert!(reopened.is_fenced());
    }

    #[test]
    fn pages_roundtrip_and_zero_fill() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let path = Path::new("/idx/l.idx");
        let mut f = LedgerIndexFile::create(&vfs, &cx, path, 1, b"k").unwrap();

        let absent = f.read_page(&cx, 3, PAGE).unwrap();
        assert!(absent.iter().all(|&b| b == 0));

        let mut page = vec![0u8; PAGE];
        page[..ENTRY_LOCATION_SIZE].copy_from_slice(&slot_bytes(2, 4096));
        f.write_page(&cx, 3, &page, PAGE).unwrap();
        assert_eq!(f.read_page(&cx, 3, PAGE).unwrap(), page);
        // Neighboring page still reads as zeros.
        assert!(f.read_page(&cx, 2, PAGE).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn last_entry_recovered_by_backward_scan() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let path = Path::new("/idx/l.idx");
        let mut f = LedgerIndexFile::create(&vfs, &cx, path, 1, b"k").unwrap();

        // Entry ids 0 and 27 with 10 slots per page: page 0 slot 0, page 2 slot 7.
        let mut page0 = vec![0u8; PAGE];
        page0[..ENTRY_LOCATION_SIZE].copy_from_slice(&slot_bytes(1, 1024));
        f.write_page(&cx, 0, &page0, PAGE).unwrap();
        let mut page2 = vec![0u8; PAGE];
        page2[7 * ENTRY_LOCATION_SIZE..8 * ENTRY_LOCATION_SIZE]
            .copy_from_slice(&slot_bytes(1, 2048));
        f.write_page(&cx, 2, &page2, PAGE).unwrap();
        f.sync(&cx).unwrap();

        let reopened = LedgerIndexFile::open(&vfs, &cx, path, 1, PAGE).unwrap();
        assert_eq!(reopened.last_entry(), 27);
    }

    #[test]
    fn empty_index_has_no_last_entry() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        let path = Path::new("/idx/l.idx");
        let _ = LedgerIndexFile::create(&vfs, &cx, path, 1, b"k").unwrap();
        let reopened = LedgerIndexFile::open(&vfs, &cx, path, 1, PAGE).unwrap();
        assert_eq!(reopened.last_entry(), -1);
    }
}
