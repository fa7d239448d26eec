//! Interleaved entry log.
//!
//! Entries from every ledger are packed into rolling segment files:
//! ```text
//! [Header: 1024 bytes]  magic "RKEL", version, log id
//! [len: u32 BE][entry bytes][len][entry]...
//! ```
//! `entry bytes[0..16]` are the big-endian `(ledger_id, entry_id)` prefix.
//! Appends land in a memory buffer first: the returned location is
//! readable immediately (read-your-writes) but only crash-durable after
//! `flush`. The journal owns durability of the acknowledgement path;
//! anything lost from the buffer is re-added during replay.
//!
//! When a segment seals, a ledgers-map sidecar (`<logid>.map`) records
//! how many bytes each ledger contributed, so GC and the compactor can
//! judge liveness without scanning entries. A sealed segment whose
//! sidecar is missing (crash between seal and sidecar write) is scanned
//! once and the sidecar rebuilt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rook_error::{BookieError, Result};
use rook_types::{parse_entry_prefix, Cx, EntryLocation, LogId};
use rook_vfs::traits::read_exact_at;
use rook_vfs::{OpenFlags, Vfs, VfsFile};
use tracing::{debug, info, warn};

use crate::ledger_dirs::LedgerDirs;

/// Magic bytes at the start of every entry-log segment.
pub const ENTRY_LOG_MAGIC: [u8; 4] = *b"RKEL";

/// Size of the segment header page.
pub const ENTRY_LOG_HEADER_SIZE: u64 = 1024;

/// Entry-log format version.
pub const ENTRY_LOG_VERSION: u32 = 1;

/// Magic bytes of the ledgers-map sidecar.
pub const LEDGERS_MAP_MAGIC: [u8; 4] = *b"RKLM";

/// Upper bound on a single entry; larger framed lengths are damage.
pub const MAX_ENTRY_SIZE: usize = 128 * 1024 * 1024;

struct CurrentSegment<V: Vfs> {
    log_id: u32,
    dir: PathBuf,
    file: V::File,
    /// Logical end of the segment (header + flushed + buffered bytes).
    tail: u64,
    /// File offset where the in-memory buffer begins.
    buffer_start: u64,
    buffer: Vec<u8>,
    ledger_bytes: HashMap<i64, u64>,
}

/// The interleaved entry log across all ledger directories.
pub struct EntryLogger<V: Vfs> {
    vfs: Arc<V>,
    dirs: Arc<LedgerDirs<V>>,
    max_size: u64,
    current: Mutex<CurrentSegment<V>>,
    read_handles: Mutex<HashMap<u32, Arc<V::File>>>,
}

impl<V: Vfs> EntryLogger<V> {
    /// Open the entry log: scans every directory for existing segments
    /// and starts a fresh segment above the highest id found.
    pub fn open(vfs: Arc<V>, dirs: Arc<LedgerDirs<V>>, cx: &Cx, max_size: u64) -> Result<Self> {
        let next_id = segment_ids(vfs.as_ref(), dirs.as_ref(), cx)?
            .last()
            .map_or(1, |max| max + 1);
        let current = create_segment(vfs.as_ref(), dirs.as_ref(), cx, next_id)?;
        info!(log_id = next_id, "entry log opened");
        Ok(Self {
            vfs,
            dirs,
            max_size,
            current: Mutex::new(current),
            read_handles: Mutex::new(HashMap::new()),
        })
    }

    /// Append an entry, returning its stable location.
    pub fn add_entry(&self, cx: &Cx, entry: &[u8]) -> Result<EntryLocation> {
        let (ledger_id, entry_id) = parse_entry_prefix(entry)?;
        if !entry_id.is_storable() {
            return Err(BookieError::internal(format!(
                "meta entry id {entry_id} must never reach the entry log"
            )));
        }
        let frame_len = 4 + entry.len() as u64;
        let mut cur = self.current.lock();
        if cur.tail + frame_len > self.max_size && cur.tail > ENTRY_LOG_HEADER_SIZE {
            self.roll_locked(cx, &mut cur)?;
        }
        let location = EntryLocation {
            log_id: LogId::new(cur.log_id),
            offset: cur.tail,
        };
        let len = u32::try_from(entry.len())
            .map_err(|_| BookieError::internal("entry too large for frame"))?;
        cur.buffer.extend_from_slice(&len.to_be_bytes());
        cur.buffer.extend_from_slice(entry);
        cur.tail += frame_len;
        *cur.ledger_bytes.entry(ledger_id.get()).or_insert(0) += frame_len;
        Ok(location)
    }

    /// Flush and fsync the current segment's buffered tail.
    pub fn flush(&self, cx: &Cx) -> Result<()> {
        let mut cur = self.current.lock();
        self.flush_locked(cx, &mut cur)
    }

    fn flush_locked(&self, cx: &Cx, cur: &mut CurrentSegment<V>) -> Result<()> {
        if !cur.buffer.is_empty() {
            let buffer = std::mem::take(&mut cur.buffer);
            if let Err(err) = cur.file.write_at(cx, &buffer, cur.buffer_start) {
                cur.buffer = buffer;
                self.dirs.mark_failed(&cur.dir);
                return Err(err);
            }
            cur.buffer_start = cur.tail;
        }
        if let Err(err) = cur.file.sync(cx, true) {
            self.dirs.mark_failed(&cur.dir);
            return Err(err);
        }
        Ok(())
    }

    /// Seal the current segment and start a new one.
    pub fn roll(&self, cx: &Cx) -> Result<()> {
        let mut cur = self.current.lock();
        self.roll_locked(cx, &mut cur)
    }

    fn roll_locked(&self, cx: &Cx, cur: &mut CurrentSegment<V>) -> Result<()> {
        self.flush_locked(cx, cur)?;
        write_ledgers_map(
            self.vfs.as_ref(),
            cx,
            &cur.dir,
            cur.log_id,
            &cur.ledger_bytes,
        )?;
        let mut next = create_segment(self.vfs.as_ref(), self.dirs.as_ref(), cx, cur.log_id + 1)?;
        std::mem::swap(cur, &mut next);
        let sealed = next;
        info!(log_id = sealed.log_id, next = cur.log_id, "entry log rolled");
        self.read_handles
            .lock()
            .insert(sealed.log_id, Arc::new(sealed.file));
        Ok(())
    }

    /// Read the entry stored at `location`.
    ///
    /// Buffered tail entries of the open segment are served from memory;
    /// everything else reads through a cached per-segment handle.
    pub fn read_entry(&self, cx: &Cx, location: EntryLocation) -> Result<Vec<u8>> {
        let log_id = location.log_id.get();
        {
            let cur = self.current.lock();
            if log_id == cur.log_id {
                if location.offset >= cur.tail {
                    return Err(BookieError::EntryLogCorrupt {
                        detail: format!(
                            "location {location:?} is past the tail of open segment {log_id:08x}"
                        ),
                    });
                }
                if location.offset >= cur.buffer_start {
                    return read_frame_from_buffer(&cur.buffer, location.offset - cur.buffer_start);
                }
                return read_frame(&cur.file, cx, location.offset);
            }
        }
        let file = self.sealed_handle(cx, log_id)?;
        read_frame(file.as_ref(), cx, location.offset)
    }

    fn sealed_handle(&self, cx: &Cx, log_id: u32) -> Result<Arc<V::File>> {
        if let Some(handle) = self.read_handles.lock().get(&log_id) {
            return Ok(Arc::clone(handle));
        }
        let path = self
            .find_segment(cx, log_id)?
            .ok_or_else(|| BookieError::EntryLogCorrupt {
                detail: format!("segment {log_id:08x} not found in any ledger directory"),
            })?;
        let file = Arc::new(self.vfs.open(cx, &path, OpenFlags::read_only())?);
        self.read_handles.lock().insert(log_id, Arc::clone(&file));
        Ok(file)
    }

    /// Locate a segment file across the directory pool.
    pub fn find_segment(&self, cx: &Cx, log_id: u32) -> Result<Option<PathBuf>> {
        let name = format!("{log_id:08x}.log");
        for dir in self.dirs.all_dirs() {
            let path = dir.join(&name);
            if self.vfs.exists(cx, &path)? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Ids of all segments on disk, ascending.
    pub fn segments(&self, cx: &Cx) -> Result<Vec<u32>> {
        segment_ids(self.vfs.as_ref(), self.dirs.as_ref(), cx)
    }

    /// Ids of sealed (non-current) segments, ascending.
    pub fn sealed_segments(&self, cx: &Cx) -> Result<Vec<u32>> {
        let current_id = self.current.lock().log_id;
        Ok(self
            .segments(cx)?
            .into_iter()
            .filter(|&id| id != current_id)
            .collect())
    }

    /// Id of the open segment.
    #[must_use]
    pub fn current_log_id(&self) -> u32 {
        self.current.lock().log_id
    }

    /// Per-ledger byte counts for a sealed segment, reading the sidecar
    /// or rebuilding it from a scan when missing or damaged.
    pub fn ledgers_map(&self, cx: &Cx, log_id: u32) -> Result<HashMap<i64, u64>> {
        let map_name = format!("{log_id:08x}.map");
        for dir in self.dirs.all_dirs() {
            let path = dir.join(&map_name);
            if self.vfs.exists(cx, &path)? {
                match read_ledgers_map(self.vfs.as_ref(), cx, &path, log_id) {
                    Ok(map) => return Ok(map),
                    Err(err) => {
                        warn!(log_id, error = %err, "damaged ledgers map, rebuilding");
                        break;
                    }
                }
            }
        }
        self.rebuild_ledgers_map(cx, log_id)
    }

    fn rebuild_ledgers_map(&self, cx: &Cx, log_id: u32) -> Result<HashMap<i64, u64>> {
        let mut map: HashMap<i64, u64> = HashMap::new();
        self.scan_segment(cx, log_id, &mut |ledger_id, _entry_id, _offset, entry| {
            *map.entry(ledger_id).or_insert(0) += 4 + entry.len() as u64;
            Ok(())
        })?;
        let dir = self
            .find_segment(cx, log_id)?
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .ok_or_else(|| BookieError::EntryLogCorrupt {
                detail: format!("segment {log_id:08x} disappeared during map rebuild"),
            })?;
        write_ledgers_map(self.vfs.as_ref(), cx, &dir, log_id, &map)?;
        debug!(log_id, ledgers = map.len(), "ledgers map rebuilt");
        Ok(map)
    }

    /// Scan every intact entry of a sealed segment.
    pub fn scan_segment(
        &self,
        cx: &Cx,
        log_id: u32,
        on_entry: &mut dyn FnMut(i64, i64, u64, &[u8]) -> Result<()>,
    ) -> Result<()> {
        if log_id == self.current_log_id() {
            return Err(BookieError::internal("refusing to scan the open segment"));
        }
        let file = self.sealed_handle(cx, log_id)?;
        let size = file.size(cx)?;
        let mut header = [0u8; 12];
        read_exact_at(file.as_ref(), cx, &mut header, 0)?;
        if header[..4] != ENTRY_LOG_MAGIC {
            return Err(BookieError::EntryLogCorrupt {
                detail: format!("segment {log_id:08x} has bad magic"),
            });
        }
        let mut offset = ENTRY_LOG_HEADER_SIZE;
        loop {
            cx.checkpoint()?;
            if offset + 4 > size {
                break;
            }
            let mut len_buf = [0u8; 4];
            read_exact_at(file.as_ref(), cx, &mut len_buf, offset)?;
            let len = u32::from_be_bytes(len_buf) as u64;
            if len == 0 || len as usize > MAX_ENTRY_SIZE || offset + 4 + len > size {
                // Unflushed tail lost in a crash; everything before it is
                // intact and anything after never hit the index durably.
                debug!(log_id, offset, "segment scan stops at damaged tail");
                break;
            }
            let mut entry = vec![0u8; usize::try_from(len).unwrap_or(0)];
            read_exact_at(file.as_ref(), cx, &mut entry, offset + 4)?;
            let (ledger_id, entry_id) = parse_entry_prefix(&entry)?;
            on_entry(ledger_id.get(), entry_id.get(), offset, &entry)?;
            offset += 4 + len;
        }
        Ok(())
    }

    /// Delete a sealed segment and its sidecar.
    pub fn delete_segment(&self, cx: &Cx, log_id: u32) -> Result<()> {
        self.read_handles.lock().remove(&log_id);
        if let Some(path) = self.find_segment(cx, log_id)? {
            let map_path = path.with_extension("map");
            self.vfs.delete(cx, &path)?;
            if self.vfs.exists(cx, &map_path)? {
                self.vfs.delete(cx, &map_path)?;
            }
            info!(log_id, "entry log segment deleted");
        }
        Ok(())
    }
}

fn create_segment<V: Vfs>(
    vfs: &V,
    dirs: &LedgerDirs<V>,
    cx: &Cx,
    log_id: u32,
) -> Result<CurrentSegment<V>> {
    let dir = dirs.pick_for_new_file(cx)?;
    let path = dir.join(format!("{log_id:08x}.log"));
    let mut file = vfs.open(cx, &path, OpenFlags::read_write_create())?;
    let mut header = [0u8; 12];
    header[..4].copy_from_slice(&ENTRY_LOG_MAGIC);
    header[4..8].copy_from_slice(&ENTRY_LOG_VERSION.to_be_bytes());
    header[8..12].copy_from_slice(&log_id.to_be_bytes());
    file.write_at(cx, &header, 0)?;
    Ok(CurrentSegment {
        log_id,
        dir,
        file,
        tail: ENTRY_LOG_HEADER_SIZE,
        buffer_start: ENTRY_LOG_HEADER_SIZE,
        buffer: Vec::new(),
        ledger_bytes: HashMap::new(),
    })
}

fn segment_ids<V: Vfs>(vfs: &V, dirs: &LedgerDirs<V>, cx: &Cx) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for dir in dirs.all_dirs() {
        for path in vfs.read_dir(cx, dir)? {
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Some(id) = LogId::parse_file_stem(stem) {
                    ids.push(id.get());
                }
            }
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

fn read_frame<F: VfsFile>(file: &F, cx: &Cx, offset: u64) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    read_exact_at(file, cx, &mut len_buf, offset)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_ENTRY_SIZE {
        return Err(BookieError::EntryLogCorrupt {
            detail: format!("bad entry frame length {len} at offset {offset}"),
        });
    }
    let mut entry = vec![0u8; len];
    read_exact_at(file, cx, &mut entry, offset + 4)?;
    Ok(entry)
}

fn read_frame_from_buffer(buffer: &[u8], offset: u64) -> Result<Vec<u8>> {
    let offset = usize::try_from(offset).map_err(|_| BookieError::internal("offset overflow"))?;
    if offset + 4 > buffer.len() {
        return Err(BookieError::EntryLogCorrupt {
            detail: "buffered frame header out of range".to_owned(),
        });
    }
    let len = u32::from_be_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ]) as usize;
    if len == 0 || offset + 4 + len > buffer.len() {
        return Err(BookieError::EntryLogCorrupt {
            detail: "buffered frame body out of range".to_owned(),
        });
    }
    Ok(buffer[offset + 4..offset + 4 + len].to_vec())
}

fn write_ledgers_map<V: Vfs>(
    vfs: &V,
    cx: &Cx,
    dir: &Path,
    log_id: u32,
    ledger_bytes: &HashMap<i64, u64>,
) -> Result<()> {
    let mut body = Vec::with_capacity(16 + ledger_bytes.len() * 16);
    body.extend_from_slice(&LEDGERS_MAP_MAGIC);
    body.extend_from_slice(&1u32.to_be_bytes());
    body.extend_from_slice(&log_id.to_be_bytes());
    let count = u32::try_from(ledger_bytes.len())
        .map_err(|_| BookieError::internal("ledgers map too large"))?;
    body.extend_from_slice(&count.to_be_bytes());
    let mut entries: Vec<(i64, u64)> = ledger_bytes.iter().map(|(&l, &b)| (l, b)).collect();
    entries.sort_unstable();
    for (ledger_id, bytes) in entries {
        body.extend_from_slice(&ledger_id.to_be_bytes());
        body.extend_from_slice(&bytes.to_be_bytes());
    }
    let crc = crc32c::crc32c(&body);
    body.extend_from_slice(&crc.to_be_bytes());

    let path = dir.join(format!("{log_id:08x}.map"));
    let mut file = vfs.open(cx, &path, OpenFlags::read_write_create() | OpenFlags::TRUNCATE)?;
    file.write_at(cx, &body, 0)?;
    file.sync(cx, false)?;
    Ok(())
}

fn read_ledgers_map<V: Vfs>(
    vfs: &V,
    cx: &Cx,
    path: &Path,
    expect_log_id: u32,
) -> Result<HashMap<i64, u64>> {
    let file = vfs.open(cx, path, OpenFlags::read_only())?;
    let size = usize::try_from(file.size(cx)?).map_err(|_| BookieError::internal("map too large"))?;
    if size < 20 {
        return Err(BookieError::EntryLogCorrupt {
            detail: "ledgers map too small".to_owned(),
        });
    }
    let mut body = vec![0u8; size];
    read_exact_at(&file, cx, &mut body, 0)?;
    let (payload, crc_bytes) = body.split_at(size - 4);
    let stored = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    if stored != crc32c::crc32c(payload) {
        return Err(BookieError::EntryLogCorrupt {
            detail: "ledgers map checksum mismatch".to_owned(),
        });
    }
    if payload[..4] != LEDGERS_MAP_MAGIC {
        return Err(BookieError::EntryLogCorrupt {
            detail: "ledgers map bad magic".to_owned(),
        });
    }
    let log_id = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
    if log_id != expect_log_id {
        return Err(BookieError::EntryLogCorrupt {
            detail: format!("ledgers map names segment {log_id:08x}, expected {expect_log_id:08x}"),
        });
    }
    let count = u32::from_be_bytes([payload[12], payload[13], payload[14], payload[15]]) as usize;
    let mut map = HashMap::with_capacity(count);
    let mut pos = 16;
    for _ in 0..count {
        if pos + 16 > payload.len() {
            return Err(BookieError::EntryLogCorrupt {
                detail: "ledgers map truncated".to_owned(),
            });
        }
        let ledger_id = i64::from_be_bytes(payload[pos..pos + 8].try_into().expect("8 bytes"));
        let bytes = u64::from_be_bytes(payload[pos + 8..pos + 16].try_into().expect("8 bytes"));
        map.insert(ledger_id, bytes);
        pos += 16;
    }
    Ok(map)
}
