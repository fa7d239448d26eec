//! Bookie configuration.
//!
//! The configuration *loader* (files, env, flags) is an external
//! collaborator; this struct is the contract it fills in. Values are
//! plain data with defaults tuned for a small deployment; `validated()`
//! clamps nonsensical settings instead of erroring so a partially wrong
//! config degrades rather than refusing to describe itself.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a single bookie process.
#[derive(Debug, Clone)]
pub struct BookieConfig {
    /// Stable identity of this bookie in the cluster (host:port in
    /// production; any unique string in tests).
    pub bookie_id: String,

    /// Directory holding journal files (`<id>.txn`).
    pub journal_dir: PathBuf,

    /// Directories holding entry-log segments and ledger index files.
    pub ledger_dirs: Vec<PathBuf>,

    // --- Journal ---
    /// Rotate the journal file once it exceeds this many bytes.
    ///
    /// Default: 2 GiB.
    pub journal_max_size: u64,

    /// Force a group-commit flush once this many bytes are batched.
    ///
    /// Default: 512 KiB.
    pub journal_max_group_bytes: usize,

    /// Maximum time a batched record waits for co-committers before the
    /// writer flushes anyway.
    ///
    /// Default: 2ms. Bounds the latency added by group commit.
    pub journal_max_group_wait: Duration,

    // --- Index / ledger cache ---
    /// Size in bytes of one index page.
    ///
    /// Default: 8 KiB.
    pub index_page_size: usize,

    /// Maximum number of index pages resident in the ledger cache.
    ///
    /// Default: 2048 pages (16 MiB at the default page size).
    pub index_page_limit: usize,

    // --- Entry log ---
    /// Seal an entry-log segment once it exceeds this many bytes.
    ///
    /// Default: 1 GiB.
    pub entry_log_max_size: u64,

    // --- Checkpointing ---
    /// Interval between sync-thread checkpoints.
    ///
    /// Default: 100ms.
    pub flush_interval: Duration,

    // --- Garbage collection / compaction ---
    /// Interval between GC scans.
    ///
    /// Default: 1s (production deployments raise this; tests rely on a
    /// short default).
    pub gc_interval: Duration,

    /// Minor compaction: usage ratio at or below which a sealed segment
    /// is rewritten. `<= 0.0` disables minor compaction.
    pub minor_compaction_threshold: f64,

    /// Interval between minor compaction sweeps. Zero disables.
    pub minor_compaction_interval: Duration,

    /// Major compaction: usage ratio at or below which a sealed segment
    /// is rewritten. `<= 0.0` disables major compaction.
    pub major_compaction_threshold: f64,

    /// Interval between major compaction sweeps. Zero disables.
    pub major_compaction_interval: Duration,

    // --- Disk health ---
    /// Fraction of disk usage at which a directory is considered full.
    ///
    /// Default: 0.95.
    pub disk_usage_threshold: f64,

    /// Interval between disk-health checks.
    ///
    /// Default: 10s.
    pub disk_check_interval: Duration,

    // --- Modes ---
    /// Whether the bookie may transition to read-only when every ledger
    /// directory is full. When disabled, all-disks-full is fatal.
    pub read_only_mode_enabled: bool,

    /// Metadata-service session timeout; also bounds how long startup
    /// waits for a stale registration from a previous incarnation to
    /// disappear.
    ///
    /// Default: 10s.
    pub metadata_session_timeout: Duration,
}

impl Default for BookieConfig {
    fn default() -> Self {
        Self {
            bookie_id: "127.0.0.1:3181".to_owned(),
            journal_dir: PathBuf::from("/tmp/rookery/journal"),
            ledger_dirs: vec![PathBuf::from("/tmp/rookery/ledgers")],
            journal_max_size: 2 * 1024 * 1024 * 1024,
            journal_max_group_bytes: 512 * 1024,
            journal_max_group_wait: Duration::from_millis(2),
            index_page_size: 8 * 1024,
            index_page_limit: 2048,
            entry_log_max_size: 1024 * 1024 * 1024,
            flush_interval: Duration::from_millis(100),
            gc_interval: Duration::from_secs(1),
            minor_compaction_threshold: 0.2,
            minor_compaction_interval: Duration::from_secs(3600),
            major_compaction_threshold: 0.8,
            major_compaction_interval: Duration::from_secs(86400),
            disk_usage_threshold: 0.95,
            disk_check_interval: Duration::from_secs(10),
            read_only_mode_enabled: false,
            metadata_session_timeout: Duration::from_secs(10),
        }
    }
}

impl BookieConfig {
    /// Clamp out-of-range settings to usable values.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if self.journal_max_group_bytes == 0 {
            self.journal_max_group_bytes = 1;
        }
        // A page must hold at least one 12-byte slot.
        if self.index_page_size < 12 {
            self.index_page_size = 12;
        }
        if self.index_page_limit == 0 {
            self.index_page_limit = 1;
        }
        if self.journal_max_size == 0 {
            self.journal_max_size = u64::MAX;
        }
        if self.entry_log_max_size == 0 {
            self.entry_log_max_size = u64::MAX;
        }
        if !(0.0..=1.0).contains(&self.disk_usage_threshold) {
            self.disk_usage_threshold = 0.95;
        }
        self
    }

    /// Whether a compaction tier is enabled.
    #[must_use]
    pub fn minor_compaction_enabled(&self) -> bool {
        self.minor_compaction_threshold > 0.0 && !self.minor_compaction_interval.is_zero()
    }

    /// Whether the major compaction tier is enabled.
    #[must_use]
    pub fn major_compaction_enabled(&self) -> bool {
        self.major_compaction_threshold > 0.0 && !self.major_compaction_interval.is_zero()
    }

    /// Number of index slots per page at the configured page size.
    #[must_use]
    pub fn entries_per_page(&self) -> u64 {
        (self.index_page_size / crate::ENTRY_LOCATION_SIZE) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = BookieConfig::default().validated();
        assert!(cfg.entries_per_page() > 0);
        assert!(cfg.minor_compaction_enabled());
        assert!(cfg.major_compaction_enabled());
    }

    #[test]
    fn validated_clamps() {
        let cfg = BookieConfig {
            journal_max_group_bytes: 0,
            index_page_size: 1,
            index_page_limit: 0,
            disk_usage_threshold: 7.5,
            ..BookieConfig::default()
        }
        .validated();
        assert_eq!(cfg.journal_max_group_bytes, 1);
        assert_eq!(cfg.index_page_size, 12);
        assert_eq!(cfg.index_page_limit, 1);
        assert!((cfg.disk_usage_threshold - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn compaction_tiers_disable_independently() {
        let cfg = BookieConfig {
            minor_compaction_threshold: 0.0,
            major_compaction_interval: Duration::ZERO,
            ..BookieConfig::default()
        };
        assert!(!cfg.minor_compaction_enabled());
        assert!(!cfg.major_compaction_enabled());
    }
}
