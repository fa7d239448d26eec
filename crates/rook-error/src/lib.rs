use thiserror::Error;

/// Primary error type for bookie operations.
///
/// Client-addressable conditions (missing ledger, fenced ledger, bad master
/// key) are structured variants that the request layer reports back to the
/// caller; storage-level conditions carry enough detail to decide between
/// retry, directory failover, and fatal shutdown.
#[derive(Error, Debug)]
pub enum BookieError {
    // === Client-addressable errors ===
    /// The ledger has no state on this bookie.
    #[error("ledger {ledger_id} not found")]
    NoLedger { ledger_id: i64 },

    /// The ledger exists but the requested entry does not.
    #[error("entry {entry_id} not found in ledger {ledger_id}")]
    NoEntry { ledger_id: i64, entry_id: i64 },

    /// The ledger is fenced; normal writes are refused forever.
    #[error("ledger {ledger_id} is fenced")]
    LedgerFenced { ledger_id: i64 },

    /// Supplied master key does not match the ledger's key.
    #[error("unauthorized access to ledger {ledger_id}: master key mismatch")]
    UnauthorizedAccess { ledger_id: i64 },

    /// The bookie is in read-only mode and refuses writes.
    #[error("bookie is read-only")]
    ReadOnly,

    // === Disk / directory errors ===
    /// No ledger directory is currently writable.
    #[error("no writable ledger directory")]
    NoWritableDir,

    /// Cookie mismatch between disk, metadata service, and configuration.
    #[error("invalid cookie: {detail}")]
    InvalidCookie { detail: String },

    // === Metadata service ===
    /// Metadata-service operation failed.
    #[error("metadata service error: {detail}")]
    Metadata { detail: String },

    // === I/O ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Short read (fewer bytes than expected).
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// Journal file is corrupt beyond the torn-tail allowance.
    #[error("journal is corrupt: {detail}")]
    JournalCorrupt { detail: String },

    /// Entry-log segment is corrupt.
    #[error("entry log is corrupt: {detail}")]
    EntryLogCorrupt { detail: String },

    /// Ledger index file is corrupt.
    #[error("ledger index is corrupt: {detail}")]
    IndexCorrupt { detail: String },

    // === Control flow ===
    /// Operation was interrupted by shutdown.
    #[error("interrupted")]
    Interrupted,

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Process exit codes reported by the bookie on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    /// Clean shutdown.
    Ok = 0,
    /// Configuration rejected at startup.
    InvalidConf = 1,
    /// Generic fatal bookie error (journal failure, disk failure, ...).
    BookieException = 2,
    /// Failed to register availability in the metadata service.
    ZkRegFail = 4,
    /// Metadata-service session expired.
    ZkExpired = 5,
    /// Cookie validation failed at startup.
    InvalidCookie = 6,
}

impl BookieError {
    /// Map this error to the exit code a fatal shutdown should report.
    #[must_use]
    pub const fn exit_code(&self) -> ExitCode {
        match self {
            Self::InvalidCookie { .. } => ExitCode::InvalidCookie,
            Self::Metadata { .. } => ExitCode::ZkRegFail,
            _ => ExitCode::BookieException,
        }
    }

    /// Whether this error is reported to the requesting client and never
    /// escalates to a bookie shutdown.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NoLedger { .. }
                | Self::NoEntry { .. }
                | Self::LedgerFenced { .. }
                | Self::UnauthorizedAccess { .. }
                | Self::ReadOnly
        )
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a journal corruption error.
    pub fn journal_corrupt(detail: impl Into<String>) -> Self {
        Self::JournalCorrupt {
            detail: detail.into(),
        }
    }

    /// Create a metadata-service error.
    pub fn metadata(detail: impl Into<String>) -> Self {
        Self::Metadata {
            detail: detail.into(),
        }
    }

    /// Create a cookie validation error.
    pub fn invalid_cookie(detail: impl Into<String>) -> Self {
        Self::InvalidCookie {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `BookieError`.
pub type Result<T> = std::result::Result<T, BookieError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = BookieError::NoLedger { ledger_id: 42 };
        assert_eq!(err.to_string(), "ledger 42 not found");

        let err = BookieError::NoEntry {
            ledger_id: 1,
            entry_id: 7,
        };
        assert_eq!(err.to_string(), "entry 7 not found in ledger 1");

        let err = BookieError::journal_corrupt("bad record length");
        assert_eq!(err.to_string(), "journal is corrupt: bad record length");
    }

    #[test]
    fn client_errors_never_fatal() {
        assert!(BookieError::NoLedger { ledger_id: 1 }.is_client_error());
        assert!(BookieError::LedgerFenced { ledger_id: 1 }.is_client_error());
        assert!(BookieError::UnauthorizedAccess { ledger_id: 1 }.is_client_error());
        assert!(BookieError::ReadOnly.is_client_error());
        assert!(!BookieError::NoWritableDir.is_client_error());
        assert!(!BookieError::journal_corrupt("x").is_client_error());
    }

    #[test]
    fn exit_code_values() {
        assert_eq!(ExitCode::Ok as i32, 0);
        assert_eq!(ExitCode::InvalidConf as i32, 1);
        assert_eq!(ExitCode::BookieException as i32, 2);
        assert_eq!(ExitCode::ZkRegFail as i32, 4);
        assert_eq!(ExitCode::ZkExpired as i32, 5);
        assert_eq!(ExitCode::InvalidCookie as i32, 6);
    }

    #[test]
    fn exit_code_mapping() {
        assert_eq!(
            BookieError::invalid_cookie("mismatch").exit_code(),
            ExitCode::InvalidCookie
        );
        assert_eq!(
            BookieError::metadata("session lost").exit_code(),
            ExitCode::ZkRegFail
        );
        assert_eq!(
            BookieError::NoWritableDir.exit_code(),
            ExitCode::BookieException
        );
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: BookieError = io_err.into();
        assert!(matches!(err, BookieError::Io(_)));
        assert!(!err.is_client_error());
    }
}
