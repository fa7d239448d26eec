//! Cancellation context threaded through I/O and long-running loops.
//!
//! Shutdown interrupts background work (replay, compaction, flush loops)
//! at safe points: code calls [`Cx::checkpoint`] between units of work and
//! gets `BookieError::Interrupted` once shutdown has been requested.
//! Cloned handles observe the same flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rook_error::{BookieError, Result};

/// Shared cancellation context.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    interrupted: Arc<AtomicBool>,
}

impl Cx {
    /// Create a fresh, non-interrupted context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request interruption. Idempotent; never un-set.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Whether interruption has been requested.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Safe-point check: `Err(Interrupted)` once shutdown is requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_interrupted() {
            Err(BookieError::Interrupted)
        } else {
            Ok(())
        }
    }
}
