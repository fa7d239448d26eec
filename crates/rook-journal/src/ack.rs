//! Durability acknowledgement handles.
//!
//! An [`Ack`] resolves when the journal record it was issued for is
//! durable (its batch fsync returned), or resolves with an error when the
//! journal writer failed before reaching that record. The same handle
//! type serves every operation that needs journal-durable acknowledgement
//! (entry adds, fence records).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rook_error::{BookieError, Result};

#[derive(Debug)]
enum AckState {
    Pending,
    Done(std::result::Result<(), String>),
}

#[derive(Debug)]
struct AckShared {
    state: Mutex<AckState>,
    cond: Condvar,
}

/// A waitable handle for journal durability.
///
/// Cheap to clone; all clones observe the same completion.
#[derive(Debug, Clone)]
pub struct Ack {
    inner: Arc<AckShared>,
}

impl Ack {
    /// Create a pending handle.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(AckShared {
                state: Mutex::new(AckState::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    /// Create an already-completed successful handle.
    #[must_use]
    pub fn done_ok() -> Self {
        Self {
            inner: Arc::new(AckShared {
                state: Mutex::new(AckState::Done(Ok(()))),
                cond: Condvar::new(),
            }),
        }
    }

    /// Whether the handle has resolved (either way).
    #[must_use]
    pub fn is_done(&self) -> bool {
        !matches!(*self.inner.state.lock(), AckState::Pending)
    }

    /// Block until resolution.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while matches!(*state, AckState::Pending) {
            self.inner.cond.wait(&mut state);
        }
        Self::unpack(&state)
    }

    /// Block up to `timeout`. `Ok(None)` means the handle is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<()>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while matches!(*state, AckState::Pending) {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if matches!(*state, AckState::Pending) {
            return Ok(None);
        }
        Self::unpack(&state).map(Some)
    }

    fn unpack(state: &AckState) -> Result<()> {
        match state {
            AckState::Pending => Err(BookieError::internal("ack unpacked while pending")),
            AckState::Done(Ok(())) => Ok(()),
            AckState::Done(Err(detail)) => Err(BookieError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                detail.clone(),
            ))),
        }
    }

    /// Resolve the handle successfully.
    pub(crate) fn complete_ok(&self) {
        let mut state = self.inner.state.lock();
        if matches!(*state, AckState::Pending) {
            *state = AckState::Done(Ok(()));
            self.inner.cond.notify_all();
        }
    }

    /// Resolve the handle with a failure.
    pub(crate) fn complete_err(&self, detail: impl Into<String>) {
        let mut state = self.inner.state.lock();
        if matches!(*state, AckState::Pending) {
            *state = AckState::Done(Err(detail.into()));
            self.inner.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_ok_resolves_immediately() {
        let ack = Ack::done_ok();
        assert!(ack.is_done());
        ack.wait().unwrap();
    }

    #[test]
    fn wait_timeout_on_pending() {
        let ack = Ack::pending();
        assert!(!ack.is_done());
        assert!(ack
            .wait_timeout(Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn completion_wakes_waiter() {
        let ack = Ack::pending();
        let waiter = ack.clone();
        let th = std::thread::spawn(move || waiter.wait());
        std::thread::sleep(Duration::from_millis(5));
        ack.complete_ok();
        th.join().unwrap().unwrap();
    }

    #[test]
    fn error_completion_surfaces_detail() {
        let ack = Ack::pending();
        ack.complete_err("journal writer failed");
        let err = ack.wait().unwrap_err();
        assert!(err.to_string().contains("journal writer failed"));
    }

    #[test]
    fn completion_is_sticky() {
        let ack = Ack::pending();
        ack.complete_ok();
        ack.complete_err("late failure ignored");
        ack.wait().unwrap();
    }
}
