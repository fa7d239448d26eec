//! Metadata-service client interface.
//!
//! The bookie consumes a hierarchical key-value store with persistent
//! and ephemeral (session-bound) nodes: cookies, availability
//! registration, the read-only register, and the live-ledger set for GC.
//! Production deployments plug in a real coordination-service client;
//! [`InMemoryMetadataService`] ships for tests and single-process demos
//! and models sessions faithfully enough to exercise expiry and stale
//! registrations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rook_error::{BookieError, Result};
use rook_storage::LedgerLiveness;
use tracing::{debug, info};

/// Default metadata root path.
pub const LEDGERS_ROOT: &str = "/ledgers";

/// Node under the root holding optional cluster-identity bytes.
pub const INSTANCEID_NODE: &str = "/ledgers/INSTANCEID";

/// Parent of per-bookie cookie nodes.
pub const COOKIES_PATH: &str = "/ledgers/cookies";

/// Parent of writable-bookie ephemeral registrations.
pub const AVAILABLE_PATH: &str = "/ledgers/available";

/// Parent of read-only-bookie ephemeral registrations.
pub const READONLY_PATH: &str = "/ledgers/available/readonly";

/// Client handle to the metadata service, scoped to one session.
///
/// Ephemeral nodes created through a client disappear when its session
/// closes or expires. All operations are synchronous; the transport owns
/// retries below this interface.
pub trait MetadataClient: Send + Sync {
    /// Create a persistent node if absent; an existing node is success.
    fn create_persistent(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Create an ephemeral node bound to this session; an existing node
    /// is an error.
    fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Create or replace a persistent node.
    fn put(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Read a node's bytes.
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Whether a node exists.
    fn exists(&self, path: &str) -> Result<bool>;

    /// Delete a node. Deleting a missing node is an error.
    fn delete(&self, path: &str) -> Result<()>;

    /// Wait up to `timeout` for a node to disappear. Returns whether it
    /// is absent at return.
    fn await_removal(&self, path: &str, timeout: Duration) -> Result<bool>;

    /// Register the callback fired once when this session expires.
    fn on_session_expired(&self, listener: Arc<dyn Fn() + Send + Sync>);

    /// The current live-ledger set (ledger metadata lives under the same
    /// root).
    fn live_ledgers(&self) -> Result<HashSet<i64>>;

    /// Close the session, dropping its ephemeral nodes.
    fn close(&self);
}

/// Adapter so the GC (which only needs liveness) can borrow the client.
pub struct LivenessAdapter(pub Arc<dyn MetadataClient>);

impl LedgerLiveness for LivenessAdapter {
    fn live_ledgers(&self) -> Result<HashSet<i64>> {
        self.0.live_ledgers()
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Store {
    nodes: HashMap<String, Vec<u8>>,
    /// Ephemeral node → owning session id.
    ephemeral_owner: HashMap<String, u64>,
    live_ledgers: HashSet<i64>,
    next_session: u64,
}

/// A single-process metadata service shared by every client session.
#[derive(Clone, Default)]
pub struct InMemoryMetadataService {
    store: Arc<Mutex<Store>>,
}

impl InMemoryMetadataService {
    /// Create an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session.
    #[must_use]
    pub fn client(&self) -> Arc<InMemoryMetadataClient> {
        let session_id = {
            let mut store = self.store.lock();
            store.next_session += 1;
            store.next_session
        };
        Arc::new(InMemoryMetadataClient {
            store: Arc::clone(&self.store),
            session_id,
            closed: Mutex::new(false),
            expiry_listener: Mutex::new(None),
        })
    }

    /// Record a ledger as created (clients do this out of band).
    pub fn create_ledger(&self, ledger_id: i64) {
        self.store.lock().live_ledgers.insert(ledger_id);
    }

    /// Record a ledger as deleted; GC reclaims it on its next scan.
    pub fn delete_ledger(&self, ledger_id: i64) {
        self.store.lock().live_ledgers.remove(&ledger_id);
    }

    /// Whether a node exists (test inspection).
    #[must_use]
    pub fn node_exists(&self, path: &str) -> bool {
        self.store.lock().nodes.contains_key(path)
    }
}

/// One session against the in-memory service.
pub struct InMemoryMetadataClient {
    store: Arc<Mutex<Store>>,
    session_id: u64,
    closed: Mutex<bool>,
    expiry_listener: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl InMemoryMetadataClient {
    fn drop_session_nodes(&self) {
        let mut store = self.store.lock();
        let dead: Vec<String> = store
            .ephemeral_owner
            .iter()
            .filter(|(_, &owner)| owner == self.session_id)
            .map(|(path, _)| path.clone())
            .collect();
        for path in dead {
            store.ephemeral_owner.remove(&path);
            store.nodes.remove(&path);
            debug!(path = %path, "ephemeral node dropped with session");
        }
    }

    /// Expire the session: drop its ephemerals and fire the listener.
    pub fn expire_session(&self) {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return;
            }
            *closed = true;
        }
        info!(session = self.session_id, "metadata session expired");
        self.drop_session_nodes();
        let listener = self.expiry_listener.lock().clone();
        if let Some(listener) = listener {
            listener();
        }
    }

    fn check_open(&self) -> Result<()> {
        if *self.closed.lock() {
            return Err(BookieError::metadata("session is closed"));
        }
        Ok(())
    }
}

impl MetadataClient for InMemoryMetadataClient {
    fn create_persistent(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut store = self.store.lock();
        store
            .nodes
            .entry(path.to_owned())
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut store = self.store.lock();
        if store.nodes.contains_key(path) {
            return Err(BookieError::metadata(format!("node exists: {path}")));
        }
        store.nodes.insert(path.to_owned(), data.to_vec());
        store.ephemeral_owner.insert(path.to_owned(), self.session_id);
        Ok(())
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.store.lock().nodes.insert(path.to_owned(), data.to_vec());
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.store.lock().nodes.get(path).cloned())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.check_open()?;
        Ok(self.store.lock().nodes.contains_key(path))
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.check_open()?;
        let mut store = self.store.lock();
        store
            .nodes
            .remove(path)
            .ok_or_else(|| BookieError::metadata(format!("no such node: {path}")))?;
        store.ephemeral_owner.remove(path);
        Ok(())
    }

    fn await_removal(&self, path: &str, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.exists(path)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn on_session_expired(&self, listener: Arc<dyn Fn() + Send + Sync>) {
        *self.expiry_listener.lock() = Some(listener);
    }

    fn live_ledgers(&self) -> Result<HashSet<i64>> {
        self.check_open()?;
        Ok(self.store.lock().live_ledgers.clone())
    }

    fn close(&self) {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return;
            }
            *closed = true;
        }
        debug!(session = self.session_id, "metadata session closed");
        self.drop_session_nodes();
    }
}
