//! In-memory tunnel session store with TTL eviction.
//!
//! Sessions live in a concurrent map keyed by the base32 session id; each
//! session carries its own async lock for its internal maps, and the shared
//! secret is treated as read-only after init. A periodic sweep evicts idle
//! sessions, fails stalled executions, and clears out surfaced failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Idle lifetime before a session is evicted.
pub const IDLE_TTL: Duration = Duration::from_secs(4 * 60 * 60);

/// Cadence of the cleanup sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A session stuck in PROCESSING longer than this is failed.
pub const PROCESSING_STALL: Duration = Duration::from_secs(2 * 60);

/// Failed sessions stay visible to status polls this long.
pub const FAILED_RETENTION: Duration = Duration::from_secs(5 * 60);

/// `response_total` sentinel: execution has not been requested.
pub const RESPONSE_NOT_STARTED: i32 = 0;

/// `response_total` sentinel: execution is in flight.
pub const RESPONSE_PROCESSING: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Key exchange done; query pages may arrive.
    Init,
    Processing,
    Ready,
    Failed,
}

/// Per-session state. Field-level invariants:
/// query page keys form a contiguous prefix from 0 at the moment exec is
/// accepted; `response_pages` is frozen once `response_total` turns positive.
pub struct Session {
    pub id: String,
    pub client_enc_pub: [u8; 32],
    /// Published at init; pages are accepted unsigned (see protocol notes).
    pub client_sig_pub: [u8; 32],
    pub server_enc_pub: [u8; 32],
    pub server_sig_pub: [u8; 32],
    pub shared_secret: [u8; 32],
    /// Decrypted query pages by single-byte index.
    pub query_pages: HashMap<u8, Vec<u8>>,
    /// Encrypted response pages by 0-based index.
    pub response_pages: HashMap<usize, Vec<u8>>,
    pub response_total: i32,
    pub state: SessionState,
    pub created: Instant,
    pub last_activity: Instant,
    pub processing_since: Option<Instant>,
    pub failed_at: Option<Instant>,
}

impl Session {
    pub fn new(
        id: String,
        client_enc_pub: [u8; 32],
        client_sig_pub: [u8; 32],
        server_enc_pub: [u8; 32],
        server_sig_pub: [u8; 32],
        shared_secret: [u8; 32],
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            client_enc_pub,
            client_sig_pub,
            server_enc_pub,
            server_sig_pub,
            shared_secret,
            query_pages: HashMap::new(),
            response_pages: HashMap::new(),
            response_total: RESPONSE_NOT_STARTED,
            state: SessionState::Init,
            created: now,
            last_activity: now,
            processing_since: None,
            failed_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn begin_processing(&mut self) {
        self.state = SessionState::Processing;
        self.response_total = RESPONSE_PROCESSING;
        self.processing_since = Some(Instant::now());
        self.touch();
    }

    /// Publish the finished response: the page map is frozen from here on.
    pub fn finish(&mut self, total: usize) {
        self.state = SessionState::Ready;
        self.response_total = total as i32;
        self.processing_since = None;
        self.touch();
    }

    /// Mark failed and promptly zero everything sensitive.
    pub fn fail(&mut self) {
        self.state = SessionState::Failed;
        self.failed_at = Some(Instant::now());
        self.processing_since = None;
        self.query_pages.clear();
        self.response_pages.clear();
        self.shared_secret = [0u8; 32];
        self.touch();
    }
}

#[derive(Default)]
pub struct SessionStore {
    inner: DashMap<String, Arc<Mutex<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) -> Arc<Mutex<Session>> {
        let id = session.id.clone();
        let handle = Arc::new(Mutex::new(session));
        self.inner.insert(id, Arc::clone(&handle));
        handle
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.inner.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Run the eviction sweep every [`SWEEP_INTERVAL`] until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                store.sweep_at(Instant::now()).await;
            }
        })
    }

    /// One eviction pass, evaluated against `now` (injectable for tests).
    pub(crate) async fn sweep_at(&self, now: Instant) {
        // Snapshot the handles first: session locks must not be taken while
        // holding a map shard guard.
        let snapshot: Vec<(String, Arc<Mutex<Session>>)> = self
            .inner
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut evict = Vec::new();
        for (id, handle) in snapshot {
            let mut session = handle.lock().await;
            let idle = now.saturating_duration_since(session.last_activity);
            if idle > IDLE_TTL {
                evict.push(id);
                continue;
            }
            match session.state {
                SessionState::Processing => {
                    let stalled = session
                        .processing_since
                        .map(|t| now.saturating_duration_since(t) > PROCESSING_STALL)
                        .unwrap_or(false);
                    if stalled {
                        warn!(session = %session.id, "execution stalled — failing session");
                        session.fail();
                    }
                }
                SessionState::Failed => {
                    let expired = session
                        .failed_at
                        .map(|t| now.saturating_duration_since(t) > FAILED_RETENTION)
                        .unwrap_or(true);
                    if expired {
                        evict.push(id);
                    }
                }
                _ => {}
            }
        }

        for id in evict {
            debug!(session = %id, "evicting tunnel session");
            self.inner.remove(&id);
        }
    }
}
