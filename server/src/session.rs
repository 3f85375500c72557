//! Session store for protocols built on top of the server.
//!
//! Independent of the reactor: lookups take the read lock, creation and
//! deletion take the write lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// One logical client session, shared across connections by id.
pub struct Session {
    id: String,
    created_at: Instant,
    ttl: Duration,
    last_touch: Mutex<Instant>,
    values: RwLock<HashMap<String, String>>,
}

impl Session {
    fn new(id: String, ttl: Duration) -> Self {
        let now = Instant::now();
        Session {
            id,
            created_at: now,
            ttl,
            last_touch: Mutex::new(now),
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.last_touch.lock().elapsed() > self.ttl
    }

    pub fn touch(&self) {
        *self.last_touch.lock() = Instant::now();
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(key.into(), value.into());
    }
}

/// Id-keyed collection of live sessions.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_SESSION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        SessionStore {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up a session and refresh its idle deadline.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().get(id).cloned()?;
        session.touch();
        Some(session)
    }

    /// Insert a session under an externally supplied id, replacing any
    /// previous session with that id.
    pub fn add(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .insert(session.id().to_string(), session);
    }

    /// Create a session under a fresh random id and register it.
    pub fn create(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(random_id(), self.ttl));
        self.add(session.clone());
        session
    }

    pub fn remove(&self, id: &str) {
        self.sessions.write().remove(id);
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired());
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn random_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    let mut id = String::with_capacity(32);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(id, "{b:02x}");
    }
    id
}
