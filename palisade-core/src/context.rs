//! Security context — single source of truth for identity, replay
//! protection, and threat state.
//!
//! One context is constructed per engine and owned by it; a "reset" is the
//! construction of a new instance, never mutation of hidden global state.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::events::ThreatLevel;
use crate::{NONCE_CAPACITY, ORIGIN_CACHE_CAPACITY};

/// Immutable session identity, created once with the context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    /// Unix timestamp (millis).
    pub started_at: i64,
}

/// Insertion-ordered set with a hard capacity; oldest entries evict first.
/// Eviction order is insertion order, not LRU — an accepted trade-off for
/// the replay-protection sets this backs.
struct BoundedSet {
    entries: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl BoundedSet {
    fn new(capacity: usize) -> Self {
        Self { entries: HashSet::new(), order: VecDeque::new(), capacity }
    }

    fn contains(&self, value: &str) -> bool {
        self.entries.contains(value)
    }

    /// Insert `value`, evicting the oldest entry when over capacity.
    /// Returns false if the value was already present.
    fn insert(&mut self, value: &str) -> bool {
        if !self.entries.insert(value.to_string()) {
            return false;
        }
        self.order.push_back(value.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Process-wide mutable security state: session identity, secret token,
/// consumed-nonce set, verified-origin cache, threat level, lockdown window.
///
/// All methods take `&self`; interior locking makes the context safe to share
/// across a multi-threaded host.
pub struct SecurityContext {
    session: Session,
    /// Private token, reachable only through `token()`/`validate_token()`.
    token: String,
    nonces: Mutex<BoundedSet>,
    verified_origins: Mutex<BoundedSet>,
    threat_level: RwLock<ThreatLevel>,
    /// Lockdown active-until instant (millis); 0 means inactive.
    lockdown_until_ms: AtomicI64,
}

impl SecurityContext {
    pub fn new() -> Self {
        Self {
            session: Session {
                session_id: uuid::Uuid::new_v4().to_string(),
                started_at: chrono::Utc::now().timestamp_millis(),
            },
            token: generate_token(),
            nonces: Mutex::new(BoundedSet::new(NONCE_CAPACITY)),
            verified_origins: Mutex::new(BoundedSet::new(ORIGIN_CACHE_CAPACITY)),
            threat_level: RwLock::new(ThreatLevel::Normal),
            lockdown_until_ms: AtomicI64::new(0),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The per-context secret token. Stable for the context's lifetime.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Exact-match token comparison, constant-time over the stored token.
    pub fn validate_token(&self, candidate: &str) -> bool {
        if candidate.len() != self.token.len() {
            return false;
        }
        let mut diff = 0u8;
        for (a, b) in candidate.bytes().zip(self.token.bytes()) {
            diff |= a ^ b;
        }
        diff == 0
    }

    /// Consume a nonce. Returns false for empty nonces and for nonces already
    /// seen within the eviction horizon; otherwise records it and returns true.
    pub fn validate_and_use_nonce(&self, nonce: &str) -> bool {
        if nonce.is_empty() {
            return false;
        }
        self.nonces.lock().insert(nonce)
    }

    pub fn cache_verified_origin(&self, origin: &str) {
        if !origin.is_empty() {
            self.verified_origins.lock().insert(origin);
        }
    }

    pub fn is_origin_cached(&self, origin: &str) -> bool {
        self.verified_origins.lock().contains(origin)
    }

    pub fn threat_level(&self) -> ThreatLevel {
        *self.threat_level.read()
    }

    pub fn set_threat_level(&self, level: ThreatLevel) {
        *self.threat_level.write() = level;
    }

    /// Enter lockdown for `duration_ms`, forcing the threat level to CRITICAL.
    pub fn activate_lockdown(&self, duration_ms: u64) {
        let until = chrono::Utc::now().timestamp_millis() + duration_ms as i64;
        self.lockdown_until_ms.store(until, Ordering::SeqCst);
        self.set_threat_level(ThreatLevel::Critical);
    }

    /// Clear the lockdown window and reset the threat level to NORMAL.
    pub fn deactivate_lockdown(&self) {
        self.lockdown_until_ms.store(0, Ordering::SeqCst);
        self.set_threat_level(ThreatLevel::Normal);
    }

    /// Lazily-expiring lockdown check: a stored instant that has already
    /// passed deactivates here, on observation. No background timer exists at
    /// this layer — the engine schedules its own auto-release on top.
    pub fn is_lockdown_active(&self) -> bool {
        let until = self.lockdown_until_ms.load(Ordering::SeqCst);
        if until == 0 {
            return false;
        }
        if chrono::Utc::now().timestamp_millis() >= until {
            self.deactivate_lockdown();
            return false;
        }
        true
    }

    pub fn consumed_nonce_count(&self) -> usize {
        self.nonces.lock().len()
    }

    pub fn cached_origin_count(&self) -> usize {
        self.verified_origins.lock().len()
    }
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self::new()
    }
}

// The token never appears in diagnostics.
impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("session", &self.session)
            .field("token", &"<redacted>")
            .field("threat_level", &self.threat_level())
            .field("lockdown_until_ms", &self.lockdown_until_ms.load(Ordering::SeqCst))
            .finish()
    }
}

/// Best-effort entropy mixing: v4 UUID, nanosecond timestamp, and process id
/// folded through SHA-256. Sufficient for this design; not a certified CSPRNG.
fn generate_token() -> String {
    let mut h = Sha256::new();
    h.update(uuid::Uuid::new_v4().as_bytes());
    h.update(
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(0)
            .to_le_bytes(),
    );
    h.update(std::process::id().to_le_bytes());
    hex::encode(h.finalize())
}
