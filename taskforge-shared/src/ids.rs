/// Task id and session id primitives.
///
/// Task ids are a process-wide monotonic `u64` counter owned by the pool
/// facade (`taskforge-core::pool::ThreadPool`), not a singleton here — this
/// module only provides the counter type and the default-name formatter.
///
/// Session ids are opaque 256-bit identifiers: `SHA-256(mix)` where `mix`
/// is a fixed key, the current epoch milliseconds, a coarse timestamp
/// counter, and a random salt, 64 bytes total, per the session id design.
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic task id counter.
///
/// One instance lives inside each `ThreadPool`; ids are not globally
/// unique across independently constructed pools, matching the design
/// note that global registries should be explicit process-wide state
/// rather than language-level singletons.
#[derive(Debug, Default)]
pub struct TaskIdCounter {
    next: AtomicU64,
}

impl TaskIdCounter {
    pub fn new() -> Self {
        TaskIdCounter {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next id; ids start at 1 and increase monotonically.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Default name for a task that was not given one explicitly.
pub fn default_task_name(task_id: u64) -> String {
    format!("task_{task_id}")
}

/// A 256-bit opaque session identifier.
///
/// Implements `Display` as lowercase hex and `Hash`/`Eq` so it can be used
/// directly as a map key (the connection pool and session manager key
/// their registries on it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId([u8; 32]);

impl SessionId {
    /// Fixed domain-separation key mixed into every session id. Not a
    /// secret; it exists purely to keep this identifier space distinct
    /// from any other SHA-256 digest a caller might compare it against.
    const MIX_KEY: &'static [u8; 16] = b"taskforge-sess-1";

    /// Generates a new session id from the current time, a coarse
    /// monotonic counter, and process-local randomness.
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
        let salt: u64 = rand::random();

        let mut mix = Vec::with_capacity(64);
        mix.extend_from_slice(Self::MIX_KEY);
        mix.extend_from_slice(&millis.to_le_bytes());
        mix.extend_from_slice(&counter.to_le_bytes());
        mix.extend_from_slice(&salt.to_le_bytes());
        mix.resize(64, 0);

        let digest = Sha256::digest(&mix);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        SessionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_task_id_counter_monotonic() {
        let counter = TaskIdCounter::new();
        let a = counter.next();
        let b = counter.next();
        let c = counter.next();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_task_id_counter_starts_at_one() {
        let counter = TaskIdCounter::new();
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn test_default_task_name() {
        assert_eq!(default_task_name(42), "task_42");
    }

    #[test]
    fn test_session_id_is_unique() {
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let id = SessionId::generate();
            assert!(seen.insert(id), "session id collided: {id}");
        }
    }

    #[test]
    fn test_session_id_display_is_hex() {
        let id = SessionId::generate();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 64);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
