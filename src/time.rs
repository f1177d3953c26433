//! Time utilities and the clock seam.
//!
//! Wall-clock reads go through [`Clock`] so that time-driven behavior
//! (key rotation windows, peer timeout eviction, DTN due times) can run
//! against a manually advanced clock in tests. Production code constructs
//! services with [`Clock::system`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Returns the current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A clock that is either the real system clock or a manually driven one.
///
/// Cloning is cheap; manual clones share the same underlying instant, so a
/// test can hold one handle and advance time for every service it wired.
#[derive(Debug, Clone)]
pub enum Clock {
    /// Real wall-clock time via `chrono`.
    System,
    /// Test clock: a shared millisecond counter advanced explicitly.
    Manual(Arc<AtomicI64>),
}

impl Clock {
    /// The real system clock.
    pub fn system() -> Self {
        Clock::System
    }

    /// A manual clock starting at the given Unix millisecond timestamp.
    pub fn manual(start_millis: i64) -> Self {
        Clock::Manual(Arc::new(AtomicI64::new(start_millis)))
    }

    /// Current time in Unix milliseconds.
    pub fn now_millis(&self) -> i64 {
        match self {
            Clock::System => now_timestamp_millis(),
            Clock::Manual(at) => at.load(Ordering::SeqCst),
        }
    }

    /// Current time in Unix seconds.
    pub fn now_secs(&self) -> i64 {
        self.now_millis() / 1000
    }

    /// Advance a manual clock. Has no effect on the system clock.
    pub fn advance(&self, delta: Duration) {
        if let Clock::Manual(at) = self {
            at.fetch_add(delta.as_millis() as i64, Ordering::SeqCst);
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::System
    }
}
