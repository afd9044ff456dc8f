//! Monotonic/wall-clock time source, injected rather than read ambiently.

use std::time::Instant;

use chrono::{DateTime, Utc};

/// Time source consumed by timeouts, TTLs, and retention checks.
pub trait Clock: Send + Sync {
    /// Wall-clock time, used for timestamps persisted to records.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic instant, used for deadline/timeout arithmetic.
    fn monotonic_now(&self) -> Instant;
}

/// Real wall-clock/monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}
