//! Deterministic clock for tests.

use chrono::{DateTime, Duration, Utc};
use souk_core::environment::Clock;
use std::sync::Mutex;

/// Manually advanced clock.
///
/// Starts at a pinned instant and only moves when a test calls
/// [`FixedClock::advance`], making TTL and expiry behavior reproducible.
///
/// # Example
///
/// ```
/// use souk_testing::FixedClock;
/// use souk_core::environment::Clock;
/// use chrono::Duration;
///
/// let clock = FixedClock::default();
/// let t0 = clock.now();
/// clock.advance(Duration::minutes(15));
/// assert_eq!(clock.now() - t0, Duration::minutes(15));
/// ```
#[derive(Debug)]
pub struct FixedClock {
    time: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// Create a clock pinned at `time`.
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Mutex::new(time),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut time) = self.time.lock() {
            *time += by;
        }
    }
}

impl Default for FixedClock {
    /// A clock pinned at 2025-06-01 00:00:00 UTC.
    fn default() -> Self {
        Self::new(
            DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        )
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time.lock().map(|t| *t).unwrap_or_else(|_| Utc::now())
    }
}
