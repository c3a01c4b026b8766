//! Time source handed to engines.
//!
//! Engines never read the system clock themselves. The registry holds a
//! [`Clock`] snapshot that the server refreshes before every dispatch and
//! tests advance by hand.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A monotonic instant paired with the matching wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    /// Monotonic time, used for deadlines and elapsed measurements.
    pub now: Instant,

    /// Milliseconds since the Unix epoch, used on the wire.
    pub unix_ms: i64,
}

impl Clock {
    /// Snapshot of the current system time.
    pub fn system() -> Self {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        Clock {
            now: Instant::now(),
            unix_ms,
        }
    }

    /// The same clock moved forward by `by`.
    pub fn advanced(self, by: Duration) -> Self {
        Clock {
            now: self.now + by,
            unix_ms: self.unix_ms + by.as_millis() as i64,
        }
    }

    /// Wall-clock seconds since the Unix epoch.
    pub fn unix_secs(&self) -> i64 {
        self.unix_ms / 1000
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::system()
    }
}
