/*!
 * Minimum spacing between physical transmissions.
 */
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Default minimum spacing between two transmissions
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Tracks the last transmission and delays the next one
///
/// The limiter has no lock of its own: the dispatcher keeps it next to the
/// transport behind the mutex that serializes transmissions.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_sent: Option<Instant>,
    acquired: u64,
}

impl RateLimiter {
    /// Create a limiter with the given spacing
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: None,
            acquired: 0,
        }
    }

    /// The configured spacing
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until a transmission is allowed, then mark it as sent now
    pub async fn acquire_slot(&mut self) {
        if let Some(last) = self.last_sent {
            let ready = last + self.min_interval;
            if Instant::now() < ready {
                trace!("Rate limited, waiting {:?}", ready - Instant::now());
                sleep_until(ready).await;
            }
        }
        self.last_sent = Some(Instant::now());
        self.acquired += 1;
    }

    /// Time of the last transmission
    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    /// Number of slots handed out so far
    pub fn acquired(&self) -> u64 {
        self.acquired
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}
