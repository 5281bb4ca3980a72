use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Upper bound on how far ahead a timer is armed.
const MAX_HORIZON: Duration = Duration::from_secs(100 * 365 * 86_400);

/// Wall-clock timestamps anchored to the tokio clock.
///
/// Deadlines and delay resume times are compared against `now()`, and
/// timers sleep until `instant_at()`, so both advance together even when
/// the tokio clock is paused.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin_utc: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin_utc: Utc::now(),
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_utc + elapsed
    }

    /// The tokio instant corresponding to `at`. Past times map to the origin.
    pub fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        let offset = (at - self.origin_utc).to_std().unwrap_or(Duration::ZERO);
        self.origin + offset.min(MAX_HORIZON)
    }

    /// Time left until `at`, zero if already past.
    pub fn until(&self, at: DateTime<Utc>) -> Duration {
        (at - self.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
