use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

/// Minimum spacing between consecutive calls. Waiters are served in the
/// order they arrived.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Take exclusive use of the throttle. Hold the guard across retries so
    /// nobody else slips in while a rejection is being waited out.
    pub async fn lock(&self) -> ThrottleGuard<'_> {
        ThrottleGuard {
            last: self.last.lock().await,
            interval: self.interval,
        }
    }

    /// Wait for a single slot.
    pub async fn tick(&self) {
        self.lock().await.wait().await;
    }
}

pub struct ThrottleGuard<'a> {
    last: MutexGuard<'a, Option<Instant>>,
    interval: Duration,
}

impl ThrottleGuard<'_> {
    /// Sleep until the interval since the previous slot has passed, then
    /// claim a new slot.
    pub async fn wait(&mut self) {
        if let Some(last) = *self.last {
            tokio::time::sleep_until(last + self.interval).await;
        }
        *self.last = Some(Instant::now());
    }
}
