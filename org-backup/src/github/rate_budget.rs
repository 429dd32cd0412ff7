//! Process-wide view of the API rate window.
//!
//! Every call takes a slot before it is sent; the server's rate headers on
//! every response correct the local count. All state sits behind one mutex so
//! concurrent workers see a linearizable counter that never goes below zero.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Fallback wait when the server never told us when the window resets.
const UNKNOWN_RESET_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct RateWindow {
    /// Calls left in the window; None until the first response
    remaining: Option<u32>,
    limit: Option<u32>,
    reset_epoch: Option<u64>,
    reset_at: Option<Instant>,
}

/// Outcome of asking for a call slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    /// Remaining calls are at the low-water mark; wait until this instant
    WaitUntil(Instant),
}

#[derive(Debug)]
pub struct RateBudget {
    window: Mutex<RateWindow>,
    low_water_mark: u32,
}

impl RateBudget {
    pub fn new(low_water_mark: u32) -> Self {
        Self {
            window: Mutex::new(RateWindow::default()),
            low_water_mark,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateWindow> {
        // a panic while holding the lock cannot leave the counters inconsistent
        self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a call slot, or learn how long to wait for the next window.
    pub fn try_acquire(&self) -> Acquire {
        let mut window = self.lock();
        let now = Instant::now();

        if let Some(reset_at) = window.reset_at {
            if now >= reset_at {
                // the window rolled over; the next response tells us the new count
                *window = RateWindow::default();
            }
        }

        match window.remaining {
            None => Acquire::Granted,
            Some(remaining) if remaining > self.low_water_mark => {
                window.remaining = Some(remaining - 1);
                Acquire::Granted
            }
            Some(_) => {
                let until = *window.reset_at.get_or_insert(now + UNKNOWN_RESET_WAIT);
                Acquire::WaitUntil(until)
            }
        }
    }

    /// Record the rate headers of a response.
    pub fn observe(&self, remaining: Option<u32>, limit: Option<u32>, reset_epoch: Option<u64>) {
        let Some(server_remaining) = remaining else {
            return;
        };
        let mut window = self.lock();

        let same_window = reset_epoch.is_some() && window.reset_epoch == reset_epoch;
        window.remaining = Some(match window.remaining {
            // in-flight calls may already have taken slots the server has not counted yet
            Some(local) if same_window => local.min(server_remaining),
            _ => server_remaining,
        });
        if limit.is_some() {
            window.limit = limit;
        }
        if let Some(epoch) = reset_epoch {
            window.reset_epoch = Some(epoch);
            window.reset_at = Some(instant_from_epoch(epoch));
        }
    }

    /// The server refused a call for rate reasons; nothing more is sent
    /// before `until`.
    pub fn mark_exhausted(&self, until: Instant) {
        let mut window = self.lock();
        window.remaining = Some(0);
        window.reset_at = Some(until);
    }

    pub fn remaining(&self) -> Option<u32> {
        self.lock().remaining
    }

    pub fn limit(&self) -> Option<u32> {
        self.lock().limit
    }
}

/// Convert a reset timestamp (epoch seconds) to a monotonic instant.
pub fn instant_from_epoch(epoch: u64) -> Instant {
    let now_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Instant::now() + Duration::from_secs(epoch.saturating_sub(now_epoch))
}
