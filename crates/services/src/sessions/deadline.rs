use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use assess_core::Clock;

use super::lock;

/// One observation of the countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineTick {
    /// Whole seconds left, clamped at zero.
    pub remaining_seconds: i64,
    /// True exactly once: on the first tick that observes expiry.
    pub expired_now: bool,
}

/// Countdown against a fixed authoritative deadline.
///
/// Remaining time is recomputed from `deadline_at` on every tick rather than
/// decremented, so scheduler jitter or a batch of missed ticks cannot drift
/// the clock. The expiry signal is latched: after the first expired tick,
/// later ticks report `expired_now = false` no matter how many arrive.
#[derive(Debug, Clone)]
pub struct DeadlineTimer {
    deadline_at: DateTime<Utc>,
    expired: bool,
}

impl DeadlineTimer {
    #[must_use]
    pub fn new(deadline_at: DateTime<Utc>) -> Self {
        Self {
            deadline_at,
            expired: false,
        }
    }

    #[must_use]
    pub fn deadline_at(&self) -> DateTime<Utc> {
        self.deadline_at
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Observe the clock once.
    pub fn tick(&mut self, now: DateTime<Utc>) -> DeadlineTick {
        let remaining_seconds = (self.deadline_at - now).num_seconds().max(0);
        let expired_now = remaining_seconds <= 0 && !self.expired;
        if expired_now {
            self.expired = true;
        }
        DeadlineTick {
            remaining_seconds,
            expired_now,
        }
    }
}

/// Repeating tick task that drives a callback with the remaining time.
///
/// The callback returns `false` to stop the loop early (e.g. the session
/// handle is gone); the loop also ends on its own after expiry is reported.
pub struct DeadlineClock {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeadlineClock {
    /// Spawn the tick loop. Must be called within a tokio runtime.
    pub fn start<F>(
        clock: Clock,
        deadline_at: DateTime<Utc>,
        period: Duration,
        mut on_tick: F,
    ) -> Self
    where
        F: FnMut(DeadlineTick) -> bool + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut timer = DeadlineTimer::new(deadline_at);
            let mut ticker = interval(period);
            // Recomputation makes catch-up ticks pointless.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let tick = timer.tick(clock.now());
                if !on_tick(tick) {
                    break;
                }
                if timer.is_expired() {
                    break;
                }
            }
        });
        Self {
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Cancel the tick task. Safe to call multiple times; after it returns
    /// no further tick is delivered.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.handle).take() {
            handle.abort();
        }
    }
}

impl Drop for DeadlineClock {
    fn drop(&mut self) {
        self.stop();
    }
}
