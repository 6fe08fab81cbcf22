use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::Timer;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Interval, MissedTickBehavior};

/// Wall clock timer ticking at a fixed period
pub struct IntervalTimer {
    interval: Mutex<Interval>,
}

impl IntervalTimer {
    /// Tick every `period`; must be called inside a tokio runtime
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval: Mutex::new(interval),
        }
    }
}

#[async_trait]
impl Timer for IntervalTimer {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn tick(&self) {
        self.interval.lock().await.tick().await;
    }
}

/// Timer driven by hand, for deterministic tests of timeouts
///
/// `now` only moves through `advance` and `set`; every move wakes one
/// pending `tick`.
pub struct ManualTimer {
    now: parking_lot::Mutex<DateTime<Utc>>,
    notify: Notify,
}

impl ManualTimer {
    /// A timer frozen at the current wall clock time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// A timer frozen at `now`
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(now),
            notify: Notify::new(),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        {
            let mut now = self.now.lock();
            *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        }
        self.notify.notify_one();
    }

    /// Set the clock
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
        self.notify.notify_one();
    }
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Timer for ManualTimer {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn tick(&self) {
        self.notify.notified().await;
    }
}
