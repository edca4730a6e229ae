//! Clock abstraction for virtual-time scheduling
//!
//! Timers fire on persisted timestamps, not wall clock, so every component
//! that asks "what time is it" or sleeps goes through [`Clock`]. Production
//! uses [`SystemClock`]; tests drive a [`ManualClock`] forward explicitly.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::time::Duration;
use tokio::sync::Notify;

/// Time source for the processor
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current virtual time
    fn now(&self) -> DateTime<Utc>;

    /// Completes when virtual time reaches `now + duration`
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock backed implementation
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually advanced clock
///
/// Sleepers wake when `advance`/`set` moves the clock past their deadline.
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
    tick: Notify,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
            tick: Notify::new(),
        }
    }

    /// Move the clock forward by `duration`
    pub fn advance(&self, duration: Duration) {
        {
            let mut now = self.now.write();
            *now = checked_add(*now, duration);
        }
        self.tick.notify_waiters();
    }

    /// Jump the clock to an absolute time
    pub fn set(&self, time: DateTime<Utc>) {
        {
            let mut now = self.now.write();
            *now = time;
        }
        self.tick.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = checked_add(self.now(), duration);
        loop {
            if self.now() >= deadline {
                return;
            }
            let notified = self.tick.notified();
            tokio::pin!(notified);
            // Register before the re-check so an advance in between is not lost
            notified.as_mut().enable();
            if self.now() >= deadline {
                return;
            }
            notified.await;
        }
    }
}

fn checked_add(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    match ChronoDuration::from_std(duration) {
        Ok(delta) => time.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC),
        Err(_) => DateTime::<Utc>::MAX_UTC,
    }
}
