//! Timer gate
//!
//! A single-slot scheduling primitive: holds the next fire time and exposes a
//! level-triggered readiness signal. Earlier updates win while a fire time is
//! pending; once the pending time has passed, a later update re-arms the
//! gate. Closing is permanent.

use crate::time::Clock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct GateState {
    next_fire: Option<DateTime<Utc>>,
    closed: bool,
}

/// One-slot earliest-fire-time gate
pub struct TimerGate {
    clock: Arc<dyn Clock>,
    state: Mutex<GateState>,
    notify: Notify,
}

impl TimerGate {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(GateState {
                next_fire: None,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Program the next fire time
    ///
    /// While a future fire time is pending the earlier time wins. After the
    /// pending time has passed, a future `time` re-arms the gate; a past
    /// `time` keeps it ready.
    pub fn update(&self, time: DateTime<Utc>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let now = self.clock.now();
            state.next_fire = match state.next_fire {
                None => Some(time),
                Some(current) if current <= now && time > now => Some(time),
                Some(current) => Some(current.min(time)),
            };
        }
        self.notify.notify_waiters();
    }

    /// Make the gate ready immediately
    pub fn fire_now(&self) {
        self.update(self.clock.now());
    }

    /// Permanently close the gate; pending waiters resolve `false`
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Currently programmed fire time
    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().next_fire
    }

    /// Whether the gate is ready right now
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        !state.closed
            && state
                .next_fire
                .map(|t| t <= self.clock.now())
                .unwrap_or(false)
    }

    /// Resolve `true` at or after the programmed fire time, `false` once the
    /// gate is closed. Level-triggered: concurrent waiters all observe
    /// readiness, and the gate fires at least once after the target time.
    pub async fn fired(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before the snapshot so an update in between is not lost
            notified.as_mut().enable();
            let (target, closed) = {
                let state = self.state.lock();
                (state.next_fire, state.closed)
            };
            if closed {
                return false;
            }
            match target {
                Some(time) => {
                    let now = self.clock.now();
                    if time <= now {
                        return true;
                    }
                    let wait = (time - now).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = self.clock.sleep(wait) => {}
                        _ = notified.as_mut() => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}
