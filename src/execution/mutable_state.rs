//! The per-execution mutable-state builder
//!
//! Holds the pending decisions, activities, and user timers of one workflow
//! execution plus the history events buffered for the next commit. Event
//! emitters return `None` when the state machine is already terminal for the
//! requested transition, which callers treat as "already happened".

use crate::execution::events::{EventAttributes, HistoryEvent};
use crate::execution::WorkflowExecution;
use crate::task::{TimeoutKind, TimerTask, TimerTaskType, UNASSIGNED_TASK_ID};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Event id of an event that has not happened
pub const EMPTY_EVENT_ID: i64 = 0;

/// Timer-created status bit per timeout kind
const TIMER_STATUS_SCHEDULE_TO_START: u32 = 1 << 0;
const TIMER_STATUS_SCHEDULE_TO_CLOSE: u32 = 1 << 1;
const TIMER_STATUS_START_TO_CLOSE: u32 = 1 << 2;
const TIMER_STATUS_HEARTBEAT: u32 = 1 << 3;

impl TimeoutKind {
    /// Bit recorded in [`ActivityInfo::timer_task_status`] once a timer task
    /// for this kind has been persisted
    pub fn status_bit(&self) -> u32 {
        match self {
            TimeoutKind::ScheduleToStart => TIMER_STATUS_SCHEDULE_TO_START,
            TimeoutKind::ScheduleToClose => TIMER_STATUS_SCHEDULE_TO_CLOSE,
            TimeoutKind::StartToClose => TIMER_STATUS_START_TO_CLOSE,
            TimeoutKind::Heartbeat => TIMER_STATUS_HEARTBEAT,
        }
    }
}

/// Retry policy attached to an activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    /// 0 means unlimited
    pub maximum_attempts: i64,
    pub expiration_time: Option<DateTime<Utc>>,
}

impl RetryPolicy {
    /// Backoff before the attempt following `attempt`
    pub fn next_interval(&self, attempt: i64) -> Duration {
        let factor = self.backoff_coefficient.powi(attempt.clamp(0, i32::MAX as i64) as i32);
        let interval = self.initial_interval.as_secs_f64() * factor;
        let mut next = if interval.is_finite() && interval >= 0.0 {
            Duration::try_from_secs_f64(interval).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };
        if self.maximum_interval > Duration::ZERO && next > self.maximum_interval {
            next = self.maximum_interval;
        }
        next
    }
}

/// A pending activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub version: i64,
    pub scheduled_event_id: i64,
    pub scheduled_time: DateTime<Utc>,
    pub started_event_id: i64,
    pub started_time: DateTime<Utc>,
    pub activity_id: String,
    pub task_list: String,
    pub attempt: i64,
    pub schedule_to_start_timeout: Duration,
    pub schedule_to_close_timeout: Duration,
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub last_heartbeat_time: DateTime<Utc>,
    /// Latest heartbeat payload; carried into heartbeat timeout events
    pub details: Option<serde_json::Value>,
    /// Bitmask of timeout kinds that already have a persisted timer task
    pub timer_task_status: u32,
    pub retry_policy: Option<RetryPolicy>,
    pub last_failure_reason: Option<String>,
    /// Set when the activity dispatches to a different domain
    pub target_domain_id: Option<Uuid>,
}

impl ActivityInfo {
    pub fn is_started(&self) -> bool {
        self.started_event_id != EMPTY_EVENT_ID
    }
}

/// The pending decision task, if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInfo {
    pub version: i64,
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub attempt: i64,
    pub task_list: String,
}

/// A pending user timer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerInfo {
    pub version: i64,
    pub timer_id: String,
    pub started_event_id: i64,
    pub expiry: DateTime<Utc>,
    /// Whether a timer task has been persisted for this timer
    pub task_created: bool,
}

/// Mutable state of one workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutableState {
    domain_id: Uuid,
    execution: WorkflowExecution,
    running: bool,
    next_event_id: i64,
    start_version: i64,
    task_list: String,
    sticky_task_list: Option<String>,
    sticky_schedule_to_start_timeout: Duration,
    decision_attempt: i64,
    pending_decision: Option<DecisionInfo>,
    activities: HashMap<i64, ActivityInfo>,
    user_timers: HashMap<String, TimerInfo>,
    new_events: Vec<HistoryEvent>,
}

impl MutableState {
    pub fn new(domain_id: Uuid, execution: WorkflowExecution, task_list: impl Into<String>) -> Self {
        Self {
            domain_id,
            execution,
            running: true,
            next_event_id: 1,
            start_version: 0,
            task_list: task_list.into(),
            sticky_task_list: None,
            sticky_schedule_to_start_timeout: Duration::from_secs(5),
            decision_attempt: 0,
            pending_decision: None,
            activities: HashMap::new(),
            user_timers: HashMap::new(),
            new_events: Vec::new(),
        }
    }

    // ---- queries ----

    pub fn domain_id(&self) -> Uuid {
        self.domain_id
    }

    pub fn execution(&self) -> &WorkflowExecution {
        &self.execution
    }

    pub fn is_workflow_running(&self) -> bool {
        self.running
    }

    pub fn next_event_id(&self) -> i64 {
        self.next_event_id
    }

    pub fn start_version(&self) -> i64 {
        self.start_version
    }

    pub fn has_pending_decision(&self) -> bool {
        self.pending_decision.is_some()
    }

    pub fn is_sticky_task_list_enabled(&self) -> bool {
        self.sticky_task_list.is_some()
    }

    pub fn task_list(&self) -> &str {
        &self.task_list
    }

    pub fn sticky_task_list(&self) -> Option<&str> {
        self.sticky_task_list.as_deref()
    }

    pub fn sticky_schedule_to_start_timeout(&self) -> Duration {
        self.sticky_schedule_to_start_timeout
    }

    /// Pending decision, but only when it was scheduled by `scheduled_event_id`
    pub fn pending_decision(&self, scheduled_event_id: i64) -> Option<DecisionInfo> {
        self.pending_decision
            .as_ref()
            .filter(|di| di.scheduled_event_id == scheduled_event_id)
            .cloned()
    }

    pub fn activity_info(&self, scheduled_event_id: i64) -> Option<&ActivityInfo> {
        self.activities.get(&scheduled_event_id)
    }

    pub fn activities(&self) -> impl Iterator<Item = &ActivityInfo> {
        self.activities.values()
    }

    pub fn user_timer(&self, timer_id: &str) -> Option<&TimerInfo> {
        self.user_timers.get(timer_id)
    }

    pub fn user_timers(&self) -> impl Iterator<Item = &TimerInfo> {
        self.user_timers.values()
    }

    /// History events buffered since the last commit
    pub fn new_events(&self) -> &[HistoryEvent] {
        &self.new_events
    }

    /// Take the buffered history events for a commit
    pub fn drain_new_events(&mut self) -> Vec<HistoryEvent> {
        std::mem::take(&mut self.new_events)
    }

    // ---- state construction and mutation ----

    pub fn set_start_version(&mut self, version: i64) {
        self.start_version = version;
    }

    pub fn set_next_event_id(&mut self, next_event_id: i64) {
        self.next_event_id = next_event_id;
    }

    pub fn set_sticky_task_list(&mut self, task_list: impl Into<String>, timeout: Duration) {
        self.sticky_task_list = Some(task_list.into());
        self.sticky_schedule_to_start_timeout = timeout;
    }

    /// Drop stickiness so the next decision routes to the original task list
    pub fn clear_stickiness(&mut self) {
        self.sticky_task_list = None;
    }

    pub fn set_pending_decision(&mut self, decision: DecisionInfo) {
        self.decision_attempt = decision.attempt;
        self.pending_decision = Some(decision);
    }

    pub fn add_pending_activity(&mut self, activity: ActivityInfo) {
        self.activities.insert(activity.scheduled_event_id, activity);
    }

    pub fn add_user_timer(&mut self, timer: TimerInfo) {
        self.user_timers.insert(timer.timer_id.clone(), timer);
    }

    pub fn update_activity(&mut self, activity: ActivityInfo) {
        self.activities.insert(activity.scheduled_event_id, activity);
    }

    pub fn update_user_timer(&mut self, timer: TimerInfo) {
        self.user_timers.insert(timer.timer_id.clone(), timer);
    }

    /// Mark the execution closed
    pub fn set_completed(&mut self) {
        self.running = false;
    }

    // ---- event emitters ----

    /// Fire a user timer; `None` when the timer is already gone or the
    /// execution is closed
    pub fn add_timer_fired_event(&mut self, timer_id: &str) -> Option<HistoryEvent> {
        if !self.running {
            return None;
        }
        let timer = self.user_timers.remove(timer_id)?;
        Some(self.append_event(EventAttributes::TimerFired {
            timer_id: timer.timer_id,
            started_event_id: timer.started_event_id,
        }))
    }

    /// Time out an activity; `None` when the activity is already closed
    pub fn add_activity_timed_out_event(
        &mut self,
        scheduled_event_id: i64,
        started_event_id: i64,
        timeout_kind: TimeoutKind,
        details: Option<serde_json::Value>,
    ) -> Option<HistoryEvent> {
        if !self.running {
            return None;
        }
        self.activities.remove(&scheduled_event_id)?;
        Some(self.append_event(EventAttributes::ActivityTaskTimedOut {
            scheduled_event_id,
            started_event_id,
            timeout_kind,
            details,
        }))
    }

    /// Time out a started decision task
    pub fn add_decision_timed_out_event(
        &mut self,
        scheduled_event_id: i64,
        started_event_id: i64,
    ) -> Option<HistoryEvent> {
        if !self.running {
            return None;
        }
        self.pending_decision
            .as_ref()
            .filter(|di| di.scheduled_event_id == scheduled_event_id)?;
        self.pending_decision = None;
        self.decision_attempt += 1;
        Some(self.append_event(EventAttributes::DecisionTaskTimedOut {
            scheduled_event_id,
            started_event_id,
            timeout_kind: TimeoutKind::StartToClose,
        }))
    }

    /// Time out an unstarted sticky decision task
    pub fn add_decision_schedule_to_start_timeout_event(
        &mut self,
        scheduled_event_id: i64,
    ) -> Option<HistoryEvent> {
        if !self.running {
            return None;
        }
        self.pending_decision
            .as_ref()
            .filter(|di| di.scheduled_event_id == scheduled_event_id)?;
        self.pending_decision = None;
        self.decision_attempt += 1;
        Some(self.append_event(EventAttributes::DecisionTaskTimedOut {
            scheduled_event_id,
            started_event_id: EMPTY_EVENT_ID,
            timeout_kind: TimeoutKind::ScheduleToStart,
        }))
    }

    /// Close the execution as timed out; `None` when already closed
    pub fn add_workflow_timed_out_event(&mut self) -> Option<HistoryEvent> {
        if !self.running {
            return None;
        }
        self.running = false;
        Some(self.append_event(EventAttributes::WorkflowExecutionTimedOut))
    }

    /// Schedule a new decision task; `None` when one is already pending or
    /// the execution is closed
    pub fn add_decision_scheduled_event(&mut self) -> Option<DecisionInfo> {
        if !self.running || self.pending_decision.is_some() {
            return None;
        }
        let task_list = self
            .sticky_task_list
            .clone()
            .unwrap_or_else(|| self.task_list.clone());
        let attempt = self.decision_attempt;
        let event = self.append_event(EventAttributes::DecisionTaskScheduled {
            task_list: task_list.clone(),
            attempt,
        });
        let decision = DecisionInfo {
            version: self.start_version,
            scheduled_event_id: event.event_id,
            started_event_id: EMPTY_EVENT_ID,
            attempt,
            task_list,
        };
        self.pending_decision = Some(decision.clone());
        Some(decision)
    }

    /// Advance the activity to its next retry attempt and produce the retry
    /// timer task, or `None` when retries are exhausted
    pub fn create_retry_timer(
        &mut self,
        scheduled_event_id: i64,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Option<TimerTask> {
        let activity = self.activities.get_mut(&scheduled_event_id)?;
        let policy = activity.retry_policy.clone()?;

        let next_attempt = activity.attempt + 1;
        if policy.maximum_attempts != 0 && next_attempt >= policy.maximum_attempts {
            return None;
        }
        let backoff = policy.next_interval(activity.attempt);
        let fire_time = now
            .checked_add_signed(ChronoDuration::from_std(backoff).ok()?)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if let Some(expiration) = policy.expiration_time {
            if fire_time > expiration {
                return None;
            }
        }

        activity.attempt = next_attempt;
        activity.started_event_id = EMPTY_EVENT_ID;
        activity.timer_task_status = 0;
        activity.last_failure_reason = Some(reason.to_string());

        Some(TimerTask {
            domain_id: self.domain_id,
            workflow_id: self.execution.workflow_id.clone(),
            run_id: self.execution.run_id,
            task_id: UNASSIGNED_TASK_ID,
            visibility_time: fire_time,
            task_type: TimerTaskType::ActivityRetry,
            timeout_kind: TimeoutKind::ScheduleToStart,
            event_id: scheduled_event_id,
            schedule_attempt: next_attempt,
            version: activity.version,
        })
    }

    fn append_event(&mut self, attributes: EventAttributes) -> HistoryEvent {
        let event = HistoryEvent::new(self.next_event_id, attributes);
        self.next_event_id += 1;
        self.new_events.push(event.clone());
        event
    }
}
