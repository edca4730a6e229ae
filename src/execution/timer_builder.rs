//! Pending-timer views over mutable state
//!
//! Derives the ordered user-timer and activity-timer sequences a handler
//! walks, and materialises the persisted timer task for a pending timer that
//! does not have one yet.

use crate::execution::mutable_state::{ActivityInfo, MutableState};
use crate::execution::WorkflowExecution;
use crate::task::{TimeoutKind, TimerTask, TimerTaskType, UNASSIGNED_TASK_ID};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use uuid::Uuid;

/// A pending user timer in fire order
#[derive(Debug, Clone, PartialEq)]
pub struct UserTimerCandidate {
    pub timer_id: String,
    pub started_event_id: i64,
    pub expiry: DateTime<Utc>,
    pub task_created: bool,
    pub version: i64,
}

/// A pending activity timeout in fire order
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityTimerCandidate {
    pub scheduled_event_id: i64,
    pub timeout_kind: TimeoutKind,
    pub expiry: DateTime<Utc>,
    pub attempt: i64,
    pub task_created: bool,
    pub version: i64,
}

/// Builds pending-timer sequences and new timer tasks for one execution
pub struct TimerBuilder {
    domain_id: Uuid,
    execution: WorkflowExecution,
}

impl TimerBuilder {
    pub fn new(domain_id: Uuid, execution: WorkflowExecution) -> Self {
        Self {
            domain_id,
            execution,
        }
    }

    /// Pending user timers, ascending by expiry
    pub fn user_timers(&self, ms: &MutableState) -> Vec<UserTimerCandidate> {
        let mut candidates: Vec<UserTimerCandidate> = ms
            .user_timers()
            .map(|ti| UserTimerCandidate {
                timer_id: ti.timer_id.clone(),
                started_event_id: ti.started_event_id,
                expiry: ti.expiry,
                task_created: ti.task_created,
                version: ti.version,
            })
            .collect();
        candidates.sort_by(|a, b| a.expiry.cmp(&b.expiry).then(a.timer_id.cmp(&b.timer_id)));
        candidates
    }

    /// Pending activity timeouts, ascending by expiry
    ///
    /// One candidate per applicable (activity, timeout kind) pair; kinds with
    /// a zero timeout are unset and skipped.
    pub fn activity_timers(&self, ms: &MutableState) -> Vec<ActivityTimerCandidate> {
        let mut candidates = Vec::new();
        for ai in ms.activities() {
            if !ai.is_started() {
                self.push_candidate(
                    &mut candidates,
                    ai,
                    TimeoutKind::ScheduleToStart,
                    ai.scheduled_time,
                    ai.schedule_to_start_timeout,
                );
            }
            self.push_candidate(
                &mut candidates,
                ai,
                TimeoutKind::ScheduleToClose,
                ai.scheduled_time,
                ai.schedule_to_close_timeout,
            );
            if ai.is_started() {
                self.push_candidate(
                    &mut candidates,
                    ai,
                    TimeoutKind::StartToClose,
                    ai.started_time,
                    ai.start_to_close_timeout,
                );
                self.push_candidate(
                    &mut candidates,
                    ai,
                    TimeoutKind::Heartbeat,
                    ai.last_heartbeat_time,
                    ai.heartbeat_timeout,
                );
            }
        }
        candidates.sort_by(|a, b| {
            a.expiry
                .cmp(&b.expiry)
                .then(a.scheduled_event_id.cmp(&b.scheduled_event_id))
        });
        candidates
    }

    /// Whether `expiry` has passed at `reference`
    pub fn is_expired(&self, expiry: DateTime<Utc>, reference: DateTime<Utc>) -> bool {
        expiry <= reference
    }

    /// Persisted timer task for a pending user timer
    pub fn new_user_timer_task(&self, candidate: &UserTimerCandidate) -> TimerTask {
        TimerTask {
            domain_id: self.domain_id,
            workflow_id: self.execution.workflow_id.clone(),
            run_id: self.execution.run_id,
            task_id: UNASSIGNED_TASK_ID,
            visibility_time: candidate.expiry,
            task_type: TimerTaskType::UserTimer,
            timeout_kind: TimeoutKind::StartToClose,
            event_id: candidate.started_event_id,
            schedule_attempt: 0,
            version: candidate.version,
        }
    }

    /// Persisted timer task for a pending activity timeout
    pub fn new_activity_timeout_task(&self, candidate: &ActivityTimerCandidate) -> TimerTask {
        TimerTask {
            domain_id: self.domain_id,
            workflow_id: self.execution.workflow_id.clone(),
            run_id: self.execution.run_id,
            task_id: UNASSIGNED_TASK_ID,
            visibility_time: candidate.expiry,
            task_type: TimerTaskType::ActivityTimeout,
            timeout_kind: candidate.timeout_kind,
            event_id: candidate.scheduled_event_id,
            schedule_attempt: candidate.attempt,
            version: candidate.version,
        }
    }

    /// ScheduleToStart decision timer for a sticky decision
    pub fn new_sticky_decision_timeout_task(
        &self,
        ms: &MutableState,
        scheduled_event_id: i64,
        attempt: i64,
        now: DateTime<Utc>,
    ) -> TimerTask {
        let timeout = ChronoDuration::from_std(ms.sticky_schedule_to_start_timeout())
            .unwrap_or_else(|_| ChronoDuration::seconds(5));
        TimerTask {
            domain_id: self.domain_id,
            workflow_id: self.execution.workflow_id.clone(),
            run_id: self.execution.run_id,
            task_id: UNASSIGNED_TASK_ID,
            visibility_time: now + timeout,
            task_type: TimerTaskType::DecisionTimeout,
            timeout_kind: TimeoutKind::ScheduleToStart,
            event_id: scheduled_event_id,
            schedule_attempt: attempt,
            version: ms.start_version(),
        }
    }

    fn push_candidate(
        &self,
        candidates: &mut Vec<ActivityTimerCandidate>,
        ai: &ActivityInfo,
        kind: TimeoutKind,
        base: DateTime<Utc>,
        timeout: Duration,
    ) {
        if timeout == Duration::ZERO {
            return;
        }
        let Ok(delta) = ChronoDuration::from_std(timeout) else {
            return;
        };
        candidates.push(ActivityTimerCandidate {
            scheduled_event_id: ai.scheduled_event_id,
            timeout_kind: kind,
            expiry: base + delta,
            attempt: ai.attempt,
            task_created: ai.timer_task_status & kind.status_bit() != 0,
            version: ai.version,
        });
    }
}
