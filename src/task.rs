//! Timer and transfer task records
//!
//! Timer tasks are immutable once persisted; progress is expressed by acking
//! them or by emitting new tasks. Ordering within a shard follows
//! [`TimerSequenceId`]: visibility time first, then task id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task id placeholder for tasks not yet assigned an id by the shard
pub const UNASSIGNED_TASK_ID: i64 = 0;

/// Kind of a persisted timer task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerTaskType {
    /// A user-defined workflow timer fired
    UserTimer,
    /// An activity timeout elapsed
    ActivityTimeout,
    /// A decision task timeout elapsed
    DecisionTimeout,
    /// The workflow execution timeout elapsed
    WorkflowTimeout,
    /// An activity retry backoff elapsed; dispatch the next attempt
    ActivityRetry,
    /// Retention expired; delete the closed execution's history
    DeleteHistoryEvent,
}

impl TimerTaskType {
    /// Stable label for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerTaskType::UserTimer => "user_timer",
            TimerTaskType::ActivityTimeout => "activity_timeout",
            TimerTaskType::DecisionTimeout => "decision_timeout",
            TimerTaskType::WorkflowTimeout => "workflow_timeout",
            TimerTaskType::ActivityRetry => "activity_retry",
            TimerTaskType::DeleteHistoryEvent => "delete_history_event",
        }
    }
}

/// Which timeout within an activity or decision lifecycle elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutKind {
    /// Scheduled but not picked up by a worker in time
    ScheduleToStart,
    /// Total budget from scheduling to completion
    ScheduleToClose,
    /// Started but not completed in time
    StartToClose,
    /// No heartbeat received in time
    Heartbeat,
}

impl TimeoutKind {
    /// Stable label for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutKind::ScheduleToStart => "schedule_to_start",
            TimeoutKind::ScheduleToClose => "schedule_to_close",
            TimeoutKind::StartToClose => "start_to_close",
            TimeoutKind::Heartbeat => "heartbeat",
        }
    }
}

/// A persisted timer task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerTask {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    /// Monotonic within the shard; assigned at persist time
    pub task_id: i64,
    /// Virtual fire time
    pub visibility_time: DateTime<Utc>,
    pub task_type: TimerTaskType,
    /// Meaningful for activity and decision timeouts only
    pub timeout_kind: TimeoutKind,
    /// The scheduling event this timer guards
    pub event_id: i64,
    /// Which attempt this timer was created for
    pub schedule_attempt: i64,
    /// Domain failover version at creation
    pub version: i64,
}

impl TimerTask {
    /// Cursor coordinate of this task
    pub fn sequence_id(&self) -> TimerSequenceId {
        TimerSequenceId {
            visibility_time: self.visibility_time,
            task_id: self.task_id,
        }
    }
}

/// Total order over timer tasks within a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerSequenceId {
    pub visibility_time: DateTime<Utc>,
    pub task_id: i64,
}

impl TimerSequenceId {
    /// The lowest sequence id; the initial read cursor
    pub fn zero() -> Self {
        Self {
            visibility_time: DateTime::<Utc>::MIN_UTC,
            task_id: 0,
        }
    }

    /// Cursor positioned at the start of `time`
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            visibility_time: time,
            task_id: 0,
        }
    }
}

/// Kind of a transfer task emitted alongside a mutable-state commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferTaskType {
    /// Deliver a decision task to a workflow worker
    DecisionTask,
    /// Remove a closed execution from the visibility plane
    DeleteExecution,
}

/// A persisted transfer task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTask {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub task_id: i64,
    pub task_type: TransferTaskType,
    /// Target task list for decision dispatch
    pub task_list: String,
    pub scheduled_event_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sequence_id_orders_by_time_then_task_id() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();

        let a = TimerSequenceId {
            visibility_time: t1,
            task_id: 10,
        };
        let b = TimerSequenceId {
            visibility_time: t1,
            task_id: 11,
        };
        let c = TimerSequenceId {
            visibility_time: t2,
            task_id: 1,
        };

        assert!(a < b);
        assert!(b < c);
        assert!(TimerSequenceId::zero() < a);
    }

    #[test]
    fn test_task_sequence_id_round_trip() {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let task = TimerTask {
            domain_id: Uuid::new_v4(),
            workflow_id: "wf".to_string(),
            run_id: Uuid::new_v4(),
            task_id: 42,
            visibility_time: t,
            task_type: TimerTaskType::UserTimer,
            timeout_kind: TimeoutKind::StartToClose,
            event_id: 5,
            schedule_attempt: 0,
            version: 0,
        };
        assert_eq!(task.sequence_id().visibility_time, t);
        assert_eq!(task.sequence_id().task_id, 42);
    }
}
