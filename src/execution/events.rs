//! Workflow history events emitted by the timer handlers

use crate::task::TimeoutKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single appended history event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub timestamp: DateTime<Utc>,
    pub attributes: EventAttributes,
}

/// Event payloads the timer queue can produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventAttributes {
    /// A user timer reached its expiry
    TimerFired {
        timer_id: String,
        started_event_id: i64,
    },
    /// An activity exceeded one of its timeouts
    ActivityTaskTimedOut {
        scheduled_event_id: i64,
        started_event_id: i64,
        timeout_kind: TimeoutKind,
        details: Option<serde_json::Value>,
    },
    /// A decision task exceeded a timeout
    DecisionTaskTimedOut {
        scheduled_event_id: i64,
        started_event_id: i64,
        timeout_kind: TimeoutKind,
    },
    /// The execution exceeded its overall timeout
    WorkflowExecutionTimedOut,
    /// A new decision task was scheduled
    DecisionTaskScheduled { task_list: String, attempt: i64 },
}

impl HistoryEvent {
    pub fn new(event_id: i64, attributes: EventAttributes) -> Self {
        Self {
            event_id,
            timestamp: Utc::now(),
            attributes,
        }
    }
}
