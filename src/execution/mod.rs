//! Per-execution state
//!
//! The mutable-state builder is the aggregate a handler loads, mutates, and
//! commits under optimistic concurrency. The execution cache hands out
//! per-execution contexts with a mandatory release protocol; the timer
//! builder derives pending-timer views from mutable state.

pub mod cache;
pub mod events;
pub mod mutable_state;
pub mod timer_builder;

pub use cache::{ExecutionCache, ReleaseGuard, WorkflowContext};
pub use events::{EventAttributes, HistoryEvent};
pub use mutable_state::{
    ActivityInfo, DecisionInfo, MutableState, RetryPolicy, TimerInfo, EMPTY_EVENT_ID,
};
pub use timer_builder::{ActivityTimerCandidate, TimerBuilder, UserTimerCandidate};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a single workflow execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub run_id: Uuid,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
        }
    }
}
