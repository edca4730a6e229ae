//! Persistence contracts
//!
//! The processor only sees these traits; the engine binds them to the real
//! partitioned store. [`memory`] provides the reference implementation used
//! by the scenario tests.

pub mod memory;

pub use memory::{MemoryExecutionStore, MemoryTimerStore};

use crate::error::TimerQueueResult;
use crate::execution::{HistoryEvent, MutableState, WorkflowExecution};
use crate::task::{TimerSequenceId, TimerTask, TransferTask};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One page of timer tasks
#[derive(Debug, Clone)]
pub struct TimerTaskPage {
    pub tasks: Vec<TimerTask>,
    /// More tasks matched the query beyond this page
    pub more: bool,
}

/// A conditional mutable-state commit
#[derive(Debug, Clone)]
pub struct UpdateWorkflowExecutionRequest {
    pub domain_id: Uuid,
    pub execution: WorkflowExecution,
    /// Expected next-event-id of the stored state; mismatch is a conflict
    pub condition: i64,
    pub mutable_state: MutableState,
    pub new_events: Vec<HistoryEvent>,
    pub transfer_tasks: Vec<TransferTask>,
    pub timer_tasks: Vec<TimerTask>,
    /// A superseded timer task to remove in the same commit
    pub clear_timer_task: Option<TimerTask>,
    pub transaction_id: i64,
}

/// Workflow execution records
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Load the current mutable state of an execution
    async fn get_workflow_execution(
        &self,
        domain_id: Uuid,
        execution: &WorkflowExecution,
    ) -> TimerQueueResult<MutableState>;

    /// Commit a mutation under optimistic concurrency
    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> TimerQueueResult<()>;

    /// Remove a closed execution and its history
    async fn delete_workflow_execution(
        &self,
        domain_id: Uuid,
        execution: &WorkflowExecution,
    ) -> TimerQueueResult<()>;
}

/// The shard's timer task stream
#[async_trait]
pub trait TimerStore: Send + Sync {
    /// Tasks after `exclusive_min` with visibility up to `inclusive_max_time`,
    /// in ascending sequence order
    async fn get_timer_tasks(
        &self,
        exclusive_min: TimerSequenceId,
        inclusive_max_time: DateTime<Utc>,
        batch_size: usize,
    ) -> TimerQueueResult<TimerTaskPage>;

    /// Visibility time of the first task after `after`, if any
    async fn next_fire_time(
        &self,
        after: TimerSequenceId,
    ) -> TimerQueueResult<Option<DateTime<Utc>>>;

    /// Persist the read-through cursor for a cluster
    async fn save_ack_level(&self, cluster: &str, level: DateTime<Utc>) -> TimerQueueResult<()>;
}
