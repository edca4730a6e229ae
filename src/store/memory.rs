//! In-memory reference stores
//!
//! DashMap/BTreeMap-backed implementations of the persistence contracts.
//! Scenario tests run the full processor against these; they also pin down
//! the conflict and ownership semantics the real store must match.

use crate::error::{TimerQueueError, TimerQueueResult};
use crate::execution::{HistoryEvent, MutableState, WorkflowExecution};
use crate::store::{ExecutionStore, TimerStore, TimerTaskPage, UpdateWorkflowExecutionRequest};
use crate::task::{TimerSequenceId, TimerTask, TransferTask};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// In-memory timer task stream
#[derive(Default)]
pub struct MemoryTimerStore {
    tasks: RwLock<BTreeMap<TimerSequenceId, TimerTask>>,
    ack_levels: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MemoryTimerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task directly, e.g. to seed a test backlog
    pub fn insert(&self, task: TimerTask) {
        self.tasks.write().insert(task.sequence_id(), task);
    }

    pub fn remove(&self, sequence_id: &TimerSequenceId) {
        self.tasks.write().remove(sequence_id);
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Last persisted read-through cursor for a cluster
    pub fn ack_level(&self, cluster: &str) -> Option<DateTime<Utc>> {
        self.ack_levels.read().get(cluster).copied()
    }
}

#[async_trait]
impl TimerStore for MemoryTimerStore {
    async fn get_timer_tasks(
        &self,
        exclusive_min: TimerSequenceId,
        inclusive_max_time: DateTime<Utc>,
        batch_size: usize,
    ) -> TimerQueueResult<TimerTaskPage> {
        let tasks = self.tasks.read();
        let mut page = Vec::with_capacity(batch_size.min(tasks.len()));
        let mut more = false;
        for (sequence_id, task) in tasks.range((Bound::Excluded(exclusive_min), Bound::Unbounded)) {
            if sequence_id.visibility_time > inclusive_max_time {
                break;
            }
            if page.len() == batch_size {
                more = true;
                break;
            }
            page.push(task.clone());
        }
        Ok(TimerTaskPage { tasks: page, more })
    }

    async fn next_fire_time(
        &self,
        after: TimerSequenceId,
    ) -> TimerQueueResult<Option<DateTime<Utc>>> {
        let tasks = self.tasks.read();
        Ok(tasks
            .range((Bound::Excluded(after), Bound::Unbounded))
            .next()
            .map(|(sequence_id, _)| sequence_id.visibility_time))
    }

    async fn save_ack_level(&self, cluster: &str, level: DateTime<Utc>) -> TimerQueueResult<()> {
        self.ack_levels.write().insert(cluster.to_string(), level);
        Ok(())
    }
}

struct StoredExecution {
    state: MutableState,
    history: Vec<HistoryEvent>,
}

/// In-memory workflow execution records
///
/// Shares a [`MemoryTimerStore`] so a commit lands its new timer tasks in the
/// same shard stream the processor reads.
pub struct MemoryExecutionStore {
    executions: DashMap<(Uuid, WorkflowExecution), StoredExecution>,
    timer_store: Arc<MemoryTimerStore>,
    transfer_tasks: RwLock<Vec<TransferTask>>,
    shard_owned: AtomicBool,
}

impl MemoryExecutionStore {
    pub fn new(timer_store: Arc<MemoryTimerStore>) -> Self {
        Self {
            executions: DashMap::new(),
            timer_store,
            transfer_tasks: RwLock::new(Vec::new()),
            shard_owned: AtomicBool::new(true),
        }
    }

    /// Seed or replace an execution
    pub fn put(&self, state: MutableState) {
        let key = (state.domain_id(), state.execution().clone());
        self.executions.insert(
            key,
            StoredExecution {
                state,
                history: Vec::new(),
            },
        );
    }

    /// Simulate losing the shard lease
    pub fn revoke_shard_ownership(&self) {
        self.shard_owned.store(false, Ordering::SeqCst);
    }

    pub fn contains(&self, domain_id: Uuid, execution: &WorkflowExecution) -> bool {
        self.executions.contains_key(&(domain_id, execution.clone()))
    }

    /// Committed history of an execution
    pub fn history(&self, domain_id: Uuid, execution: &WorkflowExecution) -> Vec<HistoryEvent> {
        self.executions
            .get(&(domain_id, execution.clone()))
            .map(|stored| stored.history.clone())
            .unwrap_or_default()
    }

    /// All transfer tasks committed so far
    pub fn transfer_tasks(&self) -> Vec<TransferTask> {
        self.transfer_tasks.read().clone()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn get_workflow_execution(
        &self,
        domain_id: Uuid,
        execution: &WorkflowExecution,
    ) -> TimerQueueResult<MutableState> {
        self.executions
            .get(&(domain_id, execution.clone()))
            .map(|stored| stored.state.clone())
            .ok_or_else(|| {
                TimerQueueError::EntityNotExists(format!(
                    "workflow {} run {}",
                    execution.workflow_id, execution.run_id
                ))
            })
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> TimerQueueResult<()> {
        if !self.shard_owned.load(Ordering::SeqCst) {
            return Err(TimerQueueError::ShardOwnershipLost(0));
        }
        let key = (request.domain_id, request.execution.clone());
        let mut stored = self.executions.get_mut(&key).ok_or_else(|| {
            TimerQueueError::EntityNotExists(format!(
                "workflow {} run {}",
                request.execution.workflow_id, request.execution.run_id
            ))
        })?;
        if stored.state.next_event_id() != request.condition {
            return Err(TimerQueueError::Conflict);
        }

        stored.state = request.mutable_state;
        stored.history.extend(request.new_events);
        drop(stored);

        for task in request.timer_tasks {
            self.timer_store.insert(task);
        }
        if let Some(cleared) = request.clear_timer_task {
            self.timer_store.remove(&cleared.sequence_id());
        }
        self.transfer_tasks.write().extend(request.transfer_tasks);
        Ok(())
    }

    async fn delete_workflow_execution(
        &self,
        domain_id: Uuid,
        execution: &WorkflowExecution,
    ) -> TimerQueueResult<()> {
        self.executions.remove(&(domain_id, execution.clone()));
        Ok(())
    }
}
