//! Active timer task executor
//!
//! The five per-task-type handlers plus the shared optimistic-concurrency
//! commit helper. Every handler acquires the execution context, reloads and
//! retries on conflicts up to the configured budget, and releases the
//! context on every exit path with the final error.

use crate::ack::TimerQueueAckManager;
use crate::cluster::DomainEntry;
use crate::config::TimerQueueConfig;
use crate::error::{TimerQueueError, TimerQueueResult};
use crate::execution::{
    ExecutionCache, MutableState, TimerBuilder, WorkflowContext, WorkflowExecution, EMPTY_EVENT_ID,
};
use crate::filter::TimerTaskFilter;
use crate::gate::TimerGate;
use crate::matching::{AddActivityTaskRequest, MatchingClient};
use crate::metrics;
use crate::processor::base::{self, StopSignal, TimerTaskExecutor};
use crate::shard::ShardContext;
use crate::task::{
    TimeoutKind, TimerTask, TimerTaskType, TransferTask, TransferTaskType, UNASSIGNED_TASK_ID,
};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Active-cluster (and failover) task semantics
pub struct ActiveTimerTaskExecutor {
    shard: Arc<ShardContext>,
    config: Arc<TimerQueueConfig>,
    cache: Arc<ExecutionCache>,
    matching: Arc<dyn MatchingClient>,
    ack: Arc<TimerQueueAckManager>,
    gate: Arc<TimerGate>,
    filter: TimerTaskFilter,
    stop: Arc<StopSignal>,
    /// Cluster whose virtual time drives this executor
    cluster: String,
}

impl ActiveTimerTaskExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard: Arc<ShardContext>,
        config: Arc<TimerQueueConfig>,
        cache: Arc<ExecutionCache>,
        matching: Arc<dyn MatchingClient>,
        ack: Arc<TimerQueueAckManager>,
        gate: Arc<TimerGate>,
        filter: TimerTaskFilter,
        stop: Arc<StopSignal>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            shard,
            config,
            cache,
            matching,
            ack,
            gate,
            filter,
            stop,
            cluster: cluster.into(),
        }
    }

    fn execution_of(task: &TimerTask) -> WorkflowExecution {
        WorkflowExecution::new(task.workflow_id.clone(), task.run_id)
    }

    fn timer_builder(&self, task: &TimerTask) -> TimerBuilder {
        TimerBuilder::new(task.domain_id, Self::execution_of(task))
    }

    /// Reprogram the gate toward the earliest newly persisted timer
    fn notify_new_timers(&self, tasks: &[TimerTask]) {
        if let Some(min) = tasks.iter().map(|t| t.visibility_time).min() {
            self.gate.update(min);
        }
    }

    /// Version check for global domains: the state's version must match the
    /// task's version or the task belongs to another cluster's era.
    fn verify_task_version(&self, task: &TimerTask, version: i64) -> TimerQueueResult<bool> {
        let domain: Arc<DomainEntry> = match self.shard.domain_cache().resolve(task.domain_id) {
            Ok(domain) => domain,
            Err(TimerQueueError::DomainNotFound(_)) => return Ok(true),
            Err(err) => return Err(err),
        };
        if !domain.is_global {
            return Ok(true);
        }
        Ok(version == task.version)
    }

    /// Shared commit path
    ///
    /// Optionally schedules a new decision (with a sticky ScheduleToStart
    /// timer when stickiness is on) and the retention deletion tasks, then
    /// commits through the execution context. Ownership loss stops the
    /// processor. The gate is always nudged toward the new timers so an
    /// earlier fire is not missed.
    async fn update_workflow_execution(
        &self,
        context: &Arc<WorkflowContext>,
        mut mutable_state: MutableState,
        schedule_new_decision: bool,
        create_deletion_task: bool,
        mut timer_tasks: Vec<TimerTask>,
        clear_timer_task: Option<TimerTask>,
    ) -> TimerQueueResult<()> {
        let mut transfer_tasks: Vec<TransferTask> = Vec::new();
        let now = self.shard.current_time(&self.cluster);
        let execution = context.execution().clone();

        if schedule_new_decision {
            let decision = mutable_state.add_decision_scheduled_event().ok_or_else(|| {
                TimerQueueError::Internal("failed to schedule decision task".to_string())
            })?;
            transfer_tasks.push(TransferTask {
                domain_id: context.domain_id(),
                workflow_id: execution.workflow_id.clone(),
                run_id: execution.run_id,
                task_id: UNASSIGNED_TASK_ID,
                task_type: TransferTaskType::DecisionTask,
                task_list: decision.task_list.clone(),
                scheduled_event_id: decision.scheduled_event_id,
            });
            if mutable_state.is_sticky_task_list_enabled() {
                let builder = TimerBuilder::new(context.domain_id(), execution.clone());
                timer_tasks.push(builder.new_sticky_decision_timeout_task(
                    &mutable_state,
                    decision.scheduled_event_id,
                    decision.attempt,
                    now,
                ));
            }
        }

        if create_deletion_task {
            let domain = self.shard.domain_cache().resolve(context.domain_id())?;
            let retention = ChronoDuration::days(i64::from(domain.retention_days));
            transfer_tasks.push(TransferTask {
                domain_id: context.domain_id(),
                workflow_id: execution.workflow_id.clone(),
                run_id: execution.run_id,
                task_id: UNASSIGNED_TASK_ID,
                task_type: TransferTaskType::DeleteExecution,
                task_list: mutable_state.task_list().to_string(),
                scheduled_event_id: EMPTY_EVENT_ID,
            });
            timer_tasks.push(TimerTask {
                domain_id: context.domain_id(),
                workflow_id: execution.workflow_id.clone(),
                run_id: execution.run_id,
                task_id: UNASSIGNED_TASK_ID,
                visibility_time: now + retention,
                task_type: TimerTaskType::DeleteHistoryEvent,
                timeout_kind: TimeoutKind::StartToClose,
                event_id: EMPTY_EVENT_ID,
                schedule_attempt: 0,
                version: mutable_state.start_version(),
            });
        }

        let transaction_id = self.shard.next_task_id();
        for task in &mut transfer_tasks {
            task.task_id = self.shard.next_task_id();
        }
        for task in &mut timer_tasks {
            if task.task_id == UNASSIGNED_TASK_ID {
                task.task_id = self.shard.next_task_id();
            }
        }

        let result = context
            .update_workflow_execution(
                mutable_state,
                transfer_tasks,
                timer_tasks.clone(),
                clear_timer_task,
                transaction_id,
            )
            .await;

        if let Err(TimerQueueError::ShardOwnershipLost(_)) = &result {
            warn!(
                shard_id = self.shard.shard_id(),
                "shard ownership lost during timer commit; stopping processor"
            );
            self.stop.signal();
            self.gate.close();
        }
        self.notify_new_timers(&timer_tasks);
        result
    }

    // ---- user timer ----

    async fn process_user_timer(&self, task: &TimerTask) -> TimerQueueResult<()> {
        let execution = Self::execution_of(task);
        let (context, mut release) = self.cache.acquire(task.domain_id, &execution).await;
        let result = self.process_user_timer_locked(&context, task).await;
        release.release(result.as_ref().err());
        result
    }

    async fn process_user_timer_locked(
        &self,
        context: &Arc<WorkflowContext>,
        task: &TimerTask,
    ) -> TimerQueueResult<()> {
        let builder = self.timer_builder(task);

        for _ in 0..self.config.conditional_retry_count {
            let mut ms = context.load_mutable_state().await?;
            if !ms.is_workflow_running() {
                return Ok(());
            }

            let mut fired = false;
            let mut new_timer_tasks: Vec<TimerTask> = Vec::new();

            for candidate in builder.user_timers(&ms) {
                let Some(timer_info) = ms.user_timer(&candidate.timer_id).cloned() else {
                    return Err(TimerQueueError::Internal(format!(
                        "pending user timer {} not found",
                        candidate.timer_id
                    )));
                };

                if builder.is_expired(candidate.expiry, task.visibility_time) {
                    ms.add_timer_fired_event(&candidate.timer_id).ok_or_else(|| {
                        TimerQueueError::Internal(format!(
                            "failed to add timer fired event for {}",
                            candidate.timer_id
                        ))
                    })?;
                    fired = true;
                    // More timers may have expired in the same pass
                    continue;
                }

                // The list is ordered; later timers are not expired either.
                // Materialise the persisted task for this one if missing.
                if !timer_info.task_created {
                    new_timer_tasks.push(builder.new_user_timer_task(&candidate));
                    let mut timer_info = timer_info;
                    timer_info.task_created = true;
                    ms.update_user_timer(timer_info);
                }
                break;
            }

            if !fired && new_timer_tasks.is_empty() {
                return Ok(());
            }
            let schedule_new_decision = fired && !ms.has_pending_decision();

            match self
                .update_workflow_execution(
                    context,
                    ms,
                    schedule_new_decision,
                    false,
                    new_timer_tasks,
                    None,
                )
                .await
            {
                Err(TimerQueueError::Conflict) => continue,
                result => return result,
            }
        }
        Err(TimerQueueError::MaxAttemptsExceeded)
    }

    // ---- activity timeout ----

    async fn process_activity_timeout(&self, task: &TimerTask) -> TimerQueueResult<()> {
        let execution = Self::execution_of(task);
        let (context, mut release) = self.cache.acquire(task.domain_id, &execution).await;
        let result = self.process_activity_timeout_locked(&context, task).await;
        release.release(result.as_ref().err());
        result
    }

    async fn process_activity_timeout_locked(
        &self,
        context: &Arc<WorkflowContext>,
        task: &TimerTask,
    ) -> TimerQueueResult<()> {
        let builder = self.timer_builder(task);
        let reference_time = task.visibility_time;

        for _ in 0..self.config.conditional_retry_count {
            let mut ms = context.load_mutable_state().await?;
            if task.event_id >= ms.next_event_id() {
                metrics::record_stale_mutable_state();
                debug!(
                    event_id = task.event_id,
                    next_event_id = ms.next_event_id(),
                    "cached mutable state is stale; reloading"
                );
                context.clear();
                continue;
            }
            if !ms.is_workflow_running() {
                return Ok(());
            }
            let Some(activity) = ms.activity_info(task.event_id).cloned() else {
                // Activity already closed
                return Ok(());
            };
            if activity.attempt != task.schedule_attempt
                && task.timeout_kind != TimeoutKind::ScheduleToClose
            {
                debug!(
                    scheduled_event_id = task.event_id,
                    task_attempt = task.schedule_attempt,
                    current_attempt = activity.attempt,
                    "dropping activity timeout for a superseded attempt"
                );
                return Ok(());
            }

            if task.timeout_kind == TimeoutKind::Heartbeat {
                // Let the scan below recreate the heartbeat timer
                let mut activity = activity.clone();
                activity.timer_task_status &= !TimeoutKind::Heartbeat.status_bit();
                ms.update_activity(activity);
            }

            let now = self.shard.current_time(&self.cluster);
            let mut update_history = false;
            let mut create_new_timer = false;
            let mut new_timer_tasks: Vec<TimerTask> = Vec::new();

            for candidate in builder.activity_timers(&ms) {
                let Some(activity) = ms.activity_info(candidate.scheduled_event_id).cloned() else {
                    // Closed by an earlier candidate in this pass
                    continue;
                };

                if builder.is_expired(candidate.expiry, reference_time) {
                    if candidate.attempt < activity.attempt
                        && candidate.timeout_kind != TimeoutKind::ScheduleToClose
                    {
                        // Ghost timer from a superseded attempt
                        continue;
                    }

                    // Retries pre-empt timeouts for everything but ScheduleToStart
                    if candidate.timeout_kind != TimeoutKind::ScheduleToStart {
                        if let Some(retry_task) = ms.create_retry_timer(
                            candidate.scheduled_event_id,
                            now,
                            candidate.timeout_kind.as_str(),
                        ) {
                            new_timer_tasks.push(retry_task);
                            create_new_timer = true;
                            continue;
                        }
                    }

                    let emitted = match candidate.timeout_kind {
                        TimeoutKind::ScheduleToClose => Some(ms.add_activity_timed_out_event(
                            activity.scheduled_event_id,
                            activity.started_event_id,
                            candidate.timeout_kind,
                            None,
                        )),
                        TimeoutKind::StartToClose => activity.is_started().then(|| {
                            ms.add_activity_timed_out_event(
                                activity.scheduled_event_id,
                                activity.started_event_id,
                                candidate.timeout_kind,
                                None,
                            )
                        }),
                        TimeoutKind::Heartbeat => Some(ms.add_activity_timed_out_event(
                            activity.scheduled_event_id,
                            activity.started_event_id,
                            candidate.timeout_kind,
                            activity.details.clone(),
                        )),
                        TimeoutKind::ScheduleToStart => (!activity.is_started()).then(|| {
                            ms.add_activity_timed_out_event(
                                activity.scheduled_event_id,
                                EMPTY_EVENT_ID,
                                candidate.timeout_kind,
                                None,
                            )
                        }),
                    };
                    if let Some(event) = emitted {
                        event.ok_or_else(|| {
                            TimerQueueError::Internal(format!(
                                "failed to add activity timeout event for {}",
                                candidate.scheduled_event_id
                            ))
                        })?;
                        metrics::record_timeout(candidate.timeout_kind);
                        update_history = true;
                    }
                    continue;
                }

                // Head of the unexpired suffix: make sure it has a timer task
                if activity.timer_task_status & candidate.timeout_kind.status_bit() == 0 {
                    new_timer_tasks.push(builder.new_activity_timeout_task(&candidate));
                    let mut activity = activity;
                    activity.timer_task_status |= candidate.timeout_kind.status_bit();
                    ms.update_activity(activity);
                    create_new_timer = true;
                }
                break;
            }

            if !update_history && !create_new_timer {
                return Ok(());
            }
            let schedule_new_decision = update_history && !ms.has_pending_decision();
            let clear_timer_task = (task.timeout_kind == TimeoutKind::Heartbeat
                && create_new_timer)
                .then(|| task.clone());

            match self
                .update_workflow_execution(
                    context,
                    ms,
                    schedule_new_decision,
                    false,
                    new_timer_tasks,
                    clear_timer_task,
                )
                .await
            {
                Err(TimerQueueError::Conflict) => continue,
                result => return result,
            }
        }
        Err(TimerQueueError::MaxAttemptsExceeded)
    }

    // ---- decision timeout ----

    async fn process_decision_timeout(&self, task: &TimerTask) -> TimerQueueResult<()> {
        let execution = Self::execution_of(task);
        let (context, mut release) = self.cache.acquire(task.domain_id, &execution).await;
        let result = self.process_decision_timeout_locked(&context, task).await;
        release.release(result.as_ref().err());
        result
    }

    async fn process_decision_timeout_locked(
        &self,
        context: &Arc<WorkflowContext>,
        task: &TimerTask,
    ) -> TimerQueueResult<()> {
        for _ in 0..self.config.conditional_retry_count {
            let mut ms = context.load_mutable_state().await?;
            if !ms.is_workflow_running() {
                return Ok(());
            }

            let Some(decision) = ms.pending_decision(task.event_id) else {
                if task.event_id >= ms.next_event_id() {
                    metrics::record_stale_mutable_state();
                    context.clear();
                    continue;
                }
                debug!(
                    scheduled_event_id = task.event_id,
                    "duplicate decision timeout; decision already handled"
                );
                return Ok(());
            };
            if !self.verify_task_version(task, decision.version)? {
                return Ok(());
            }

            let mut schedule_new_decision = false;
            match task.timeout_kind {
                TimeoutKind::StartToClose => {
                    if decision.attempt == task.schedule_attempt {
                        ms.add_decision_timed_out_event(
                            decision.scheduled_event_id,
                            decision.started_event_id,
                        )
                        .ok_or_else(|| {
                            TimerQueueError::Internal(
                                "failed to add decision timeout event".to_string(),
                            )
                        })?;
                        schedule_new_decision = true;
                    }
                }
                TimeoutKind::ScheduleToStart => {
                    // Only a sticky decision that never started can hit this
                    if ms.is_sticky_task_list_enabled()
                        && decision.started_event_id == EMPTY_EVENT_ID
                        && decision.attempt == task.schedule_attempt
                    {
                        ms.add_decision_schedule_to_start_timeout_event(
                            decision.scheduled_event_id,
                        )
                        .ok_or_else(|| {
                            TimerQueueError::Internal(
                                "failed to add decision schedule-to-start timeout event"
                                    .to_string(),
                            )
                        })?;
                        // Route the next decision to the original task list
                        ms.clear_stickiness();
                        schedule_new_decision = true;
                    }
                }
                _ => {
                    debug!(
                        timeout_kind = task.timeout_kind.as_str(),
                        "ignoring decision timeout of an inapplicable kind"
                    );
                }
            }

            if !schedule_new_decision {
                return Ok(());
            }
            match self
                .update_workflow_execution(context, ms, true, false, Vec::new(), None)
                .await
            {
                Err(TimerQueueError::Conflict) => continue,
                result => return result,
            }
        }
        Err(TimerQueueError::MaxAttemptsExceeded)
    }

    // ---- workflow timeout ----

    async fn process_workflow_timeout(&self, task: &TimerTask) -> TimerQueueResult<()> {
        let execution = Self::execution_of(task);
        let (context, mut release) = self.cache.acquire(task.domain_id, &execution).await;
        let result = self.process_workflow_timeout_locked(&context, task).await;
        release.release(result.as_ref().err());
        result
    }

    async fn process_workflow_timeout_locked(
        &self,
        context: &Arc<WorkflowContext>,
        task: &TimerTask,
    ) -> TimerQueueResult<()> {
        for _ in 0..self.config.conditional_retry_count {
            let mut ms = context.load_mutable_state().await?;
            if !ms.is_workflow_running() {
                return Ok(());
            }
            if !self.verify_task_version(task, ms.start_version())? {
                return Ok(());
            }
            if ms.add_workflow_timed_out_event().is_none() {
                // Already completed under us
                return Ok(());
            }

            match self
                .update_workflow_execution(context, ms, false, true, Vec::new(), None)
                .await
            {
                Err(TimerQueueError::Conflict) => continue,
                result => return result,
            }
        }
        Err(TimerQueueError::MaxAttemptsExceeded)
    }

    // ---- activity retry dispatch ----

    async fn process_retry_timer(&self, task: &TimerTask) -> TimerQueueResult<()> {
        for _ in 0..self.config.conditional_retry_count {
            match self.attempt_retry_dispatch(task).await {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_retriable() => return Err(err),
                Err(err) => {
                    debug!(
                        scheduled_event_id = task.event_id,
                        error = %err,
                        "retry dispatch failed; retrying"
                    );
                }
            }
        }
        Err(TimerQueueError::MaxAttemptsExceeded)
    }

    /// One dispatch attempt. Reads under the execution lock, then releases
    /// the lock BEFORE the matching call so dispatch never blocks other
    /// workers on this execution.
    async fn attempt_retry_dispatch(&self, task: &TimerTask) -> TimerQueueResult<()> {
        let execution = Self::execution_of(task);
        let (context, mut release) = self.cache.acquire(task.domain_id, &execution).await;

        let prepared: TimerQueueResult<Option<AddActivityTaskRequest>> = async {
            let ms = match context.load_mutable_state().await {
                // Duplicate replay of an already-deleted execution
                Err(TimerQueueError::EntityNotExists(_)) => return Ok(None),
                other => other?,
            };
            if !ms.is_workflow_running() {
                return Ok(None);
            }
            let Some(activity) = ms.activity_info(task.event_id) else {
                return Ok(None);
            };
            if task.schedule_attempt < activity.attempt {
                // Stale retry from a superseded attempt
                return Ok(None);
            }
            if !self.verify_task_version(task, activity.version)? {
                return Ok(None);
            }

            let target_domain_id = match activity.target_domain_id {
                Some(target) => {
                    self.shard.domain_cache().resolve(target).map_err(|err| {
                        TimerQueueError::Internal(format!(
                            "cross-domain activity target resolution failed: {}",
                            err
                        ))
                    })?;
                    target
                }
                None => task.domain_id,
            };

            Ok(Some(AddActivityTaskRequest {
                source_domain_id: task.domain_id,
                target_domain_id,
                execution: execution.clone(),
                task_list: activity.task_list.clone(),
                scheduled_event_id: activity.scheduled_event_id,
                schedule_to_start_timeout: activity.schedule_to_start_timeout,
                attempt: activity.attempt,
            }))
        }
        .await;

        match prepared {
            Ok(Some(request)) => {
                release.release(None);
                self.matching.add_activity_task(request).await
            }
            Ok(None) => {
                release.release(None);
                Ok(())
            }
            Err(err) => {
                release.release(Some(&err));
                Err(err)
            }
        }
    }
}

#[async_trait]
impl TimerTaskExecutor for ActiveTimerTaskExecutor {
    async fn process(&self, task: &TimerTask) -> TimerQueueResult<()> {
        if !self.filter.accepts(task)? {
            // Not ours to act on, but advancing the cursor is correct
            self.ack.complete_timer_task(task);
            return Ok(());
        }

        let operation = task.task_type.as_str();
        metrics::record_task_request(operation);
        let started = Instant::now();

        let result = match task.task_type {
            TimerTaskType::UserTimer => self.process_user_timer(task).await,
            TimerTaskType::ActivityTimeout => self.process_activity_timeout(task).await,
            TimerTaskType::DecisionTimeout => self.process_decision_timeout(task).await,
            TimerTaskType::WorkflowTimeout => self.process_workflow_timeout(task).await,
            TimerTaskType::ActivityRetry => self.process_retry_timer(task).await,
            TimerTaskType::DeleteHistoryEvent => {
                base::process_delete_history_event(
                    &self.cache,
                    self.shard.execution_store(),
                    task,
                )
                .await
            }
        };
        metrics::record_task_latency(operation, started.elapsed());

        match result {
            Ok(()) => {
                self.ack.complete_timer_task(task);
                Ok(())
            }
            Err(TimerQueueError::EntityNotExists(reason)) => {
                // The execution was deleted out from under us
                debug!(
                    task_id = task.task_id,
                    reason = %reason,
                    "timer task targets a deleted execution; acking"
                );
                self.ack.complete_timer_task(task);
                Ok(())
            }
            Err(err) => {
                metrics::record_task_failure(operation);
                Err(err)
            }
        }
    }
}
