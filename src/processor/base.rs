//! Processor base
//!
//! Runs the fetch/dispatch loop: wait on the timer gate, page due tasks from
//! the ack manager, hand them to the task executor's workers, and reprogram
//! the gate from the ack manager's next-fire hint. Task semantics live in
//! the executor; the base only drives.

use crate::ack::TimerQueueAckManager;
use crate::config::TimerQueueConfig;
use crate::error::{TimerQueueError, TimerQueueResult};
use crate::execution::{ExecutionCache, WorkflowExecution};
use crate::gate::TimerGate;
use crate::shard::ShardContext;
use crate::store::ExecutionStore;
use crate::task::TimerTask;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-task semantics plugged into the base loop
#[async_trait]
pub trait TimerTaskExecutor: Send + Sync {
    /// Process one task: filter, dispatch by type, ack or surface
    async fn process(&self, task: &TimerTask) -> TimerQueueResult<()>;
}

/// One-way stop latch shared between the loop, the workers, and the handlers
pub struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn signal(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Completes once the signal is raised
    pub async fn wait(&self) {
        loop {
            if self.is_stopped() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a signal in between is not lost
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The fetch/dispatch loop plus its worker pool
pub struct TimerQueueProcessorBase {
    shard: Arc<ShardContext>,
    config: Arc<TimerQueueConfig>,
    gate: Arc<TimerGate>,
    ack: Arc<TimerQueueAckManager>,
    executor: Arc<dyn TimerTaskExecutor>,
    stop: Arc<StopSignal>,
    /// A failover processor stops itself once its window drains
    failover: bool,
    timer_fired_count: Arc<AtomicU64>,
    sender: Mutex<Option<flume::Sender<TimerTask>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl TimerQueueProcessorBase {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard: Arc<ShardContext>,
        config: Arc<TimerQueueConfig>,
        gate: Arc<TimerGate>,
        ack: Arc<TimerQueueAckManager>,
        executor: Arc<dyn TimerTaskExecutor>,
        stop: Arc<StopSignal>,
        failover: bool,
    ) -> Self {
        Self {
            shard,
            config,
            gate,
            ack,
            executor,
            stop,
            failover,
            timer_fired_count: Arc::new(AtomicU64::new(0)),
            sender: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn gate(&self) -> Arc<TimerGate> {
        self.gate.clone()
    }

    pub fn stop_signal(&self) -> Arc<StopSignal> {
        self.stop.clone()
    }

    /// Tasks handed to workers so far
    pub fn timer_fired_count(&self) -> u64 {
        self.timer_fired_count.load(Ordering::Relaxed)
    }

    /// Reprogram the gate toward the earliest of the new tasks
    pub fn notify_new_timers(&self, tasks: &[TimerTask]) {
        if let Some(min) = tasks.iter().map(|t| t.visibility_time).min() {
            self.gate.update(min);
        }
    }

    /// Spawn the loop and the worker pool; fires the gate immediately
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            shard_id = self.shard.shard_id(),
            cluster = %self.ack.cluster(),
            failover = self.failover,
            "timer queue processor starting"
        );

        let (sender, receiver) = flume::bounded::<TimerTask>(self.config.batch_size * 2);
        *self.sender.lock() = Some(sender.clone());

        let mut handles = self.handles.lock();
        for _ in 0..self.config.worker_count {
            let this = self.clone();
            let receiver = receiver.clone();
            handles.push(tokio::spawn(async move { this.worker(receiver).await }));
        }
        let this = self.clone();
        handles.push(tokio::spawn(async move { this.run_loop(sender).await }));

        self.gate.fire_now();
    }

    /// Close the gate, drain in-flight handlers, flush the ack level
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        info!(shard_id = self.shard.shard_id(), "timer queue processor stopping");
        self.stop.signal();
        self.gate.close();
        self.sender.lock().take();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                warn!(error = %err, "timer queue task join failed");
            }
        }
        if let Err(err) = self.ack.update_ack_level().await {
            warn!(error = %err, "final ack level flush failed");
        }
    }

    async fn run_loop(self: Arc<Self>, sender: flume::Sender<TimerTask>) {
        let mut ack_interval = tokio::time::interval(self.config.ack_update_interval());
        ack_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                fired = self.gate.fired() => {
                    if !fired {
                        break;
                    }
                    if let Err(err) = self.drain(&sender).await {
                        warn!(error = %err, "timer task read failed");
                        tokio::time::sleep(self.config.redispatch_backoff()).await;
                    }
                }
                _ = self.stop.wait() => break,
                _ = ack_interval.tick() => {
                    match self.ack.update_ack_level().await {
                        Ok(true) if self.failover => {
                            info!(
                                cluster = %self.ack.cluster(),
                                "failover timer backlog drained"
                            );
                            self.stop.signal();
                            self.gate.close();
                            break;
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "ack level update failed"),
                    }
                }
            }
        }
        drop(sender);
    }

    async fn drain(&self, sender: &flume::Sender<TimerTask>) -> TimerQueueResult<()> {
        let (tasks, next_hint, more) = self.ack.read_timer_tasks().await?;
        debug!(
            count = tasks.len(),
            more,
            "timer tasks fetched"
        );
        for task in tasks {
            self.timer_fired_count.fetch_add(1, Ordering::Relaxed);
            if sender.send_async(task).await.is_err() {
                return Ok(());
            }
        }

        if more {
            self.gate.fire_now();
        } else if let Some(hint) = next_hint {
            self.gate.update(hint);
        } else {
            let now = self.shard.current_time(self.ack.cluster());
            let poll = ChronoDuration::from_std(self.config.max_poll_interval())
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
            self.gate.update(now + poll);
        }
        Ok(())
    }

    async fn worker(self: Arc<Self>, receiver: flume::Receiver<TimerTask>) {
        while let Ok(task) = receiver.recv_async().await {
            self.process_with_redelivery(task).await;
            if self.stop.is_stopped() {
                break;
            }
        }
    }

    /// At-least-once: redeliver a failed task with capped backoff until it
    /// succeeds or the processor stops
    async fn process_with_redelivery(&self, task: TimerTask) {
        let mut backoff = self.config.redispatch_backoff();
        loop {
            match self.executor.process(&task).await {
                Ok(()) => return,
                Err(err) => {
                    if self.stop.is_stopped() {
                        return;
                    }
                    warn!(
                        task_id = task.task_id,
                        task_type = task.task_type.as_str(),
                        error = %err,
                        "timer task processing failed; redelivering"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.stop.wait() => return,
                    }
                    backoff = (backoff * 2).min(self.config.redispatch_backoff_max());
                }
            }
        }
    }
}

/// Retention handler for `DeleteHistoryEvent` tasks
///
/// Once the execution is closed (or already gone) its record is removed; a
/// still-running execution is left untouched.
pub(crate) async fn process_delete_history_event(
    cache: &ExecutionCache,
    store: Arc<dyn ExecutionStore>,
    task: &TimerTask,
) -> TimerQueueResult<()> {
    let execution = WorkflowExecution::new(task.workflow_id.clone(), task.run_id);
    let (context, mut release) = cache.acquire(task.domain_id, &execution).await;

    let result = async {
        let mutable_state = match context.load_mutable_state().await {
            Err(TimerQueueError::EntityNotExists(_)) => return Ok(()),
            other => other?,
        };
        if mutable_state.is_workflow_running() {
            return Ok(());
        }
        store
            .delete_workflow_execution(task.domain_id, &execution)
            .await
    }
    .await;

    release.release(result.as_ref().err());
    if result.is_ok() {
        cache.evict(task.domain_id, &execution);
    }
    result
}
