//! Timer queue processors
//!
//! [`TimerQueueProcessor`] is the public surface: an active processor bound
//! to the current cluster, or a one-shot failover processor draining a
//! standby cluster's backlog for one domain. The base loop drives; the
//! active executor provides per-task semantics.

pub mod active;
pub mod base;

pub use active::ActiveTimerTaskExecutor;
pub use base::{StopSignal, TimerQueueProcessorBase, TimerTaskExecutor};

use crate::ack::TimerQueueAckManager;
use crate::config::TimerQueueConfig;
use crate::error::TimerQueueResult;
use crate::execution::ExecutionCache;
use crate::filter::TimerTaskFilter;
use crate::gate::TimerGate;
use crate::matching::MatchingClient;
use crate::shard::ShardContext;
use crate::task::TimerTask;
use std::sync::Arc;
use uuid::Uuid;

/// A timer queue processor bound to one shard
pub struct TimerQueueProcessor {
    base: Arc<TimerQueueProcessorBase>,
}

impl TimerQueueProcessor {
    /// Processor for the current cluster's live timer stream
    pub fn new_active(
        shard: Arc<ShardContext>,
        cache: Arc<ExecutionCache>,
        matching: Arc<dyn MatchingClient>,
        config: TimerQueueConfig,
    ) -> TimerQueueResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let cluster = shard.current_cluster_name().to_string();

        let gate = Arc::new(TimerGate::new(shard.clock()));
        let ack = Arc::new(TimerQueueAckManager::new_active(
            shard.clone(),
            config.batch_size,
        ));
        let stop = Arc::new(StopSignal::new());
        let filter = TimerTaskFilter::active(shard.domain_cache(), cluster.clone());
        let executor = Arc::new(ActiveTimerTaskExecutor::new(
            shard.clone(),
            config.clone(),
            cache,
            matching,
            ack.clone(),
            gate.clone(),
            filter,
            stop.clone(),
            cluster,
        ));
        let base = Arc::new(TimerQueueProcessorBase::new(
            shard, config, gate, ack, executor, stop, false,
        ));
        Ok(Self { base })
    }

    /// One-shot processor draining the standby cluster's backlog for one
    /// domain during failover
    ///
    /// The ack window closes at the shard's current time; once the window is
    /// drained the processor stops itself.
    pub fn new_failover(
        shard: Arc<ShardContext>,
        cache: Arc<ExecutionCache>,
        matching: Arc<dyn MatchingClient>,
        config: TimerQueueConfig,
        domain_id: Uuid,
        standby_cluster: &str,
    ) -> TimerQueueResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let min_level = shard.timer_ack_level(standby_cluster);
        let max_level = shard.current_time(shard.current_cluster_name());

        let gate = Arc::new(TimerGate::new(shard.clock()));
        let ack = Arc::new(TimerQueueAckManager::new_failover(
            shard.clone(),
            standby_cluster,
            config.batch_size,
            min_level,
            max_level,
        ));
        let stop = Arc::new(StopSignal::new());
        let filter = TimerTaskFilter::failover(domain_id);
        let executor = Arc::new(ActiveTimerTaskExecutor::new(
            shard.clone(),
            config.clone(),
            cache,
            matching,
            ack.clone(),
            gate.clone(),
            filter,
            stop.clone(),
            standby_cluster.to_string(),
        ));
        let base = Arc::new(TimerQueueProcessorBase::new(
            shard, config, gate, ack, executor, stop, true,
        ));
        Ok(Self { base })
    }

    /// Start the fetch/dispatch loop; the gate fires immediately
    pub fn start(&self) {
        self.base.start();
    }

    /// Close the gate, let in-flight handlers finish, flush progress
    pub async fn stop(&self) {
        self.base.stop().await;
    }

    /// Whether an internal or external stop has been requested
    pub fn is_stopped(&self) -> bool {
        self.base.stop_signal().is_stopped()
    }

    /// Nudge the gate toward newly persisted timer tasks
    pub fn notify_new_timers(&self, tasks: &[TimerTask]) {
        self.base.notify_new_timers(tasks);
    }

    /// The gate, for composition with replication processors
    pub fn timer_gate(&self) -> Arc<TimerGate> {
        self.base.gate()
    }

    /// Monotonic count of tasks handed to workers
    pub fn timer_fired_count(&self) -> u64 {
        self.base.timer_fired_count()
    }
}
