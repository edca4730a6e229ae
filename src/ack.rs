//! Timer queue ack manager
//!
//! Tracks the read cursor and per-task completion for one cluster's timer
//! stream. The persisted cursor only advances over a contiguous prefix of
//! completed tasks, so a crash never skips work. The failover variant is
//! bounded to a closed time window and reports when that window is drained.

use crate::error::TimerQueueResult;
use crate::shard::ShardContext;
use crate::task::{TimerSequenceId, TimerTask};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

struct AckState {
    read_level: TimerSequenceId,
    ack_level: DateTime<Utc>,
    /// Tasks handed out but not yet contiguously acked; value = completed
    outstanding: BTreeMap<TimerSequenceId, bool>,
    /// Failover only: the bounded read has returned everything it ever will
    read_exhausted: bool,
}

/// Ack manager over one cluster's timer stream
pub struct TimerQueueAckManager {
    shard: Arc<ShardContext>,
    /// Cluster whose virtual time drives reads
    cluster: String,
    batch_size: usize,
    /// Failover only: closed upper bound on readable visibility times
    max_read_time: Option<DateTime<Utc>>,
    /// Whether cursor advances persist to the shard
    persist_ack_level: bool,
    state: Mutex<AckState>,
}

impl TimerQueueAckManager {
    /// Ack manager for the current cluster's live stream
    pub fn new_active(shard: Arc<ShardContext>, batch_size: usize) -> Self {
        let cluster = shard.current_cluster_name().to_string();
        let ack_level = shard.timer_ack_level(&cluster);
        Self {
            shard,
            cluster,
            batch_size,
            max_read_time: None,
            persist_ack_level: true,
            state: Mutex::new(AckState {
                read_level: TimerSequenceId::at(ack_level),
                ack_level,
                outstanding: BTreeMap::new(),
                read_exhausted: false,
            }),
        }
    }

    /// Bounded ack manager draining a standby cluster's backlog
    ///
    /// Reads tasks with visibility in `(min_level, max_level]` and reports
    /// `finished` from [`update_ack_level`] once they are all acked.
    pub fn new_failover(
        shard: Arc<ShardContext>,
        standby_cluster: impl Into<String>,
        batch_size: usize,
        min_level: DateTime<Utc>,
        max_level: DateTime<Utc>,
    ) -> Self {
        Self {
            shard,
            cluster: standby_cluster.into(),
            batch_size,
            max_read_time: Some(max_level),
            persist_ack_level: false,
            state: Mutex::new(AckState {
                read_level: TimerSequenceId::at(min_level),
                ack_level: min_level,
                outstanding: BTreeMap::new(),
                read_exhausted: false,
            }),
        }
    }

    /// Cluster whose time drives this manager
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Read the next batch of due tasks
    ///
    /// Returns the batch, the earliest known future fire time (for gate
    /// reprogramming), and whether more due tasks remain.
    pub async fn read_timer_tasks(
        &self,
    ) -> TimerQueueResult<(Vec<TimerTask>, Option<DateTime<Utc>>, bool)> {
        let now = self.shard.current_time(&self.cluster);
        let max_time = match self.max_read_time {
            Some(bound) => bound.min(now),
            None => now,
        };
        let read_level = self.state.lock().read_level;

        let page = self
            .shard
            .timer_store()
            .get_timer_tasks(read_level, max_time, self.batch_size)
            .await?;

        let next_hint = if page.more {
            None
        } else {
            let after = page
                .tasks
                .last()
                .map(|t| t.sequence_id())
                .unwrap_or(read_level);
            let hint = self.shard.timer_store().next_fire_time(after).await?;
            // A failover window never cares about tasks beyond its bound
            match (hint, self.max_read_time) {
                (Some(h), Some(bound)) if h > bound => None,
                _ => hint,
            }
        };

        {
            let mut state = self.state.lock();
            for task in &page.tasks {
                state.outstanding.entry(task.sequence_id()).or_insert(false);
            }
            if let Some(last) = page.tasks.last() {
                state.read_level = state.read_level.max(last.sequence_id());
            }
            if let Some(bound) = self.max_read_time {
                if !page.more && now >= bound && next_hint.is_none() {
                    state.read_exhausted = true;
                }
            }
        }

        Ok((page.tasks, next_hint, page.more))
    }

    /// Mark one task complete; idempotent and thread-safe
    pub fn complete_timer_task(&self, task: &TimerTask) {
        let mut state = self.state.lock();
        state.outstanding.insert(task.sequence_id(), true);
    }

    /// Advance the cursor over the completed prefix
    ///
    /// Returns `true` when this is a bounded (failover) manager and its
    /// window is fully drained.
    pub async fn update_ack_level(&self) -> TimerQueueResult<bool> {
        let (new_ack_level, finished) = {
            let mut state = self.state.lock();
            while let Some(entry) = state.outstanding.first_entry() {
                if !entry.get() {
                    break;
                }
                let (sequence_id, _) = entry.remove_entry();
                state.ack_level = sequence_id.visibility_time;
            }
            let finished = self.max_read_time.is_some()
                && state.read_exhausted
                && state.outstanding.is_empty();
            (state.ack_level, finished)
        };

        if self.persist_ack_level {
            self.shard
                .update_timer_ack_level(&self.cluster, new_ack_level)
                .await?;
        }
        debug!(
            cluster = %self.cluster,
            ack_level = %new_ack_level,
            finished,
            "timer ack level advanced"
        );
        Ok(finished)
    }

    /// Acked-through time
    pub fn ack_level(&self) -> DateTime<Utc> {
        self.state.lock().ack_level
    }

    /// Read-through cursor
    pub fn read_level(&self) -> TimerSequenceId {
        self.state.lock().read_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterMetadata, DomainCache};
    use crate::store::{MemoryExecutionStore, MemoryTimerStore};
    use crate::task::{TimeoutKind, TimerTaskType};
    use crate::time::ManualClock;
    use chrono::TimeZone;
    use std::time::Duration;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn harness() -> (Arc<ManualClock>, Arc<MemoryTimerStore>, Arc<ShardContext>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let timer_store = Arc::new(MemoryTimerStore::new());
        let execution_store = Arc::new(MemoryExecutionStore::new(timer_store.clone()));
        let shard = Arc::new(ShardContext::new(
            1,
            Arc::new(ClusterMetadata::single("cluster-a")),
            Arc::new(DomainCache::new()),
            clock.clone(),
            timer_store.clone(),
            execution_store,
        ));
        (clock, timer_store, shard)
    }

    fn task(task_id: i64, offset_secs: i64) -> TimerTask {
        TimerTask {
            domain_id: Uuid::new_v4(),
            workflow_id: "wf".to_string(),
            run_id: Uuid::new_v4(),
            task_id,
            visibility_time: t0() + chrono::Duration::seconds(offset_secs),
            task_type: TimerTaskType::UserTimer,
            timeout_kind: TimeoutKind::StartToClose,
            event_id: 1,
            schedule_attempt: 0,
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_read_returns_only_due_tasks_with_future_hint() {
        let (clock, store, shard) = harness();
        store.insert(task(1, 1));
        store.insert(task(2, 2));
        store.insert(task(3, 60));
        clock.advance(Duration::from_secs(5));

        let ack = TimerQueueAckManager::new_active(shard, 10);
        let (tasks, hint, more) = ack.read_timer_tasks().await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(!more);
        assert_eq!(hint, Some(t0() + chrono::Duration::seconds(60)));
    }

    #[tokio::test]
    async fn test_cursor_waits_for_contiguous_prefix() {
        let (clock, store, shard) = harness();
        store.insert(task(1, 1));
        store.insert(task(2, 2));
        store.insert(task(3, 3));
        clock.advance(Duration::from_secs(10));

        let ack = TimerQueueAckManager::new_active(shard, 10);
        let (tasks, _, _) = ack.read_timer_tasks().await.unwrap();
        assert_eq!(tasks.len(), 3);

        // Complete out of order: 2 and 3 but not 1
        ack.complete_timer_task(&tasks[1]);
        ack.complete_timer_task(&tasks[2]);
        ack.update_ack_level().await.unwrap();
        assert_eq!(ack.ack_level(), DateTime::<Utc>::MIN_UTC);

        // Completing 1 releases the whole prefix
        ack.complete_timer_task(&tasks[0]);
        ack.update_ack_level().await.unwrap();
        assert_eq!(ack.ack_level(), t0() + chrono::Duration::seconds(3));
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let (clock, store, shard) = harness();
        store.insert(task(1, 1));
        clock.advance(Duration::from_secs(5));

        let ack = TimerQueueAckManager::new_active(shard, 10);
        let (tasks, _, _) = ack.read_timer_tasks().await.unwrap();
        ack.complete_timer_task(&tasks[0]);
        ack.complete_timer_task(&tasks[0]);
        ack.update_ack_level().await.unwrap();
        assert_eq!(ack.ack_level(), t0() + chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_active_cursor_persists_to_shard() {
        let (clock, store, shard) = harness();
        store.insert(task(1, 1));
        clock.advance(Duration::from_secs(5));

        let ack = TimerQueueAckManager::new_active(shard.clone(), 10);
        let (tasks, _, _) = ack.read_timer_tasks().await.unwrap();
        ack.complete_timer_task(&tasks[0]);
        ack.update_ack_level().await.unwrap();

        assert_eq!(
            shard.timer_ack_level("cluster-a"),
            t0() + chrono::Duration::seconds(1)
        );
        assert_eq!(
            store.ack_level("cluster-a"),
            Some(t0() + chrono::Duration::seconds(1))
        );
    }

    #[tokio::test]
    async fn test_failover_window_finishes_when_drained() {
        let (clock, store, shard) = harness();
        store.insert(task(1, 1));
        store.insert(task(2, 2));
        // Outside the failover window
        store.insert(task(3, 600));
        clock.advance(Duration::from_secs(10));

        let ack = TimerQueueAckManager::new_failover(
            shard,
            "cluster-b",
            10,
            DateTime::<Utc>::MIN_UTC,
            t0() + chrono::Duration::seconds(10),
        );

        let (tasks, hint, more) = ack.read_timer_tasks().await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(!more);
        // The out-of-window task is not a fire hint
        assert_eq!(hint, None);

        assert!(!ack.update_ack_level().await.unwrap());
        ack.complete_timer_task(&tasks[0]);
        ack.complete_timer_task(&tasks[1]);
        assert!(ack.update_ack_level().await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_limit_reports_more() {
        let (clock, store, shard) = harness();
        for id in 1..=5 {
            store.insert(task(id, id));
        }
        clock.advance(Duration::from_secs(10));

        let ack = TimerQueueAckManager::new_active(shard, 2);
        let (tasks, hint, more) = ack.read_timer_tasks().await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(more);
        assert_eq!(hint, None);

        // The next read resumes past the previous batch
        let (tasks, _, _) = ack.read_timer_tasks().await.unwrap();
        assert_eq!(tasks[0].task_id, 3);
    }
}
