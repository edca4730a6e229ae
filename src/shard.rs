//! Shard context
//!
//! A processor is bound to one shard. The shard context carries the cluster
//! metadata, the per-cluster virtual clocks, the task-id allocator, and the
//! persisted timer read cursors.

use crate::cluster::{ClusterMetadata, DomainCache};
use crate::error::TimerQueueResult;
use crate::store::{ExecutionStore, TimerStore};
use crate::time::Clock;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Per-shard runtime context
pub struct ShardContext {
    shard_id: u32,
    cluster_metadata: Arc<ClusterMetadata>,
    domain_cache: Arc<DomainCache>,
    clock: Arc<dyn Clock>,
    timer_store: Arc<dyn TimerStore>,
    execution_store: Arc<dyn ExecutionStore>,
    /// Replication-fed current time of remote clusters
    remote_cluster_times: DashMap<String, DateTime<Utc>>,
    next_task_id: AtomicI64,
    timer_ack_levels: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl ShardContext {
    pub fn new(
        shard_id: u32,
        cluster_metadata: Arc<ClusterMetadata>,
        domain_cache: Arc<DomainCache>,
        clock: Arc<dyn Clock>,
        timer_store: Arc<dyn TimerStore>,
        execution_store: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            shard_id,
            cluster_metadata,
            domain_cache,
            clock,
            timer_store,
            execution_store,
            remote_cluster_times: DashMap::new(),
            next_task_id: AtomicI64::new(1),
            timer_ack_levels: RwLock::new(HashMap::new()),
        }
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn cluster_metadata(&self) -> &ClusterMetadata {
        &self.cluster_metadata
    }

    pub fn current_cluster_name(&self) -> &str {
        self.cluster_metadata.current_cluster_name()
    }

    pub fn domain_cache(&self) -> Arc<DomainCache> {
        self.domain_cache.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn timer_store(&self) -> Arc<dyn TimerStore> {
        self.timer_store.clone()
    }

    pub fn execution_store(&self) -> Arc<dyn ExecutionStore> {
        self.execution_store.clone()
    }

    /// Current virtual time of a cluster
    ///
    /// The local cluster reads the clock; remote clusters read the last time
    /// replication reported, falling back to the local clock.
    pub fn current_time(&self, cluster: &str) -> DateTime<Utc> {
        if cluster == self.current_cluster_name() {
            return self.clock.now();
        }
        self.remote_cluster_times
            .get(cluster)
            .map(|entry| *entry.value())
            .unwrap_or_else(|| self.clock.now())
    }

    /// Record a remote cluster's reported current time
    pub fn set_remote_cluster_time(&self, cluster: impl Into<String>, time: DateTime<Utc>) {
        self.remote_cluster_times.insert(cluster.into(), time);
    }

    /// Allocate the next transfer/timer task id
    pub fn next_task_id(&self) -> i64 {
        self.next_task_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Last acked-through time for a cluster's timer stream
    pub fn timer_ack_level(&self, cluster: &str) -> DateTime<Utc> {
        self.timer_ack_levels
            .read()
            .get(cluster)
            .copied()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Persist and record a new acked-through time
    pub async fn update_timer_ack_level(
        &self,
        cluster: &str,
        level: DateTime<Utc>,
    ) -> TimerQueueResult<()> {
        self.timer_store.save_ack_level(cluster, level).await?;
        self.timer_ack_levels
            .write()
            .insert(cluster.to_string(), level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryExecutionStore, MemoryTimerStore};
    use crate::time::ManualClock;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn shard() -> (Arc<ManualClock>, ShardContext) {
        let clock = Arc::new(ManualClock::new(t0()));
        let timer_store = Arc::new(MemoryTimerStore::new());
        let execution_store = Arc::new(MemoryExecutionStore::new(timer_store.clone()));
        let shard = ShardContext::new(
            1,
            Arc::new(ClusterMetadata::new(
                "cluster-a",
                vec!["cluster-a".to_string(), "cluster-b".to_string()],
            )),
            Arc::new(DomainCache::new()),
            clock.clone(),
            timer_store,
            execution_store,
        );
        (clock, shard)
    }

    #[test]
    fn test_local_cluster_time_reads_clock() {
        let (clock, shard) = shard();
        clock.advance(std::time::Duration::from_secs(10));
        assert_eq!(
            shard.current_time("cluster-a"),
            t0() + chrono::Duration::seconds(10)
        );
    }

    #[test]
    fn test_remote_cluster_time_is_replication_fed() {
        let (_clock, shard) = shard();
        let remote = t0() - chrono::Duration::seconds(30);
        shard.set_remote_cluster_time("cluster-b", remote);
        assert_eq!(shard.current_time("cluster-b"), remote);
    }

    #[test]
    fn test_task_ids_are_monotonic() {
        let (_clock, shard) = shard();
        let a = shard.next_task_id();
        let b = shard.next_task_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_ack_level_round_trip() {
        let (_clock, shard) = shard();
        assert_eq!(shard.timer_ack_level("cluster-a"), DateTime::<Utc>::MIN_UTC);

        let level = t0() + chrono::Duration::seconds(5);
        shard.update_timer_ack_level("cluster-a", level).await.unwrap();
        assert_eq!(shard.timer_ack_level("cluster-a"), level);
    }
}
