//! Cluster metadata and the domain cache
//!
//! A domain is the multi-tenancy unit. Global domains are replicated across
//! clusters and only the active cluster may mutate them; the task filter and
//! the version checks in the handlers both resolve domains through
//! [`DomainCache`].

use crate::error::{TimerQueueError, TimerQueueResult};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Names of the clusters participating in replication
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    current: String,
    clusters: Vec<String>,
}

impl ClusterMetadata {
    pub fn new(current: impl Into<String>, clusters: Vec<String>) -> Self {
        Self {
            current: current.into(),
            clusters,
        }
    }

    /// Single-cluster deployment
    pub fn single(current: impl Into<String>) -> Self {
        let current = current.into();
        Self {
            clusters: vec![current.clone()],
            current,
        }
    }

    pub fn current_cluster_name(&self) -> &str {
        &self.current
    }

    pub fn all_cluster_names(&self) -> &[String] {
        &self.clusters
    }

    pub fn is_configured(&self, cluster: &str) -> bool {
        self.clusters.iter().any(|c| c == cluster)
    }
}

/// A registered domain
#[derive(Debug, Clone)]
pub struct DomainEntry {
    pub id: Uuid,
    pub name: String,
    /// Replicated across clusters; only the active cluster mutates it
    pub is_global: bool,
    pub active_cluster: String,
    /// History retention after close, in days
    pub retention_days: u32,
    pub failover_version: i64,
}

impl DomainEntry {
    /// Whether this cluster may act on the domain's tasks
    pub fn is_active_in(&self, cluster: &str) -> bool {
        !self.is_global || self.active_cluster == cluster
    }
}

/// Domain id to entry resolution
#[derive(Default)]
pub struct DomainCache {
    entries: DashMap<Uuid, Arc<DomainEntry>>,
}

impl DomainCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn register(&self, entry: DomainEntry) {
        self.entries.insert(entry.id, Arc::new(entry));
    }

    pub fn remove(&self, domain_id: &Uuid) {
        self.entries.remove(domain_id);
    }

    /// Resolve a domain by id
    ///
    /// A missing domain is a distinct error: the task filter treats it as
    /// "act here so the task can drain".
    pub fn resolve(&self, domain_id: Uuid) -> TimerQueueResult<Arc<DomainEntry>> {
        self.entries
            .get(&domain_id)
            .map(|entry| entry.value().clone())
            .ok_or(TimerQueueError::DomainNotFound(domain_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: Uuid, is_global: bool, active: &str) -> DomainEntry {
        DomainEntry {
            id,
            name: "orders".to_string(),
            is_global,
            active_cluster: active.to_string(),
            retention_days: 3,
            failover_version: 100,
        }
    }

    #[test]
    fn test_resolve_missing_domain() {
        let cache = DomainCache::new();
        let id = Uuid::new_v4();
        let err = cache.resolve(id).unwrap_err();
        assert_eq!(err, TimerQueueError::DomainNotFound(id));
    }

    #[test]
    fn test_local_domain_is_active_everywhere() {
        let id = Uuid::new_v4();
        let cache = DomainCache::new();
        cache.register(entry(id, false, "cluster-a"));

        let resolved = cache.resolve(id).unwrap();
        assert!(resolved.is_active_in("cluster-a"));
        assert!(resolved.is_active_in("cluster-b"));
    }

    #[test]
    fn test_global_domain_is_active_only_in_active_cluster() {
        let id = Uuid::new_v4();
        let cache = DomainCache::new();
        cache.register(entry(id, true, "cluster-a"));

        let resolved = cache.resolve(id).unwrap();
        assert!(resolved.is_active_in("cluster-a"));
        assert!(!resolved.is_active_in("cluster-b"));
    }

    #[test]
    fn test_cluster_metadata() {
        let meta = ClusterMetadata::new(
            "cluster-a",
            vec!["cluster-a".to_string(), "cluster-b".to_string()],
        );
        assert_eq!(meta.current_cluster_name(), "cluster-a");
        assert!(meta.is_configured("cluster-b"));
        assert!(!meta.is_configured("cluster-c"));
    }
}
