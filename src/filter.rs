//! Task filter
//!
//! Pure accept/reject decision applied before any handler runs. Rejected
//! tasks are acked by the dispatcher without touching mutable state.

use crate::cluster::DomainCache;
use crate::error::{TimerQueueError, TimerQueueResult};
use crate::task::TimerTask;
use std::sync::Arc;
use uuid::Uuid;

/// Accept/reject decision for timer tasks
pub enum TimerTaskFilter {
    /// Accept tasks whose domain is active in this cluster (or unknown, so
    /// the task can drain)
    Active {
        domain_cache: Arc<DomainCache>,
        current_cluster: String,
    },
    /// Accept only tasks of the domain being failed over
    Failover { target_domain_id: Uuid },
}

impl TimerTaskFilter {
    pub fn active(domain_cache: Arc<DomainCache>, current_cluster: impl Into<String>) -> Self {
        TimerTaskFilter::Active {
            domain_cache,
            current_cluster: current_cluster.into(),
        }
    }

    pub fn failover(target_domain_id: Uuid) -> Self {
        TimerTaskFilter::Failover { target_domain_id }
    }

    /// Whether a handler should run for this task
    pub fn accepts(&self, task: &TimerTask) -> TimerQueueResult<bool> {
        match self {
            TimerTaskFilter::Active {
                domain_cache,
                current_cluster,
            } => match domain_cache.resolve(task.domain_id) {
                Ok(domain) => Ok(domain.is_active_in(current_cluster)),
                // A missing domain drains here rather than sticking forever
                Err(TimerQueueError::DomainNotFound(_)) => Ok(true),
                Err(err) => Err(err),
            },
            TimerTaskFilter::Failover { target_domain_id } => {
                Ok(task.domain_id == *target_domain_id)
            }
        }
    }
}
