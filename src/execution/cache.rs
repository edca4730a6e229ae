//! Workflow execution cache
//!
//! Hands out one [`WorkflowContext`] per execution, serialized through a
//! per-execution async mutex. Release is mandatory and idempotent; releasing
//! with an error drops the cached mutable state so the next load re-reads
//! the store.

use crate::error::{TimerQueueError, TimerQueueResult};
use crate::execution::{MutableState, WorkflowExecution};
use crate::store::{ExecutionStore, UpdateWorkflowExecutionRequest};
use crate::task::{TimerTask, TransferTask};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

type CacheKey = (Uuid, WorkflowExecution);

/// Cache of per-execution contexts
pub struct ExecutionCache {
    contexts: DashMap<CacheKey, Arc<WorkflowContext>>,
    store: Arc<dyn ExecutionStore>,
}

impl ExecutionCache {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            contexts: DashMap::new(),
            store,
        }
    }

    /// Get or create the context for an execution and lock it
    ///
    /// The returned guard must be released on every exit path.
    pub async fn acquire(
        &self,
        domain_id: Uuid,
        execution: &WorkflowExecution,
    ) -> (Arc<WorkflowContext>, ReleaseGuard) {
        let key = (domain_id, execution.clone());
        let context = self
            .contexts
            .entry(key)
            .or_insert_with(|| {
                Arc::new(WorkflowContext::new(
                    domain_id,
                    execution.clone(),
                    self.store.clone(),
                ))
            })
            .value()
            .clone();

        let guard = context.lock.clone().lock_owned().await;
        let release = ReleaseGuard {
            context: context.clone(),
            guard: Some(guard),
        };
        (context, release)
    }

    /// Drop a cached context, e.g. after the execution was deleted
    pub fn evict(&self, domain_id: Uuid, execution: &WorkflowExecution) {
        self.contexts.remove(&(domain_id, execution.clone()));
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

struct CachedState {
    state: MutableState,
    /// next-event-id at load time; the commit condition
    condition: i64,
}

/// Per-execution context: cached state plus the commit path
pub struct WorkflowContext {
    domain_id: Uuid,
    execution: WorkflowExecution,
    store: Arc<dyn ExecutionStore>,
    lock: Arc<AsyncMutex<()>>,
    cached: Mutex<Option<CachedState>>,
}

impl WorkflowContext {
    fn new(domain_id: Uuid, execution: WorkflowExecution, store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            domain_id,
            execution,
            store,
            lock: Arc::new(AsyncMutex::new(())),
            cached: Mutex::new(None),
        }
    }

    pub fn domain_id(&self) -> Uuid {
        self.domain_id
    }

    pub fn execution(&self) -> &WorkflowExecution {
        &self.execution
    }

    /// Cached mutable state, loading from the store on a miss
    pub async fn load_mutable_state(&self) -> TimerQueueResult<MutableState> {
        if let Some(cached) = self.cached.lock().as_ref() {
            return Ok(cached.state.clone());
        }
        let state = self
            .store
            .get_workflow_execution(self.domain_id, &self.execution)
            .await?;
        *self.cached.lock() = Some(CachedState {
            condition: state.next_event_id(),
            state: state.clone(),
        });
        Ok(state)
    }

    /// Drop the cached state so the next load hits the store
    pub fn clear(&self) {
        *self.cached.lock() = None;
    }

    /// Commit a mutated state under the condition captured at load
    pub async fn update_workflow_execution(
        &self,
        mut mutable_state: MutableState,
        transfer_tasks: Vec<TransferTask>,
        timer_tasks: Vec<TimerTask>,
        clear_timer_task: Option<TimerTask>,
        transaction_id: i64,
    ) -> TimerQueueResult<()> {
        let condition = self
            .cached
            .lock()
            .as_ref()
            .map(|cached| cached.condition)
            .ok_or_else(|| {
                TimerQueueError::Internal("commit without a loaded mutable state".to_string())
            })?;

        let new_events = mutable_state.drain_new_events();
        let request = UpdateWorkflowExecutionRequest {
            domain_id: self.domain_id,
            execution: self.execution.clone(),
            condition,
            mutable_state: mutable_state.clone(),
            new_events,
            transfer_tasks,
            timer_tasks,
            clear_timer_task,
            transaction_id,
        };

        match self.store.update_workflow_execution(request).await {
            Ok(()) => {
                *self.cached.lock() = Some(CachedState {
                    condition: mutable_state.next_event_id(),
                    state: mutable_state,
                });
                Ok(())
            }
            Err(err) => {
                self.clear();
                Err(err)
            }
        }
    }
}

/// Lock hold over one execution
///
/// Dropping without an explicit release conservatively clears the cached
/// state, the same as releasing with an error.
pub struct ReleaseGuard {
    context: Arc<WorkflowContext>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ReleaseGuard {
    /// Release the lock; a non-`None` error drops the cached dirty state.
    /// Safe to call more than once.
    pub fn release(&mut self, error: Option<&TimerQueueError>) {
        if let Some(guard) = self.guard.take() {
            if error.is_some() {
                self.context.clear();
            }
            drop(guard);
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.context.clear();
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryExecutionStore, MemoryTimerStore};
    use std::time::Duration;

    fn harness() -> (Arc<MemoryExecutionStore>, ExecutionCache, Uuid, WorkflowExecution) {
        let timer_store = Arc::new(MemoryTimerStore::new());
        let store = Arc::new(MemoryExecutionStore::new(timer_store));
        let cache = ExecutionCache::new(store.clone());
        let domain_id = Uuid::new_v4();
        let execution = WorkflowExecution::new("wf", Uuid::new_v4());
        (store, cache, domain_id, execution)
    }

    #[tokio::test]
    async fn test_acquire_serializes_same_execution() {
        let (store, cache, domain_id, execution) = harness();
        store.put(MutableState::new(domain_id, execution.clone(), "tl"));

        let (_context, mut release) = cache.acquire(domain_id, &execution).await;

        // A second acquire must block until the first releases
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            cache.acquire(domain_id, &execution),
        )
        .await;
        assert!(blocked.is_err());

        release.release(None);
        tokio::time::timeout(Duration::from_secs(1), cache.acquire(domain_id, &execution))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_release_with_error_clears_cached_state() {
        let (store, cache, domain_id, execution) = harness();
        let mut seeded = MutableState::new(domain_id, execution.clone(), "tl");
        seeded.set_next_event_id(5);
        store.put(seeded);

        let (context, mut release) = cache.acquire(domain_id, &execution).await;
        let loaded = context.load_mutable_state().await.unwrap();
        assert_eq!(loaded.next_event_id(), 5);

        // Store moves on underneath the cache
        let mut newer = MutableState::new(domain_id, execution.clone(), "tl");
        newer.set_next_event_id(9);
        store.put(newer);

        // Cached state still answers until released with an error
        assert_eq!(context.load_mutable_state().await.unwrap().next_event_id(), 5);
        release.release(Some(&TimerQueueError::Conflict));
        assert_eq!(context.load_mutable_state().await.unwrap().next_event_id(), 9);
    }

    #[tokio::test]
    async fn test_double_release_is_noop() {
        let (store, cache, domain_id, execution) = harness();
        store.put(MutableState::new(domain_id, execution.clone(), "tl"));

        let (_context, mut release) = cache.acquire(domain_id, &execution).await;
        release.release(None);
        release.release(Some(&TimerQueueError::Conflict));
        release.release(None);
    }

    #[tokio::test]
    async fn test_commit_without_load_is_rejected() {
        let (store, cache, domain_id, execution) = harness();
        let state = MutableState::new(domain_id, execution.clone(), "tl");
        store.put(state.clone());

        let (context, mut release) = cache.acquire(domain_id, &execution).await;
        let result = context
            .update_workflow_execution(state, vec![], vec![], None, 1)
            .await;
        assert!(matches!(result, Err(TimerQueueError::Internal(_))));
        release.release(None);
    }
}
