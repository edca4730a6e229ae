//! Matching service client
//!
//! Activity retry dispatch goes through this seam. The service deduplicates
//! on `(workflow, run, scheduled_event_id, attempt)`, so re-sending on
//! replay is safe.

use crate::error::{TimerQueueError, TimerQueueResult};
use crate::execution::WorkflowExecution;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Dispatch request for one activity attempt
#[derive(Debug, Clone, PartialEq)]
pub struct AddActivityTaskRequest {
    pub source_domain_id: Uuid,
    pub target_domain_id: Uuid,
    pub execution: WorkflowExecution,
    pub task_list: String,
    pub scheduled_event_id: i64,
    pub schedule_to_start_timeout: Duration,
    pub attempt: i64,
}

/// Client to the matching service
#[async_trait]
pub trait MatchingClient: Send + Sync {
    async fn add_activity_task(&self, request: AddActivityTaskRequest) -> TimerQueueResult<()>;
}

/// In-memory matching client that records requests
///
/// Can be primed to fail the first N dispatches to exercise the retry path.
#[derive(Default)]
pub struct RecordingMatchingClient {
    requests: Mutex<Vec<AddActivityTaskRequest>>,
    failures_remaining: AtomicUsize,
}

impl RecordingMatchingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` dispatches with a transient error
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<AddActivityTaskRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl MatchingClient for RecordingMatchingClient {
    async fn add_activity_task(&self, request: AddActivityTaskRequest) -> TimerQueueResult<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(TimerQueueError::Matching(
                "matching service unavailable".to_string(),
            ));
        }
        self.requests.lock().push(request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AddActivityTaskRequest {
        AddActivityTaskRequest {
            source_domain_id: Uuid::new_v4(),
            target_domain_id: Uuid::new_v4(),
            execution: WorkflowExecution::new("wf", Uuid::new_v4()),
            task_list: "tl".to_string(),
            scheduled_event_id: 7,
            schedule_to_start_timeout: Duration::from_secs(10),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_recording_client_records_requests() {
        let client = RecordingMatchingClient::new();
        client.add_activity_task(request()).await.unwrap();
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test]
    async fn test_primed_failures_then_success() {
        let client = RecordingMatchingClient::new();
        client.fail_next(2);
        assert!(client.add_activity_task(request()).await.is_err());
        assert!(client.add_activity_task(request()).await.is_err());
        assert!(client.add_activity_task(request()).await.is_ok());
        assert_eq!(client.request_count(), 1);
    }
}
