//! Error types for the timer queue processor

use thiserror::Error;
use uuid::Uuid;

/// Result type for timer queue operations
pub type TimerQueueResult<T> = Result<T, TimerQueueError>;

/// Error types for the timer queue processor and its collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerQueueError {
    /// Optimistic concurrency lost; the caller reloads and retries
    #[error("optimistic concurrency conflict")]
    Conflict,

    /// The in-band retry budget for a single task is exhausted
    #[error("maximum attempts exceeded")]
    MaxAttemptsExceeded,

    /// The referenced entity no longer exists in the store
    #[error("entity not exists: {0}")]
    EntityNotExists(String),

    /// This shard is owned by another host; the processor must stop
    #[error("shard {0} ownership lost")]
    ShardOwnershipLost(u32),

    /// Domain is not registered in the domain cache
    #[error("domain {0} not found")]
    DomainNotFound(Uuid),

    /// Domain cache lookup failed for a reason other than "not found"
    #[error("domain cache error: {0}")]
    DomainCache(String),

    /// Persistence layer error
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Matching service dispatch error
    #[error("matching service error: {0}")]
    Matching(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invariant violation inside the processor
    #[error("internal error: {0}")]
    Internal(String),
}

impl TimerQueueError {
    /// Whether retrying the same operation can possibly succeed.
    ///
    /// Deterministic failures (missing domains, broken invariants) are not
    /// retried; transient store and RPC failures are.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TimerQueueError::Conflict
                | TimerQueueError::Persistence(_)
                | TimerQueueError::Matching(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(TimerQueueError::Conflict.is_retriable());
        assert!(TimerQueueError::Persistence("timeout".to_string()).is_retriable());
        assert!(TimerQueueError::Matching("unavailable".to_string()).is_retriable());

        assert!(!TimerQueueError::DomainNotFound(Uuid::new_v4()).is_retriable());
        assert!(!TimerQueueError::Internal("bad state".to_string()).is_retriable());
        assert!(!TimerQueueError::ShardOwnershipLost(7).is_retriable());
    }
}
