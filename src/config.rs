//! Processor configuration
//!
//! Provides defaults, validation, and environment-based overrides.

use crate::error::{TimerQueueError, TimerQueueResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a timer queue processor instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerQueueConfig {
    /// Maximum number of timer tasks fetched per read
    pub batch_size: usize,
    /// Number of concurrent task workers
    pub worker_count: usize,
    /// In-band retry budget for a single task on optimistic conflicts
    pub conditional_retry_count: usize,
    /// Interval between ack-level maintenance passes, in milliseconds
    pub ack_update_interval_ms: u64,
    /// Upper bound on gate idle time before re-checking the store, in milliseconds
    pub max_poll_interval_ms: u64,
    /// Initial backoff before redelivering a failed task, in milliseconds
    pub redispatch_backoff_ms: u64,
    /// Cap on the redelivery backoff, in milliseconds
    pub redispatch_backoff_max_ms: u64,
}

impl TimerQueueConfig {
    /// Load defaults with environment variable overrides applied
    pub fn from_env() -> TimerQueueResult<Self> {
        let mut config = TimerQueueConfig::default();

        if let Ok(val) = std::env::var("SHARDFLOW_TIMER_BATCH_SIZE") {
            config.batch_size = parse_env("SHARDFLOW_TIMER_BATCH_SIZE", &val)?;
        }
        if let Ok(val) = std::env::var("SHARDFLOW_TIMER_WORKER_COUNT") {
            config.worker_count = parse_env("SHARDFLOW_TIMER_WORKER_COUNT", &val)?;
        }
        if let Ok(val) = std::env::var("SHARDFLOW_TIMER_RETRY_COUNT") {
            config.conditional_retry_count = parse_env("SHARDFLOW_TIMER_RETRY_COUNT", &val)?;
        }
        if let Ok(val) = std::env::var("SHARDFLOW_TIMER_ACK_INTERVAL_MS") {
            config.ack_update_interval_ms = parse_env("SHARDFLOW_TIMER_ACK_INTERVAL_MS", &val)?;
        }
        if let Ok(val) = std::env::var("SHARDFLOW_TIMER_MAX_POLL_INTERVAL_MS") {
            config.max_poll_interval_ms = parse_env("SHARDFLOW_TIMER_MAX_POLL_INTERVAL_MS", &val)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> TimerQueueResult<()> {
        if self.batch_size == 0 {
            return Err(TimerQueueError::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(TimerQueueError::Configuration(
                "worker_count must be positive".to_string(),
            ));
        }
        if self.conditional_retry_count == 0 {
            return Err(TimerQueueError::Configuration(
                "conditional_retry_count must be positive".to_string(),
            ));
        }
        if self.redispatch_backoff_ms > self.redispatch_backoff_max_ms {
            return Err(TimerQueueError::Configuration(
                "redispatch_backoff_ms must not exceed redispatch_backoff_max_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Ack-level maintenance interval
    pub fn ack_update_interval(&self) -> Duration {
        Duration::from_millis(self.ack_update_interval_ms)
    }

    /// Idle re-check bound for the timer gate
    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    /// Initial redelivery backoff
    pub fn redispatch_backoff(&self) -> Duration {
        Duration::from_millis(self.redispatch_backoff_ms)
    }

    /// Redelivery backoff cap
    pub fn redispatch_backoff_max(&self) -> Duration {
        Duration::from_millis(self.redispatch_backoff_max_ms)
    }
}

impl Default for TimerQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            worker_count: 10,
            conditional_retry_count: 5,
            ack_update_interval_ms: 5_000,
            max_poll_interval_ms: 300_000,
            redispatch_backoff_ms: 100,
            redispatch_backoff_max_ms: 5_000,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> TimerQueueResult<T> {
    value
        .parse()
        .map_err(|_| TimerQueueError::Configuration(format!("invalid value for {}: {}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TimerQueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.conditional_retry_count, 5);
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let config = TimerQueueConfig {
            worker_count: 0,
            ..TimerQueueConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TimerQueueError::Configuration(_))
        ));
    }

    #[test]
    fn test_validation_rejects_inverted_backoff() {
        let config = TimerQueueConfig {
            redispatch_backoff_ms: 10_000,
            redispatch_backoff_max_ms: 1_000,
            ..TimerQueueConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
