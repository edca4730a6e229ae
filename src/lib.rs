//! Active timer queue processor for a sharded workflow orchestration engine
//!
//! Each shard owns a stream of persisted timer tasks alongside its workflow
//! state. This crate fires those tasks in virtual-time order and, for each,
//! mutates the owning workflow's state under optimistic concurrency:
//! - a timer gate schedules the fetch loop on persisted wake-up timestamps
//! - an ack manager advances the durable read cursor over contiguous
//!   completions only
//! - a task filter keeps standby clusters from acting on replicated domains
//! - five task-type handlers (user timer, activity timeout, decision
//!   timeout, workflow timeout, activity retry dispatch) share one
//!   conflict-retrying commit path
//!
//! Fire is at-least-once; handlers are idempotent against replays.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod ack;
pub mod cluster;
pub mod config;
pub mod error;
pub mod execution;
pub mod filter;
pub mod gate;
pub mod matching;
pub(crate) mod metrics;
pub mod processor;
pub mod shard;
pub mod store;
pub mod task;
pub mod time;

pub use ack::TimerQueueAckManager;
pub use cluster::{ClusterMetadata, DomainCache, DomainEntry};
pub use config::TimerQueueConfig;
pub use error::{TimerQueueError, TimerQueueResult};
pub use execution::{ExecutionCache, MutableState, WorkflowExecution};
pub use filter::TimerTaskFilter;
pub use gate::TimerGate;
pub use matching::{AddActivityTaskRequest, MatchingClient};
pub use processor::TimerQueueProcessor;
pub use shard::ShardContext;
pub use task::{TimeoutKind, TimerSequenceId, TimerTask, TimerTaskType};
pub use time::{Clock, ManualClock, SystemClock};
