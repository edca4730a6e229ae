//! End-to-end scenarios against the in-memory stores with a manual clock

use chrono::{DateTime, TimeZone, Utc};
use shardflow_timers::cluster::{ClusterMetadata, DomainCache, DomainEntry};
use shardflow_timers::execution::events::EventAttributes;
use shardflow_timers::execution::mutable_state::TimerInfo;
use shardflow_timers::execution::{ExecutionCache, MutableState, WorkflowExecution};
use shardflow_timers::matching::RecordingMatchingClient;
use shardflow_timers::store::{MemoryExecutionStore, MemoryTimerStore};
use shardflow_timers::task::{TimeoutKind, TimerTask, TimerTaskType};
use shardflow_timers::time::ManualClock;
use shardflow_timers::{ShardContext, TimerQueueConfig, TimerQueueProcessor};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

struct World {
    clock: Arc<ManualClock>,
    timer_store: Arc<MemoryTimerStore>,
    store: Arc<MemoryExecutionStore>,
    shard: Arc<ShardContext>,
    cache: Arc<ExecutionCache>,
    matching: Arc<RecordingMatchingClient>,
}

fn world() -> World {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let clock = Arc::new(ManualClock::new(t0()));
    let timer_store = Arc::new(MemoryTimerStore::new());
    let store = Arc::new(MemoryExecutionStore::new(timer_store.clone()));
    let shard = Arc::new(ShardContext::new(
        1,
        Arc::new(ClusterMetadata::new(
            "cluster-a",
            vec!["cluster-a".to_string(), "cluster-b".to_string()],
        )),
        Arc::new(DomainCache::new()),
        clock.clone(),
        timer_store.clone(),
        store.clone(),
    ));
    let cache = Arc::new(ExecutionCache::new(store.clone()));
    let matching = Arc::new(RecordingMatchingClient::new());
    World {
        clock,
        timer_store,
        store,
        shard,
        cache,
        matching,
    }
}

fn test_config() -> TimerQueueConfig {
    TimerQueueConfig {
        batch_size: 10,
        worker_count: 2,
        ack_update_interval_ms: 25,
        redispatch_backoff_ms: 10,
        redispatch_backoff_max_ms: 50,
        ..TimerQueueConfig::default()
    }
}

fn user_timer_task(
    domain_id: Uuid,
    execution: &WorkflowExecution,
    task_id: i64,
    visibility: DateTime<Utc>,
    event_id: i64,
) -> TimerTask {
    TimerTask {
        domain_id,
        workflow_id: execution.workflow_id.clone(),
        run_id: execution.run_id,
        task_id,
        visibility_time: visibility,
        task_type: TimerTaskType::UserTimer,
        timeout_kind: TimeoutKind::StartToClose,
        event_id,
        schedule_attempt: 0,
        version: 0,
    }
}

fn running_state_with_timer(
    domain_id: Uuid,
    execution: &WorkflowExecution,
    timer_id: &str,
    started_event_id: i64,
    expiry: DateTime<Utc>,
) -> MutableState {
    let mut ms = MutableState::new(domain_id, execution.clone(), "default-tl");
    ms.set_next_event_id(100);
    ms.add_user_timer(TimerInfo {
        version: 0,
        timer_id: timer_id.to_string(),
        started_event_id,
        expiry,
        task_created: true,
    });
    ms
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition().await {
            return;
        }
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn user_timer_fires_and_advances_cursor() {
    let w = world();
    let domain_id = Uuid::new_v4();
    let execution = WorkflowExecution::new("wf-user-timer", Uuid::new_v4());
    let fire_at = t0() + chrono::Duration::seconds(10);

    w.store.put(running_state_with_timer(
        domain_id, &execution, "u1", 42, fire_at,
    ));
    w.timer_store
        .insert(user_timer_task(domain_id, &execution, 1, fire_at, 42));

    let processor = TimerQueueProcessor::new_active(
        w.shard.clone(),
        w.cache.clone(),
        w.matching.clone(),
        test_config(),
    )
    .unwrap();
    processor.start();

    // Nothing fires while virtual time is short of the timer
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(w.store.history(domain_id, &execution).is_empty());

    w.clock.advance(Duration::from_secs(10));

    let store = w.store.clone();
    let exec = execution.clone();
    wait_until("timer fired event", || {
        let store = store.clone();
        let exec = exec.clone();
        async move {
            store
                .history(domain_id, &exec)
                .iter()
                .any(|e| {
                    e.attributes
                        == EventAttributes::TimerFired {
                            timer_id: "u1".to_string(),
                            started_event_id: 42,
                        }
                })
        }
    })
    .await;

    // A decision task transfer went out and the durable cursor caught up
    let transfers = w.store.transfer_tasks();
    assert!(transfers.iter().any(|t| t.task_list == "default-tl"));

    let timer_store = w.timer_store.clone();
    wait_until("ack level persisted", || {
        let timer_store = timer_store.clone();
        async move { timer_store.ack_level("cluster-a") == Some(fire_at) }
    })
    .await;

    assert!(processor.timer_fired_count() >= 1);
    processor.stop().await;
}

#[tokio::test]
async fn new_timer_notification_reprograms_the_gate() {
    let w = world();
    let domain_id = Uuid::new_v4();
    let execution = WorkflowExecution::new("wf-notify", Uuid::new_v4());

    let processor = TimerQueueProcessor::new_active(
        w.shard.clone(),
        w.cache.clone(),
        w.matching.clone(),
        test_config(),
    )
    .unwrap();
    processor.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A task persisted after start, already due: only the notification
    // tells the gate to fire before the idle poll interval
    let fire_at = t0();
    w.store.put(running_state_with_timer(
        domain_id, &execution, "u1", 7, fire_at,
    ));
    let task = user_timer_task(domain_id, &execution, 1, fire_at, 7);
    w.timer_store.insert(task.clone());
    processor.notify_new_timers(&[task]);

    let store = w.store.clone();
    let exec = execution.clone();
    wait_until("notified timer processed", || {
        let store = store.clone();
        let exec = exec.clone();
        async move { !store.history(domain_id, &exec).is_empty() }
    })
    .await;
    processor.stop().await;
}

#[tokio::test]
async fn out_of_order_completions_keep_cursor_contiguous() {
    let w = world();
    let domain_id = Uuid::new_v4();

    let mut fire_times = Vec::new();
    for i in 1..=5 {
        let execution = WorkflowExecution::new(format!("wf-{}", i), Uuid::new_v4());
        let fire_at = t0() + chrono::Duration::seconds(i);
        w.store.put(running_state_with_timer(
            domain_id, &execution, "u1", 42, fire_at,
        ));
        w.timer_store
            .insert(user_timer_task(domain_id, &execution, i, fire_at, 42));
        fire_times.push(fire_at);
    }

    let processor = TimerQueueProcessor::new_active(
        w.shard.clone(),
        w.cache.clone(),
        w.matching.clone(),
        test_config(),
    )
    .unwrap();
    processor.start();
    w.clock.advance(Duration::from_secs(60));

    let last = *fire_times.last().unwrap();
    let timer_store = w.timer_store.clone();
    wait_until("cursor reaches the last task", || {
        let timer_store = timer_store.clone();
        async move { timer_store.ack_level("cluster-a") == Some(last) }
    })
    .await;

    assert_eq!(processor.timer_fired_count(), 5);
    processor.stop().await;
}

#[tokio::test]
async fn failover_processor_drains_target_domain_and_stops() {
    let w = world();
    let target_domain = Uuid::new_v4();
    let other_domain = Uuid::new_v4();

    // Both domains are global and active on cluster-b; this is the backlog
    // cluster-b left behind, drained here on cluster-a's behalf
    for (id, name) in [(target_domain, "orders"), (other_domain, "billing")] {
        w.shard.domain_cache().register(DomainEntry {
            id,
            name: name.to_string(),
            is_global: true,
            active_cluster: "cluster-b".to_string(),
            retention_days: 1,
            failover_version: 0,
        });
    }

    let target_exec = WorkflowExecution::new("wf-target", Uuid::new_v4());
    let other_exec = WorkflowExecution::new("wf-other", Uuid::new_v4());
    let fire_at = t0() + chrono::Duration::seconds(1);
    w.store.put(running_state_with_timer(
        target_domain, &target_exec, "u1", 42, fire_at,
    ));
    w.store.put(running_state_with_timer(
        other_domain, &other_exec, "u1", 42, fire_at,
    ));
    w.timer_store
        .insert(user_timer_task(target_domain, &target_exec, 1, fire_at, 42));
    w.timer_store
        .insert(user_timer_task(other_domain, &other_exec, 2, fire_at, 42));

    // The backlog is already due when the failover window is captured
    w.clock.advance(Duration::from_secs(30));

    let processor = TimerQueueProcessor::new_failover(
        w.shard.clone(),
        w.cache.clone(),
        w.matching.clone(),
        test_config(),
        target_domain,
        "cluster-b",
    )
    .unwrap();
    processor.start();

    let store = w.store.clone();
    let exec = target_exec.clone();
    wait_until("target domain task handled", || {
        let store = store.clone();
        let exec = exec.clone();
        async move { !store.history(target_domain, &exec).is_empty() }
    })
    .await;

    // The whole mixed stream acks, and the drained processor stops itself
    wait_until("failover processor self-stops", || {
        let stopped = processor.is_stopped();
        async move { stopped }
    })
    .await;

    // The foreign domain was acked without any handler running
    assert!(w.store.history(other_domain, &other_exec).is_empty());
    processor.stop().await;
}

#[tokio::test]
async fn stop_closes_the_gate_and_preserves_progress() {
    let w = world();
    let domain_id = Uuid::new_v4();
    let execution = WorkflowExecution::new("wf-stop", Uuid::new_v4());
    let fire_at = t0() + chrono::Duration::seconds(1);
    w.store.put(running_state_with_timer(
        domain_id, &execution, "u1", 42, fire_at,
    ));
    w.timer_store
        .insert(user_timer_task(domain_id, &execution, 1, fire_at, 42));

    let processor = TimerQueueProcessor::new_active(
        w.shard.clone(),
        w.cache.clone(),
        w.matching.clone(),
        test_config(),
    )
    .unwrap();
    processor.start();
    w.clock.advance(Duration::from_secs(5));

    let store = w.store.clone();
    let exec = execution.clone();
    wait_until("task handled before stop", || {
        let store = store.clone();
        let exec = exec.clone();
        async move { !store.history(domain_id, &exec).is_empty() }
    })
    .await;

    processor.stop().await;
    assert!(processor.timer_gate().is_closed());
    // The final flush persisted whatever the handlers completed
    assert_eq!(w.timer_store.ack_level("cluster-a"), Some(fire_at));

    // Stopping twice is harmless
    processor.stop().await;
}
