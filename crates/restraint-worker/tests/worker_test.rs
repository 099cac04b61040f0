use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use restraint_core::models::{ConstraintSpec, ConsumerState, ReleaseEvent, ReleaseStatus};
use restraint_core::ConstraintStore;
use restraint_db::MemoryConstraintStore;
use restraint_engine::{
    AdmissionRequest, ConstraintEngine, EngineConfig, NoopNotifier, ReleaseStatusSource,
    ReleaseTrigger,
};
use restraint_worker::{Reconciler, ReleaseListener, RestraintWorker, RetentionSweeper, WorkerConfig};

async fn setup(limit: u32) -> (ConstraintEngine, MemoryConstraintStore) {
    let store = MemoryConstraintStore::new();
    let engine = ConstraintEngine::with_store(
        Arc::new(store.clone()),
        Arc::new(NoopNotifier),
        EngineConfig::default(),
    );
    engine
        .register_constraint(&ConstraintSpec::fifo("registry", limit).unwrap())
        .await
        .unwrap();
    (engine, store)
}

async fn admit(engine: &ConstraintEngine, consumer: &str) {
    engine
        .request_admission(AdmissionRequest::new(
            "registry",
            "acct",
            consumer,
            format!("node-{}", consumer),
        ))
        .await
        .unwrap();
}

async fn state_of(store: &MemoryConstraintStore, consumer: &str) -> ConsumerState {
    store
        .get_consumer(&consumer.into())
        .await
        .unwrap()
        .unwrap()
        .state
}

struct StaticStatuses(Mutex<HashMap<String, ReleaseStatus>>);

#[async_trait]
impl ReleaseStatusSource for StaticStatuses {
    async fn status(&self, release_entity_id: &str) -> anyhow::Result<Option<ReleaseStatus>> {
        Ok(self.0.lock().unwrap().get(release_entity_id).copied())
    }
}

#[tokio::test]
async fn test_release_events_drive_activation_end_to_end() {
    let (engine, store) = setup(1).await;
    admit(&engine, "c1").await;
    admit(&engine, "c2").await;

    let config = WorkerConfig {
        reconcile_interval_secs: 0,
        retention_days: 0,
        ..WorkerConfig::default()
    };
    let worker = RestraintWorker::start(engine, Arc::new(store.clone()), None, config, None);

    worker
        .release_events()
        .send(ReleaseEvent::new("node-c1", ReleaseStatus::Succeeded))
        .await
        .unwrap();

    let mut activated = false;
    for _ in 0..200 {
        if state_of(&store, "c2").await == ConsumerState::Active {
            activated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(activated, "c2 was not activated by the release event");
    assert_eq!(state_of(&store, "c1").await, ConsumerState::Finished);

    worker.shutdown().await;
}

#[tokio::test]
async fn test_listener_retries_transient_store_failures() {
    let (engine, store) = setup(1).await;
    admit(&engine, "c1").await;
    admit(&engine, "c2").await;

    let listener = ReleaseListener::new(ReleaseTrigger::new(engine), 3, Duration::from_millis(1));
    store.inject_failures(2);
    let outcomes = listener
        .handle(&ReleaseEvent::new("node-c1", ReleaseStatus::Aborted))
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(state_of(&store, "c2").await, ConsumerState::Active);
}

#[tokio::test]
async fn test_listener_gives_up_after_max_attempts() {
    let (engine, store) = setup(1).await;
    admit(&engine, "c1").await;

    let listener = ReleaseListener::new(ReleaseTrigger::new(engine), 2, Duration::from_millis(1));
    store.inject_failures(5);
    let err = listener
        .handle(&ReleaseEvent::new("node-c1", ReleaseStatus::Failed))
        .await
        .unwrap_err();
    assert!(err.is_recoverable());

    store.inject_failures(0);
    assert_eq!(state_of(&store, "c1").await, ConsumerState::Active);
}

#[tokio::test]
async fn test_reconciler_finishes_consumers_of_terminal_entities() {
    let (engine, store) = setup(1).await;
    admit(&engine, "c1").await;
    admit(&engine, "c2").await;
    admit(&engine, "c3").await;

    let statuses = Arc::new(StaticStatuses(Mutex::new(HashMap::from([
        ("node-c1".to_string(), ReleaseStatus::Expired),
        ("node-c2".to_string(), ReleaseStatus::Queued),
        ("node-c3".to_string(), ReleaseStatus::Queued),
    ]))));
    let trigger = ReleaseTrigger::new(engine).with_status_source(statuses);
    let reconciler = Reconciler::new(Arc::new(store.clone()), trigger, 2);

    let stats = reconciler.run_once().await.unwrap();
    assert_eq!(stats.finished, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(state_of(&store, "c1").await, ConsumerState::Finished);
    assert_eq!(state_of(&store, "c2").await, ConsumerState::Active);
    assert_eq!(state_of(&store, "c3").await, ConsumerState::Blocked);
}

#[tokio::test]
async fn test_reconciler_heals_stranded_queue() {
    let (engine, store) = setup(2).await;
    for id in ["c1", "c2", "c3", "c4"] {
        admit(&engine, id).await;
    }
    for id in ["c1", "c2"] {
        store
            .transition(
                &id.into(),
                &ConsumerState::NON_TERMINAL,
                ConsumerState::Finished,
                None,
            )
            .await
            .unwrap();
    }

    let reconciler = Reconciler::new(Arc::new(store.clone()), ReleaseTrigger::new(engine), 10);
    let stats = reconciler.run_once().await.unwrap();

    assert_eq!(stats.scanned, 2);
    assert_eq!(stats.rebalanced_units, 1);
    assert_eq!(stats.activated, 2);
    assert_eq!(state_of(&store, "c3").await, ConsumerState::Active);
    assert_eq!(state_of(&store, "c4").await, ConsumerState::Active);
}

#[tokio::test]
async fn test_retention_sweeper_deletes_only_expired_finished_consumers() {
    let (engine, store) = setup(2).await;
    admit(&engine, "old").await;
    admit(&engine, "recent").await;
    admit(&engine, "live").await;
    engine.finish(&"old".into()).await.unwrap();
    engine.finish(&"recent".into()).await.unwrap();
    store
        .set_finished_at(&"old".into(), Utc::now() - chrono::Duration::days(31))
        .await;

    let disabled = RetentionSweeper::new(Arc::new(store.clone()), 0);
    assert_eq!(disabled.run_once().await.unwrap(), 0);

    let sweeper = RetentionSweeper::new(Arc::new(store.clone()), 30);
    assert_eq!(sweeper.run_once().await.unwrap(), 1);

    assert!(store.get_consumer(&"old".into()).await.unwrap().is_none());
    assert_eq!(state_of(&store, "recent").await, ConsumerState::Finished);
    assert_eq!(state_of(&store, "live").await, ConsumerState::Active);
}
