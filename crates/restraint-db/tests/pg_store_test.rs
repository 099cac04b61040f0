//! Postgres store tests.
//!
//! Run against the database in `TEST_DATABASE_URL`; skipped when it is unset.

use restraint_core::models::{ConstraintSpec, ConsumerInstance, ConsumerState, Strategy};
use restraint_core::{ConstraintStore, RestraintError};
use restraint_db::{PgConstraintStore, MIGRATOR};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use uuid::Uuid;

async fn setup_store() -> Option<PgConstraintStore> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&url)
        .await
        .expect("Failed to connect to test database");
    MIGRATOR
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    Some(PgConstraintStore::new(pool))
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

fn consumer(
    id: &str,
    spec: &ConstraintSpec,
    unit: &str,
    order: i64,
    state: ConsumerState,
) -> ConsumerInstance {
    ConsumerInstance::new(
        id.into(),
        spec.id.clone(),
        unit.into(),
        order,
        state,
        1,
        format!("node-{}", id),
    )
    .unwrap()
}

#[tokio::test]
async fn test_registration_is_idempotent() {
    let Some(store) = setup_store().await else {
        return;
    };
    let id = unique("github-api");
    let spec = ConstraintSpec::new(id.as_str(), 2, Strategy::Asap).unwrap();

    let first = store.create_if_absent(&spec).await.unwrap();
    let second = store
        .create_if_absent(&ConstraintSpec::fifo(id.as_str(), 9).unwrap())
        .await
        .unwrap();

    assert_eq!(first, spec);
    assert_eq!(second, spec);
    assert_eq!(store.get_spec(&spec.id).await.unwrap(), Some(spec));
}

#[tokio::test]
async fn test_order_allocation_and_capacity_guard() {
    let Some(store) = setup_store().await else {
        return;
    };
    let spec = ConstraintSpec::fifo(unique("registry").as_str(), 1).unwrap();
    store.create_if_absent(&spec).await.unwrap();
    let unit = unique("acct");
    let (c1, c2) = (unique("c1"), unique("c2"));

    assert_eq!(store.max_order(&unit.as_str().into()).await.unwrap(), 0);
    store
        .insert(&consumer(&c1, &spec, &unit, 1, ConsumerState::Active), Some(1))
        .await
        .unwrap();

    let err = store
        .insert(&consumer(&c2, &spec, &unit, 1, ConsumerState::Blocked), Some(1))
        .await
        .unwrap_err();
    assert!(matches!(err, RestraintError::OrderConflict { .. }));

    let err = store
        .insert(&consumer(&c2, &spec, &unit, 2, ConsumerState::Active), Some(1))
        .await
        .unwrap_err();
    assert!(matches!(err, RestraintError::CapacityExhausted { .. }));

    store
        .insert(&consumer(&c2, &spec, &unit, 2, ConsumerState::Blocked), Some(1))
        .await
        .unwrap();
    let listed = store
        .list_active_and_blocked(&unit.as_str().into())
        .await
        .unwrap();
    let orders: Vec<i64> = listed.iter().map(|c| c.order).collect();
    assert_eq!(orders, vec![1, 2]);
}

#[tokio::test]
async fn test_conditional_transitions() {
    let Some(store) = setup_store().await else {
        return;
    };
    let spec = ConstraintSpec::fifo(unique("registry").as_str(), 1).unwrap();
    store.create_if_absent(&spec).await.unwrap();
    let unit = unique("acct");
    let (c1, c2) = (unique("c1"), unique("c2"));
    store
        .insert(&consumer(&c1, &spec, &unit, 1, ConsumerState::Active), Some(1))
        .await
        .unwrap();
    store
        .insert(&consumer(&c2, &spec, &unit, 2, ConsumerState::Blocked), Some(1))
        .await
        .unwrap();

    let err = store
        .transition(
            &c2.as_str().into(),
            &[ConsumerState::Blocked],
            ConsumerState::Active,
            Some(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RestraintError::CapacityExhausted { .. }));

    let finished = store
        .transition(
            &c1.as_str().into(),
            &ConsumerState::NON_TERMINAL,
            ConsumerState::Finished,
            None,
        )
        .await
        .unwrap();
    assert_eq!(finished.state, ConsumerState::Finished);
    assert!(finished.finished_at.is_some());

    let activated = store
        .transition(
            &c2.as_str().into(),
            &[ConsumerState::Blocked],
            ConsumerState::Active,
            Some(1),
        )
        .await
        .unwrap();
    assert!(activated.acquire_at.is_some());

    let err = store
        .transition(
            &c2.as_str().into(),
            &[ConsumerState::Blocked],
            ConsumerState::Active,
            Some(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RestraintError::StaleStateConflict { .. }));

    let err = store
        .transition(
            &unique("missing").as_str().into(),
            &[ConsumerState::Blocked],
            ConsumerState::Active,
            Some(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RestraintError::NotFound(_)));
}

#[tokio::test]
async fn test_release_entity_lookup_and_retention() {
    let Some(store) = setup_store().await else {
        return;
    };
    let spec = ConstraintSpec::fifo(unique("registry").as_str(), 2).unwrap();
    store.create_if_absent(&spec).await.unwrap();
    let unit = unique("acct");
    let c1 = unique("c1");
    let instance = consumer(&c1, &spec, &unit, 1, ConsumerState::Active);
    store.insert(&instance, Some(2)).await.unwrap();

    let found = store
        .find_active_and_blocked_by_release_entity(&instance.release_entity_id)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);

    store
        .transition(
            &instance.id,
            &ConsumerState::NON_TERMINAL,
            ConsumerState::Finished,
            None,
        )
        .await
        .unwrap();
    let found = store
        .find_active_and_blocked_by_release_entity(&instance.release_entity_id)
        .await
        .unwrap();
    assert!(found.is_empty());

    let deleted = store
        .delete_finished_before(chrono::Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert!(deleted >= 1);
    assert!(store.get_consumer(&instance.id).await.unwrap().is_none());
}
