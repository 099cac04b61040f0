//! In-memory constraint store
//!
//! Same contract as the Postgres store, with a single mutex standing in for the
//! per-unit row lock. Used by tests and by deployments that embed the engine in
//! one process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use restraint_core::models::{
    ConstraintId, ConstraintSpec, ConsumerId, ConsumerInstance, ConsumerState, ResourceUnit,
};
use restraint_core::{ConstraintStore, RestraintError, RestraintResult};

#[derive(Default)]
struct Inner {
    specs: HashMap<ConstraintId, ConstraintSpec>,
    max_orders: HashMap<ResourceUnit, i64>,
    consumers: BTreeMap<ConsumerId, ConsumerInstance>,
}

impl Inner {
    fn active_permits(&self, constraint_id: &ConstraintId, resource_unit: &ResourceUnit) -> u64 {
        self.consumers
            .values()
            .filter(|c| {
                c.is_active() && &c.constraint_id == constraint_id && &c.resource_unit == resource_unit
            })
            .map(|c| u64::from(c.permits))
            .sum()
    }
}

#[derive(Clone, Default)]
pub struct MemoryConstraintStore {
    inner: Arc<Mutex<Inner>>,
    pending_failures: Arc<AtomicU32>,
    skip_before_failure: Arc<AtomicU32>,
    writes: Arc<AtomicU64>,
}

impl MemoryConstraintStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` operations fail with `StoreUnavailable`.
    pub fn inject_failures(&self, count: u32) {
        self.inject_failures_after(0, count);
    }

    /// Lets `skip` operations succeed, then fails the following `count`.
    pub fn inject_failures_after(&self, skip: u32, count: u32) {
        self.skip_before_failure.store(skip, Ordering::SeqCst);
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes (inserts and transitions) so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every consumer ever stored, FINISHED included (for test assertions).
    pub async fn snapshot(&self) -> Vec<ConsumerInstance> {
        self.inner.lock().await.consumers.values().cloned().collect()
    }

    /// Overrides a consumer's `finished_at` (for retention tests).
    pub async fn set_finished_at(&self, consumer_id: &ConsumerId, at: DateTime<Utc>) {
        if let Some(consumer) = self.inner.lock().await.consumers.get_mut(consumer_id) {
            consumer.finished_at = Some(at);
        }
    }

    fn check_failure(&self) -> RestraintResult<()> {
        if self.pending_failures.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }
        let skipped = self
            .skip_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if skipped {
            return Ok(());
        }
        let took = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(RestraintError::store(anyhow::anyhow!(
                "injected store failure"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ConstraintStore for MemoryConstraintStore {
    async fn create_if_absent(&self, spec: &ConstraintSpec) -> RestraintResult<ConstraintSpec> {
        self.check_failure()?;
        let mut inner = self.inner.lock().await;
        let stored = inner
            .specs
            .entry(spec.id.clone())
            .or_insert_with(|| spec.clone())
            .clone();
        Ok(stored)
    }

    async fn get_spec(
        &self,
        constraint_id: &ConstraintId,
    ) -> RestraintResult<Option<ConstraintSpec>> {
        self.check_failure()?;
        Ok(self.inner.lock().await.specs.get(constraint_id).cloned())
    }

    async fn list_active_and_blocked(
        &self,
        resource_unit: &ResourceUnit,
    ) -> RestraintResult<Vec<ConsumerInstance>> {
        self.check_failure()?;
        let inner = self.inner.lock().await;
        let mut consumers: Vec<ConsumerInstance> = inner
            .consumers
            .values()
            .filter(|c| &c.resource_unit == resource_unit && !c.state.is_terminal())
            .cloned()
            .collect();
        consumers.sort_by_key(|c| c.order);
        Ok(consumers)
    }

    async fn max_order(&self, resource_unit: &ResourceUnit) -> RestraintResult<i64> {
        self.check_failure()?;
        Ok(self
            .inner
            .lock()
            .await
            .max_orders
            .get(resource_unit)
            .copied()
            .unwrap_or(0))
    }

    async fn insert(
        &self,
        consumer: &ConsumerInstance,
        capacity: Option<u32>,
    ) -> RestraintResult<ConsumerInstance> {
        self.check_failure()?;
        if consumer.state.is_terminal() {
            return Err(RestraintError::InvalidSpec(format!(
                "consumer {} cannot be inserted in state {}",
                consumer.id, consumer.state
            )));
        }

        let mut inner = self.inner.lock().await;
        if !inner.specs.contains_key(&consumer.constraint_id) {
            return Err(RestraintError::UnknownConstraint(
                consumer.constraint_id.clone(),
            ));
        }

        let max_order = inner
            .max_orders
            .get(&consumer.resource_unit)
            .copied()
            .unwrap_or(0);
        if consumer.order != max_order + 1 {
            return Err(RestraintError::OrderConflict {
                resource_unit: consumer.resource_unit.clone(),
                order: consumer.order,
            });
        }
        if inner.consumers.contains_key(&consumer.id) {
            return Err(RestraintError::DuplicateConsumer(consumer.id.clone()));
        }
        if let (ConsumerState::Active, Some(capacity)) = (consumer.state, capacity) {
            let used = inner.active_permits(&consumer.constraint_id, &consumer.resource_unit);
            if used + u64::from(consumer.permits) > u64::from(capacity) {
                return Err(RestraintError::CapacityExhausted {
                    constraint_id: consumer.constraint_id.clone(),
                    resource_unit: consumer.resource_unit.clone(),
                });
            }
        }

        inner
            .max_orders
            .insert(consumer.resource_unit.clone(), consumer.order);
        inner.consumers.insert(consumer.id.clone(), consumer.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(consumer.clone())
    }

    async fn transition(
        &self,
        consumer_id: &ConsumerId,
        expected: &[ConsumerState],
        new_state: ConsumerState,
        capacity: Option<u32>,
    ) -> RestraintResult<ConsumerInstance> {
        self.check_failure()?;
        let mut inner = self.inner.lock().await;
        let current = inner
            .consumers
            .get(consumer_id)
            .cloned()
            .ok_or_else(|| RestraintError::NotFound(consumer_id.clone()))?;

        if !expected.contains(&current.state) {
            return Err(RestraintError::StaleStateConflict {
                consumer_id: consumer_id.clone(),
                actual: current.state,
                expected: expected.to_vec(),
            });
        }
        if let (ConsumerState::Active, Some(capacity)) = (new_state, capacity) {
            let used = inner.active_permits(&current.constraint_id, &current.resource_unit);
            if used + u64::from(current.permits) > u64::from(capacity) {
                return Err(RestraintError::CapacityExhausted {
                    constraint_id: current.constraint_id.clone(),
                    resource_unit: current.resource_unit.clone(),
                });
            }
        }

        let mut updated = current;
        updated.apply_transition(new_state, Utc::now());
        inner.consumers.insert(consumer_id.clone(), updated.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn get_consumer(
        &self,
        consumer_id: &ConsumerId,
    ) -> RestraintResult<Option<ConsumerInstance>> {
        self.check_failure()?;
        Ok(self.inner.lock().await.consumers.get(consumer_id).cloned())
    }

    async fn find_active_and_blocked_by_release_entity(
        &self,
        release_entity_id: &str,
    ) -> RestraintResult<Vec<ConsumerInstance>> {
        self.check_failure()?;
        let inner = self.inner.lock().await;
        let mut consumers: Vec<ConsumerInstance> = inner
            .consumers
            .values()
            .filter(|c| c.release_entity_id == release_entity_id && !c.state.is_terminal())
            .cloned()
            .collect();
        consumers.sort_by(|a, b| {
            a.resource_unit
                .cmp(&b.resource_unit)
                .then(a.order.cmp(&b.order))
        });
        Ok(consumers)
    }

    async fn list_active_and_blocked_page(
        &self,
        limit: usize,
        after: Option<&ConsumerId>,
    ) -> RestraintResult<Vec<ConsumerInstance>> {
        self.check_failure()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .consumers
            .values()
            .filter(|c| after.map_or(true, |after| &c.id > after) && !c.state.is_terminal())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> RestraintResult<u64> {
        self.check_failure()?;
        let mut inner = self.inner.lock().await;
        let before = inner.consumers.len();
        inner.consumers.retain(|_, c| {
            !(c.state.is_terminal() && c.finished_at.map_or(false, |at| at < cutoff))
        });
        Ok((before - inner.consumers.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer(id: &str, order: i64, state: ConsumerState) -> ConsumerInstance {
        ConsumerInstance::new(
            id.into(),
            "registry".into(),
            "unit".into(),
            order,
            state,
            1,
            format!("node-{}", id),
        )
        .unwrap()
    }

    async fn store_with_spec(limit: u32) -> MemoryConstraintStore {
        let store = MemoryConstraintStore::new();
        store
            .create_if_absent(&ConstraintSpec::fifo("registry", limit).unwrap())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn first_registration_wins() {
        let store = store_with_spec(2).await;
        let again = store
            .create_if_absent(&ConstraintSpec::fifo("registry", 5).unwrap())
            .await
            .unwrap();
        assert_eq!(again.max_concurrent, 2);
    }

    #[tokio::test]
    async fn insert_requires_next_order() {
        let store = store_with_spec(1).await;
        store
            .insert(&consumer("c1", 1, ConsumerState::Active), Some(1))
            .await
            .unwrap();

        let err = store
            .insert(&consumer("c2", 1, ConsumerState::Blocked), Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RestraintError::OrderConflict { order: 1, .. }));
        assert_eq!(store.max_order(&"unit".into()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = store_with_spec(1).await;
        store
            .insert(&consumer("c1", 1, ConsumerState::Active), Some(1))
            .await
            .unwrap();
        let err = store
            .insert(&consumer("c1", 2, ConsumerState::Blocked), Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RestraintError::DuplicateConsumer(_)));
    }

    #[tokio::test]
    async fn active_insert_is_capacity_guarded() {
        let store = store_with_spec(1).await;
        store
            .insert(&consumer("c1", 1, ConsumerState::Active), Some(1))
            .await
            .unwrap();
        let err = store
            .insert(&consumer("c2", 2, ConsumerState::Active), Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RestraintError::CapacityExhausted { .. }));
    }

    #[tokio::test]
    async fn transition_is_conditional() {
        let store = store_with_spec(1).await;
        store
            .insert(&consumer("c1", 1, ConsumerState::Active), Some(1))
            .await
            .unwrap();
        store
            .insert(&consumer("c2", 2, ConsumerState::Blocked), Some(1))
            .await
            .unwrap();

        let err = store
            .transition(
                &"c2".into(),
                &[ConsumerState::Blocked],
                ConsumerState::Active,
                Some(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RestraintError::CapacityExhausted { .. }));

        let finished = store
            .transition(
                &"c1".into(),
                &ConsumerState::NON_TERMINAL,
                ConsumerState::Finished,
                None,
            )
            .await
            .unwrap();
        assert!(finished.finished_at.is_some());

        let err = store
            .transition(
                &"c1".into(),
                &ConsumerState::NON_TERMINAL,
                ConsumerState::Finished,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RestraintError::StaleStateConflict {
                actual: ConsumerState::Finished,
                ..
            }
        ));

        let err = store
            .transition(
                &"missing".into(),
                &[ConsumerState::Blocked],
                ConsumerState::Active,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RestraintError::NotFound(_)));
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = store_with_spec(1).await;
        store.inject_failures(2);
        assert!(store.max_order(&"unit".into()).await.is_err());
        assert!(store.max_order(&"unit".into()).await.is_err());
        assert_eq!(store.max_order(&"unit".into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pages_skip_finished_consumers() {
        let store = store_with_spec(3).await;
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            store
                .insert(&consumer(id, i as i64 + 1, ConsumerState::Active), Some(3))
                .await
                .unwrap();
        }
        store
            .transition(
                &"b".into(),
                &[ConsumerState::Active],
                ConsumerState::Finished,
                None,
            )
            .await
            .unwrap();

        let first = store.list_active_and_blocked_page(1, None).await.unwrap();
        assert_eq!(first[0].id.as_str(), "a");
        let rest = store
            .list_active_and_blocked_page(10, Some(&first[0].id))
            .await
            .unwrap();
        let ids: Vec<&str> = rest.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[tokio::test]
    async fn retention_deletes_only_old_finished_rows() {
        let store = store_with_spec(2).await;
        store
            .insert(&consumer("old", 1, ConsumerState::Active), Some(2))
            .await
            .unwrap();
        store
            .insert(&consumer("live", 2, ConsumerState::Active), Some(2))
            .await
            .unwrap();
        store
            .transition(
                &"old".into(),
                &[ConsumerState::Active],
                ConsumerState::Finished,
                None,
            )
            .await
            .unwrap();
        store
            .set_finished_at(&"old".into(), Utc::now() - chrono::Duration::days(40))
            .await;

        let deleted = store
            .delete_finished_before(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_consumer(&"live".into()).await.unwrap().is_some());
        assert!(store.get_consumer(&"old".into()).await.unwrap().is_none());
    }
}
