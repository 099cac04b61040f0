//! Registry adapter between the engine and the constraint store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use restraint_core::models::{
    ConstraintId, ConstraintSpec, ConsumerId, ConsumerInstance, ConsumerState, ResourceUnit,
    UnitQueue,
};
use restraint_core::{ConstraintStore, RestraintResult};

/// The queries and conditional writes the engine issues, and nothing else.
#[async_trait]
pub trait ConsumerRegistry: Send + Sync {
    async fn spec(&self, constraint_id: &ConstraintId) -> RestraintResult<Option<ConstraintSpec>>;

    async fn register(&self, spec: &ConstraintSpec) -> RestraintResult<ConstraintSpec>;

    /// Non-terminal consumers of one (constraint, unit), ordered by `order`.
    async fn list_active_and_blocked(
        &self,
        constraint_id: &ConstraintId,
        resource_unit: &ResourceUnit,
    ) -> RestraintResult<UnitQueue>;

    async fn max_order(&self, resource_unit: &ResourceUnit) -> RestraintResult<i64>;

    async fn consumer(&self, consumer_id: &ConsumerId)
        -> RestraintResult<Option<ConsumerInstance>>;

    async fn consumers_for_release_entity(
        &self,
        release_entity_id: &str,
    ) -> RestraintResult<Vec<ConsumerInstance>>;

    async fn insert(
        &self,
        consumer: &ConsumerInstance,
        capacity: Option<u32>,
    ) -> RestraintResult<ConsumerInstance>;

    async fn transition(
        &self,
        consumer_id: &ConsumerId,
        expected: &[ConsumerState],
        new_state: ConsumerState,
        capacity: Option<u32>,
    ) -> RestraintResult<ConsumerInstance>;
}

/// Store-backed registry. Specs are immutable once registered and are cached;
/// everything else goes to the store on every call.
#[derive(Clone)]
pub struct StoreRegistry {
    store: Arc<dyn ConstraintStore>,
    specs: Arc<RwLock<HashMap<ConstraintId, ConstraintSpec>>>,
}

impl StoreRegistry {
    pub fn new(store: Arc<dyn ConstraintStore>) -> Self {
        Self {
            store,
            specs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConstraintStore> {
        &self.store
    }
}

#[async_trait]
impl ConsumerRegistry for StoreRegistry {
    async fn spec(&self, constraint_id: &ConstraintId) -> RestraintResult<Option<ConstraintSpec>> {
        if let Some(spec) = self.specs.read().await.get(constraint_id) {
            return Ok(Some(spec.clone()));
        }

        let spec = self.store.get_spec(constraint_id).await?;
        if let Some(spec) = &spec {
            self.specs
                .write()
                .await
                .insert(spec.id.clone(), spec.clone());
        }
        Ok(spec)
    }

    async fn register(&self, spec: &ConstraintSpec) -> RestraintResult<ConstraintSpec> {
        let stored = self.store.create_if_absent(spec).await?;
        self.specs
            .write()
            .await
            .insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn list_active_and_blocked(
        &self,
        constraint_id: &ConstraintId,
        resource_unit: &ResourceUnit,
    ) -> RestraintResult<UnitQueue> {
        let consumers = self.store.list_active_and_blocked(resource_unit).await?;
        Ok(UnitQueue::new(
            constraint_id.clone(),
            resource_unit.clone(),
            consumers,
        ))
    }

    async fn max_order(&self, resource_unit: &ResourceUnit) -> RestraintResult<i64> {
        self.store.max_order(resource_unit).await
    }

    async fn consumer(
        &self,
        consumer_id: &ConsumerId,
    ) -> RestraintResult<Option<ConsumerInstance>> {
        self.store.get_consumer(consumer_id).await
    }

    async fn consumers_for_release_entity(
        &self,
        release_entity_id: &str,
    ) -> RestraintResult<Vec<ConsumerInstance>> {
        self.store
            .find_active_and_blocked_by_release_entity(release_entity_id)
            .await
    }

    async fn insert(
        &self,
        consumer: &ConsumerInstance,
        capacity: Option<u32>,
    ) -> RestraintResult<ConsumerInstance> {
        self.store.insert(consumer, capacity).await
    }

    async fn transition(
        &self,
        consumer_id: &ConsumerId,
        expected: &[ConsumerState],
        new_state: ConsumerState,
        capacity: Option<u32>,
    ) -> RestraintResult<ConsumerInstance> {
        self.store
            .transition(consumer_id, expected, new_state, capacity)
            .await
    }
}
