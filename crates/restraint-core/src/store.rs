//! Constraint store contract
//!
//! The store is the single source of truth for consumers and their order. The
//! engine holds no shared mutable state, so every guarantee the engine relies on
//! (unique order allocation, capacity-guarded activation, conditional transitions)
//! must be provided atomically by the implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RestraintResult;
use crate::models::{
    ConstraintId, ConstraintSpec, ConsumerId, ConsumerInstance, ConsumerState, ResourceUnit,
};

/// Persistence operations the admission engine needs.
///
/// Every operation may fail with `RestraintError::StoreUnavailable`; the other
/// error variants listed per method are part of the contract.
#[async_trait]
pub trait ConstraintStore: Send + Sync {
    /// Register `spec` unless a spec with the same id exists; returns the stored spec.
    async fn create_if_absent(&self, spec: &ConstraintSpec) -> RestraintResult<ConstraintSpec>;

    async fn get_spec(&self, constraint_id: &ConstraintId)
        -> RestraintResult<Option<ConstraintSpec>>;

    /// All BLOCKED and ACTIVE consumers of a unit, ordered by `order` ascending.
    async fn list_active_and_blocked(
        &self,
        resource_unit: &ResourceUnit,
    ) -> RestraintResult<Vec<ConsumerInstance>>;

    /// Highest order ever allocated on the unit, 0 when the unit is unknown.
    async fn max_order(&self, resource_unit: &ResourceUnit) -> RestraintResult<i64>;

    /// Persist a new BLOCKED or ACTIVE consumer.
    ///
    /// Fails with `OrderConflict` unless `consumer.order` is exactly the unit's
    /// `max_order + 1`, with `DuplicateConsumer` if the id exists, and, when
    /// `capacity` is given and the consumer is ACTIVE, with `CapacityExhausted`
    /// if the (constraint, unit) would exceed it.
    async fn insert(
        &self,
        consumer: &ConsumerInstance,
        capacity: Option<u32>,
    ) -> RestraintResult<ConsumerInstance>;

    /// Move a consumer to `new_state` if it is currently in one of `expected`.
    ///
    /// Fails with `NotFound`, `StaleStateConflict`, or (activation with a
    /// `capacity` guard) `CapacityExhausted`. Stamps `acquire_at` on ACTIVE and
    /// `finished_at` on FINISHED.
    async fn transition(
        &self,
        consumer_id: &ConsumerId,
        expected: &[ConsumerState],
        new_state: ConsumerState,
        capacity: Option<u32>,
    ) -> RestraintResult<ConsumerInstance>;

    async fn get_consumer(&self, consumer_id: &ConsumerId)
        -> RestraintResult<Option<ConsumerInstance>>;

    /// BLOCKED and ACTIVE consumers tied to one external work item.
    async fn find_active_and_blocked_by_release_entity(
        &self,
        release_entity_id: &str,
    ) -> RestraintResult<Vec<ConsumerInstance>>;

    /// Page through every non-terminal consumer by ascending id, starting after
    /// `after`.
    async fn list_active_and_blocked_page(
        &self,
        limit: usize,
        after: Option<&ConsumerId>,
    ) -> RestraintResult<Vec<ConsumerInstance>>;

    /// Delete FINISHED consumers whose `finished_at` is older than `cutoff`.
    /// Returns the number of rows deleted.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> RestraintResult<u64>;
}
