//! Activation notification trait.
//!
//! Fired by a rebalance whenever a BLOCKED consumer becomes ACTIVE, so the executor
//! can resume the work item that was waiting for the resource.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ConstraintId, ConsumerId, ConsumerInstance, ResourceUnit};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationEvent {
    pub consumer_id: ConsumerId,
    pub release_entity_id: String,
    pub constraint_id: ConstraintId,
    pub resource_unit: ResourceUnit,
    pub order: i64,
    pub acquire_at: Option<DateTime<Utc>>,
}

impl From<&ConsumerInstance> for ActivationEvent {
    fn from(consumer: &ConsumerInstance) -> Self {
        Self {
            consumer_id: consumer.id.clone(),
            release_entity_id: consumer.release_entity_id.clone(),
            constraint_id: consumer.constraint_id.clone(),
            resource_unit: consumer.resource_unit.clone(),
            order: consumer.order,
            acquire_at: consumer.acquire_at,
        }
    }
}

/// Side channel the executor subscribes to for "your consumer is now ACTIVE".
///
/// Delivery is best effort: a failed notification is logged by the engine and the
/// consumer stays ACTIVE, observable through the status query.
#[async_trait]
pub trait ActivationNotifier: Send + Sync {
    async fn consumer_activated(&self, event: &ActivationEvent) -> anyhow::Result<()>;
}
