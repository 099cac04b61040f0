use serde::{Deserialize, Serialize};

use super::consumer::ConsumerInstance;
use super::ids::{ConstraintId, ResourceUnit};

/// Point-in-time view of the non-terminal consumers of one (constraint, unit),
/// ordered by `order` ascending.
#[derive(Debug, Clone)]
pub struct UnitQueue {
    constraint_id: ConstraintId,
    resource_unit: ResourceUnit,
    consumers: Vec<ConsumerInstance>,
}

impl UnitQueue {
    /// Keeps only the non-terminal consumers governed by `constraint_id` and sorts
    /// them by order.
    pub fn new(
        constraint_id: ConstraintId,
        resource_unit: ResourceUnit,
        consumers: Vec<ConsumerInstance>,
    ) -> Self {
        let mut consumers: Vec<ConsumerInstance> = consumers
            .into_iter()
            .filter(|c| {
                c.constraint_id == constraint_id
                    && c.resource_unit == resource_unit
                    && !c.state.is_terminal()
            })
            .collect();
        consumers.sort_by_key(|c| c.order);
        Self {
            constraint_id,
            resource_unit,
            consumers,
        }
    }

    pub fn constraint_id(&self) -> &ConstraintId {
        &self.constraint_id
    }

    pub fn resource_unit(&self) -> &ResourceUnit {
        &self.resource_unit
    }

    pub fn consumers(&self) -> &[ConsumerInstance] {
        &self.consumers
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn active(&self) -> impl Iterator<Item = &ConsumerInstance> {
        self.consumers.iter().filter(|c| c.is_active())
    }

    pub fn blocked(&self) -> impl Iterator<Item = &ConsumerInstance> {
        self.consumers.iter().filter(|c| c.is_blocked())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked().count()
    }

    pub fn permits_in_use(&self) -> u32 {
        self.active().map(|c| c.permits).sum()
    }

    pub fn free_permits(&self, limit: u32) -> u32 {
        limit.saturating_sub(self.permits_in_use())
    }

    pub fn status(&self, limit: u32) -> UnitStatus {
        if self.is_empty() {
            return UnitStatus::Unconstrained;
        }
        UnitStatus::Constrained {
            active: self.active_count(),
            blocked: self.blocked_count(),
            permits_in_use: self.permits_in_use(),
            limit,
        }
    }
}

/// Admission status of a resource unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    /// Nobody holds or waits for this unit; a new request would be admitted at once.
    Unconstrained,
    Constrained {
        active: usize,
        blocked: usize,
        permits_in_use: u32,
        limit: u32,
    },
}
