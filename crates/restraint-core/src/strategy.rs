//! Admission policies
//!
//! A policy decides, from a unit's queue snapshot, whether a new request starts
//! ACTIVE and which BLOCKED consumers a rebalance should try to activate. Policies
//! are pure functions of the snapshot; the store's conditional transitions keep
//! them safe under concurrent callers.

use crate::models::{ConsumerInstance, UnitQueue};

pub trait AdmissionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a new request for `permits` may be inserted ACTIVE right away.
    fn admits_immediately(&self, queue: &UnitQueue, permits: u32, limit: u32) -> bool;

    /// BLOCKED consumers to activate, in activation order, within the free capacity.
    fn runnable<'a>(&self, queue: &'a UnitQueue, limit: u32) -> Vec<&'a ConsumerInstance>;
}

/// Strict enqueue order: the head of the queue must be admitted before anyone
/// behind it.
#[derive(Debug, Default, Clone, Copy)]
pub struct FifoPolicy;

impl AdmissionPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn admits_immediately(&self, queue: &UnitQueue, permits: u32, limit: u32) -> bool {
        queue.blocked_count() == 0 && permits <= queue.free_permits(limit)
    }

    fn runnable<'a>(&self, queue: &'a UnitQueue, limit: u32) -> Vec<&'a ConsumerInstance> {
        let mut free = queue.free_permits(limit);
        let mut runnable = Vec::new();
        for consumer in queue.blocked() {
            if consumer.permits > free {
                break;
            }
            free -= consumer.permits;
            runnable.push(consumer);
        }
        runnable
    }
}

/// Enqueue order, but a consumer that does not fit is passed over by smaller ones
/// behind it.
#[derive(Debug, Default, Clone, Copy)]
pub struct AsapPolicy;

impl AdmissionPolicy for AsapPolicy {
    fn name(&self) -> &'static str {
        "asap"
    }

    fn admits_immediately(&self, queue: &UnitQueue, permits: u32, limit: u32) -> bool {
        let claimed_by_queue: u32 = self.runnable(queue, limit).iter().map(|c| c.permits).sum();
        permits <= queue.free_permits(limit).saturating_sub(claimed_by_queue)
    }

    fn runnable<'a>(&self, queue: &'a UnitQueue, limit: u32) -> Vec<&'a ConsumerInstance> {
        let mut free = queue.free_permits(limit);
        let mut runnable = Vec::new();
        for consumer in queue.blocked() {
            if free == 0 {
                break;
            }
            if consumer.permits <= free {
                free -= consumer.permits;
                runnable.push(consumer);
            }
        }
        runnable
    }
}
