//! Data models for resource constraints
//!
//! Constraint definitions, consumers and their lifecycle, per-unit queue snapshots
//! and the release-entity statuses that drive consumers to FINISHED.

mod constraint;
mod consumer;
mod ids;
mod queue;
mod release;

pub use constraint::*;
pub use consumer::*;
pub use ids::*;
pub use queue::*;
pub use release::*;
