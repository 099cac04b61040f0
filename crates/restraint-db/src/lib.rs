//! Restraint Database Layer
//!
//! Constraint store implementations: the Postgres store used in production, an
//! in-memory store with the same contract for tests and embedded use, and the
//! Postgres NOTIFY side channel for activations and release events.

pub mod db;
pub mod memory;

pub use db::{
    notify_release_event, PgActivationNotifier, PgConstraintStore, ACTIVATION_CHANNEL,
    RELEASE_EVENT_CHANNEL,
};
pub use memory::MemoryConstraintStore;

/// Embedded schema migrations for the Postgres store.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");
