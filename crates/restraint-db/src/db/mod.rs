//! Postgres repositories
//
// Constraint and consumer persistence
pub mod store;
//
// LISTEN/NOTIFY channels
pub mod notify;

pub use notify::{
    notify_release_event, PgActivationNotifier, ACTIVATION_CHANNEL, RELEASE_EVENT_CHANNEL,
};
pub use store::PgConstraintStore;
