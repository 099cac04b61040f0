//! Restraint Worker
//!
//! Background loops around the admission engine: the release-event listener that
//! finishes consumers when their release entity completes, the reconciler that
//! heals queues a crashed engine left behind, and the retention sweeper for
//! FINISHED consumers. `restraintd` hosts them in one process.

pub mod config;
pub mod listener;
pub mod reconciler;
pub mod retention;
pub mod telemetry;
pub mod worker;

pub use config::WorkerConfig;
pub use listener::{
    compute_retry_backoff, spawn_pg_release_listener, ReleaseEventSender, ReleaseListener,
    MAX_RETRY_BACKOFF,
};
pub use reconciler::{ReconcileStats, Reconciler};
pub use retention::RetentionSweeper;
pub use telemetry::init_telemetry;
pub use worker::RestraintWorker;
