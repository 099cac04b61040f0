//! Error types module
//!
//! Every failure of the constraint store and the admission engine is expressed as a
//! `RestraintError`. Variants split into three groups:
//!
//! - benign races (`NotFound`, `StaleStateConflict`, `CapacityExhausted`,
//!   `OrderConflict`, `DuplicateConsumer`): expected outcomes of concurrent
//!   rebalancing, absorbed by the engine and never surfaced to callers;
//! - transient failures (`StoreUnavailable`, `Contention`): surfaced, retryable;
//! - configuration errors (`UnknownConstraint`, `InvalidPermits`, `InvalidSpec`):
//!   surfaced, not retryable.
//!
//! `From<sqlx::Error>` is gated behind the `sqlx` feature.

use crate::models::{ConstraintId, ConsumerId, ConsumerState, ResourceUnit};

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

pub type RestraintResult<T> = Result<T, RestraintError>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected races and retries
    Debug,
    /// Warning level - for recoverable issues
    Warn,
    /// Error level - for unexpected failures and misconfiguration
    Error,
}

#[derive(Debug, thiserror::Error)]
pub enum RestraintError {
    #[error("Consumer not found: {0}")]
    NotFound(ConsumerId),

    #[error("Consumer {consumer_id} is {actual}, expected one of {expected:?}")]
    StaleStateConflict {
        consumer_id: ConsumerId,
        actual: ConsumerState,
        expected: Vec<ConsumerState>,
    },

    #[error("Capacity exhausted for constraint {constraint_id} on resource unit {resource_unit}")]
    CapacityExhausted {
        constraint_id: ConstraintId,
        resource_unit: ResourceUnit,
    },

    #[error("Order {order} is no longer the next order on resource unit {resource_unit}")]
    OrderConflict {
        resource_unit: ResourceUnit,
        order: i64,
    },

    #[error("Consumer already registered: {0}")]
    DuplicateConsumer(ConsumerId),

    #[error("Constraint store unavailable: {0}")]
    StoreUnavailable(#[source] BoxError),

    #[error("Admission on resource unit {resource_unit} still contended after {attempts} attempts")]
    Contention {
        resource_unit: ResourceUnit,
        attempts: u32,
    },

    #[error("Unknown constraint: {0}")]
    UnknownConstraint(ConstraintId),

    #[error("Invalid permits: requested {requested}, constraint allows {limit}")]
    InvalidPermits { requested: u32, limit: u32 },

    #[error("Invalid constraint specification: {0}")]
    InvalidSpec(String),
}

impl RestraintError {
    /// Wraps any storage-layer failure as a transient store error.
    pub fn store(err: impl Into<BoxError>) -> Self {
        RestraintError::StoreUnavailable(err.into())
    }

    /// Machine-readable error code (e.g., "STORE_UNAVAILABLE")
    pub fn error_code(&self) -> &'static str {
        error_static_metadata(self).0
    }

    /// Whether the failed operation may succeed when retried.
    pub fn is_recoverable(&self) -> bool {
        error_static_metadata(self).1
    }

    /// Whether this is an expected outcome of concurrent callers racing on the same
    /// consumer or unit.
    pub fn is_benign_race(&self) -> bool {
        error_static_metadata(self).2
    }

    /// Log level for this error
    pub fn log_level(&self) -> LogLevel {
        error_static_metadata(self).3
    }
}

/// Static metadata for each variant: (error_code, recoverable, benign_race, log_level).
fn error_static_metadata(err: &RestraintError) -> (&'static str, bool, bool, LogLevel) {
    match err {
        RestraintError::NotFound(_) => ("CONSUMER_NOT_FOUND", false, true, LogLevel::Warn),
        RestraintError::StaleStateConflict { .. } => {
            ("STALE_STATE_CONFLICT", false, true, LogLevel::Debug)
        }
        RestraintError::CapacityExhausted { .. } => {
            ("CAPACITY_EXHAUSTED", true, true, LogLevel::Debug)
        }
        RestraintError::OrderConflict { .. } => ("ORDER_CONFLICT", true, true, LogLevel::Debug),
        RestraintError::DuplicateConsumer(_) => {
            ("DUPLICATE_CONSUMER", false, true, LogLevel::Debug)
        }
        RestraintError::StoreUnavailable(_) => ("STORE_UNAVAILABLE", true, false, LogLevel::Error),
        RestraintError::Contention { .. } => ("ADMISSION_CONTENTION", true, false, LogLevel::Warn),
        RestraintError::UnknownConstraint(_) => {
            ("UNKNOWN_CONSTRAINT", false, false, LogLevel::Error)
        }
        RestraintError::InvalidPermits { .. } => {
            ("INVALID_PERMITS", false, false, LogLevel::Error)
        }
        RestraintError::InvalidSpec(_) => ("INVALID_SPEC", false, false, LogLevel::Error),
    }
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for RestraintError {
    fn from(err: SqlxError) -> Self {
        RestraintError::StoreUnavailable(Box::new(err))
    }
}

impl From<anyhow::Error> for RestraintError {
    fn from(err: anyhow::Error) -> Self {
        RestraintError::StoreUnavailable(err.into())
    }
}
