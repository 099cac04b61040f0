//! Restraint Core Library
//!
//! This crate provides the domain models, the persistence contract, error types and
//! configuration shared by every Restraint component: the store implementations,
//! the admission engine and the background worker.

pub mod config;
pub mod error;
pub mod models;
pub mod notify;
pub mod store;
pub mod strategy;

// Re-export commonly used types
pub use config::{parse_constraints, LogFormat, RestraintConfig};
pub use error::{LogLevel, RestraintError, RestraintResult};
pub use notify::{ActivationEvent, ActivationNotifier};
pub use store::ConstraintStore;
pub use strategy::{AdmissionPolicy, AsapPolicy, FifoPolicy};
