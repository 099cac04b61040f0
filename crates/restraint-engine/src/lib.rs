//! Restraint Engine
//!
//! Admission control over the constraint store: consumers request a slot on a
//! resource unit, are admitted or queued in order, and are promoted when holders
//! finish. The engine is stateless apart from an immutable spec cache, so any
//! number of instances may share one store.

pub mod engine;
pub mod notify;
pub mod registry;
pub mod trigger;

pub use engine::{
    Admission, AdmissionRequest, ConstraintEngine, EngineConfig, FinishOutcome, RebalanceReport,
};
pub use notify::{ActivationReceiver, ChannelNotifier, NoopNotifier};
pub use registry::{ConsumerRegistry, StoreRegistry};
pub use trigger::{ProcessOutcome, ReleaseStatusSource, ReleaseTrigger};
