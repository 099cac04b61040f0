//! Admission engine
//!
//! `ConstraintEngine` turns admission requests into BLOCKED or ACTIVE consumers,
//! finishes consumers and promotes queued consumers into freed capacity. All
//! coordination goes through the store's conditional writes:
//!
//! - a new consumer takes `max_order + 1` for its unit; losing that race to a
//!   concurrent admission re-reads and retries, up to `max_admission_attempts`;
//! - activation is `transition(BLOCKED -> ACTIVE)` guarded by the constraint's
//!   capacity, so concurrent rebalances of one unit can never over-activate;
//! - finishing is `transition({ACTIVE, BLOCKED} -> FINISHED)`, so repeated or
//!   concurrent finishes of one consumer are harmless.
//!
//! Cascading is event driven: every finish rebalances the consumer's unit once,
//! and a rebalance only loops to recover from lost races, bounded by the number of
//! BLOCKED consumers it first observed.

use serde::Serialize;
use std::sync::Arc;

use restraint_core::models::{
    ConstraintId, ConstraintSpec, ConsumerId, ConsumerInstance, ConsumerState, ConsumerStatus,
    ResourceUnit, UnitStatus,
};
use restraint_core::{
    ActivationEvent, ActivationNotifier, ConstraintStore, RestraintConfig, RestraintError,
    RestraintResult,
};

use crate::registry::{ConsumerRegistry, StoreRegistry};

const DEFAULT_MAX_ADMISSION_ATTEMPTS: u32 = 8;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_admission_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_admission_attempts: DEFAULT_MAX_ADMISSION_ATTEMPTS,
        }
    }
}

impl From<&RestraintConfig> for EngineConfig {
    fn from(config: &RestraintConfig) -> Self {
        Self {
            max_admission_attempts: config.max_admission_attempts.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub constraint_id: ConstraintId,
    pub resource_unit: ResourceUnit,
    pub consumer_id: ConsumerId,
    pub release_entity_id: String,
    pub permits: u32,
}

impl AdmissionRequest {
    /// Single-permit request.
    pub fn new(
        constraint_id: impl Into<ConstraintId>,
        resource_unit: impl Into<ResourceUnit>,
        consumer_id: impl Into<ConsumerId>,
        release_entity_id: impl Into<String>,
    ) -> Self {
        Self {
            constraint_id: constraint_id.into(),
            resource_unit: resource_unit.into(),
            consumer_id: consumer_id.into(),
            release_entity_id: release_entity_id.into(),
            permits: 1,
        }
    }

    pub fn with_permits(mut self, permits: u32) -> Self {
        self.permits = permits;
        self
    }
}

/// Result of an admission request. `state` is ACTIVE when the caller may proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub state: ConsumerState,
    pub order: i64,
    pub consumer: ConsumerInstance,
}

impl Admission {
    pub fn is_active(&self) -> bool {
        self.state == ConsumerState::Active
    }
}

impl From<ConsumerInstance> for Admission {
    fn from(consumer: ConsumerInstance) -> Self {
        Self {
            state: consumer.state,
            order: consumer.order,
            consumer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The consumer moved to FINISHED on this call.
    Finished(ConsumerInstance),
    /// The consumer was already FINISHED; nothing changed.
    AlreadyFinished(ConsumerInstance),
    /// No consumer with this id exists.
    NotFound(ConsumerId),
}

impl FinishOutcome {
    pub fn consumer(&self) -> Option<&ConsumerInstance> {
        match self {
            FinishOutcome::Finished(c) | FinishOutcome::AlreadyFinished(c) => Some(c),
            FinishOutcome::NotFound(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    /// Consumers activated by this rebalance, in activation order.
    pub activated: Vec<ConsumerInstance>,
    /// Candidates another caller had already activated or finished.
    pub lost_races: u32,
    pub passes: u32,
}

#[derive(Clone)]
pub struct ConstraintEngine {
    registry: Arc<dyn ConsumerRegistry>,
    notifier: Arc<dyn ActivationNotifier>,
    config: EngineConfig,
}

impl ConstraintEngine {
    pub fn new(
        registry: Arc<dyn ConsumerRegistry>,
        notifier: Arc<dyn ActivationNotifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            notifier,
            config,
        }
    }

    /// Engine over a [`StoreRegistry`] for `store`.
    pub fn with_store(
        store: Arc<dyn ConstraintStore>,
        notifier: Arc<dyn ActivationNotifier>,
        config: EngineConfig,
    ) -> Self {
        Self::new(Arc::new(StoreRegistry::new(store)), notifier, config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[tracing::instrument(skip(self, spec), fields(constraint_id = %spec.id))]
    pub async fn register_constraint(&self, spec: &ConstraintSpec) -> RestraintResult<ConstraintSpec> {
        let stored = self.registry.register(spec).await?;
        tracing::info!(
            max_concurrent = stored.max_concurrent,
            strategy = %stored.strategy,
            "Constraint registered"
        );
        Ok(stored)
    }

    async fn require_spec(&self, constraint_id: &ConstraintId) -> RestraintResult<ConstraintSpec> {
        self.registry
            .spec(constraint_id)
            .await?
            .ok_or_else(|| RestraintError::UnknownConstraint(constraint_id.clone()))
    }

    /// Registers a consumer on a resource unit, ACTIVE if the strategy admits it
    /// right away, BLOCKED with the next order otherwise.
    ///
    /// Never waits for capacity. Requests for an already registered consumer id
    /// return the existing consumer unchanged.
    #[tracing::instrument(
        skip(self, request),
        fields(
            constraint_id = %request.constraint_id,
            resource_unit = %request.resource_unit,
            consumer_id = %request.consumer_id,
            permits = request.permits
        )
    )]
    pub async fn request_admission(&self, request: AdmissionRequest) -> RestraintResult<Admission> {
        let spec = self.require_spec(&request.constraint_id).await?;
        spec.check_permits(request.permits)?;
        let policy = spec.strategy.policy();
        let attempts = self.config.max_admission_attempts.max(1);

        for attempt in 1..=attempts {
            if let Some(existing) = self.registry.consumer(&request.consumer_id).await? {
                tracing::debug!(
                    state = %existing.state,
                    order = existing.order,
                    "Consumer already registered, returning existing admission"
                );
                return self.settle_existing(existing).await;
            }

            let queue = self
                .registry
                .list_active_and_blocked(&spec.id, &request.resource_unit)
                .await?;
            let max_order = self.registry.max_order(&request.resource_unit).await?;
            let state = if policy.admits_immediately(&queue, request.permits, spec.max_concurrent)
            {
                ConsumerState::Active
            } else {
                ConsumerState::Blocked
            };

            let candidate = ConsumerInstance::new(
                request.consumer_id.clone(),
                spec.id.clone(),
                request.resource_unit.clone(),
                max_order + 1,
                state,
                request.permits,
                request.release_entity_id.clone(),
            )?;

            match self
                .registry
                .insert(&candidate, Some(spec.max_concurrent))
                .await
            {
                Ok(consumer) if consumer.is_active() => {
                    tracing::info!(order = consumer.order, "Consumer admitted");
                    return Ok(Admission::from(consumer));
                }
                Ok(consumer) => {
                    tracing::info!(
                        order = consumer.order,
                        active = queue.active_count(),
                        blocked = queue.blocked_count(),
                        "Consumer queued"
                    );
                    if queue.free_permits(spec.max_concurrent) > 0 {
                        return self.settle_queued(consumer).await;
                    }
                    return Ok(Admission::from(consumer));
                }
                Err(RestraintError::DuplicateConsumer(_)) => {
                    tracing::debug!(attempt, "Consumer registered concurrently");
                }
                Err(
                    err @ (RestraintError::OrderConflict { .. }
                    | RestraintError::CapacityExhausted { .. }),
                ) => {
                    tracing::debug!(
                        attempt,
                        error = %err,
                        "Admission lost a race, re-reading unit"
                    );
                }
                Err(err) => return Err(err),
            }

            tokio::task::yield_now().await;
        }

        if let Some(existing) = self.registry.consumer(&request.consumer_id).await? {
            return self.settle_existing(existing).await;
        }

        tracing::warn!(attempts, "Admission still contended, giving up");
        Err(RestraintError::Contention {
            resource_unit: request.resource_unit,
            attempts,
        })
    }

    /// A retried admission of a BLOCKED consumer rebalances its unit, in case the
    /// rebalance of an earlier attempt failed.
    async fn settle_existing(&self, existing: ConsumerInstance) -> RestraintResult<Admission> {
        if existing.is_blocked() {
            return self.settle_queued(existing).await;
        }
        Ok(Admission::from(existing))
    }

    /// Queued behind consumers while capacity is free: heal the unit and report
    /// the consumer's state afterwards.
    async fn settle_queued(&self, consumer: ConsumerInstance) -> RestraintResult<Admission> {
        self.rebalance(&consumer.constraint_id, &consumer.resource_unit)
            .await?;
        let current = self
            .registry
            .consumer(&consumer.id)
            .await?
            .unwrap_or(consumer);
        Ok(Admission::from(current))
    }

    /// Moves a BLOCKED or ACTIVE consumer to FINISHED and promotes queued
    /// consumers of its unit. Finishing a BLOCKED consumer cancels its request.
    ///
    /// An already FINISHED consumer still triggers a rebalance, so a retried
    /// release repairs a unit whose earlier rebalance failed.
    #[tracing::instrument(skip(self))]
    pub async fn finish(&self, consumer_id: &ConsumerId) -> RestraintResult<FinishOutcome> {
        match self
            .registry
            .transition(
                consumer_id,
                &ConsumerState::NON_TERMINAL,
                ConsumerState::Finished,
                None,
            )
            .await
        {
            Ok(consumer) => {
                tracing::info!(
                    resource_unit = %consumer.resource_unit,
                    order = consumer.order,
                    "Consumer finished"
                );
                self.rebalance(&consumer.constraint_id, &consumer.resource_unit)
                    .await?;
                Ok(FinishOutcome::Finished(consumer))
            }
            Err(RestraintError::StaleStateConflict { .. }) => {
                match self.registry.consumer(consumer_id).await? {
                    Some(consumer) => {
                        tracing::debug!(
                            state = %consumer.state,
                            "Consumer already finished"
                        );
                        self.rebalance(&consumer.constraint_id, &consumer.resource_unit)
                            .await?;
                        Ok(FinishOutcome::AlreadyFinished(consumer))
                    }
                    None => Ok(FinishOutcome::NotFound(consumer_id.clone())),
                }
            }
            Err(RestraintError::NotFound(_)) => {
                tracing::warn!("Finish requested for unknown consumer");
                Ok(FinishOutcome::NotFound(consumer_id.clone()))
            }
            Err(err) => Err(err),
        }
    }

    /// Activates queued consumers of one (constraint, unit) into its free capacity,
    /// in the order the constraint's strategy dictates.
    #[tracing::instrument(skip(self))]
    pub async fn rebalance(
        &self,
        constraint_id: &ConstraintId,
        resource_unit: &ResourceUnit,
    ) -> RestraintResult<RebalanceReport> {
        let spec = self.require_spec(constraint_id).await?;
        let policy = spec.strategy.policy();
        let mut report = RebalanceReport::default();
        let mut max_passes: Option<u32> = None;

        loop {
            report.passes += 1;
            let queue = self
                .registry
                .list_active_and_blocked(constraint_id, resource_unit)
                .await?;
            let blocked = queue.blocked_count();
            let max_passes =
                *max_passes.get_or_insert(u32::try_from(blocked).unwrap_or(u32::MAX));

            if blocked == 0 {
                break;
            }
            let runnable = policy.runnable(&queue, spec.max_concurrent);
            if runnable.is_empty() {
                break;
            }

            let mut lost_race = false;
            let mut exhausted = false;
            for candidate in runnable {
                match self
                    .registry
                    .transition(
                        &candidate.id,
                        &[ConsumerState::Blocked],
                        ConsumerState::Active,
                        Some(spec.max_concurrent),
                    )
                    .await
                {
                    Ok(activated) => {
                        tracing::info!(
                            consumer_id = %activated.id,
                            order = activated.order,
                            release_entity_id = %activated.release_entity_id,
                            "Consumer activated"
                        );
                        self.notify_activated(&activated).await;
                        report.activated.push(activated);
                    }
                    Err(
                        err @ (RestraintError::StaleStateConflict { .. }
                        | RestraintError::NotFound(_)),
                    ) => {
                        tracing::debug!(
                            consumer_id = %candidate.id,
                            error = %err,
                            "Candidate changed concurrently, skipping"
                        );
                        report.lost_races += 1;
                        lost_race = true;
                    }
                    Err(RestraintError::CapacityExhausted { .. }) => {
                        tracing::debug!(
                            consumer_id = %candidate.id,
                            "Capacity taken concurrently, stopping pass"
                        );
                        report.lost_races += 1;
                        exhausted = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }

            if exhausted || !lost_race || report.passes >= max_passes {
                break;
            }
        }

        if !report.activated.is_empty() {
            tracing::debug!(
                activated = report.activated.len(),
                lost_races = report.lost_races,
                passes = report.passes,
                "Rebalance complete"
            );
        }

        Ok(report)
    }

    async fn notify_activated(&self, consumer: &ConsumerInstance) {
        let event = ActivationEvent::from(consumer);
        if let Err(e) = self.notifier.consumer_activated(&event).await {
            tracing::warn!(
                error = %e,
                consumer_id = %consumer.id,
                "Failed to deliver activation notification, consumer stays active"
            );
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_consumer_state(
        &self,
        consumer_id: &ConsumerId,
    ) -> RestraintResult<Option<ConsumerStatus>> {
        Ok(self
            .registry
            .consumer(consumer_id)
            .await?
            .map(|c| c.status()))
    }

    /// Whether anyone holds or waits for capacity on a unit.
    #[tracing::instrument(skip(self))]
    pub async fn unit_status(
        &self,
        constraint_id: &ConstraintId,
        resource_unit: &ResourceUnit,
    ) -> RestraintResult<UnitStatus> {
        let spec = self.require_spec(constraint_id).await?;
        let queue = self
            .registry
            .list_active_and_blocked(constraint_id, resource_unit)
            .await?;
        Ok(queue.status(spec.max_concurrent))
    }

    /// Finishes every BLOCKED and ACTIVE consumer tied to one external work item.
    #[tracing::instrument(skip(self))]
    pub async fn finish_release_entity(
        &self,
        release_entity_id: &str,
    ) -> RestraintResult<Vec<FinishOutcome>> {
        let consumers = self
            .registry
            .consumers_for_release_entity(release_entity_id)
            .await?;

        let mut outcomes = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            outcomes.push(self.finish(&consumer.id).await?);
        }

        if !outcomes.is_empty() {
            tracing::info!(
                finished = outcomes.len(),
                "Released consumers of release entity"
            );
        }
        Ok(outcomes)
    }
}
