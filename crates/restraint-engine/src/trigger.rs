//! Release trigger
//!
//! Maps the lifecycle of external work items (release entities) onto consumer
//! completion: once a release entity reaches a status that releases resources,
//! every consumer it holds or waits with is finished and its units rebalanced.

use async_trait::async_trait;
use std::sync::Arc;

use restraint_core::models::{ConsumerInstance, ConsumerState, ReleaseEvent, ReleaseStatus};
use restraint_core::{RestraintError, RestraintResult};

use crate::engine::{ConstraintEngine, FinishOutcome, RebalanceReport};

/// Looks up the current status of a release entity, `None` when it is unknown.
#[async_trait]
pub trait ReleaseStatusSource: Send + Sync {
    async fn status(&self, release_entity_id: &str) -> anyhow::Result<Option<ReleaseStatus>>;
}

/// What `process_instance` did with one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Rebalanced(RebalanceReport),
    Finished(FinishOutcome),
    Unchanged,
}

#[derive(Clone)]
pub struct ReleaseTrigger {
    engine: ConstraintEngine,
    status_source: Option<Arc<dyn ReleaseStatusSource>>,
}

impl ReleaseTrigger {
    pub fn new(engine: ConstraintEngine) -> Self {
        Self {
            engine,
            status_source: None,
        }
    }

    pub fn with_status_source(mut self, source: Arc<dyn ReleaseStatusSource>) -> Self {
        self.status_source = Some(source);
        self
    }

    pub fn engine(&self) -> &ConstraintEngine {
        &self.engine
    }

    /// Finishes the release entity's consumers when `status` releases resources.
    #[tracing::instrument(skip(self))]
    pub async fn on_status(
        &self,
        release_entity_id: &str,
        status: ReleaseStatus,
    ) -> RestraintResult<Vec<FinishOutcome>> {
        if !status.releases_resources() {
            tracing::debug!("Status keeps resources, nothing to release");
            return Ok(Vec::new());
        }
        self.engine.finish_release_entity(release_entity_id).await
    }

    pub async fn on_event(&self, event: &ReleaseEvent) -> RestraintResult<Vec<FinishOutcome>> {
        self.on_status(&event.release_entity_id, event.status).await
    }

    /// Re-evaluates one consumer: a BLOCKED consumer gets its unit rebalanced, an
    /// ACTIVE one is finished when its release entity no longer needs it.
    #[tracing::instrument(
        skip(self, consumer),
        fields(consumer_id = %consumer.id, state = %consumer.state)
    )]
    pub async fn process_instance(
        &self,
        consumer: &ConsumerInstance,
    ) -> RestraintResult<ProcessOutcome> {
        match consumer.state {
            ConsumerState::Blocked => {
                let report = self
                    .engine
                    .rebalance(&consumer.constraint_id, &consumer.resource_unit)
                    .await?;
                Ok(ProcessOutcome::Rebalanced(report))
            }
            ConsumerState::Active => {
                let Some(source) = &self.status_source else {
                    return Ok(ProcessOutcome::Unchanged);
                };
                let status = source
                    .status(&consumer.release_entity_id)
                    .await
                    .map_err(RestraintError::from)?;

                match status {
                    Some(status) if status.releases_resources() => {
                        tracing::info!(
                            release_entity_id = %consumer.release_entity_id,
                            status = %status,
                            "Release entity done, finishing active consumer"
                        );
                        let outcome = self.engine.finish(&consumer.id).await?;
                        Ok(ProcessOutcome::Finished(outcome))
                    }
                    Some(_) => Ok(ProcessOutcome::Unchanged),
                    None => {
                        tracing::warn!(
                            release_entity_id = %consumer.release_entity_id,
                            "Release entity unknown to status source, leaving consumer active"
                        );
                        Ok(ProcessOutcome::Unchanged)
                    }
                }
            }
            ConsumerState::Finished => Ok(ProcessOutcome::Unchanged),
        }
    }
}
