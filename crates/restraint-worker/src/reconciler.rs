//! Periodic restraint processing: walks every BLOCKED and ACTIVE consumer and
//! re-applies the release rules, so a lost release event or an engine that died
//! between finishing a holder and rebalancing never strands a queue.

use std::collections::HashSet;
use std::sync::Arc;

use restraint_core::models::{ConstraintId, ConsumerId, ConsumerState, ResourceUnit};
use restraint_core::ConstraintStore;
use restraint_engine::{FinishOutcome, ProcessOutcome, ReleaseTrigger};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub scanned: usize,
    pub rebalanced_units: usize,
    pub activated: usize,
    pub finished: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ConstraintStore>,
    trigger: ReleaseTrigger,
    batch_size: usize,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ConstraintStore>, trigger: ReleaseTrigger, batch_size: usize) -> Self {
        Self {
            store,
            trigger,
            batch_size: batch_size.max(1),
        }
    }

    /// One full sweep. Each (constraint, unit) with BLOCKED consumers is
    /// rebalanced once per sweep; failures on single consumers are counted and
    /// logged, never abort the sweep.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> anyhow::Result<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        let mut seen_units: HashSet<(ConstraintId, ResourceUnit)> = HashSet::new();
        let mut after: Option<ConsumerId> = None;

        loop {
            let page = self
                .store
                .list_active_and_blocked_page(self.batch_size, after.as_ref())
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());
            let page_len = page.len();

            for consumer in page {
                stats.scanned += 1;
                if consumer.state == ConsumerState::Blocked
                    && !seen_units
                        .insert((consumer.constraint_id.clone(), consumer.resource_unit.clone()))
                {
                    continue;
                }

                match self.trigger.process_instance(&consumer).await {
                    Ok(ProcessOutcome::Rebalanced(report)) => {
                        stats.rebalanced_units += 1;
                        stats.activated += report.activated.len();
                    }
                    Ok(ProcessOutcome::Finished(FinishOutcome::Finished(_))) => {
                        stats.finished += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        stats.errors += 1;
                        tracing::error!(
                            error = %e,
                            consumer_id = %consumer.id,
                            resource_unit = %consumer.resource_unit,
                            "Failed to reconcile consumer"
                        );
                    }
                }
            }

            if page_len < self.batch_size {
                break;
            }
        }

        if stats.activated > 0 || stats.finished > 0 || stats.errors > 0 {
            tracing::info!(
                scanned = stats.scanned,
                rebalanced_units = stats.rebalanced_units,
                activated = stats.activated,
                finished = stats.finished,
                errors = stats.errors,
                "Reconcile sweep completed"
            );
        } else {
            tracing::debug!(scanned = stats.scanned, "Reconcile sweep found nothing to do");
        }

        Ok(stats)
    }
}
