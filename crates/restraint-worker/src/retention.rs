use chrono::{Duration, Utc};
use std::sync::Arc;

use restraint_core::ConstraintStore;

/// Deletes FINISHED consumers once they are older than the retention period.
#[derive(Clone)]
pub struct RetentionSweeper {
    store: Arc<dyn ConstraintStore>,
    retention_days: i64,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn ConstraintStore>, retention_days: i64) -> Self {
        Self {
            store,
            retention_days,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.retention_days > 0
    }

    #[tracing::instrument(skip(self), fields(retention_days = self.retention_days))]
    pub async fn run_once(&self) -> anyhow::Result<u64> {
        if !self.is_enabled() {
            return Ok(0);
        }

        let cutoff = Utc::now() - Duration::days(self.retention_days);
        let deleted = self.store.delete_finished_before(cutoff).await?;

        tracing::info!(deleted, cutoff = %cutoff, "Finished consumer cleanup completed");
        Ok(deleted)
    }
}
