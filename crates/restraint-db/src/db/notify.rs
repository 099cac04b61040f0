//! Postgres NOTIFY channels
//!
//! Activations are published on [`ACTIVATION_CHANNEL`] for executors that LISTEN
//! instead of sharing a process with the engine. Release events arrive on
//! [`RELEASE_EVENT_CHANNEL`] and are consumed by the worker.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;

use restraint_core::models::ReleaseEvent;
use restraint_core::{ActivationEvent, ActivationNotifier};

pub const ACTIVATION_CHANNEL: &str = "restraint_consumer_activated";
pub const RELEASE_EVENT_CHANNEL: &str = "restraint_release_event";

#[derive(Clone)]
pub struct PgActivationNotifier {
    pool: PgPool,
}

impl PgActivationNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActivationNotifier for PgActivationNotifier {
    async fn consumer_activated(&self, event: &ActivationEvent) -> anyhow::Result<()> {
        let payload =
            serde_json::to_string(event).context("Failed to serialize activation event")?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(ACTIVATION_CHANNEL)
            .bind(&payload)
            .execute(&self.pool)
            .await
            .context("Failed to send pg_notify for consumer activation")?;

        tracing::debug!(
            consumer_id = %event.consumer_id,
            resource_unit = %event.resource_unit,
            "Activation notification sent"
        );

        Ok(())
    }
}

/// Publishes a release event for the worker's LISTEN loop.
pub async fn notify_release_event(pool: &PgPool, event: &ReleaseEvent) -> anyhow::Result<()> {
    let payload = serde_json::to_string(event).context("Failed to serialize release event")?;

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(RELEASE_EVENT_CHANNEL)
        .bind(&payload)
        .execute(pool)
        .await
        .context("Failed to send pg_notify for release event")?;

    Ok(())
}
