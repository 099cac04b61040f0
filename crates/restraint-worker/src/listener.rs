//! Release-event listener: finishes consumers as their release entities reach a
//! releasing status, with capped exponential backoff on transient failures.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use restraint_core::models::ReleaseEvent;
use restraint_core::{RestraintError, RestraintResult};
use restraint_db::RELEASE_EVENT_CHANNEL;
use restraint_engine::{FinishOutcome, ReleaseTrigger};

/// Maximum delay before retrying a release event.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

const LISTEN_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Producer side of the release-event channel consumed by the worker.
pub type ReleaseEventSender = mpsc::Sender<ReleaseEvent>;

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
#[inline]
pub fn compute_retry_backoff(attempt: u32, base: Duration) -> Duration {
    let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor)
        .unwrap_or(MAX_RETRY_BACKOFF)
        .min(MAX_RETRY_BACKOFF)
}

#[derive(Clone)]
pub struct ReleaseListener {
    trigger: ReleaseTrigger,
    max_attempts: u32,
    retry_base: Duration,
}

impl ReleaseListener {
    pub fn new(trigger: ReleaseTrigger, max_attempts: u32, retry_base: Duration) -> Self {
        Self {
            trigger,
            max_attempts: max_attempts.max(1),
            retry_base,
        }
    }

    /// Applies one release event, retrying recoverable errors.
    #[tracing::instrument(
        skip(self, event),
        fields(release_entity_id = %event.release_entity_id, status = %event.status)
    )]
    pub async fn handle(&self, event: &ReleaseEvent) -> RestraintResult<Vec<FinishOutcome>> {
        let mut attempt = 0;
        loop {
            match self.trigger.on_event(event).await {
                Ok(outcomes) => return Ok(outcomes),
                Err(e) if e.is_recoverable() && attempt + 1 < self.max_attempts => {
                    let backoff = compute_retry_backoff(attempt, self.retry_base);
                    tracing::warn!(
                        error = %e,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "Release event failed, scheduling retry"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drains `events` until the channel closes or shutdown is signalled.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<ReleaseEvent>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!(
            max_attempts = self.max_attempts,
            "Release listener started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Release listener shutting down");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::info!("Release event channel closed");
                        break;
                    };
                    match self.handle(&event).await {
                        Ok(outcomes) => {
                            if !outcomes.is_empty() {
                                tracing::debug!(
                                    release_entity_id = %event.release_entity_id,
                                    finished = outcomes.len(),
                                    "Release event applied"
                                );
                            }
                        }
                        Err(e) => log_dropped_event(&event, &e),
                    }
                }
            }
        }

        tracing::info!("Release listener stopped");
    }
}

fn log_dropped_event(event: &ReleaseEvent, err: &RestraintError) {
    tracing::error!(
        error = %err,
        error_code = err.error_code(),
        release_entity_id = %event.release_entity_id,
        status = %event.status,
        "Release event dropped, reconciler will retry"
    );
}

/// Forwards release events published with NOTIFY on the release channel into
/// `tx`, reconnecting whenever the listener connection fails.
pub fn spawn_pg_release_listener(pool: sqlx::PgPool, tx: ReleaseEventSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match sqlx::postgres::PgListener::connect_with(&pool).await {
                Ok(mut listener) => {
                    if let Err(e) = listener.listen(RELEASE_EVENT_CHANNEL).await {
                        tracing::warn!(error = %e, "LISTEN failed, will retry");
                        tokio::time::sleep(LISTEN_RECONNECT_DELAY).await;
                        continue;
                    }
                    tracing::info!(channel = RELEASE_EVENT_CHANNEL, "Listening for release events");

                    while let Ok(notification) = listener.recv().await {
                        match serde_json::from_str::<ReleaseEvent>(notification.payload()) {
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    tracing::debug!("Release event receiver dropped, stopping LISTEN");
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    error = %e,
                                    payload = notification.payload(),
                                    "Ignoring malformed release event"
                                );
                            }
                        }
                    }
                    tracing::warn!("PgListener connection lost, reconnecting");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "PgListener connect failed, will retry");
                    tokio::time::sleep(LISTEN_RECONNECT_DELAY).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_exponential_then_capped() {
        let base = Duration::from_millis(500);
        assert_eq!(compute_retry_backoff(0, base), Duration::from_millis(500));
        assert_eq!(compute_retry_backoff(1, base), Duration::from_secs(1));
        assert_eq!(compute_retry_backoff(3, base), Duration::from_secs(4));
        assert_eq!(compute_retry_backoff(6, base), MAX_RETRY_BACKOFF);
        assert_eq!(compute_retry_backoff(40, base), MAX_RETRY_BACKOFF);
    }
}
