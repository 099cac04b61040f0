//! Worker host: spawns the release listener, the optional Postgres LISTEN loop,
//! the reconciler and the retention sweeper, and stops them together.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use restraint_core::ConstraintStore;
use restraint_engine::{ConstraintEngine, ReleaseStatusSource, ReleaseTrigger};

use crate::config::WorkerConfig;
use crate::listener::{spawn_pg_release_listener, ReleaseEventSender, ReleaseListener};
use crate::reconciler::Reconciler;
use crate::retention::RetentionSweeper;

pub struct RestraintWorker {
    instance_id: String,
    events_tx: ReleaseEventSender,
    shutdown_txs: Vec<mpsc::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
    pg_listener: Option<JoinHandle<()>>,
}

impl RestraintWorker {
    /// Spawns the background loops.
    ///
    /// With `pool` set and `listen_notify_enabled`, release events published on
    /// the Postgres release channel are consumed in addition to those sent
    /// through [`RestraintWorker::release_events`]. Without a `status_source`, the
    /// reconciler only heals BLOCKED queues.
    pub fn start(
        engine: ConstraintEngine,
        store: Arc<dyn ConstraintStore>,
        status_source: Option<Arc<dyn ReleaseStatusSource>>,
        config: WorkerConfig,
        pool: Option<sqlx::PgPool>,
    ) -> Self {
        let instance_id = worker_instance_id();
        let mut trigger = ReleaseTrigger::new(engine);
        if let Some(source) = status_source {
            trigger = trigger.with_status_source(source);
        }

        tracing::info!(
            worker_id = %instance_id,
            reconcile_interval_secs = config.reconcile_interval_secs,
            retention_days = config.retention_days,
            listen_notify = config.listen_notify_enabled && pool.is_some(),
            "Restraint worker starting"
        );

        let mut shutdown_txs = Vec::new();
        let mut handles = Vec::new();

        let (events_tx, events_rx) = mpsc::channel(config.release_channel_capacity.max(1));
        let (listener_shutdown_tx, listener_shutdown_rx) = mpsc::channel(1);
        let listener = ReleaseListener::new(
            trigger.clone(),
            config.release_max_attempts,
            config.release_retry_base,
        );
        handles.push(tokio::spawn(
            listener.run(events_rx, listener_shutdown_rx),
        ));
        shutdown_txs.push(listener_shutdown_tx);

        let pg_listener = match pool {
            Some(pool) if config.listen_notify_enabled => {
                Some(spawn_pg_release_listener(pool, events_tx.clone()))
            }
            _ => None,
        };

        if config.reconcile_interval_secs > 0 {
            let reconciler = Reconciler::new(store.clone(), trigger, config.reconcile_batch_size);
            let period = Duration::from_secs(config.reconcile_interval_secs);
            let (tx, mut shutdown_rx) = mpsc::channel::<()>(1);
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = reconciler.run_once().await {
                                tracing::error!(error = %e, "Reconcile sweep failed");
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
            shutdown_txs.push(tx);
        }

        let sweeper = RetentionSweeper::new(store, config.retention_days);
        if sweeper.is_enabled() && config.retention_sweep_interval_secs > 0 {
            let period = Duration::from_secs(config.retention_sweep_interval_secs);
            let (tx, mut shutdown_rx) = mpsc::channel::<()>(1);
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = sweeper.run_once().await {
                                tracing::error!(error = %e, "Finished consumer cleanup failed");
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
            shutdown_txs.push(tx);
        }

        Self {
            instance_id,
            events_tx,
            shutdown_txs,
            handles,
            pg_listener,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Sender for release events produced in-process.
    pub fn release_events(&self) -> ReleaseEventSender {
        self.events_tx.clone()
    }

    /// Signals every loop to stop and waits for them. An event being handled when
    /// the signal arrives is finished first.
    pub async fn shutdown(self) {
        tracing::info!(worker_id = %self.instance_id, "Initiating restraint worker shutdown");

        if let Some(pg_listener) = self.pg_listener {
            pg_listener.abort();
        }
        for tx in &self.shutdown_txs {
            let _ = tx.send(()).await;
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Worker loop ended abnormally");
            }
        }

        tracing::info!(worker_id = %self.instance_id, "Restraint worker stopped");
    }
}

fn worker_instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}
