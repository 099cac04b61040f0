//! restraintd: hosts the release listener, reconciler and retention sweeper
//! against the Postgres constraint store.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;

use restraint_core::{ConstraintStore, RestraintConfig};
use restraint_db::{PgActivationNotifier, PgConstraintStore, MIGRATOR};
use restraint_engine::{ConstraintEngine, EngineConfig};
use restraint_worker::{init_telemetry, RestraintWorker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RestraintConfig::from_env().context("Failed to load configuration")?;
    init_telemetry(config.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set")?;

    tracing::info!(
        environment = %config.environment,
        max_connections = config.db_max_connections,
        constraints = config.constraints.len(),
        "Starting restraintd"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(config.db_timeout_seconds))
        .connect(&database_url)
        .await
        .context("Failed to connect to database")?;

    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    let store: Arc<dyn ConstraintStore> = Arc::new(PgConstraintStore::new(pool.clone()));
    let engine = ConstraintEngine::with_store(
        store.clone(),
        Arc::new(PgActivationNotifier::new(pool.clone())),
        EngineConfig::from(&config),
    );

    for spec in &config.constraints {
        engine
            .register_constraint(spec)
            .await
            .with_context(|| format!("Failed to register constraint {}", spec.id))?;
    }

    let worker = RestraintWorker::start(
        engine,
        store,
        None,
        WorkerConfig::from(&config),
        Some(pool.clone()),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    worker.shutdown().await;
    pool.close().await;

    Ok(())
}
