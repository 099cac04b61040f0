//! Configuration module
//!
//! Environment-driven settings for the constraint store connection, the admission
//! engine and the background worker, plus the constraint definitions a deployment
//! registers at startup.

use std::env;

use crate::models::{ConstraintSpec, Strategy};

// Common constants
const DB_MAX_CONNECTIONS: u32 = 10;
const DB_TIMEOUT_SECS: u64 = 30;
const MAX_ADMISSION_ATTEMPTS: u32 = 8;
const RECONCILE_INTERVAL_SECS: u64 = 30;
const RECONCILE_BATCH_SIZE: usize = 500;
const RETENTION_DAYS: i64 = 30;
const RETENTION_SWEEP_INTERVAL_SECS: u64 = 3600;
const RELEASE_MAX_ATTEMPTS: u32 = 5;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Debug)]
pub struct RestraintConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub environment: String,
    pub log_format: LogFormat,
    /// Upper bound on optimistic re-reads when concurrent admissions race for the
    /// next order or the last free permit.
    pub max_admission_attempts: u32,
    /// Interval between reconciler sweeps. 0 = disabled.
    pub reconcile_interval_secs: u64,
    pub reconcile_batch_size: usize,
    /// Retention in days for FINISHED consumers. 0 = disabled.
    pub retention_days: i64,
    pub retention_sweep_interval_secs: u64,
    /// Attempts per release event before it is dropped (transient errors only).
    pub release_max_attempts: u32,
    pub listen_notify_enabled: bool,
    /// Constraints registered at startup (`RESTRAINT_CONSTRAINTS`).
    pub constraints: Vec<ConstraintSpec>,
}

impl Default for RestraintConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: DB_MAX_CONNECTIONS,
            db_timeout_seconds: DB_TIMEOUT_SECS,
            environment: "development".to_string(),
            log_format: LogFormat::Pretty,
            max_admission_attempts: MAX_ADMISSION_ATTEMPTS,
            reconcile_interval_secs: RECONCILE_INTERVAL_SECS,
            reconcile_batch_size: RECONCILE_BATCH_SIZE,
            retention_days: RETENTION_DAYS,
            retention_sweep_interval_secs: RETENTION_SWEEP_INTERVAL_SECS,
            release_max_attempts: RELEASE_MAX_ATTEMPTS,
            listen_notify_enabled: true,
            constraints: Vec::new(),
        }
    }
}

impl RestraintConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "pretty".to_string())
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let constraints = match env::var("RESTRAINT_CONSTRAINTS") {
            Ok(raw) => parse_constraints(&raw)?,
            Err(_) => Vec::new(),
        };

        let config = Self {
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", DB_MAX_CONNECTIONS),
            db_timeout_seconds: parse_env("DB_TIMEOUT_SECONDS", DB_TIMEOUT_SECS),
            environment,
            log_format,
            max_admission_attempts: parse_env(
                "RESTRAINT_MAX_ADMISSION_ATTEMPTS",
                MAX_ADMISSION_ATTEMPTS,
            ),
            reconcile_interval_secs: parse_env(
                "RESTRAINT_RECONCILE_INTERVAL_SECS",
                RECONCILE_INTERVAL_SECS,
            ),
            reconcile_batch_size: parse_env(
                "RESTRAINT_RECONCILE_BATCH_SIZE",
                RECONCILE_BATCH_SIZE,
            ),
            retention_days: parse_env("RESTRAINT_RETENTION_DAYS", RETENTION_DAYS),
            retention_sweep_interval_secs: parse_env(
                "RESTRAINT_RETENTION_SWEEP_INTERVAL_SECS",
                RETENTION_SWEEP_INTERVAL_SECS,
            ),
            release_max_attempts: parse_env("RESTRAINT_RELEASE_MAX_ATTEMPTS", RELEASE_MAX_ATTEMPTS),
            listen_notify_enabled: env::var("RESTRAINT_LISTEN_NOTIFY")
                .unwrap_or_else(|_| "true".to_string())
                .to_lowercase()
                .parse()
                .unwrap_or(true),
            constraints,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if let Some(url) = &self.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(anyhow::anyhow!(
                    "DATABASE_URL must be a valid PostgreSQL connection string"
                ));
            }
        }

        if self.max_admission_attempts == 0 {
            return Err(anyhow::anyhow!(
                "RESTRAINT_MAX_ADMISSION_ATTEMPTS must be at least 1"
            ));
        }

        if self.release_max_attempts == 0 {
            return Err(anyhow::anyhow!(
                "RESTRAINT_RELEASE_MAX_ATTEMPTS must be at least 1"
            ));
        }

        if self.reconcile_batch_size == 0 {
            return Err(anyhow::anyhow!(
                "RESTRAINT_RECONCILE_BATCH_SIZE must be at least 1"
            ));
        }

        if self.retention_days < 0 {
            return Err(anyhow::anyhow!("RESTRAINT_RETENTION_DAYS cannot be negative"));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parses `id:limit[:strategy]` entries separated by commas, e.g.
/// `github-api:1,artifact-registry:4:asap`.
pub fn parse_constraints(raw: &str) -> Result<Vec<ConstraintSpec>, anyhow::Error> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let (id, limit, strategy) = match parts.as_slice() {
                [id, limit] => (*id, *limit, Strategy::Fifo),
                [id, limit, strategy] => (*id, *limit, strategy.parse::<Strategy>()?),
                _ => {
                    return Err(anyhow::anyhow!(
                        "Invalid constraint entry '{}', expected id:limit[:strategy]",
                        entry
                    ))
                }
            };
            let limit: u32 = limit.parse().map_err(|_| {
                anyhow::anyhow!("Invalid limit '{}' for constraint '{}'", limit, id)
            })?;
            Ok(ConstraintSpec::new(id, limit, strategy)?)
        })
        .collect()
}
