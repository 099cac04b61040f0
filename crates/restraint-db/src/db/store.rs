use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use restraint_core::models::{
    ConstraintId, ConstraintSpec, ConsumerId, ConsumerInstance, ConsumerState, ResourceUnit,
};
use restraint_core::{ConstraintStore, RestraintError, RestraintResult};

const CONSUMER_COLUMNS: &str = r#"id, constraint_id, resource_unit, "order", state, permits,
    release_entity_id, acquire_at, finished_at, created_at"#;

const ORDER_UNIQUE_CONSTRAINT: &str = "restraint_consumers_unit_order_key";

/// Postgres-backed constraint store.
///
/// Every write that depends on the state of a resource unit (order allocation,
/// capacity-guarded activation) locks the unit's `restraint_units` row first, so
/// concurrent engines serialize per unit inside the database.
#[derive(Clone)]
pub struct PgConstraintStore {
    pool: PgPool,
}

impl PgConstraintStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Ensures the unit row exists and locks it for the rest of the transaction.
/// Returns the unit's current high-water mark.
async fn lock_unit(
    tx: &mut Transaction<'_, Postgres>,
    resource_unit: &ResourceUnit,
) -> anyhow::Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO restraint_units (resource_unit)
        VALUES ($1)
        ON CONFLICT (resource_unit) DO NOTHING
        "#,
    )
    .bind(resource_unit.as_str())
    .execute(&mut **tx)
    .await
    .context("Failed to create resource unit row")?;

    let max_order: i64 = sqlx::query_scalar(
        r#"
        SELECT max_order
        FROM restraint_units
        WHERE resource_unit = $1
        FOR UPDATE
        "#,
    )
    .bind(resource_unit.as_str())
    .fetch_one(&mut **tx)
    .await
    .context("Failed to lock resource unit row")?;

    Ok(max_order)
}

async fn active_permits(
    tx: &mut Transaction<'_, Postgres>,
    constraint_id: &ConstraintId,
    resource_unit: &ResourceUnit,
) -> anyhow::Result<i64> {
    let used: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(permits), 0)::BIGINT
        FROM restraint_consumers
        WHERE constraint_id = $1
          AND resource_unit = $2
          AND state = 'active'
        "#,
    )
    .bind(constraint_id.as_str())
    .bind(resource_unit.as_str())
    .fetch_one(&mut **tx)
    .await
    .context("Failed to sum active permits")?;

    Ok(used)
}

fn permits_to_db(permits: u32, limit: u32) -> RestraintResult<i32> {
    i32::try_from(permits).map_err(|_| RestraintError::InvalidPermits {
        requested: permits,
        limit,
    })
}

fn map_insert_error(err: sqlx::Error, consumer: &ConsumerInstance) -> RestraintError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return if db_err.constraint() == Some(ORDER_UNIQUE_CONSTRAINT) {
                RestraintError::OrderConflict {
                    resource_unit: consumer.resource_unit.clone(),
                    order: consumer.order,
                }
            } else {
                RestraintError::DuplicateConsumer(consumer.id.clone())
            };
        }
        if db_err.is_foreign_key_violation() {
            return RestraintError::UnknownConstraint(consumer.constraint_id.clone());
        }
    }

    tracing::error!(
        error = %err,
        consumer_id = %consumer.id,
        resource_unit = %consumer.resource_unit,
        "Failed to insert consumer into database"
    );
    RestraintError::store(err)
}

#[async_trait]
impl ConstraintStore for PgConstraintStore {
    #[tracing::instrument(skip(self, spec), fields(constraint_id = %spec.id))]
    async fn create_if_absent(&self, spec: &ConstraintSpec) -> RestraintResult<ConstraintSpec> {
        let max_concurrent = permits_to_db(spec.max_concurrent, spec.max_concurrent)?;

        sqlx::query(
            r#"
            INSERT INTO restraint_constraints (id, max_concurrent, strategy)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(spec.id.as_str())
        .bind(max_concurrent)
        .bind(spec.strategy.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to register constraint")?;

        let stored = sqlx::query_as::<Postgres, ConstraintSpec>(
            r#"
            SELECT id, max_concurrent, strategy
            FROM restraint_constraints
            WHERE id = $1
            "#,
        )
        .bind(spec.id.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch registered constraint")?;

        if stored != *spec {
            tracing::warn!(
                constraint_id = %spec.id,
                requested_limit = spec.max_concurrent,
                stored_limit = stored.max_concurrent,
                "Constraint already registered with a different definition, keeping the stored one"
            );
        }

        Ok(stored)
    }

    #[tracing::instrument(skip(self))]
    async fn get_spec(
        &self,
        constraint_id: &ConstraintId,
    ) -> RestraintResult<Option<ConstraintSpec>> {
        let spec = sqlx::query_as::<Postgres, ConstraintSpec>(
            r#"
            SELECT id, max_concurrent, strategy
            FROM restraint_constraints
            WHERE id = $1
            "#,
        )
        .bind(constraint_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch constraint")?;

        Ok(spec)
    }

    #[tracing::instrument(skip(self))]
    async fn list_active_and_blocked(
        &self,
        resource_unit: &ResourceUnit,
    ) -> RestraintResult<Vec<ConsumerInstance>> {
        let consumers = sqlx::query_as::<Postgres, ConsumerInstance>(&format!(
            r#"
            SELECT {CONSUMER_COLUMNS}
            FROM restraint_consumers
            WHERE resource_unit = $1
              AND state IN ('blocked', 'active')
            ORDER BY "order" ASC
            "#
        ))
        .bind(resource_unit.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list consumers of resource unit")?;

        Ok(consumers)
    }

    #[tracing::instrument(skip(self))]
    async fn max_order(&self, resource_unit: &ResourceUnit) -> RestraintResult<i64> {
        let max_order: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT max_order
            FROM restraint_units
            WHERE resource_unit = $1
            "#,
        )
        .bind(resource_unit.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch resource unit max order")?;

        Ok(max_order.unwrap_or(0))
    }

    #[tracing::instrument(
        skip(self, consumer),
        fields(
            consumer_id = %consumer.id,
            resource_unit = %consumer.resource_unit,
            order = consumer.order,
            state = %consumer.state
        )
    )]
    async fn insert(
        &self,
        consumer: &ConsumerInstance,
        capacity: Option<u32>,
    ) -> RestraintResult<ConsumerInstance> {
        if consumer.state.is_terminal() {
            return Err(RestraintError::InvalidSpec(format!(
                "consumer {} cannot be inserted in state {}",
                consumer.id, consumer.state
            )));
        }
        let permits = permits_to_db(consumer.permits, capacity.unwrap_or(consumer.permits))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for consumer insert")?;

        let max_order = lock_unit(&mut tx, &consumer.resource_unit).await?;
        if consumer.order != max_order + 1 {
            tracing::debug!(
                expected_order = max_order + 1,
                "Order already allocated by a concurrent admission"
            );
            return Err(RestraintError::OrderConflict {
                resource_unit: consumer.resource_unit.clone(),
                order: consumer.order,
            });
        }

        if let (ConsumerState::Active, Some(capacity)) = (consumer.state, capacity) {
            let used =
                active_permits(&mut tx, &consumer.constraint_id, &consumer.resource_unit).await?;
            if used + i64::from(consumer.permits) > i64::from(capacity) {
                return Err(RestraintError::CapacityExhausted {
                    constraint_id: consumer.constraint_id.clone(),
                    resource_unit: consumer.resource_unit.clone(),
                });
            }
        }

        let inserted = sqlx::query_as::<Postgres, ConsumerInstance>(&format!(
            r#"
            INSERT INTO restraint_consumers (
                id, constraint_id, resource_unit, "order", state, permits,
                release_entity_id, acquire_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {CONSUMER_COLUMNS}
            "#
        ))
        .bind(consumer.id.as_str())
        .bind(consumer.constraint_id.as_str())
        .bind(consumer.resource_unit.as_str())
        .bind(consumer.order)
        .bind(consumer.state.as_str())
        .bind(permits)
        .bind(&consumer.release_entity_id)
        .bind(consumer.acquire_at)
        .bind(consumer.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_insert_error(e, consumer))?;

        sqlx::query(
            r#"
            UPDATE restraint_units
            SET max_order = $2, updated_at = NOW()
            WHERE resource_unit = $1
            "#,
        )
        .bind(consumer.resource_unit.as_str())
        .bind(consumer.order)
        .execute(&mut *tx)
        .await
        .context("Failed to advance resource unit max order")?;

        tx.commit()
            .await
            .context("Failed to commit consumer insert")?;

        tracing::debug!("Consumer inserted");

        Ok(inserted)
    }

    #[tracing::instrument(skip(self, expected))]
    async fn transition(
        &self,
        consumer_id: &ConsumerId,
        expected: &[ConsumerState],
        new_state: ConsumerState,
        capacity: Option<u32>,
    ) -> RestraintResult<ConsumerInstance> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for consumer transition")?;

        let guarded = new_state == ConsumerState::Active && capacity.is_some();
        if guarded {
            let resource_unit: Option<String> = sqlx::query_scalar(
                r#"
                SELECT resource_unit
                FROM restraint_consumers
                WHERE id = $1
                "#,
            )
            .bind(consumer_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to fetch consumer resource unit")?;

            let Some(resource_unit) = resource_unit else {
                return Err(RestraintError::NotFound(consumer_id.clone()));
            };
            lock_unit(&mut tx, &ResourceUnit::new(resource_unit)).await?;
        }

        let current = sqlx::query_as::<Postgres, ConsumerInstance>(&format!(
            r#"
            SELECT {CONSUMER_COLUMNS}
            FROM restraint_consumers
            WHERE id = $1
            FOR UPDATE
            "#
        ))
        .bind(consumer_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to lock consumer row")?
        .ok_or_else(|| RestraintError::NotFound(consumer_id.clone()))?;

        if !expected.contains(&current.state) {
            return Err(RestraintError::StaleStateConflict {
                consumer_id: consumer_id.clone(),
                actual: current.state,
                expected: expected.to_vec(),
            });
        }

        if let (true, Some(capacity)) = (guarded, capacity) {
            let used =
                active_permits(&mut tx, &current.constraint_id, &current.resource_unit).await?;
            if used + i64::from(current.permits) > i64::from(capacity) {
                return Err(RestraintError::CapacityExhausted {
                    constraint_id: current.constraint_id.clone(),
                    resource_unit: current.resource_unit.clone(),
                });
            }
        }

        let updated = sqlx::query_as::<Postgres, ConsumerInstance>(&format!(
            r#"
            UPDATE restraint_consumers
            SET state = $2::text,
                acquire_at = CASE WHEN $2::text = 'active' THEN NOW() ELSE acquire_at END,
                finished_at = CASE WHEN $2::text = 'finished' THEN NOW() ELSE finished_at END
            WHERE id = $1
            RETURNING {CONSUMER_COLUMNS}
            "#
        ))
        .bind(consumer_id.as_str())
        .bind(new_state.as_str())
        .fetch_one(&mut *tx)
        .await
        .context("Failed to update consumer state")?;

        tx.commit()
            .await
            .context("Failed to commit consumer transition")?;

        tracing::debug!(
            from = %current.state,
            to = %updated.state,
            resource_unit = %updated.resource_unit,
            "Consumer state updated"
        );

        Ok(updated)
    }

    #[tracing::instrument(skip(self))]
    async fn get_consumer(
        &self,
        consumer_id: &ConsumerId,
    ) -> RestraintResult<Option<ConsumerInstance>> {
        let consumer = sqlx::query_as::<Postgres, ConsumerInstance>(&format!(
            r#"
            SELECT {CONSUMER_COLUMNS}
            FROM restraint_consumers
            WHERE id = $1
            "#
        ))
        .bind(consumer_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch consumer")?;

        Ok(consumer)
    }

    #[tracing::instrument(skip(self))]
    async fn find_active_and_blocked_by_release_entity(
        &self,
        release_entity_id: &str,
    ) -> RestraintResult<Vec<ConsumerInstance>> {
        let consumers = sqlx::query_as::<Postgres, ConsumerInstance>(&format!(
            r#"
            SELECT {CONSUMER_COLUMNS}
            FROM restraint_consumers
            WHERE release_entity_id = $1
              AND state IN ('blocked', 'active')
            ORDER BY resource_unit, "order" ASC
            "#
        ))
        .bind(release_entity_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list consumers of release entity")?;

        Ok(consumers)
    }

    #[tracing::instrument(skip(self))]
    async fn list_active_and_blocked_page(
        &self,
        limit: usize,
        after: Option<&ConsumerId>,
    ) -> RestraintResult<Vec<ConsumerInstance>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let consumers = sqlx::query_as::<Postgres, ConsumerInstance>(&format!(
            r#"
            SELECT {CONSUMER_COLUMNS}
            FROM restraint_consumers
            WHERE state IN ('blocked', 'active')
              AND ($1::text IS NULL OR id > $1::text)
            ORDER BY id ASC
            LIMIT $2
            "#
        ))
        .bind(after.map(|id| id.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to page non-terminal consumers")?;

        Ok(consumers)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> RestraintResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM restraint_consumers
            WHERE state = 'finished'
              AND finished_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to delete finished consumers")?;

        Ok(result.rows_affected())
    }
}
