use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use super::ids::{ConstraintId, ConsumerId, ResourceUnit};
use crate::error::RestraintError;

/// Lifecycle state of a consumer.
///
/// Allowed moves are BLOCKED -> ACTIVE -> FINISHED and BLOCKED -> FINISHED.
/// FINISHED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Blocked,
    Active,
    Finished,
}

impl ConsumerState {
    pub const NON_TERMINAL: [ConsumerState; 2] = [ConsumerState::Active, ConsumerState::Blocked];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Blocked => "blocked",
            ConsumerState::Active => "active",
            ConsumerState::Finished => "finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Finished)
    }

    pub fn can_transition_to(&self, next: ConsumerState) -> bool {
        matches!(
            (self, next),
            (ConsumerState::Blocked, ConsumerState::Active)
                | (ConsumerState::Blocked, ConsumerState::Finished)
                | (ConsumerState::Active, ConsumerState::Finished)
        )
    }
}

impl Display for ConsumerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsumerState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocked" => Ok(ConsumerState::Blocked),
            "active" => Ok(ConsumerState::Active),
            "finished" => Ok(ConsumerState::Finished),
            _ => Err(anyhow::anyhow!("Invalid consumer state: {}", s)),
        }
    }
}

/// One admission request on a resource unit and its position in the unit's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInstance {
    pub id: ConsumerId,
    pub constraint_id: ConstraintId,
    pub resource_unit: ResourceUnit,
    pub order: i64,
    pub state: ConsumerState,
    pub permits: u32,
    /// External work item whose completion releases this consumer.
    pub release_entity_id: String,
    pub acquire_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ConsumerInstance {
    /// Builds a not-yet-persisted consumer in `state`, stamping `acquire_at` when it
    /// starts out ACTIVE.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ConsumerId,
        constraint_id: ConstraintId,
        resource_unit: ResourceUnit,
        order: i64,
        state: ConsumerState,
        permits: u32,
        release_entity_id: impl Into<String>,
    ) -> Result<Self, RestraintError> {
        if state.is_terminal() {
            return Err(RestraintError::InvalidSpec(format!(
                "consumer {} cannot be created in state {}",
                id, state
            )));
        }
        let now = Utc::now();
        Ok(Self {
            id,
            constraint_id,
            resource_unit,
            order,
            state,
            permits,
            release_entity_id: release_entity_id.into(),
            acquire_at: (state == ConsumerState::Active).then_some(now),
            finished_at: None,
            created_at: now,
        })
    }

    pub fn is_active(&self) -> bool {
        self.state == ConsumerState::Active
    }

    pub fn is_blocked(&self) -> bool {
        self.state == ConsumerState::Blocked
    }

    /// Applies a state change the way a store does: stamps `acquire_at` on activation
    /// and `finished_at` on finish.
    pub fn apply_transition(&mut self, next: ConsumerState, at: DateTime<Utc>) {
        match next {
            ConsumerState::Active => self.acquire_at = Some(at),
            ConsumerState::Finished => self.finished_at = Some(at),
            ConsumerState::Blocked => {}
        }
        self.state = next;
    }

    pub fn status(&self) -> ConsumerStatus {
        ConsumerStatus {
            consumer_id: self.id.clone(),
            constraint_id: self.constraint_id.clone(),
            resource_unit: self.resource_unit.clone(),
            state: self.state,
            order: self.order,
            acquire_at: self.acquire_at,
        }
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for ConsumerInstance {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let permits: i32 = row.try_get("permits")?;
        Ok(ConsumerInstance {
            id: ConsumerId::new(row.try_get::<String, _>("id")?),
            constraint_id: ConstraintId::new(row.try_get::<String, _>("constraint_id")?),
            resource_unit: ResourceUnit::new(row.try_get::<String, _>("resource_unit")?),
            order: row.try_get("order")?,
            state: row.try_get::<String, _>("state")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse consumer state: {}", e).into())
            })?,
            permits: u32::try_from(permits)
                .map_err(|e| sqlx::Error::Decode(format!("Invalid permits: {}", e).into()))?,
            release_entity_id: row.try_get("release_entity_id")?,
            acquire_at: row.try_get("acquire_at")?,
            finished_at: row.try_get("finished_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Answer to "may this consumer's work proceed?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStatus {
    pub consumer_id: ConsumerId,
    pub constraint_id: ConstraintId,
    pub resource_unit: ResourceUnit,
    pub state: ConsumerState,
    pub order: i64,
    pub acquire_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        use ConsumerState::*;
        assert!(Blocked.can_transition_to(Active));
        assert!(Blocked.can_transition_to(Finished));
        assert!(Active.can_transition_to(Finished));
        assert!(!Active.can_transition_to(Blocked));
        assert!(!Finished.can_transition_to(Active));
        assert!(!Finished.can_transition_to(Blocked));
        assert!(!Finished.can_transition_to(Finished));
    }

    #[test]
    fn state_parses_its_own_display() {
        for state in [
            ConsumerState::Blocked,
            ConsumerState::Active,
            ConsumerState::Finished,
        ] {
            assert_eq!(state.to_string().parse::<ConsumerState>().unwrap(), state);
        }
        assert!("running".parse::<ConsumerState>().is_err());
    }

    #[test]
    fn active_consumers_are_stamped_on_creation() {
        let active = ConsumerInstance::new(
            "c1".into(),
            "github".into(),
            "acct".into(),
            1,
            ConsumerState::Active,
            1,
            "node-1",
        )
        .unwrap();
        assert!(active.acquire_at.is_some());

        let blocked = ConsumerInstance::new(
            "c2".into(),
            "github".into(),
            "acct".into(),
            2,
            ConsumerState::Blocked,
            1,
            "node-2",
        )
        .unwrap();
        assert!(blocked.acquire_at.is_none());
    }

    #[test]
    fn consumers_cannot_be_created_finished() {
        let result = ConsumerInstance::new(
            "c1".into(),
            "github".into(),
            "acct".into(),
            1,
            ConsumerState::Finished,
            1,
            "node-1",
        );
        assert!(result.is_err());
    }
}
