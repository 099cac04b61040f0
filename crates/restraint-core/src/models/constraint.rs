use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use super::ids::ConstraintId;
use crate::error::RestraintError;
use crate::strategy::{AdmissionPolicy, AsapPolicy, FifoPolicy};

/// Queuing strategy applied to the blocked consumers of a resource unit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Admit strictly in enqueue order; a consumer that does not fit holds back
    /// everyone behind it.
    #[default]
    Fifo,
    /// Admit, in enqueue order, every consumer that fits into the free capacity.
    Asap,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Fifo => "fifo",
            Strategy::Asap => "asap",
        }
    }

    /// Admission policy implementing this strategy.
    pub fn policy(&self) -> &'static dyn AdmissionPolicy {
        match self {
            Strategy::Fifo => &FifoPolicy,
            Strategy::Asap => &AsapPolicy,
        }
    }
}

impl Display for Strategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = RestraintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fifo" => Ok(Strategy::Fifo),
            "asap" => Ok(Strategy::Asap),
            other => Err(RestraintError::InvalidSpec(format!(
                "unknown strategy '{}'",
                other
            ))),
        }
    }
}

/// Capacity policy of one protected resource class.
///
/// Immutable once registered: the store keeps the first registration and every
/// later `create_if_absent` returns it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub id: ConstraintId,
    pub max_concurrent: u32,
    pub strategy: Strategy,
}

impl ConstraintSpec {
    pub fn new(
        id: impl Into<ConstraintId>,
        max_concurrent: u32,
        strategy: Strategy,
    ) -> Result<Self, RestraintError> {
        let id = id.into();
        if id.as_str().trim().is_empty() {
            return Err(RestraintError::InvalidSpec(
                "constraint id must not be empty".to_string(),
            ));
        }
        if max_concurrent == 0 {
            return Err(RestraintError::InvalidSpec(format!(
                "constraint '{}' must allow at least one concurrent holder",
                id
            )));
        }
        Ok(Self {
            id,
            max_concurrent,
            strategy,
        })
    }

    /// FIFO constraint with the given limit.
    pub fn fifo(id: impl Into<ConstraintId>, max_concurrent: u32) -> Result<Self, RestraintError> {
        Self::new(id, max_concurrent, Strategy::Fifo)
    }

    /// Checks a permit request against this constraint's limit.
    pub fn check_permits(&self, permits: u32) -> Result<(), RestraintError> {
        if permits == 0 || permits > self.max_concurrent {
            return Err(RestraintError::InvalidPermits {
                requested: permits,
                limit: self.max_concurrent,
            });
        }
        Ok(())
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for ConstraintSpec {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let max_concurrent: i32 = row.try_get("max_concurrent")?;
        Ok(ConstraintSpec {
            id: ConstraintId::new(row.try_get::<String, _>("id")?),
            max_concurrent: u32::try_from(max_concurrent).map_err(|e| {
                sqlx::Error::Decode(format!("Invalid max_concurrent: {}", e).into())
            })?,
            strategy: row.try_get::<String, _>("strategy")?.parse().map_err(
                |e: RestraintError| {
                    sqlx::Error::Decode(format!("Failed to parse strategy: {}", e).into())
                },
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        let err = ConstraintSpec::fifo("github-api", 0).unwrap_err();
        assert!(matches!(err, RestraintError::InvalidSpec(_)));
    }

    #[test]
    fn empty_id_is_rejected() {
        assert!(ConstraintSpec::fifo("  ", 1).is_err());
    }

    #[test]
    fn permits_must_fit_the_limit() {
        let spec = ConstraintSpec::fifo("registry", 2).unwrap();
        assert!(spec.check_permits(1).is_ok());
        assert!(spec.check_permits(2).is_ok());
        assert!(matches!(
            spec.check_permits(3),
            Err(RestraintError::InvalidPermits {
                requested: 3,
                limit: 2
            })
        ));
        assert!(spec.check_permits(0).is_err());
    }

    #[test]
    fn strategy_round_trips_through_text() {
        for strategy in [Strategy::Fifo, Strategy::Asap] {
            assert_eq!(strategy.to_string().parse::<Strategy>().unwrap(), strategy);
        }
        assert_eq!(" FIFO ".parse::<Strategy>().unwrap(), Strategy::Fifo);
        assert!("lifo".parse::<Strategy>().is_err());
    }
}
