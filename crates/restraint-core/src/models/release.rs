use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Status of the external work item (release entity) a consumer is tied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Queued,
    Running,
    Paused,
    /// Being stopped; treated like a final status for releasing resources.
    Discontinuing,
    Succeeded,
    Failed,
    Errored,
    Aborted,
    Expired,
    Skipped,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Queued => "queued",
            ReleaseStatus::Running => "running",
            ReleaseStatus::Paused => "paused",
            ReleaseStatus::Discontinuing => "discontinuing",
            ReleaseStatus::Succeeded => "succeeded",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Errored => "errored",
            ReleaseStatus::Aborted => "aborted",
            ReleaseStatus::Expired => "expired",
            ReleaseStatus::Skipped => "skipped",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ReleaseStatus::Succeeded
                | ReleaseStatus::Failed
                | ReleaseStatus::Errored
                | ReleaseStatus::Aborted
                | ReleaseStatus::Expired
                | ReleaseStatus::Skipped
        )
    }

    /// Whether consumers held by a work item in this status must be finished.
    pub fn releases_resources(&self) -> bool {
        self.is_final() || *self == ReleaseStatus::Discontinuing
    }
}

impl Display for ReleaseStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleaseStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ReleaseStatus::Queued),
            "running" => Ok(ReleaseStatus::Running),
            "paused" => Ok(ReleaseStatus::Paused),
            "discontinuing" => Ok(ReleaseStatus::Discontinuing),
            "succeeded" => Ok(ReleaseStatus::Succeeded),
            "failed" => Ok(ReleaseStatus::Failed),
            "errored" => Ok(ReleaseStatus::Errored),
            "aborted" => Ok(ReleaseStatus::Aborted),
            "expired" => Ok(ReleaseStatus::Expired),
            "skipped" => Ok(ReleaseStatus::Skipped),
            _ => Err(anyhow::anyhow!("Invalid release status: {}", s)),
        }
    }
}

/// Status change of a release entity, as pushed by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEvent {
    pub release_entity_id: String,
    pub status: ReleaseStatus,
}

impl ReleaseEvent {
    pub fn new(release_entity_id: impl Into<String>, status: ReleaseStatus) -> Self {
        Self {
            release_entity_id: release_entity_id.into(),
            status,
        }
    }
}
