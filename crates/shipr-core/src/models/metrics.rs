use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::repository::RepositoryId;
use super::team::TeamId;
use super::user::UserId;

/// What a metrics request is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Repository,
    User,
    Team,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Repository => write!(f, "repository"),
            EntityKind::User => write!(f, "user"),
            EntityKind::Team => write!(f, "team"),
        }
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "repository" | "repo" => Ok(EntityKind::Repository),
            "user" => Ok(EntityKind::User),
            "team" => Ok(EntityKind::Team),
            _ => Err(format!("unknown entity kind: {s}")),
        }
    }
}

/// A typed entity reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MetricsEntity {
    Repository(RepositoryId),
    User(UserId),
    Team(TeamId),
}

impl MetricsEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            MetricsEntity::Repository(_) => EntityKind::Repository,
            MetricsEntity::User(_) => EntityKind::User,
            MetricsEntity::Team(_) => EntityKind::Team,
        }
    }

    pub fn id_string(&self) -> String {
        match self {
            MetricsEntity::Repository(id) => id.to_string(),
            MetricsEntity::User(id) => id.to_string(),
            MetricsEntity::Team(id) => id.to_string(),
        }
    }

    /// Build from a kind and textual id.
    pub fn parse(kind: EntityKind, id: &str) -> Result<Self, String> {
        match kind {
            EntityKind::Repository => id.parse().map(MetricsEntity::Repository),
            EntityKind::User => id.parse().map(MetricsEntity::User),
            EntityKind::Team => id.parse().map(MetricsEntity::Team),
        }
    }
}

/// Whether the payload was computed from stored rows or generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsMode {
    Live,
    Synthetic,
}

impl std::fmt::Display for MetricsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricsMode::Live => write!(f, "live"),
            MetricsMode::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// Activity folded into one calendar day (UTC).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyBucket {
    pub date: NaiveDate,
    pub commits: u32,
    pub additions: u64,
    pub deletions: u64,
    pub prs_opened: u32,
    pub prs_merged: u32,
    /// Closed without merging.
    pub prs_closed: u32,
    pub reviews: u32,
    pub merge_time_total_ms: i64,
    pub merge_samples: u32,
    pub first_review_total_ms: i64,
    pub first_review_samples: u32,
}

impl DailyBucket {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_commits: u64,
    pub total_additions: u64,
    pub total_deletions: u64,
    pub total_prs_opened: u64,
    pub total_prs_merged: u64,
    pub total_prs_closed: u64,
    pub total_reviews: u64,
    pub active_days: u32,
}

/// DORA-style delivery figures derived from the summed buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoraMetrics {
    /// Merged pull requests per day.
    pub deployment_frequency: f64,
    /// Closed-unmerged over all closed.
    pub change_failure_rate: f64,
    pub avg_time_to_first_review_minutes: f64,
    pub avg_time_to_merge_minutes: f64,
    pub pr_cycle_time_ms: f64,
}

/// The response handed to the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub tenant_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub mode: MetricsMode,
    pub summary: MetricsSummary,
    pub dora: DoraMetrics,
    /// One entry per day in range, ascending.
    pub daily: Vec<DailyBucket>,
}
