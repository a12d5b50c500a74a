use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::repository::RepositoryId;

/// Status of an orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "idle"),
            SyncStatus::Running => write!(f, "running"),
            SyncStatus::Completed => write!(f, "completed"),
            SyncStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SyncStatus::Idle),
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err(format!("unknown sync status: {s}")),
        }
    }
}

/// Rows a collector run wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub commit_count: u32,
    pub pull_request_count: u32,
    pub review_count: u32,
}

/// Outcome of syncing one repository. Produced for every repository, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub id: Uuid,
    pub repository_id: RepositoryId,
    pub repository_name: String,
    pub success: bool,
    /// Set when the repository was not attempted because another run held it.
    #[serde(default)]
    pub skipped: bool,
    pub message: String,
    pub commit_count: u32,
    pub pull_request_count: u32,
    pub review_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn succeeded(
        repository_id: RepositoryId,
        repository_name: String,
        stats: CollectionStats,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            repository_id,
            message: format!(
                "synced {repository_name}: {} commits, {} pull requests, {} reviews",
                stats.commit_count, stats.pull_request_count, stats.review_count
            ),
            repository_name,
            success: true,
            skipped: false,
            commit_count: stats.commit_count,
            pull_request_count: stats.pull_request_count,
            review_count: stats.review_count,
            started_at,
            finished_at,
            errors: Vec::new(),
        }
    }

    pub fn failed(
        repository_id: RepositoryId,
        repository_name: String,
        errors: Vec<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            repository_id,
            message: format!("failed to sync {repository_name}"),
            repository_name,
            success: false,
            skipped: false,
            commit_count: 0,
            pull_request_count: 0,
            review_count: 0,
            started_at,
            finished_at,
            errors,
        }
    }

    /// Record rows a failed run still wrote before it gave up.
    pub fn with_stats(mut self, stats: CollectionStats) -> Self {
        self.commit_count = stats.commit_count;
        self.pull_request_count = stats.pull_request_count;
        self.review_count = stats.review_count;
        self
    }

    pub fn skipped(
        repository_id: RepositoryId,
        repository_name: String,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            repository_id,
            message: format!("skipped {repository_name}: {reason}"),
            repository_name,
            success: false,
            skipped: true,
            commit_count: 0,
            pull_request_count: 0,
            review_count: 0,
            started_at: at,
            finished_at: at,
            errors: Vec::new(),
        }
    }
}

/// Process-local progress of one orchestrator run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub total: usize,
    /// Repositories handed out so far, finished or not.
    pub current: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub in_progress: usize,
    pub status: SyncStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub estimated_remaining_ms: Option<u64>,
}

impl SyncProgress {
    pub fn processed(&self) -> usize {
        self.completed + self.failed + self.skipped
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, SyncStatus::Completed | SyncStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeded_message_carries_counts() {
        let now = Utc::now();
        let result = SyncResult::succeeded(
            RepositoryId::new(),
            "acme/widgets".to_string(),
            CollectionStats {
                commit_count: 3,
                pull_request_count: 2,
                review_count: 1,
            },
            now,
            now,
        );
        assert!(result.success);
        assert_eq!(
            result.message,
            "synced acme/widgets: 3 commits, 2 pull requests, 1 reviews"
        );
    }

    #[test]
    fn test_failed_result_keeps_partial_counts() {
        let now = Utc::now();
        let result = SyncResult::failed(
            RepositoryId::new(),
            "acme/widgets".to_string(),
            vec!["rate limited".to_string()],
            now,
            now,
        )
        .with_stats(CollectionStats {
            commit_count: 4,
            pull_request_count: 0,
            review_count: 0,
        });
        assert!(!result.success);
        assert_eq!(result.commit_count, 4);
        assert_eq!(result.message, "failed to sync acme/widgets");
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SyncStatus::Idle,
            SyncStatus::Running,
            SyncStatus::Completed,
            SyncStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<SyncStatus>().unwrap(), status);
        }
    }
}
