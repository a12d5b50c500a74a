use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::repository::RepositoryId;
use super::user::UserId;

/// A commit, keyed by its remote hash within a repository. Never updated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub repository_id: RepositoryId,
    pub author_id: Option<UserId>,
    pub committer_id: Option<UserId>,
    pub message: String,
    pub committed_at: DateTime<Utc>,
    pub additions: u32,
    pub deletions: u32,
}

/// Unique identifier for a stored pull request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PullRequestId(pub Uuid);

impl PullRequestId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for PullRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PullRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

impl std::fmt::Display for PrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrState::Open => write!(f, "open"),
            PrState::Closed => write!(f, "closed"),
            PrState::Merged => write!(f, "merged"),
        }
    }
}

impl std::str::FromStr for PrState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(PrState::Open),
            "closed" => Ok(PrState::Closed),
            "merged" => Ok(PrState::Merged),
            _ => Err(format!("unknown pull request state: {s}")),
        }
    }
}

/// A pull request, unique per (repository, number). Lifecycle fields follow the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: PullRequestId,
    pub repository_id: RepositoryId,
    pub number: u64,
    pub title: String,
    pub author_id: Option<UserId>,
    pub state: PrState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub additions: u32,
    pub deletions: u32,
    pub changed_files: u32,
}

impl PullRequest {
    /// True when the lifecycle fields differ from `other`.
    pub fn lifecycle_differs(&self, other: &PullRequest) -> bool {
        self.state != other.state
            || self.updated_at != other.updated_at
            || self.closed_at != other.closed_at
            || self.merged_at != other.merged_at
    }

    /// Closed without being merged.
    pub fn is_abandoned(&self) -> bool {
        self.state == PrState::Closed && self.merged_at.is_none()
    }
}

/// What a reviewer decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
}

impl std::fmt::Display for ReviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewState::Approved => write!(f, "approved"),
            ReviewState::ChangesRequested => write!(f, "changes_requested"),
            ReviewState::Commented => write!(f, "commented"),
        }
    }
}

impl std::str::FromStr for ReviewState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approved" => Ok(ReviewState::Approved),
            "changes_requested" => Ok(ReviewState::ChangesRequested),
            "commented" | "dismissed" => Ok(ReviewState::Commented),
            _ => Err(format!("unknown review state: {s}")),
        }
    }
}

/// A submitted review, keyed by the remote review id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub remote_id: String,
    pub pull_request_id: PullRequestId,
    pub reviewer_id: Option<UserId>,
    pub state: ReviewState,
    pub submitted_at: DateTime<Utc>,
}
