pub mod dto;
pub mod github;
mod graphql;
pub mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipr_core::error::ShiprError;
use shipr_core::models::activity::{PrState, ReviewState};
use shipr_core::models::repository::Repository;
use shipr_core::models::user::IdentitySignal;

pub use dto::{CommitPayload, PullRequestPayload, ReviewPayload};

/// One page of a cursor-driven listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_next_page: bool,
    /// Opaque cursor to pass back for the next page.
    pub end_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            has_next_page: false,
            end_cursor: None,
        }
    }
}

/// A commit after normalization, ready for identity resolution and storage.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCommit {
    pub sha: String,
    pub message: String,
    pub committed_at: DateTime<Utc>,
    pub author: Option<IdentitySignal>,
    pub committer: Option<IdentitySignal>,
    pub additions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemotePullRequest {
    pub number: u64,
    pub title: String,
    pub state: PrState,
    pub author: Option<IdentitySignal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub additions: u32,
    pub deletions: u32,
    pub changed_files: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteReview {
    pub remote_id: String,
    pub reviewer: Option<IdentitySignal>,
    pub state: ReviewState,
    pub submitted_at: DateTime<Utc>,
}

/// Read access to one repository's activity on a hosting service.
///
/// Two families of calls sit behind the same trait: cursor-driven bulk pages
/// (pull request pages embed their reviews) and per-item listings for hosts
/// or tokens that cannot use the bulk query. Both return raw payloads;
/// callers normalize item by item so one bad record only costs that record.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Host name used in logs and errors.
    fn host(&self) -> &str;

    /// Whether the bulk page calls are usable with this host and credential.
    async fn supports_bulk_query(&self) -> bool;

    /// Commits on the default branch newer than `since`, one page at a time.
    async fn commit_page(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page<CommitPayload>, ShiprError>;

    /// Pull requests updated after `since`, with their reviews embedded.
    async fn pull_request_page(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page<PullRequestPayload>, ShiprError>;

    /// Every commit newer than `since`. Items may lack line stats.
    async fn list_commits(
        &self,
        since: Option<DateTime<Utc>>,
        page_size: u32,
    ) -> Result<Vec<CommitPayload>, ShiprError>;

    /// A single commit with line stats.
    async fn get_commit(&self, sha: &str) -> Result<CommitPayload, ShiprError>;

    /// Every pull request updated after `since`, without reviews.
    async fn list_pull_requests(
        &self,
        since: Option<DateTime<Utc>>,
        page_size: u32,
    ) -> Result<Vec<PullRequestPayload>, ShiprError>;

    async fn list_reviews(&self, number: u64) -> Result<Vec<ReviewPayload>, ShiprError>;
}

/// Builds an [`ActivitySource`] for a stored repository.
pub trait SourceFactory: Send + Sync {
    fn source_for(&self, repository: &Repository) -> Result<Arc<dyn ActivitySource>, ShiprError>;
}
