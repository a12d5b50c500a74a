//! In-memory [`ActivitySource`] for tests, with fault injection.
//!
//! Activity is described once and served in either shape: GraphQL payloads
//! from the bulk calls, REST payloads from the per-item calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use shipr_core::error::ShiprError;
use shipr_core::models::repository::Repository;

use crate::dto::{
    GqlActor, GqlCommit, GqlGitActor, GqlPullRequest, GqlReview, GqlReviewConnection,
    GqlReviewPageInfo, RestCommit, RestCommitDetail, RestGitActor, RestPullRequest, RestReview, RestStats, RestUser,
};
use crate::{ActivitySource, CommitPayload, Page, PullRequestPayload, ReviewPayload, SourceFactory};

/// Reviews embedded per pull request in a bulk page, as `reviews(first: 100)` returns.
const EMBEDDED_REVIEWS: usize = 100;

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone)]
pub struct ScriptedUser {
    pub name: String,
    pub email: Option<String>,
    pub login: Option<String>,
    pub remote_id: Option<i64>,
}

impl ScriptedUser {
    /// An account with a login and numeric id.
    pub fn account(login: &str, remote_id: i64) -> Self {
        Self {
            name: login.to_string(),
            email: Some(format!("{login}@example.com")),
            login: Some(login.to_string()),
            remote_id: Some(remote_id),
        }
    }

    /// A git identity with no linked account.
    pub fn email_only(name: &str, email: &str) -> Self {
        Self {
            name: name.to_string(),
            email: Some(email.to_string()),
            login: None,
            remote_id: None,
        }
    }

    fn avatar(&self) -> Option<String> {
        self.remote_id
            .map(|id| format!("https://avatars.example.com/u/{id}"))
    }

    fn gql_actor(&self) -> Option<GqlActor> {
        self.login.as_ref().map(|login| GqlActor {
            login: Some(login.clone()),
            database_id: self.remote_id,
            avatar_url: self.avatar(),
        })
    }

    fn rest_user(&self) -> Option<RestUser> {
        self.login.as_ref().map(|login| RestUser {
            login: Some(login.clone()),
            id: self.remote_id,
            avatar_url: self.avatar(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedCommit {
    pub sha: String,
    pub message: String,
    pub committed_at: DateTime<Utc>,
    pub author: Option<ScriptedUser>,
    pub additions: u32,
    pub deletions: u32,
}

impl ScriptedCommit {
    pub fn new(sha: &str, committed_at: DateTime<Utc>) -> Self {
        Self {
            sha: sha.to_string(),
            message: format!("commit {sha}"),
            committed_at,
            author: None,
            additions: 1,
            deletions: 0,
        }
    }

    pub fn by(mut self, author: ScriptedUser) -> Self {
        self.author = Some(author);
        self
    }

    pub fn lines(mut self, additions: u32, deletions: u32) -> Self {
        self.additions = additions;
        self.deletions = deletions;
        self
    }

    fn graphql(&self) -> GqlCommit {
        let actor = self.author.as_ref().map(|a| GqlGitActor {
            name: Some(a.name.clone()),
            email: a.email.clone(),
            user: a.gql_actor(),
        });
        GqlCommit {
            oid: Some(self.sha.clone()),
            message: Some(self.message.clone()),
            committed_date: Some(ts(&self.committed_at)),
            additions: Some(self.additions),
            deletions: Some(self.deletions),
            author: actor.clone(),
            committer: actor,
        }
    }

    fn rest(&self, with_stats: bool) -> RestCommit {
        let git = self.author.as_ref().map(|a| RestGitActor {
            name: Some(a.name.clone()),
            email: a.email.clone(),
            date: Some(ts(&self.committed_at)),
        });
        let user = self.author.as_ref().and_then(ScriptedUser::rest_user);
        RestCommit {
            sha: Some(self.sha.clone()),
            commit: Some(RestCommitDetail {
                message: Some(self.message.clone()),
                author: git.clone().or_else(|| {
                    Some(RestGitActor {
                        date: Some(ts(&self.committed_at)),
                        ..Default::default()
                    })
                }),
                committer: git,
            }),
            author: user.clone(),
            committer: user,
            stats: with_stats.then(|| RestStats {
                additions: self.additions,
                deletions: self.deletions,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedReview {
    pub id: i64,
    pub reviewer: Option<ScriptedUser>,
    pub state: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl ScriptedReview {
    pub fn new(id: i64, state: &str, reviewer: ScriptedUser, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id,
            reviewer: Some(reviewer),
            state: state.to_string(),
            submitted_at: Some(submitted_at),
        }
    }

    pub fn approved(id: i64, reviewer: ScriptedUser, submitted_at: DateTime<Utc>) -> Self {
        Self::new(id, "APPROVED", reviewer, submitted_at)
    }

    fn graphql(&self) -> GqlReview {
        GqlReview {
            id: Some(format!("PRR_kwDO{:08X}", self.id)),
            database_id: Some(self.id),
            state: Some(self.state.clone()),
            submitted_at: self.submitted_at.as_ref().map(ts),
            author: self.reviewer.as_ref().and_then(ScriptedUser::gql_actor),
        }
    }

    fn rest(&self) -> RestReview {
        RestReview {
            id: Some(self.id),
            state: Some(self.state.clone()),
            submitted_at: self.submitted_at.as_ref().map(ts),
            user: self.reviewer.as_ref().and_then(ScriptedUser::rest_user),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedPullRequest {
    pub number: u64,
    pub title: String,
    pub author: Option<ScriptedUser>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub reviews: Vec<ScriptedReview>,
}

impl ScriptedPullRequest {
    pub fn opened(number: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            number,
            title: format!("Pull request #{number}"),
            author: None,
            created_at,
            updated_at: created_at,
            closed_at: None,
            merged_at: None,
            reviews: Vec::new(),
        }
    }

    pub fn by(mut self, author: ScriptedUser) -> Self {
        self.author = Some(author);
        self
    }

    pub fn merged(mut self, at: DateTime<Utc>) -> Self {
        self.merged_at = Some(at);
        self.closed_at = Some(at);
        self.updated_at = at;
        self
    }

    pub fn closed(mut self, at: DateTime<Utc>) -> Self {
        self.closed_at = Some(at);
        self.updated_at = at;
        self
    }

    pub fn review(mut self, review: ScriptedReview) -> Self {
        if let Some(at) = review.submitted_at {
            self.updated_at = self.updated_at.max(at);
        }
        self.reviews.push(review);
        self
    }

    fn graphql(&self, review_limit: usize) -> GqlPullRequest {
        let state = match (self.merged_at, self.closed_at) {
            (Some(_), _) => "MERGED",
            (None, Some(_)) => "CLOSED",
            _ => "OPEN",
        };
        GqlPullRequest {
            number: Some(self.number),
            title: Some(self.title.clone()),
            state: Some(state.to_string()),
            created_at: Some(ts(&self.created_at)),
            updated_at: Some(ts(&self.updated_at)),
            closed_at: self.closed_at.as_ref().map(ts),
            merged_at: self.merged_at.as_ref().map(ts),
            additions: Some(10),
            deletions: Some(2),
            changed_files: Some(1),
            author: self.author.as_ref().and_then(ScriptedUser::gql_actor),
            reviews: Some(GqlReviewConnection {
                page_info: Some(GqlReviewPageInfo {
                    has_next_page: self.reviews.len() > review_limit,
                }),
                nodes: self
                    .reviews
                    .iter()
                    .take(review_limit)
                    .map(ScriptedReview::graphql)
                    .collect(),
            }),
        }
    }

    fn rest(&self) -> RestPullRequest {
        let state = if self.closed_at.is_some() { "closed" } else { "open" };
        RestPullRequest {
            number: Some(self.number),
            title: Some(self.title.clone()),
            state: Some(state.to_string()),
            user: self.author.as_ref().and_then(ScriptedUser::rest_user),
            created_at: Some(ts(&self.created_at)),
            updated_at: Some(ts(&self.updated_at)),
            closed_at: self.closed_at.as_ref().map(ts),
            merged_at: self.merged_at.as_ref().map(ts),
            additions: Some(10),
            deletions: Some(2),
            changed_files: Some(1),
        }
    }
}

#[derive(Default)]
struct Script {
    commits: Vec<ScriptedCommit>,
    pull_requests: Vec<ScriptedPullRequest>,
    malformed_commits: usize,
    bulk_supported: bool,
    fail_bulk: bool,
    fail_with: Option<fn() -> ShiprError>,
    rate_limited_calls: u32,
    throttled_pull_request_pages: u32,
    review_limit: usize,
    delay: Option<Duration>,
}

/// Scripted remote activity for one repository.
pub struct ScriptedSource {
    script: Mutex<Script>,
    calls: AtomicUsize,
    detail_calls: AtomicUsize,
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSource {
    /// A source that supports bulk queries and has no activity yet.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                bulk_supported: true,
                review_limit: EMBEDDED_REVIEWS,
                ..Script::default()
            }),
            calls: AtomicUsize::new(0),
            detail_calls: AtomicUsize::new(0),
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_commits(self, commits: impl IntoIterator<Item = ScriptedCommit>) -> Self {
        self.script().commits.extend(commits);
        self
    }

    pub fn with_pull_requests(
        self,
        pull_requests: impl IntoIterator<Item = ScriptedPullRequest>,
    ) -> Self {
        self.script().pull_requests.extend(pull_requests);
        self
    }

    /// Only the per-item calls are available.
    pub fn without_bulk(self) -> Self {
        self.script().bulk_supported = false;
        self
    }

    /// Advertise bulk support but fail every bulk call with a server error.
    pub fn failing_bulk(self) -> Self {
        self.script().fail_bulk = true;
        self
    }

    /// Fail every call with the given error.
    pub fn failing_with(self, error: fn() -> ShiprError) -> Self {
        self.script().fail_with = Some(error);
        self
    }

    /// Answer the next `times` calls with a one-second rate limit.
    pub fn rate_limited(self, times: u32) -> Self {
        self.script().rate_limited_calls = times;
        self
    }

    /// Answer the next `times` pull request page calls with a zero-second
    /// rate limit. Commit calls are unaffected.
    pub fn throttling_pull_request_pages(self, times: u32) -> Self {
        self.script().throttled_pull_request_pages = times;
        self
    }

    /// Embed at most `limit` reviews per pull request in bulk pages.
    pub fn embedding_reviews_up_to(self, limit: usize) -> Self {
        self.script().review_limit = limit;
        self
    }

    /// Serve `count` commits that fail normalization ahead of the real ones.
    pub fn with_malformed_commits(self, count: usize) -> Self {
        self.script().malformed_commits = count;
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.script().delay = Some(delay);
        self
    }

    pub fn push_commit(&self, commit: ScriptedCommit) {
        self.script().commits.push(commit);
    }

    /// Replace (by number) or add a pull request.
    pub fn upsert_pull_request(&self, pr: ScriptedPullRequest) {
        let mut script = self.script();
        script.pull_requests.retain(|p| p.number != pr.number);
        script.pull_requests.push(pr);
    }

    /// Remote calls served so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `get_commit` calls served so far.
    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, bulk: bool) -> Result<(), ShiprError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.script().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script();
        if let Some(error) = script.fail_with {
            return Err(error());
        }
        if script.rate_limited_calls > 0 {
            script.rate_limited_calls -= 1;
            return Err(ShiprError::RateLimited {
                host: "scripted".to_string(),
                retry_after_secs: 1,
            });
        }
        if bulk && script.fail_bulk {
            return Err(ShiprError::ApiError {
                status: 502,
                message: "bulk query failed".to_string(),
            });
        }
        Ok(())
    }

    fn commits_since(&self, since: Option<DateTime<Utc>>) -> Vec<ScriptedCommit> {
        let mut commits: Vec<_> = self
            .script()
            .commits
            .iter()
            .filter(|c| since.map_or(true, |s| c.committed_at >= s))
            .cloned()
            .collect();
        commits.sort_by(|a, b| b.committed_at.cmp(&a.committed_at).then(a.sha.cmp(&b.sha)));
        commits
    }

    fn pull_requests_since(&self, since: Option<DateTime<Utc>>) -> Vec<ScriptedPullRequest> {
        let mut prs: Vec<_> = self
            .script()
            .pull_requests
            .iter()
            .filter(|p| since.map_or(true, |s| p.updated_at >= s))
            .cloned()
            .collect();
        prs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.number.cmp(&b.number)));
        prs
    }
}

fn page_of<T>(all: Vec<T>, cursor: Option<&str>, page_size: u32) -> Result<Page<T>, ShiprError> {
    let offset = match cursor {
        Some(c) => c
            .parse::<usize>()
            .map_err(|_| ShiprError::validation(format!("bad cursor {c}")))?,
        None => 0,
    };
    let end = (offset + page_size.max(1) as usize).min(all.len());
    let has_next_page = end < all.len();
    let items = all.into_iter().skip(offset).take(end.saturating_sub(offset)).collect();
    Ok(Page {
        items,
        has_next_page,
        end_cursor: Some(end.to_string()),
    })
}

#[async_trait]
impl ActivitySource for ScriptedSource {
    fn host(&self) -> &str {
        "scripted"
    }

    async fn supports_bulk_query(&self) -> bool {
        self.script().bulk_supported
    }

    async fn commit_page(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page<CommitPayload>, ShiprError> {
        self.enter(true).await?;
        let malformed = self.script().malformed_commits;
        let mut items: Vec<CommitPayload> = Vec::new();
        if cursor.is_none() {
            for i in 0..malformed {
                items.push(CommitPayload::Graphql(GqlCommit {
                    oid: Some(format!("malformed-{i}")),
                    ..Default::default()
                }));
            }
        }
        let page = page_of(self.commits_since(since), cursor, page_size)?;
        items.extend(page.items.iter().map(|c| CommitPayload::Graphql(c.graphql())));
        Ok(Page {
            items,
            has_next_page: page.has_next_page,
            end_cursor: page.end_cursor,
        })
    }

    async fn pull_request_page(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page<PullRequestPayload>, ShiprError> {
        self.enter(true).await?;
        let review_limit = {
            let mut script = self.script();
            if script.throttled_pull_request_pages > 0 {
                script.throttled_pull_request_pages -= 1;
                return Err(ShiprError::RateLimited {
                    host: "scripted".to_string(),
                    retry_after_secs: 0,
                });
            }
            script.review_limit
        };
        let page = page_of(self.pull_requests_since(since), cursor, page_size)?;
        Ok(Page {
            items: page
                .items
                .iter()
                .map(|p| PullRequestPayload::Graphql(p.graphql(review_limit)))
                .collect(),
            has_next_page: page.has_next_page,
            end_cursor: page.end_cursor,
        })
    }

    async fn list_commits(
        &self,
        since: Option<DateTime<Utc>>,
        _page_size: u32,
    ) -> Result<Vec<CommitPayload>, ShiprError> {
        self.enter(false).await?;
        let malformed = self.script().malformed_commits;
        let mut items: Vec<CommitPayload> = (0..malformed)
            .map(|i| {
                CommitPayload::Rest(RestCommit {
                    sha: Some(format!("malformed-{i}")),
                    ..Default::default()
                })
            })
            .collect();
        items.extend(
            self.commits_since(since)
                .iter()
                .map(|c| CommitPayload::Rest(c.rest(false))),
        );
        Ok(items)
    }

    async fn get_commit(&self, sha: &str) -> Result<CommitPayload, ShiprError> {
        self.enter(false).await?;
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if sha.starts_with("malformed-") {
            return Ok(CommitPayload::Rest(RestCommit {
                sha: Some(sha.to_string()),
                ..Default::default()
            }));
        }
        self.script()
            .commits
            .iter()
            .find(|c| c.sha == sha)
            .map(|c| CommitPayload::Rest(c.rest(true)))
            .ok_or_else(|| ShiprError::ApiError {
                status: 422,
                message: format!("no commit found for SHA: {sha}"),
            })
    }

    async fn list_pull_requests(
        &self,
        since: Option<DateTime<Utc>>,
        _page_size: u32,
    ) -> Result<Vec<PullRequestPayload>, ShiprError> {
        self.enter(false).await?;
        Ok(self
            .pull_requests_since(since)
            .iter()
            .map(|p| PullRequestPayload::Rest(p.rest()))
            .collect())
    }

    async fn list_reviews(&self, number: u64) -> Result<Vec<ReviewPayload>, ShiprError> {
        self.enter(false).await?;
        Ok(self
            .script()
            .pull_requests
            .iter()
            .find(|p| p.number == number)
            .map(|p| p.reviews.iter().map(|r| ReviewPayload::Rest(r.rest())).collect())
            .unwrap_or_default())
    }
}

/// Hands out scripted sources by repository full name.
#[derive(Default)]
pub struct ScriptedSourceFactory {
    sources: Mutex<HashMap<String, Arc<ScriptedSource>>>,
}

impl ScriptedSourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, full_name: &str, source: ScriptedSource) -> Arc<ScriptedSource> {
        let source = Arc::new(source);
        self.sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(full_name.to_string(), source.clone());
        source
    }
}

impl SourceFactory for ScriptedSourceFactory {
    fn source_for(&self, repository: &Repository) -> Result<Arc<dyn ActivitySource>, ShiprError> {
        let sources = self
            .sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match sources.get(&repository.full_name) {
            Some(source) => Ok(source.clone() as Arc<dyn ActivitySource>),
            None => Err(ShiprError::RepositoryNotFound {
                name: repository.full_name.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_bulk_pages_follow_cursor() {
        let source = ScriptedSource::new()
            .with_commits((1..=5).map(|d| ScriptedCommit::new(&format!("c{d}"), at(d))));

        let first = source.commit_page(None, None, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_next_page);
        assert_eq!(first.items[0].sha(), Some("c5"));

        let second = source
            .commit_page(None, first.end_cursor.as_deref(), 2)
            .await
            .unwrap();
        let third = source
            .commit_page(None, second.end_cursor.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(!third.has_next_page);

        let since = source.commit_page(Some(at(4)), None, 10).await.unwrap();
        assert_eq!(since.items.len(), 2);
    }

    #[tokio::test]
    async fn test_both_shapes_normalize_to_the_same_rows() {
        let ada = ScriptedUser::account("ada", 42);
        let source = ScriptedSource::new()
            .with_commits([ScriptedCommit::new("c1", at(1)).by(ada.clone()).lines(7, 3)])
            .with_pull_requests([ScriptedPullRequest::opened(1, at(1))
                .by(ada.clone())
                .review(ScriptedReview::approved(10, ScriptedUser::account("bob", 7), at(2)))
                .merged(at(3))]);

        let bulk = source.commit_page(None, None, 10).await.unwrap().items[0]
            .normalize()
            .unwrap();
        let listed = source.list_commits(None, 10).await.unwrap();
        assert!(!listed[0].has_stats());
        let detail = source.get_commit("c1").await.unwrap().normalize().unwrap();
        assert_eq!(bulk, detail);

        let page = source.pull_request_page(None, None, 10).await.unwrap();
        let rest = source.list_pull_requests(None, 10).await.unwrap();
        assert_eq!(
            page.items[0].normalize().unwrap(),
            rest[0].normalize().unwrap()
        );
        let embedded = page.items[0].embedded_reviews().unwrap();
        let listed_reviews = source.list_reviews(1).await.unwrap();
        let embedded = embedded[0].normalize().unwrap();
        assert_eq!(embedded, listed_reviews[0].normalize().unwrap());
        assert_eq!(embedded.remote_id, "10");
    }

    #[tokio::test]
    async fn test_embedded_reviews_are_truncated() {
        let bob = ScriptedUser::account("bob", 7);
        let pr = (1..=3).fold(ScriptedPullRequest::opened(1, at(1)), |pr, id| {
            pr.review(ScriptedReview::approved(id, bob.clone(), at(2)))
        });
        let source = ScriptedSource::new()
            .with_pull_requests([pr])
            .embedding_reviews_up_to(2);

        let page = source.pull_request_page(None, None, 10).await.unwrap();
        assert!(page.items[0].has_more_reviews());
        assert_eq!(page.items[0].embedded_reviews().unwrap().len(), 2);
        assert_eq!(source.list_reviews(1).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_throttled_pull_request_pages() {
        let source = ScriptedSource::new().throttling_pull_request_pages(1);
        assert!(source.commit_page(None, None, 10).await.is_ok());
        let err = source.pull_request_page(None, None, 10).await.unwrap_err();
        assert!(matches!(
            err,
            ShiprError::RateLimited { retry_after_secs: 0, .. }
        ));
        assert!(source.pull_request_page(None, None, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let source = ScriptedSource::new().rate_limited(1).failing_bulk();
        assert!(source
            .commit_page(None, None, 10)
            .await
            .unwrap_err()
            .is_rate_limited());
        assert!(matches!(
            source.commit_page(None, None, 10).await,
            Err(ShiprError::ApiError { status: 502, .. })
        ));
        assert!(source.list_commits(None, 10).await.is_ok());
        assert_eq!(source.calls(), 3);

        let denied = ScriptedSource::new().failing_with(|| ShiprError::AuthFailed {
            host: "scripted".into(),
            message: "bad credentials".into(),
        });
        assert!(denied.list_reviews(1).await.unwrap_err().is_permanent());
    }
}
