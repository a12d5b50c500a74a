//! Remote payload shapes and their normalization.
//!
//! Every field is optional at the deserialization layer so a page with one
//! odd record still parses; `normalize` is the validation step that decides
//! whether a record is usable.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use shipr_core::error::ShiprError;
use shipr_core::models::activity::{PrState, ReviewState};
use shipr_core::models::user::IdentitySignal;

use crate::{RemoteCommit, RemotePullRequest, RemoteReview};

// ── GraphQL shapes ──

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GqlActor {
    pub login: Option<String>,
    pub database_id: Option<i64>,
    pub avatar_url: Option<String>,
}

/// Git-level author/committer with the linked account, if any.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GqlGitActor {
    pub name: Option<String>,
    pub email: Option<String>,
    pub user: Option<GqlActor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GqlCommit {
    pub oid: Option<String>,
    pub message: Option<String>,
    pub committed_date: Option<String>,
    pub additions: Option<u32>,
    pub deletions: Option<u32>,
    pub author: Option<GqlGitActor>,
    pub committer: Option<GqlGitActor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GqlReview {
    /// Global node id. Stored ids come from `database_id`, which REST reports as `id`.
    pub id: Option<String>,
    pub database_id: Option<i64>,
    pub state: Option<String>,
    pub submitted_at: Option<String>,
    pub author: Option<GqlActor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GqlReviewPageInfo {
    #[serde(default)]
    pub has_next_page: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GqlReviewConnection {
    pub page_info: Option<GqlReviewPageInfo>,
    #[serde(default)]
    pub nodes: Vec<GqlReview>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GqlPullRequest {
    pub number: Option<u64>,
    pub title: Option<String>,
    pub state: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub closed_at: Option<String>,
    pub merged_at: Option<String>,
    pub additions: Option<u32>,
    pub deletions: Option<u32>,
    pub changed_files: Option<u32>,
    pub author: Option<GqlActor>,
    pub reviews: Option<GqlReviewConnection>,
}

// ── REST shapes ──

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestUser {
    pub login: Option<String>,
    pub id: Option<i64>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestGitActor {
    pub name: Option<String>,
    pub email: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestCommitDetail {
    pub message: Option<String>,
    pub author: Option<RestGitActor>,
    pub committer: Option<RestGitActor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestStats {
    #[serde(default)]
    pub additions: u32,
    #[serde(default)]
    pub deletions: u32,
}

/// A commit from the list or detail endpoint. Only the detail carries `stats`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestCommit {
    pub sha: Option<String>,
    pub commit: Option<RestCommitDetail>,
    pub author: Option<RestUser>,
    pub committer: Option<RestUser>,
    pub stats: Option<RestStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestPullRequest {
    pub number: Option<u64>,
    pub title: Option<String>,
    pub state: Option<String>,
    pub user: Option<RestUser>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub closed_at: Option<String>,
    pub merged_at: Option<String>,
    pub additions: Option<u32>,
    pub deletions: Option<u32>,
    pub changed_files: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestReview {
    pub id: Option<i64>,
    pub state: Option<String>,
    pub submitted_at: Option<String>,
    pub user: Option<RestUser>,
}

// ── Tagged payloads ──

#[derive(Debug, Clone)]
pub enum CommitPayload {
    Graphql(GqlCommit),
    Rest(RestCommit),
}

#[derive(Debug, Clone)]
pub enum PullRequestPayload {
    Graphql(GqlPullRequest),
    Rest(RestPullRequest),
}

#[derive(Debug, Clone)]
pub enum ReviewPayload {
    Graphql(GqlReview),
    Rest(RestReview),
}

impl CommitPayload {
    pub fn sha(&self) -> Option<&str> {
        match self {
            CommitPayload::Graphql(c) => c.oid.as_deref(),
            CommitPayload::Rest(c) => c.sha.as_deref(),
        }
    }

    /// True when the payload carries line stats.
    pub fn has_stats(&self) -> bool {
        match self {
            CommitPayload::Graphql(c) => c.additions.is_some() && c.deletions.is_some(),
            CommitPayload::Rest(c) => c.stats.is_some(),
        }
    }

    pub fn normalize(&self) -> Result<RemoteCommit, ShiprError> {
        match self {
            CommitPayload::Graphql(c) => {
                let sha = required("commit oid", c.oid.as_deref())?;
                Ok(RemoteCommit {
                    sha: sha.to_string(),
                    message: c.message.clone().unwrap_or_default(),
                    committed_at: timestamp("committedDate", c.committed_date.as_deref())?,
                    author: c.author.as_ref().and_then(git_actor_identity),
                    committer: c.committer.as_ref().and_then(git_actor_identity),
                    additions: c.additions.unwrap_or(0),
                    deletions: c.deletions.unwrap_or(0),
                })
            }
            CommitPayload::Rest(c) => {
                let sha = required("commit sha", c.sha.as_deref())?;
                let detail = c
                    .commit
                    .as_ref()
                    .ok_or_else(|| ShiprError::validation(format!("commit {sha} has no detail")))?;
                let committed = detail
                    .committer
                    .as_ref()
                    .and_then(|a| a.date.as_deref())
                    .or_else(|| detail.author.as_ref().and_then(|a| a.date.as_deref()));
                let stats = c.stats.clone().unwrap_or_default();
                Ok(RemoteCommit {
                    sha: sha.to_string(),
                    message: detail.message.clone().unwrap_or_default(),
                    committed_at: timestamp("commit date", committed)?,
                    author: rest_git_identity(detail.author.as_ref(), c.author.as_ref()),
                    committer: rest_git_identity(detail.committer.as_ref(), c.committer.as_ref()),
                    additions: stats.additions,
                    deletions: stats.deletions,
                })
            }
        }
    }
}

impl PullRequestPayload {
    pub fn number(&self) -> Option<u64> {
        match self {
            PullRequestPayload::Graphql(pr) => pr.number,
            PullRequestPayload::Rest(pr) => pr.number,
        }
    }

    /// Reviews delivered with the pull request, if this shape embeds them.
    pub fn embedded_reviews(&self) -> Option<Vec<ReviewPayload>> {
        match self {
            PullRequestPayload::Graphql(pr) => Some(
                pr.reviews
                    .as_ref()
                    .map(|conn| conn.nodes.iter().cloned().map(ReviewPayload::Graphql).collect())
                    .unwrap_or_default(),
            ),
            PullRequestPayload::Rest(_) => None,
        }
    }

    /// True when the embedded review list was cut short and the rest must be
    /// listed per pull request.
    pub fn has_more_reviews(&self) -> bool {
        match self {
            PullRequestPayload::Graphql(pr) => pr
                .reviews
                .as_ref()
                .and_then(|conn| conn.page_info.as_ref())
                .is_some_and(|info| info.has_next_page),
            PullRequestPayload::Rest(_) => false,
        }
    }

    pub fn normalize(&self) -> Result<RemotePullRequest, ShiprError> {
        match self {
            PullRequestPayload::Graphql(pr) => {
                let number = pr
                    .number
                    .ok_or_else(|| ShiprError::validation("pull request without number"))?;
                let merged_at = optional_timestamp("mergedAt", pr.merged_at.as_deref())?;
                let state = pr_state(pr.state.as_deref(), merged_at.is_some())?;
                Ok(RemotePullRequest {
                    number,
                    title: pr.title.clone().unwrap_or_default(),
                    state,
                    author: pr.author.as_ref().and_then(actor_identity),
                    created_at: timestamp("createdAt", pr.created_at.as_deref())?,
                    updated_at: timestamp("updatedAt", pr.updated_at.as_deref())?,
                    closed_at: optional_timestamp("closedAt", pr.closed_at.as_deref())?,
                    merged_at,
                    additions: pr.additions.unwrap_or(0),
                    deletions: pr.deletions.unwrap_or(0),
                    changed_files: pr.changed_files.unwrap_or(0),
                })
            }
            PullRequestPayload::Rest(pr) => {
                let number = pr
                    .number
                    .ok_or_else(|| ShiprError::validation("pull request without number"))?;
                let merged_at = optional_timestamp("merged_at", pr.merged_at.as_deref())?;
                let state = pr_state(pr.state.as_deref(), merged_at.is_some())?;
                Ok(RemotePullRequest {
                    number,
                    title: pr.title.clone().unwrap_or_default(),
                    state,
                    author: pr.user.as_ref().and_then(user_identity),
                    created_at: timestamp("created_at", pr.created_at.as_deref())?,
                    updated_at: timestamp("updated_at", pr.updated_at.as_deref())?,
                    closed_at: optional_timestamp("closed_at", pr.closed_at.as_deref())?,
                    merged_at,
                    additions: pr.additions.unwrap_or(0),
                    deletions: pr.deletions.unwrap_or(0),
                    changed_files: pr.changed_files.unwrap_or(0),
                })
            }
        }
    }
}

impl ReviewPayload {
    pub fn normalize(&self) -> Result<RemoteReview, ShiprError> {
        let (remote_id, state, submitted_at, reviewer) = match self {
            ReviewPayload::Graphql(r) => (
                r.database_id
                    .map(|id| id.to_string())
                    .ok_or_else(|| {
                        ShiprError::validation(format!(
                            "review {} without databaseId",
                            r.id.as_deref().unwrap_or("?")
                        ))
                    })?,
                r.state.as_deref(),
                r.submitted_at.as_deref(),
                r.author.as_ref().and_then(actor_identity),
            ),
            ReviewPayload::Rest(r) => (
                r.id.map(|id| id.to_string())
                    .ok_or_else(|| ShiprError::validation("review without id"))?,
                r.state.as_deref(),
                r.submitted_at.as_deref(),
                r.user.as_ref().and_then(user_identity),
            ),
        };
        let state = required("review state", state)?
            .parse::<ReviewState>()
            .map_err(ShiprError::validation)?;
        Ok(RemoteReview {
            submitted_at: timestamp("review submitted time", submitted_at)?,
            remote_id,
            reviewer,
            state,
        })
    }
}

// ── Helpers ──

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn required<'a>(field: &str, value: Option<&'a str>) -> Result<&'a str, ShiprError> {
    non_empty(value).ok_or_else(|| ShiprError::validation(format!("missing {field}")))
}

fn timestamp(field: &str, value: Option<&str>) -> Result<DateTime<Utc>, ShiprError> {
    let raw = required(field, value)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ShiprError::validation(format!("bad {field} '{raw}': {e}")))
}

fn optional_timestamp(field: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>, ShiprError> {
    match non_empty(value) {
        Some(_) => timestamp(field, value).map(Some),
        None => Ok(None),
    }
}

/// A merge timestamp wins over whatever state string came with it.
fn pr_state(raw: Option<&str>, merged: bool) -> Result<PrState, ShiprError> {
    if merged {
        return Ok(PrState::Merged);
    }
    required("pull request state", raw)?
        .parse()
        .map_err(ShiprError::validation)
}

fn identity(
    name: Option<&str>,
    email: Option<&str>,
    login: Option<&str>,
    remote_id: Option<i64>,
    avatar_url: Option<&str>,
) -> Option<IdentitySignal> {
    let signal = IdentitySignal {
        name: non_empty(name)
            .or(non_empty(login))
            .unwrap_or("unknown")
            .to_string(),
        email: non_empty(email).map(str::to_string),
        login: non_empty(login).map(str::to_string),
        remote_id,
        avatar_url: non_empty(avatar_url).map(str::to_string),
    };
    signal.is_resolvable().then_some(signal)
}

fn actor_identity(actor: &GqlActor) -> Option<IdentitySignal> {
    identity(
        None,
        None,
        actor.login.as_deref(),
        actor.database_id,
        actor.avatar_url.as_deref(),
    )
}

fn git_actor_identity(actor: &GqlGitActor) -> Option<IdentitySignal> {
    let user = actor.user.as_ref();
    identity(
        actor.name.as_deref(),
        actor.email.as_deref(),
        user.and_then(|u| u.login.as_deref()),
        user.and_then(|u| u.database_id),
        user.and_then(|u| u.avatar_url.as_deref()),
    )
}

fn user_identity(user: &RestUser) -> Option<IdentitySignal> {
    identity(
        None,
        None,
        user.login.as_deref(),
        user.id,
        user.avatar_url.as_deref(),
    )
}

fn rest_git_identity(git: Option<&RestGitActor>, user: Option<&RestUser>) -> Option<IdentitySignal> {
    identity(
        git.and_then(|g| g.name.as_deref()),
        git.and_then(|g| g.email.as_deref()),
        user.and_then(|u| u.login.as_deref()),
        user.and_then(|u| u.id),
        user.and_then(|u| u.avatar_url.as_deref()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_graphql_and_rest_commits_normalize_alike() {
        let gql: GqlCommit = serde_json::from_value(json!({
            "oid": "abc123",
            "message": "Fix widget",
            "committedDate": "2024-05-01T10:00:00Z",
            "additions": 12,
            "deletions": 3,
            "author": {
                "name": "Ada",
                "email": "Ada@Example.com",
                "user": { "login": "ada", "databaseId": 42, "avatarUrl": "https://a/42.png" }
            },
            "committer": { "name": "GitHub", "email": "noreply@github.com", "user": null }
        }))
        .unwrap();
        let rest: RestCommit = serde_json::from_value(json!({
            "sha": "abc123",
            "commit": {
                "message": "Fix widget",
                "author": { "name": "Ada", "email": "Ada@Example.com", "date": "2024-05-01T09:00:00Z" },
                "committer": { "name": "GitHub", "email": "noreply@github.com", "date": "2024-05-01T10:00:00Z" }
            },
            "author": { "login": "ada", "id": 42, "avatar_url": "https://a/42.png" },
            "committer": null,
            "stats": { "additions": 12, "deletions": 3, "total": 15 }
        }))
        .unwrap();

        let from_gql = CommitPayload::Graphql(gql).normalize().unwrap();
        let from_rest = CommitPayload::Rest(rest).normalize().unwrap();
        assert_eq!(from_gql, from_rest);
        assert_eq!(
            from_gql.committed_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        let author = from_gql.author.unwrap();
        assert_eq!(author.remote_id, Some(42));
        assert_eq!(author.login.as_deref(), Some("ada"));
        assert_eq!(from_gql.committer.unwrap().remote_id, None);
    }

    #[test]
    fn test_rest_list_item_without_stats() {
        let rest: RestCommit = serde_json::from_value(json!({
            "sha": "def456",
            "commit": { "message": "m", "author": { "name": "Bo", "email": "bo@x.io", "date": "2024-05-02T00:00:00Z" } }
        }))
        .unwrap();
        let payload = CommitPayload::Rest(rest);
        assert!(!payload.has_stats());
        let commit = payload.normalize().unwrap();
        assert_eq!(commit.additions, 0);
        assert!(commit.committer.is_none());
    }

    #[test]
    fn test_malformed_commit_fails_validation() {
        let missing_date = CommitPayload::Graphql(GqlCommit {
            oid: Some("abc".to_string()),
            ..Default::default()
        });
        assert!(matches!(
            missing_date.normalize(),
            Err(ShiprError::Validation { .. })
        ));

        let bad_date = CommitPayload::Graphql(GqlCommit {
            oid: Some("abc".to_string()),
            committed_date: Some("yesterday".to_string()),
            ..Default::default()
        });
        assert!(bad_date.normalize().is_err());

        let no_sha = CommitPayload::Rest(RestCommit::default());
        assert!(no_sha.normalize().is_err());
    }

    #[test]
    fn test_pull_request_states() {
        let merged: RestPullRequest = serde_json::from_value(json!({
            "number": 7,
            "title": "Add widgets",
            "state": "closed",
            "user": { "login": "ada", "id": 42 },
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T12:00:00Z",
            "closed_at": "2024-05-01T12:00:00Z",
            "merged_at": "2024-05-01T12:00:00Z"
        }))
        .unwrap();
        let pr = PullRequestPayload::Rest(merged).normalize().unwrap();
        assert_eq!(pr.state, PrState::Merged);
        assert_eq!(pr.author.unwrap().remote_id, Some(42));

        let closed: GqlPullRequest = serde_json::from_value(json!({
            "number": 8,
            "title": "Abandoned",
            "state": "CLOSED",
            "createdAt": "2024-05-01T10:00:00Z",
            "updatedAt": "2024-05-02T10:00:00Z",
            "closedAt": "2024-05-02T10:00:00Z",
            "mergedAt": null,
            "author": null,
            "reviews": { "nodes": [
                { "id": "PRR_1", "databaseId": 501, "state": "CHANGES_REQUESTED", "submittedAt": "2024-05-01T11:00:00Z",
                  "author": { "login": "bob", "databaseId": 7 } },
                { "id": "PRR_2", "state": "PENDING", "submittedAt": null, "author": null }
            ] }
        }))
        .unwrap();
        let payload = PullRequestPayload::Graphql(closed);
        let pr = payload.normalize().unwrap();
        assert_eq!(pr.state, PrState::Closed);
        assert!(pr.author.is_none());

        let reviews = payload.embedded_reviews().unwrap();
        assert_eq!(reviews.len(), 2);
        let first = reviews[0].normalize().unwrap();
        assert_eq!(first.state, ReviewState::ChangesRequested);
        assert_eq!(first.remote_id, "501");
        assert_eq!(first.reviewer.unwrap().login.as_deref(), Some("bob"));
        assert!(reviews[1].normalize().is_err());
        assert!(!payload.has_more_reviews());
    }

    #[test]
    fn test_review_ids_match_across_shapes() {
        let gql: GqlReview = serde_json::from_value(json!({
            "id": "PRR_kwDOAbCd5M5xYz12",
            "databaseId": 1621432178,
            "state": "APPROVED",
            "submittedAt": "2024-05-01T11:00:00Z",
            "author": { "login": "bob", "databaseId": 7 }
        }))
        .unwrap();
        let rest: RestReview = serde_json::from_value(json!({
            "id": 1621432178,
            "state": "APPROVED",
            "submitted_at": "2024-05-01T11:00:00Z",
            "user": { "login": "bob", "id": 7 }
        }))
        .unwrap();
        let from_gql = ReviewPayload::Graphql(gql).normalize().unwrap();
        let from_rest = ReviewPayload::Rest(rest).normalize().unwrap();
        assert_eq!(from_gql.remote_id, "1621432178");
        assert_eq!(from_gql, from_rest);

        let node_only = ReviewPayload::Graphql(GqlReview {
            id: Some("PRR_kwDOAbCd5M5xYz12".to_string()),
            state: Some("APPROVED".to_string()),
            submitted_at: Some("2024-05-01T11:00:00Z".to_string()),
            ..Default::default()
        });
        assert!(matches!(
            node_only.normalize(),
            Err(ShiprError::Validation { .. })
        ));
    }

    #[test]
    fn test_truncated_review_connection() {
        let pr: GqlPullRequest = serde_json::from_value(json!({
            "number": 9,
            "reviews": {
                "pageInfo": { "hasNextPage": true },
                "nodes": [ { "id": "PRR_9", "databaseId": 9, "state": "COMMENTED",
                             "submittedAt": "2024-05-01T11:00:00Z" } ]
            }
        }))
        .unwrap();
        let payload = PullRequestPayload::Graphql(pr);
        assert!(payload.has_more_reviews());
        assert_eq!(payload.embedded_reviews().unwrap().len(), 1);
    }

    #[test]
    fn test_rest_review_ids_are_stringified() {
        let review: RestReview = serde_json::from_value(json!({
            "id": 80,
            "state": "DISMISSED",
            "submitted_at": "2024-05-01T11:00:00Z",
            "user": { "login": "cy", "id": 9 }
        }))
        .unwrap();
        let review = ReviewPayload::Rest(review).normalize().unwrap();
        assert_eq!(review.remote_id, "80");
        assert_eq!(review.state, ReviewState::Commented);
    }

    #[test]
    fn test_unresolvable_actor_is_dropped() {
        assert!(identity(Some("ghost"), None, None, None, None).is_none());
        let signal = identity(None, Some(" "), Some("ada"), None, None).unwrap();
        assert_eq!(signal.name, "ada");
        assert_eq!(signal.email, None);
    }
}
