//! GraphQL documents and envelopes for the bulk listing calls.

use serde::Deserialize;

use crate::dto::{GqlCommit, GqlPullRequest};

pub(crate) const VIEWER_QUERY: &str = "query { viewer { login } }";

pub(crate) const COMMIT_HISTORY_QUERY: &str = r#"
query($owner: String!, $name: String!, $since: GitTimestamp, $cursor: String, $pageSize: Int!) {
  repository(owner: $owner, name: $name) {
    defaultBranchRef {
      target {
        ... on Commit {
          history(first: $pageSize, after: $cursor, since: $since) {
            pageInfo { hasNextPage endCursor }
            nodes {
              oid
              message
              committedDate
              additions
              deletions
              author { name email user { login databaseId avatarUrl } }
              committer { name email user { login databaseId avatarUrl } }
            }
          }
        }
      }
    }
  }
}
"#;

pub(crate) const PULL_REQUESTS_QUERY: &str = r#"
query($owner: String!, $name: String!, $cursor: String, $pageSize: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequests(first: $pageSize, after: $cursor, orderBy: {field: UPDATED_AT, direction: DESC}) {
      pageInfo { hasNextPage endCursor }
      nodes {
        number
        title
        state
        createdAt
        updatedAt
        closedAt
        mergedAt
        additions
        deletions
        changedFiles
        author { login avatarUrl ... on User { databaseId } }
        reviews(first: 100) {
          pageInfo { hasNextPage }
          nodes {
            id
            databaseId
            state
            submittedAt
            author { login avatarUrl ... on User { databaseId } }
          }
        }
      }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
pub(crate) struct Response<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphqlError {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Connection<T> {
    pub page_info: PageInfo,
    #[serde(default = "Vec::new")]
    pub nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RepositoryData<T> {
    pub repository: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CommitHistoryRepo {
    pub default_branch_ref: Option<BranchRef>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BranchRef {
    pub target: Option<CommitTarget>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CommitTarget {
    pub history: Option<Connection<GqlCommit>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PullRequestsRepo {
    pub pull_requests: Connection<GqlPullRequest>,
}
