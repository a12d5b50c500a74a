use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::OnceCell;

use shipr_auth::CredentialStore;
use shipr_core::error::ShiprError;
use shipr_core::models::repository::Repository;

use crate::dto::{GqlPullRequest, RestCommit, RestPullRequest, RestReview};
use crate::graphql::{self, CommitHistoryRepo, PullRequestsRepo, RepositoryData};
use crate::{
    ActivitySource, CommitPayload, Page, PullRequestPayload, ReviewPayload, SourceFactory,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// GitHub (or GitHub Enterprise) activity for one repository, over REST and GraphQL.
pub struct GitHubSource {
    client: reqwest::Client,
    api_url: url::Url,
    graphql_url: url::Url,
    host: String,
    owner: String,
    name: String,
    authenticated: bool,
    bulk_supported: OnceCell<bool>,
}

impl GitHubSource {
    pub fn new(
        api_url: url::Url,
        owner: &str,
        name: &str,
        token: Option<&str>,
    ) -> Result<Self, ShiprError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                ShiprError::CredentialError {
                    message: "token contains characters not allowed in a header".to_string(),
                }
            })?;
            headers.insert(header::AUTHORIZATION, value);
        }
        headers.insert(header::USER_AGENT, HeaderValue::from_static("shipr/0.1.0"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ShiprError::Config {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            host: api_url.host_str().unwrap_or("github.com").to_string(),
            graphql_url: graphql_endpoint(&api_url),
            client,
            api_url,
            owner: owner.to_string(),
            name: name.to_string(),
            authenticated: token.is_some(),
            bulk_supported: OnceCell::new(),
        })
    }

    fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    fn url(&self, path: &str) -> String {
        let base = self.api_url.as_str().trim_end_matches('/');
        format!("{base}{path}")
    }

    fn repo_url(&self, path: &str) -> String {
        self.url(&format!("/repos/{}/{}{path}", self.owner, self.name))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ShiprError> {
        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ShiprError::Timeout {
                    after: REQUEST_TIMEOUT,
                }
            } else {
                ShiprError::ApiError {
                    status: 0,
                    message: e.to_string(),
                }
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(
            &self.host,
            &self.full_name(),
            status.as_u16(),
            &headers,
            body,
            Utc::now(),
        ))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ShiprError> {
        let resp = self.send(self.client.get(url).query(query)).await?;
        resp.json().await.map_err(|e| ShiprError::ApiError {
            status: 0,
            message: format!("JSON parse error: {e}"),
        })
    }

    /// Page-numbered REST listing. Stops early once `keep` rejects an item.
    async fn paginated_get<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        per_page: u32,
        keep: impl Fn(&T) -> bool,
    ) -> Result<Vec<T>, ShiprError> {
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let mut params = query.to_vec();
            params.push(("per_page", per_page.to_string()));
            params.push(("page", page.to_string()));
            let items: Vec<T> = self.get_json(url, &params).await?;

            let count = items.len();
            let mut exhausted = false;
            for item in items {
                if !keep(&item) {
                    exhausted = true;
                    break;
                }
                all.push(item);
            }

            tracing::debug!("{}: page {page} returned {count} items", self.full_name());
            if exhausted || count < per_page as usize {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, ShiprError> {
        let body = json!({ "query": query, "variables": variables });
        let resp = self
            .send(self.client.post(self.graphql_url.as_str()).json(&body))
            .await?;
        let envelope: graphql::Response<T> = resp.json().await.map_err(|e| ShiprError::ApiError {
            status: 0,
            message: format!("GraphQL parse error: {e}"),
        })?;

        match envelope.data {
            Some(data) if envelope.errors.is_empty() => Ok(data),
            _ => Err(self.graphql_error(&envelope.errors)),
        }
    }

    fn graphql_error(&self, errors: &[graphql::GraphqlError]) -> ShiprError {
        let kind = |k: &str| errors.iter().any(|e| e.kind.as_deref() == Some(k));
        if kind("RATE_LIMITED") {
            return ShiprError::RateLimited {
                host: self.host.clone(),
                retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
            };
        }
        if kind("NOT_FOUND") {
            return ShiprError::RepositoryNotFound {
                name: self.full_name(),
            };
        }
        let message = errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        ShiprError::ApiError {
            status: 200,
            message: format!("GraphQL: {message}"),
        }
    }
}

#[async_trait]
impl ActivitySource for GitHubSource {
    fn host(&self) -> &str {
        &self.host
    }

    async fn supports_bulk_query(&self) -> bool {
        if !self.authenticated {
            return false;
        }
        *self
            .bulk_supported
            .get_or_init(|| async {
                match self
                    .graphql::<serde_json::Value>(graphql::VIEWER_QUERY, json!({}))
                    .await
                {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!("{}: GraphQL unavailable ({e}), using REST", self.host);
                        false
                    }
                }
            })
            .await
    }

    async fn commit_page(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page<CommitPayload>, ShiprError> {
        let variables = json!({
            "owner": self.owner,
            "name": self.name,
            "since": since.map(|s| s.to_rfc3339_opts(SecondsFormat::Secs, true)),
            "cursor": cursor,
            "pageSize": page_size,
        });
        let data: RepositoryData<CommitHistoryRepo> =
            self.graphql(graphql::COMMIT_HISTORY_QUERY, variables).await?;
        let repo = data.repository.ok_or_else(|| ShiprError::RepositoryNotFound {
            name: self.full_name(),
        })?;

        // An empty repository has no default branch.
        let Some(history) = repo
            .default_branch_ref
            .and_then(|b| b.target)
            .and_then(|t| t.history)
        else {
            return Ok(Page::last(Vec::new()));
        };

        Ok(Page {
            items: history.nodes.into_iter().map(CommitPayload::Graphql).collect(),
            has_next_page: history.page_info.has_next_page,
            end_cursor: history.page_info.end_cursor,
        })
    }

    async fn pull_request_page(
        &self,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page<PullRequestPayload>, ShiprError> {
        let variables = json!({
            "owner": self.owner,
            "name": self.name,
            "cursor": cursor,
            "pageSize": page_size,
        });
        let data: RepositoryData<PullRequestsRepo> =
            self.graphql(graphql::PULL_REQUESTS_QUERY, variables).await?;
        let repo = data.repository.ok_or_else(|| ShiprError::RepositoryNotFound {
            name: self.full_name(),
        })?;
        let connection = repo.pull_requests;

        let (nodes, reached_since) = truncate_since(connection.nodes, since);
        Ok(Page {
            items: nodes.into_iter().map(PullRequestPayload::Graphql).collect(),
            has_next_page: connection.page_info.has_next_page && !reached_since,
            end_cursor: connection.page_info.end_cursor,
        })
    }

    async fn list_commits(
        &self,
        since: Option<DateTime<Utc>>,
        page_size: u32,
    ) -> Result<Vec<CommitPayload>, ShiprError> {
        let mut query = Vec::new();
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        let commits: Vec<RestCommit> = self
            .paginated_get(&self.repo_url("/commits"), &query, page_size, |_| true)
            .await?;
        Ok(commits.into_iter().map(CommitPayload::Rest).collect())
    }

    async fn get_commit(&self, sha: &str) -> Result<CommitPayload, ShiprError> {
        let commit: RestCommit = self
            .get_json(&self.repo_url(&format!("/commits/{sha}")), &[])
            .await?;
        Ok(CommitPayload::Rest(commit))
    }

    async fn list_pull_requests(
        &self,
        since: Option<DateTime<Utc>>,
        page_size: u32,
    ) -> Result<Vec<PullRequestPayload>, ShiprError> {
        let query = [
            ("state", "all".to_string()),
            ("sort", "updated".to_string()),
            ("direction", "desc".to_string()),
        ];
        let pulls: Vec<RestPullRequest> = self
            .paginated_get(
                &self.repo_url("/pulls"),
                &query,
                page_size,
                |pr: &RestPullRequest| !updated_before(pr.updated_at.as_deref(), since),
            )
            .await?;
        Ok(pulls.into_iter().map(PullRequestPayload::Rest).collect())
    }

    async fn list_reviews(&self, number: u64) -> Result<Vec<ReviewPayload>, ShiprError> {
        let reviews: Vec<RestReview> = self
            .paginated_get(
                &self.repo_url(&format!("/pulls/{number}/reviews")),
                &[],
                100,
                |_| true,
            )
            .await?;
        Ok(reviews.into_iter().map(ReviewPayload::Rest).collect())
    }
}

/// Builds [`GitHubSource`]s, looking each repository's token up in a credential store.
pub struct GitHubSourceFactory {
    default_api_url: url::Url,
    credentials: Arc<dyn CredentialStore>,
    default_token: Option<String>,
}

impl GitHubSourceFactory {
    pub fn new(
        default_api_url: url::Url,
        credentials: Arc<dyn CredentialStore>,
        default_token: Option<String>,
    ) -> Self {
        Self {
            default_api_url,
            credentials,
            default_token,
        }
    }
}

impl SourceFactory for GitHubSourceFactory {
    fn source_for(&self, repository: &Repository) -> Result<Arc<dyn ActivitySource>, ShiprError> {
        let token = self.credentials.resolve(
            repository.credential_key.as_deref(),
            self.default_token.as_deref(),
        )?;
        if token.is_none() {
            tracing::debug!("{}: no token, using anonymous access", repository.full_name);
        }
        let api_url = repository
            .api_url
            .clone()
            .unwrap_or_else(|| self.default_api_url.clone());
        let source = GitHubSource::new(
            api_url,
            &repository.owner,
            &repository.name,
            token.as_deref(),
        )?;
        Ok(Arc::new(source))
    }
}

/// `https://api.github.com` → `/graphql`; Enterprise `…/api/v3` → `…/api/graphql`.
fn graphql_endpoint(api_url: &url::Url) -> url::Url {
    let path = api_url.path().trim_end_matches('/');
    let graphql_path = match path.strip_suffix("/v3") {
        Some(prefix) => format!("{prefix}/graphql"),
        None => format!("{path}/graphql"),
    };
    let mut url = api_url.clone();
    url.set_path(&graphql_path);
    url
}

/// Map a non-success HTTP status onto the error taxonomy.
pub(crate) fn classify_status(
    host: &str,
    full_name: &str,
    status: u16,
    headers: &HeaderMap,
    body: String,
    now: DateTime<Utc>,
) -> ShiprError {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let exhausted = header_str("x-ratelimit-remaining") == Some("0");

    match status {
        401 => ShiprError::AuthFailed {
            host: host.to_string(),
            message: body,
        },
        404 => ShiprError::RepositoryNotFound {
            name: full_name.to_string(),
        },
        429 => ShiprError::RateLimited {
            host: host.to_string(),
            retry_after_secs: retry_after_secs(headers, now),
        },
        403 if exhausted || header_str("retry-after").is_some() => ShiprError::RateLimited {
            host: host.to_string(),
            retry_after_secs: retry_after_secs(headers, now),
        },
        _ => ShiprError::ApiError {
            status,
            message: body,
        },
    }
}

/// Seconds to wait, from `Retry-After` or the `x-ratelimit-reset` epoch.
fn retry_after_secs(headers: &HeaderMap, now: DateTime<Utc>) -> u64 {
    let header_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };
    if let Some(secs) = header_u64("retry-after") {
        return secs;
    }
    if let Some(reset) = header_u64("x-ratelimit-reset") {
        let wait = reset as i64 - now.timestamp();
        return wait.max(1) as u64;
    }
    DEFAULT_RETRY_AFTER_SECS
}

fn updated_before(updated_at: Option<&str>, since: Option<DateTime<Utc>>) -> bool {
    let (Some(raw), Some(since)) = (updated_at, since) else {
        return false;
    };
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc) < since)
        .unwrap_or(false)
}

/// Drop nodes last updated before `since`. Nodes arrive newest first, so the
/// second value says whether the listing has gone past the watermark.
fn truncate_since(
    nodes: Vec<GqlPullRequest>,
    since: Option<DateTime<Utc>>,
) -> (Vec<GqlPullRequest>, bool) {
    let mut kept = Vec::with_capacity(nodes.len());
    for node in nodes {
        if updated_before(node.updated_at.as_deref(), since) {
            return (kept, true);
        }
        kept.push(node);
    }
    (kept, false)
}
