use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

use shipr_core::models::activity::{
    Commit, PrState, PullRequest, PullRequestId, Review, ReviewState,
};
use shipr_core::models::repository::{Repository, RepositoryId, TenantId};
use shipr_core::models::sync_state::SyncResult;
use shipr_core::models::team::{Team, TeamId};
use shipr_core::models::user::{User, UserId};

// ── Helpers ──

/// Fixed-width UTC timestamp; lexical order equals chronological order.
pub fn fmt_dt(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_dt(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(fmt_dt)
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn dt_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_dt_col(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn uuid_col(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| conversion_error(idx, e))
}

fn opt_uuid_col(row: &Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| Uuid::parse_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn parsed_col<T: FromStr<Err = String>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e: String| conversion_error(idx, e))
}

// ── Repositories ──

const REPOSITORY_COLUMNS: &str = "id, tenant_id, full_name, owner, name, clone_url, api_url, credential_key, last_sync_at, created_at";

pub fn insert_repository(conn: &Connection, repo: &Repository) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO repositories (id, tenant_id, full_name, owner, name, clone_url, api_url, credential_key, last_sync_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            repo.id.0.to_string(),
            repo.tenant_id.as_str(),
            repo.full_name,
            repo.owner,
            repo.name,
            repo.clone_url,
            repo.api_url.as_ref().map(|u| u.to_string()),
            repo.credential_key,
            opt_dt(&repo.last_sync_at),
            fmt_dt(&repo.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_repository(conn: &Connection, id: &RepositoryId) -> anyhow::Result<Option<Repository>> {
    let sql = format!("SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id.0.to_string()], row_to_repository)
        .optional()?)
}

pub fn get_repository_by_full_name(
    conn: &Connection,
    tenant: &TenantId,
    full_name: &str,
) -> anyhow::Result<Option<Repository>> {
    let sql = format!(
        "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE tenant_id = ?1 AND full_name = ?2"
    );
    Ok(conn
        .query_row(&sql, params![tenant.as_str(), full_name], row_to_repository)
        .optional()?)
}

pub fn list_repositories(conn: &Connection, tenant: &TenantId) -> anyhow::Result<Vec<Repository>> {
    let sql = format!(
        "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE tenant_id = ?1 ORDER BY full_name"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![tenant.as_str()], row_to_repository)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn delete_repository(conn: &Connection, id: &RepositoryId) -> anyhow::Result<()> {
    conn.execute(
        "DELETE FROM repositories WHERE id = ?1",
        params![id.0.to_string()],
    )?;
    Ok(())
}

/// Move the watermark forward to `ts`. Never moves it backwards; returns whether it moved.
pub fn advance_watermark(
    conn: &Connection,
    id: &RepositoryId,
    ts: &DateTime<Utc>,
) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "UPDATE repositories SET last_sync_at = ?1
         WHERE id = ?2 AND (last_sync_at IS NULL OR last_sync_at <= ?1)",
        params![fmt_dt(ts), id.0.to_string()],
    )?;
    Ok(changed == 1)
}

/// Reset the watermark to the epoch so the next collection refetches everything.
pub fn reset_watermark(conn: &Connection, id: &RepositoryId) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE repositories SET last_sync_at = ?1 WHERE id = ?2",
        params![fmt_dt(&DateTime::<Utc>::UNIX_EPOCH), id.0.to_string()],
    )?;
    Ok(())
}

fn row_to_repository(row: &Row) -> rusqlite::Result<Repository> {
    let api_url: Option<String> = row.get(6)?;
    Ok(Repository {
        id: RepositoryId::from_uuid(uuid_col(row, 0)?),
        tenant_id: TenantId(row.get(1)?),
        full_name: row.get(2)?,
        owner: row.get(3)?,
        name: row.get(4)?,
        clone_url: row.get(5)?,
        api_url: api_url.and_then(|s| url::Url::parse(&s).ok()),
        credential_key: row.get(7)?,
        last_sync_at: opt_dt_col(row, 8)?,
        created_at: dt_col(row, 9)?,
    })
}

// ── Users ──

const USER_COLUMNS: &str = "id, name, email, login, remote_id, avatar_url, created_at";

pub fn insert_user(conn: &Connection, user: &User) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO users (id, name, email, login, remote_id, avatar_url, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user.id.0.to_string(),
            user.name,
            user.email,
            user.login,
            user.remote_id,
            user.avatar_url,
            fmt_dt(&user.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_user(conn: &Connection, id: &UserId) -> anyhow::Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id.0.to_string()], row_to_user)
        .optional()?)
}

pub fn find_user_by_remote_id(conn: &Connection, remote_id: i64) -> anyhow::Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE remote_id = ?1");
    Ok(conn.query_row(&sql, params![remote_id], row_to_user).optional()?)
}

/// Oldest user with this email. Emails are stored lower-cased.
pub fn find_user_by_email(conn: &Connection, email: &str) -> anyhow::Result<Option<User>> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users WHERE email = ?1 ORDER BY created_at, id LIMIT 1"
    );
    Ok(conn.query_row(&sql, params![email], row_to_user).optional()?)
}

/// Oldest user with this login, compared case-insensitively.
pub fn find_user_by_login(conn: &Connection, login: &str) -> anyhow::Result<Option<User>> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users WHERE login = ?1 ORDER BY created_at, id LIMIT 1"
    );
    Ok(conn.query_row(&sql, params![login], row_to_user).optional()?)
}

/// Fill in identity fields the row does not have yet. Existing values are kept.
pub fn enrich_user(
    conn: &Connection,
    id: &UserId,
    remote_id: Option<i64>,
    email: Option<&str>,
    login: Option<&str>,
    avatar_url: Option<&str>,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE users SET
             remote_id = COALESCE(remote_id, ?2),
             email = COALESCE(email, ?3),
             login = COALESCE(login, ?4),
             avatar_url = COALESCE(avatar_url, ?5)
         WHERE id = ?1",
        params![id.0.to_string(), remote_id, email, login, avatar_url],
    )?;
    Ok(())
}

pub fn list_users(conn: &Connection) -> anyhow::Result<Vec<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY name, id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_user)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_users(conn: &Connection) -> anyhow::Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
    Ok(count as u64)
}

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: UserId::from_uuid(uuid_col(row, 0)?),
        name: row.get(1)?,
        email: row.get(2)?,
        login: row.get(3)?,
        remote_id: row.get(4)?,
        avatar_url: row.get(5)?,
        created_at: dt_col(row, 6)?,
    })
}

// ── Teams ──

pub fn insert_team(conn: &Connection, team: &Team) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO teams (id, tenant_id, name) VALUES (?1, ?2, ?3)",
        params![team.id.0.to_string(), team.tenant_id.as_str(), team.name],
    )?;
    Ok(())
}

pub fn get_team(conn: &Connection, id: &TeamId) -> anyhow::Result<Option<Team>> {
    Ok(conn
        .query_row(
            "SELECT id, tenant_id, name FROM teams WHERE id = ?1",
            params![id.0.to_string()],
            row_to_team,
        )
        .optional()?)
}

pub fn get_team_by_name(
    conn: &Connection,
    tenant: &TenantId,
    name: &str,
) -> anyhow::Result<Option<Team>> {
    Ok(conn
        .query_row(
            "SELECT id, tenant_id, name FROM teams WHERE tenant_id = ?1 AND name = ?2",
            params![tenant.as_str(), name],
            row_to_team,
        )
        .optional()?)
}

pub fn list_teams(conn: &Connection, tenant: &TenantId) -> anyhow::Result<Vec<Team>> {
    let mut stmt =
        conn.prepare("SELECT id, tenant_id, name FROM teams WHERE tenant_id = ?1 ORDER BY name")?;
    let rows = stmt.query_map(params![tenant.as_str()], row_to_team)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn add_team_member(conn: &Connection, team: &TeamId, user: &UserId) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO team_members (team_id, user_id) VALUES (?1, ?2)",
        params![team.0.to_string(), user.0.to_string()],
    )?;
    Ok(())
}

pub fn remove_team_member(conn: &Connection, team: &TeamId, user: &UserId) -> anyhow::Result<()> {
    conn.execute(
        "DELETE FROM team_members WHERE team_id = ?1 AND user_id = ?2",
        params![team.0.to_string(), user.0.to_string()],
    )?;
    Ok(())
}

pub fn list_team_members(conn: &Connection, team: &TeamId) -> anyhow::Result<Vec<UserId>> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM team_members WHERE team_id = ?1 ORDER BY user_id")?;
    let rows = stmt.query_map(params![team.0.to_string()], |row| {
        Ok(UserId::from_uuid(uuid_col(row, 0)?))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn row_to_team(row: &Row) -> rusqlite::Result<Team> {
    Ok(Team {
        id: TeamId::from_uuid(uuid_col(row, 0)?),
        tenant_id: TenantId(row.get(1)?),
        name: row.get(2)?,
    })
}

// ── Commits ──

/// Insert a commit unless its hash is already stored. Returns whether a row was written.
pub fn insert_commit(conn: &Connection, commit: &Commit) -> anyhow::Result<bool> {
    let inserted = conn.execute(
        "INSERT INTO commits (repository_id, sha, author_id, committer_id, message, committed_at, additions, deletions)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (repository_id, sha) DO NOTHING",
        params![
            commit.repository_id.0.to_string(),
            commit.sha,
            commit.author_id.as_ref().map(|id| id.0.to_string()),
            commit.committer_id.as_ref().map(|id| id.0.to_string()),
            commit.message,
            fmt_dt(&commit.committed_at),
            commit.additions as i64,
            commit.deletions as i64,
        ],
    )?;
    Ok(inserted == 1)
}

pub fn commit_exists(conn: &Connection, repository: &RepositoryId, sha: &str) -> anyhow::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM commits WHERE repository_id = ?1 AND sha = ?2",
            params![repository.0.to_string(), sha],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn count_commits(conn: &Connection, repository: &RepositoryId) -> anyhow::Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM commits WHERE repository_id = ?1",
        params![repository.0.to_string()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn row_to_commit(row: &Row) -> rusqlite::Result<Commit> {
    let additions: i64 = row.get(6)?;
    let deletions: i64 = row.get(7)?;
    Ok(Commit {
        repository_id: RepositoryId::from_uuid(uuid_col(row, 0)?),
        sha: row.get(1)?,
        author_id: opt_uuid_col(row, 2)?.map(UserId::from_uuid),
        committer_id: opt_uuid_col(row, 3)?.map(UserId::from_uuid),
        message: row.get(4)?,
        committed_at: dt_col(row, 5)?,
        additions: additions as u32,
        deletions: deletions as u32,
    })
}

// ── Pull Requests ──

/// What an upsert did to the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

const PULL_REQUEST_COLUMNS: &str = "p.id, p.repository_id, p.number, p.title, p.author_id, p.state, p.created_at, p.updated_at, p.closed_at, p.merged_at, p.additions, p.deletions, p.changed_files";

pub fn get_pull_request(
    conn: &Connection,
    repository: &RepositoryId,
    number: u64,
) -> anyhow::Result<Option<PullRequest>> {
    let sql = format!(
        "SELECT {PULL_REQUEST_COLUMNS} FROM pull_requests p WHERE p.repository_id = ?1 AND p.number = ?2"
    );
    Ok(conn
        .query_row(
            &sql,
            params![repository.0.to_string(), number as i64],
            row_to_pull_request,
        )
        .optional()?)
}

/// Insert a pull request, or reconcile the lifecycle fields of the stored one.
///
/// Reconciliation is keyed by (repository, number) and only moves forward:
/// a snapshot older than the stored `updated_at` leaves the row alone.
pub fn upsert_pull_request(
    conn: &Connection,
    pr: &PullRequest,
) -> anyhow::Result<(PullRequestId, UpsertOutcome)> {
    let Some(existing) = get_pull_request(conn, &pr.repository_id, pr.number)? else {
        conn.execute(
            "INSERT INTO pull_requests (id, repository_id, number, title, author_id, state, created_at, updated_at, closed_at, merged_at, additions, deletions, changed_files)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                pr.id.0.to_string(),
                pr.repository_id.0.to_string(),
                pr.number as i64,
                pr.title,
                pr.author_id.as_ref().map(|id| id.0.to_string()),
                pr.state.to_string(),
                fmt_dt(&pr.created_at),
                fmt_dt(&pr.updated_at),
                opt_dt(&pr.closed_at),
                opt_dt(&pr.merged_at),
                pr.additions as i64,
                pr.deletions as i64,
                pr.changed_files as i64,
            ],
        )?;
        return Ok((pr.id.clone(), UpsertOutcome::Inserted));
    };

    if !existing.lifecycle_differs(pr) || pr.updated_at < existing.updated_at {
        return Ok((existing.id, UpsertOutcome::Unchanged));
    }

    conn.execute(
        "UPDATE pull_requests SET state = ?1, updated_at = ?2, closed_at = ?3, merged_at = ?4
         WHERE id = ?5",
        params![
            pr.state.to_string(),
            fmt_dt(&pr.updated_at),
            opt_dt(&pr.closed_at),
            opt_dt(&pr.merged_at),
            existing.id.0.to_string(),
        ],
    )?;
    Ok((existing.id, UpsertOutcome::Updated))
}

pub fn count_pull_requests(conn: &Connection, repository: &RepositoryId) -> anyhow::Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pull_requests WHERE repository_id = ?1",
        params![repository.0.to_string()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn row_to_pull_request(row: &Row) -> rusqlite::Result<PullRequest> {
    let number: i64 = row.get(2)?;
    let additions: i64 = row.get(10)?;
    let deletions: i64 = row.get(11)?;
    let changed_files: i64 = row.get(12)?;
    Ok(PullRequest {
        id: PullRequestId::from_uuid(uuid_col(row, 0)?),
        repository_id: RepositoryId::from_uuid(uuid_col(row, 1)?),
        number: number as u64,
        title: row.get(3)?,
        author_id: opt_uuid_col(row, 4)?.map(UserId::from_uuid),
        state: parsed_col::<PrState>(row, 5)?,
        created_at: dt_col(row, 6)?,
        updated_at: dt_col(row, 7)?,
        closed_at: opt_dt_col(row, 8)?,
        merged_at: opt_dt_col(row, 9)?,
        additions: additions as u32,
        deletions: deletions as u32,
        changed_files: changed_files as u32,
    })
}

// ── Reviews ──

/// Insert a review unless its remote id is already stored. Returns whether a row was written.
pub fn insert_review(conn: &Connection, review: &Review) -> anyhow::Result<bool> {
    let inserted = conn.execute(
        "INSERT INTO reviews (remote_id, pull_request_id, reviewer_id, state, submitted_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (remote_id) DO NOTHING",
        params![
            review.remote_id,
            review.pull_request_id.0.to_string(),
            review.reviewer_id.as_ref().map(|id| id.0.to_string()),
            review.state.to_string(),
            fmt_dt(&review.submitted_at),
        ],
    )?;
    Ok(inserted == 1)
}

pub fn count_reviews(conn: &Connection, repository: &RepositoryId) -> anyhow::Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM reviews rv JOIN pull_requests p ON p.id = rv.pull_request_id
         WHERE p.repository_id = ?1",
        params![repository.0.to_string()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn row_to_review(row: &Row) -> rusqlite::Result<Review> {
    Ok(Review {
        remote_id: row.get(0)?,
        pull_request_id: PullRequestId::from_uuid(uuid_col(row, 1)?),
        reviewer_id: opt_uuid_col(row, 2)?.map(UserId::from_uuid),
        state: parsed_col::<ReviewState>(row, 3)?,
        submitted_at: dt_col(row, 4)?,
    })
}

// ── Activity queries ──

/// Which rows an activity query covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityScope {
    /// Everything in one repository.
    Repository(RepositoryId),
    /// Activity by one user across the tenant's repositories.
    User(TenantId, UserId),
    /// Activity by any member of a team across the tenant's repositories.
    Team(TenantId, TeamId),
}

/// WHERE fragment and its bound values. Expects `repositories r` to be joined.
fn scope_filter(scope: &ActivityScope, repo_col: &str, user_col: &str) -> (String, Vec<String>) {
    match scope {
        ActivityScope::Repository(id) => (format!("{repo_col} = ?"), vec![id.0.to_string()]),
        ActivityScope::User(tenant, user) => (
            format!("r.tenant_id = ? AND {user_col} = ?"),
            vec![tenant.0.clone(), user.0.to_string()],
        ),
        ActivityScope::Team(tenant, team) => (
            format!(
                "r.tenant_id = ? AND {user_col} IN (SELECT user_id FROM team_members WHERE team_id = ?)"
            ),
            vec![tenant.0.clone(), team.0.to_string()],
        ),
    }
}

const PR_IN_RANGE: &str = "((p.created_at >= ? AND p.created_at < ?)
      OR (p.merged_at >= ? AND p.merged_at < ?)
      OR (p.closed_at >= ? AND p.closed_at < ?))";

fn range_params(start: &DateTime<Utc>, end: &DateTime<Utc>, times: usize) -> Vec<String> {
    let (start, end) = (fmt_dt(start), fmt_dt(end));
    (0..times).flat_map(|_| [start.clone(), end.clone()]).collect()
}

/// Commits with `start <= committed_at < end`, oldest first.
pub fn commits_in_range(
    conn: &Connection,
    scope: &ActivityScope,
    start: &DateTime<Utc>,
    end: &DateTime<Utc>,
) -> anyhow::Result<Vec<Commit>> {
    let (filter, mut values) = scope_filter(scope, "c.repository_id", "c.author_id");
    let sql = format!(
        "SELECT c.repository_id, c.sha, c.author_id, c.committer_id, c.message, c.committed_at, c.additions, c.deletions
         FROM commits c JOIN repositories r ON r.id = c.repository_id
         WHERE {filter} AND c.committed_at >= ? AND c.committed_at < ?
         ORDER BY c.committed_at, c.sha"
    );
    values.extend(range_params(start, end, 1));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), row_to_commit)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Pull requests opened, merged or closed inside the range.
pub fn pull_requests_in_range(
    conn: &Connection,
    scope: &ActivityScope,
    start: &DateTime<Utc>,
    end: &DateTime<Utc>,
) -> anyhow::Result<Vec<PullRequest>> {
    let (filter, mut values) = scope_filter(scope, "p.repository_id", "p.author_id");
    let sql = format!(
        "SELECT {PULL_REQUEST_COLUMNS}
         FROM pull_requests p JOIN repositories r ON r.id = p.repository_id
         WHERE {filter} AND {PR_IN_RANGE}
         ORDER BY p.created_at, p.repository_id, p.number"
    );
    values.extend(range_params(start, end, 3));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), row_to_pull_request)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Reviews submitted inside the range by the scope's people (or on the scope's repository).
pub fn reviews_given_in_range(
    conn: &Connection,
    scope: &ActivityScope,
    start: &DateTime<Utc>,
    end: &DateTime<Utc>,
) -> anyhow::Result<Vec<Review>> {
    let (filter, mut values) = scope_filter(scope, "p.repository_id", "rv.reviewer_id");
    let sql = format!(
        "SELECT rv.remote_id, rv.pull_request_id, rv.reviewer_id, rv.state, rv.submitted_at
         FROM reviews rv
         JOIN pull_requests p ON p.id = rv.pull_request_id
         JOIN repositories r ON r.id = p.repository_id
         WHERE {filter} AND rv.submitted_at >= ? AND rv.submitted_at < ?
         ORDER BY rv.submitted_at, rv.remote_id"
    );
    values.extend(range_params(start, end, 1));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), row_to_review)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Every review, whenever submitted, on the pull requests `pull_requests_in_range` returns.
pub fn reviews_on_pull_requests_in_range(
    conn: &Connection,
    scope: &ActivityScope,
    start: &DateTime<Utc>,
    end: &DateTime<Utc>,
) -> anyhow::Result<Vec<Review>> {
    let (filter, mut values) = scope_filter(scope, "p.repository_id", "p.author_id");
    let sql = format!(
        "SELECT rv.remote_id, rv.pull_request_id, rv.reviewer_id, rv.state, rv.submitted_at
         FROM reviews rv
         JOIN pull_requests p ON p.id = rv.pull_request_id
         JOIN repositories r ON r.id = p.repository_id
         WHERE {filter} AND {PR_IN_RANGE}
         ORDER BY rv.submitted_at, rv.remote_id"
    );
    values.extend(range_params(start, end, 3));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), row_to_review)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// ── Sync History ──

pub fn insert_sync_result(conn: &Connection, result: &SyncResult) -> anyhow::Result<()> {
    let errors_json = serde_json::to_string(&result.errors)?;
    conn.execute(
        "INSERT INTO sync_history (id, repository_id, repository_name, success, skipped, message, commit_count, pull_request_count, review_count, errors, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            result.id.to_string(),
            result.repository_id.0.to_string(),
            result.repository_name,
            result.success as i32,
            result.skipped as i32,
            result.message,
            result.commit_count as i64,
            result.pull_request_count as i64,
            result.review_count as i64,
            errors_json,
            fmt_dt(&result.started_at),
            fmt_dt(&result.finished_at),
        ],
    )?;
    Ok(())
}

/// Most recent results first, optionally for one repository.
pub fn list_sync_history(
    conn: &Connection,
    repository: Option<&RepositoryId>,
    limit: u32,
) -> anyhow::Result<Vec<SyncResult>> {
    let mut stmt = conn.prepare(
        "SELECT id, repository_id, repository_name, success, skipped, message, commit_count, pull_request_count, review_count, errors, started_at, finished_at
         FROM sync_history
         WHERE ?1 IS NULL OR repository_id = ?1
         ORDER BY started_at DESC, id DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(
        params![repository.map(|id| id.0.to_string()), limit],
        row_to_sync_result,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn row_to_sync_result(row: &Row) -> rusqlite::Result<SyncResult> {
    let success: i32 = row.get(3)?;
    let skipped: i32 = row.get(4)?;
    let commits: i64 = row.get(6)?;
    let pulls: i64 = row.get(7)?;
    let reviews: i64 = row.get(8)?;
    let errors_str: String = row.get(9)?;
    Ok(SyncResult {
        id: uuid_col(row, 0)?,
        repository_id: RepositoryId::from_uuid(uuid_col(row, 1)?),
        repository_name: row.get(2)?,
        success: success != 0,
        skipped: skipped != 0,
        message: row.get(5)?,
        commit_count: commits as u32,
        pull_request_count: pulls as u32,
        review_count: reviews as u32,
        errors: serde_json::from_str(&errors_str).map_err(|e| conversion_error(9, e))?,
        started_at: dt_col(row, 10)?,
        finished_at: dt_col(row, 11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_memory_db;
    use chrono::{Duration, TimeZone};
    use shipr_core::models::sync_state::CollectionStats;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
    }

    fn seed_repository(conn: &Connection, tenant: &str, full_name: &str) -> Repository {
        let repo = Repository::new(
            TenantId::new(tenant),
            full_name.to_string(),
            format!("https://github.com/{full_name}.git"),
        );
        insert_repository(conn, &repo).unwrap();
        repo
    }

    fn seed_user(conn: &Connection, login: &str) -> User {
        let user = User {
            id: UserId::new(),
            name: login.to_string(),
            email: Some(format!("{login}@example.com")),
            login: Some(login.to_string()),
            remote_id: None,
            avatar_url: None,
            created_at: Utc::now(),
        };
        insert_user(conn, &user).unwrap();
        user
    }

    fn pull_request(repo: &Repository, number: u64, author: Option<&User>) -> PullRequest {
        PullRequest {
            id: PullRequestId::new(),
            repository_id: repo.id.clone(),
            number,
            title: format!("PR #{number}"),
            author_id: author.map(|u| u.id.clone()),
            state: PrState::Open,
            created_at: at(2, 9),
            updated_at: at(2, 9),
            closed_at: None,
            merged_at: None,
            additions: 5,
            deletions: 1,
            changed_files: 2,
        }
    }

    #[test]
    fn test_repository_crud() {
        let conn = open_memory_db().unwrap();
        let mut repo = Repository::new(
            TenantId::new("acme"),
            "acme/widgets".to_string(),
            "https://github.com/acme/widgets.git".to_string(),
        );
        repo.api_url = Some(url::Url::parse("https://ghe.acme.io/api/v3").unwrap());
        repo.credential_key = Some("shipr:acme/widgets".to_string());
        insert_repository(&conn, &repo).unwrap();

        let found = get_repository(&conn, &repo.id).unwrap().unwrap();
        assert_eq!(found.full_name, "acme/widgets");
        assert_eq!(found.owner, "acme");
        assert_eq!(found.api_url, repo.api_url);
        assert_eq!(found.last_sync_at, None);

        let by_name = get_repository_by_full_name(&conn, &TenantId::new("acme"), "acme/widgets")
            .unwrap()
            .unwrap();
        assert_eq!(by_name.id, repo.id);
        assert!(get_repository_by_full_name(&conn, &TenantId::new("other"), "acme/widgets")
            .unwrap()
            .is_none());

        assert_eq!(list_repositories(&conn, &TenantId::new("acme")).unwrap().len(), 1);
        delete_repository(&conn, &repo.id).unwrap();
        assert!(get_repository(&conn, &repo.id).unwrap().is_none());
    }

    #[test]
    fn test_watermark_is_monotonic_until_reset() {
        let conn = open_memory_db().unwrap();
        let repo = seed_repository(&conn, "acme", "acme/widgets");

        assert!(advance_watermark(&conn, &repo.id, &at(10, 0)).unwrap());
        assert!(!advance_watermark(&conn, &repo.id, &at(9, 0)).unwrap());
        let stored = get_repository(&conn, &repo.id).unwrap().unwrap();
        assert_eq!(stored.last_sync_at, Some(at(10, 0)));

        reset_watermark(&conn, &repo.id).unwrap();
        let stored = get_repository(&conn, &repo.id).unwrap().unwrap();
        assert_eq!(stored.last_sync_at, Some(DateTime::<Utc>::UNIX_EPOCH));
        assert!(stored.needs_full_sync());

        assert!(advance_watermark(&conn, &repo.id, &at(9, 0)).unwrap());
    }

    #[test]
    fn test_user_lookup_and_enrichment() {
        let conn = open_memory_db().unwrap();
        let user = seed_user(&conn, "Ada");

        assert_eq!(
            find_user_by_login(&conn, "ada").unwrap().unwrap().id,
            user.id
        );
        assert_eq!(
            find_user_by_email(&conn, "Ada@example.com").unwrap().unwrap().id,
            user.id
        );
        assert!(find_user_by_remote_id(&conn, 42).unwrap().is_none());

        enrich_user(&conn, &user.id, Some(42), Some("other@example.com"), None, Some("https://a/1.png"))
            .unwrap();
        let found = find_user_by_remote_id(&conn, 42).unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.email.as_deref(), Some("Ada@example.com"));
        assert_eq!(found.avatar_url.as_deref(), Some("https://a/1.png"));
        assert_eq!(count_users(&conn).unwrap(), 1);
    }

    #[test]
    fn test_commit_insert_is_idempotent() {
        let conn = open_memory_db().unwrap();
        let repo = seed_repository(&conn, "acme", "acme/widgets");
        let commit = Commit {
            sha: "abc123".to_string(),
            repository_id: repo.id.clone(),
            author_id: None,
            committer_id: None,
            message: "Initial commit".to_string(),
            committed_at: at(1, 12),
            additions: 10,
            deletions: 0,
        };

        assert!(insert_commit(&conn, &commit).unwrap());
        assert!(!insert_commit(&conn, &commit).unwrap());
        assert!(commit_exists(&conn, &repo.id, "abc123").unwrap());
        assert_eq!(count_commits(&conn, &repo.id).unwrap(), 1);
    }

    #[test]
    fn test_pull_request_reconciles_lifecycle() {
        let conn = open_memory_db().unwrap();
        let repo = seed_repository(&conn, "acme", "acme/widgets");
        let open = pull_request(&repo, 7, None);

        let (id, outcome) = upsert_pull_request(&conn, &open).unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(id, open.id);

        let (_, outcome) = upsert_pull_request(&conn, &open).unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);

        let mut merged = pull_request(&repo, 7, None);
        merged.title = "renamed upstream".to_string();
        merged.state = PrState::Merged;
        merged.updated_at = at(3, 9);
        merged.closed_at = Some(at(3, 9));
        merged.merged_at = Some(at(3, 9));
        let (merged_id, outcome) = upsert_pull_request(&conn, &merged).unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(merged_id, open.id);

        let stored = get_pull_request(&conn, &repo.id, 7).unwrap().unwrap();
        assert_eq!(stored.state, PrState::Merged);
        assert_eq!(stored.merged_at, Some(at(3, 9)));
        assert_eq!(stored.title, "PR #7");
        assert_eq!(count_pull_requests(&conn, &repo.id).unwrap(), 1);

        // An older snapshot arriving late does not roll the row back.
        let (_, outcome) = upsert_pull_request(&conn, &open).unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
    }

    #[test]
    fn test_review_insert_is_idempotent() {
        let conn = open_memory_db().unwrap();
        let repo = seed_repository(&conn, "acme", "acme/widgets");
        let pr = pull_request(&repo, 1, None);
        upsert_pull_request(&conn, &pr).unwrap();

        let review = Review {
            remote_id: "R_1".to_string(),
            pull_request_id: pr.id.clone(),
            reviewer_id: None,
            state: ReviewState::Approved,
            submitted_at: at(2, 11),
        };
        assert!(insert_review(&conn, &review).unwrap());
        assert!(!insert_review(&conn, &review).unwrap());
        assert_eq!(count_reviews(&conn, &repo.id).unwrap(), 1);
    }

    #[test]
    fn test_activity_scopes() {
        let conn = open_memory_db().unwrap();
        let tenant = TenantId::new("acme");
        let widgets = seed_repository(&conn, "acme", "acme/widgets");
        let gadgets = seed_repository(&conn, "acme", "acme/gadgets");
        let foreign = seed_repository(&conn, "other", "other/thing");
        let ada = seed_user(&conn, "ada");
        let bob = seed_user(&conn, "bob");

        let team = Team::new(tenant.clone(), "core".to_string());
        insert_team(&conn, &team).unwrap();
        add_team_member(&conn, &team.id, &ada.id).unwrap();
        add_team_member(&conn, &team.id, &ada.id).unwrap();
        assert_eq!(list_team_members(&conn, &team.id).unwrap(), vec![ada.id.clone()]);

        for (repo, sha, author, day) in [
            (&widgets, "w1", &ada, 1),
            (&widgets, "w2", &bob, 2),
            (&gadgets, "g1", &ada, 3),
            (&foreign, "f1", &ada, 3),
            (&widgets, "late", &ada, 20),
        ] {
            insert_commit(
                &conn,
                &Commit {
                    sha: sha.to_string(),
                    repository_id: repo.id.clone(),
                    author_id: Some(author.id.clone()),
                    committer_id: None,
                    message: String::new(),
                    committed_at: at(day, 8),
                    additions: 1,
                    deletions: 1,
                },
            )
            .unwrap();
        }

        let (start, end) = (at(1, 0), at(11, 0));
        let repo_commits =
            commits_in_range(&conn, &ActivityScope::Repository(widgets.id.clone()), &start, &end)
                .unwrap();
        assert_eq!(
            repo_commits.iter().map(|c| c.sha.as_str()).collect::<Vec<_>>(),
            vec!["w1", "w2"]
        );

        let user_commits = commits_in_range(
            &conn,
            &ActivityScope::User(tenant.clone(), ada.id.clone()),
            &start,
            &end,
        )
        .unwrap();
        assert_eq!(user_commits.len(), 2);

        let team_commits =
            commits_in_range(&conn, &ActivityScope::Team(tenant, team.id.clone()), &start, &end)
                .unwrap();
        assert_eq!(team_commits.len(), 2);
    }

    #[test]
    fn test_pull_requests_in_range_match_any_lifecycle_timestamp() {
        let conn = open_memory_db().unwrap();
        let repo = seed_repository(&conn, "acme", "acme/widgets");
        let scope = ActivityScope::Repository(repo.id.clone());

        let mut old_but_merged = pull_request(&repo, 1, None);
        old_but_merged.created_at = at(1, 0) - Duration::days(30);
        old_but_merged.state = PrState::Merged;
        old_but_merged.merged_at = Some(at(5, 0));
        old_but_merged.closed_at = Some(at(5, 0));
        upsert_pull_request(&conn, &old_but_merged).unwrap();

        let mut stale = pull_request(&repo, 2, None);
        stale.created_at = at(1, 0) - Duration::days(30);
        upsert_pull_request(&conn, &stale).unwrap();

        let prs = pull_requests_in_range(&conn, &scope, &at(1, 0), &at(11, 0)).unwrap();
        assert_eq!(prs.len(), 1);
        assert_eq!(prs[0].number, 1);

        insert_review(
            &conn,
            &Review {
                remote_id: "R_old".to_string(),
                pull_request_id: old_but_merged.id.clone(),
                reviewer_id: None,
                state: ReviewState::Commented,
                submitted_at: at(1, 0) - Duration::days(29),
            },
        )
        .unwrap();
        let received =
            reviews_on_pull_requests_in_range(&conn, &scope, &at(1, 0), &at(11, 0)).unwrap();
        assert_eq!(received.len(), 1);
        let given = reviews_given_in_range(&conn, &scope, &at(1, 0), &at(11, 0)).unwrap();
        assert!(given.is_empty());
    }

    #[test]
    fn test_sync_history() {
        let conn = open_memory_db().unwrap();
        let repo = seed_repository(&conn, "acme", "acme/widgets");
        let other = seed_repository(&conn, "acme", "acme/gadgets");

        let ok = SyncResult::succeeded(
            repo.id.clone(),
            repo.full_name.clone(),
            CollectionStats {
                commit_count: 4,
                pull_request_count: 1,
                review_count: 2,
            },
            at(1, 0),
            at(1, 1),
        );
        insert_sync_result(&conn, &ok).unwrap();
        let failed = SyncResult::failed(
            other.id.clone(),
            other.full_name.clone(),
            vec!["API error (502): bad gateway".to_string()],
            at(2, 0),
            at(2, 1),
        );
        insert_sync_result(&conn, &failed).unwrap();

        let all = list_sync_history(&conn, None, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].repository_name, "acme/gadgets");
        assert_eq!(all[0].errors.len(), 1);

        let mine = list_sync_history(&conn, Some(&repo.id), 10).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].commit_count, 4);
        assert!(mine[0].success);
    }
}
