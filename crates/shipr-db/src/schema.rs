//! SQL statements for creating the shipr database schema.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text, so comparing
//! them as strings orders them chronologically.

pub const CREATE_SCHEMA_VERSION: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TEXT NOT NULL
)";

pub const CREATE_REPOSITORIES: &str = "
CREATE TABLE IF NOT EXISTS repositories (
    id              TEXT PRIMARY KEY,
    tenant_id       TEXT NOT NULL,
    full_name       TEXT NOT NULL,
    owner           TEXT NOT NULL,
    name            TEXT NOT NULL,
    clone_url       TEXT NOT NULL,
    api_url         TEXT,
    credential_key  TEXT,
    last_sync_at    TEXT,
    created_at      TEXT NOT NULL,
    UNIQUE (tenant_id, full_name)
)";

pub const CREATE_USERS: &str = "
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    email       TEXT,
    login       TEXT COLLATE NOCASE,
    remote_id   INTEGER UNIQUE,
    avatar_url  TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_users_email ON users(email);
CREATE INDEX IF NOT EXISTS idx_users_login ON users(login)";

pub const CREATE_TEAMS: &str = "
CREATE TABLE IF NOT EXISTS teams (
    id          TEXT PRIMARY KEY,
    tenant_id   TEXT NOT NULL,
    name        TEXT NOT NULL,
    UNIQUE (tenant_id, name)
)";

pub const CREATE_TEAM_MEMBERS: &str = "
CREATE TABLE IF NOT EXISTS team_members (
    team_id     TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    PRIMARY KEY (team_id, user_id),
    FOREIGN KEY (team_id) REFERENCES teams(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
)";

pub const CREATE_COMMITS: &str = "
CREATE TABLE IF NOT EXISTS commits (
    repository_id   TEXT NOT NULL,
    sha             TEXT NOT NULL,
    author_id       TEXT,
    committer_id    TEXT,
    message         TEXT NOT NULL,
    committed_at    TEXT NOT NULL,
    additions       INTEGER NOT NULL DEFAULT 0,
    deletions       INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (repository_id, sha),
    FOREIGN KEY (repository_id) REFERENCES repositories(id) ON DELETE CASCADE,
    FOREIGN KEY (author_id) REFERENCES users(id) ON DELETE SET NULL,
    FOREIGN KEY (committer_id) REFERENCES users(id) ON DELETE SET NULL
);
CREATE INDEX IF NOT EXISTS idx_commits_committed_at ON commits(committed_at);
CREATE INDEX IF NOT EXISTS idx_commits_author ON commits(author_id)";

pub const CREATE_PULL_REQUESTS: &str = "
CREATE TABLE IF NOT EXISTS pull_requests (
    id              TEXT PRIMARY KEY,
    repository_id   TEXT NOT NULL,
    number          INTEGER NOT NULL,
    title           TEXT NOT NULL,
    author_id       TEXT,
    state           TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    closed_at       TEXT,
    merged_at       TEXT,
    additions       INTEGER NOT NULL DEFAULT 0,
    deletions       INTEGER NOT NULL DEFAULT 0,
    changed_files   INTEGER NOT NULL DEFAULT 0,
    UNIQUE (repository_id, number),
    FOREIGN KEY (repository_id) REFERENCES repositories(id) ON DELETE CASCADE,
    FOREIGN KEY (author_id) REFERENCES users(id) ON DELETE SET NULL
);
CREATE INDEX IF NOT EXISTS idx_pull_requests_author ON pull_requests(author_id)";

pub const CREATE_REVIEWS: &str = "
CREATE TABLE IF NOT EXISTS reviews (
    remote_id       TEXT PRIMARY KEY,
    pull_request_id TEXT NOT NULL,
    reviewer_id     TEXT,
    state           TEXT NOT NULL,
    submitted_at    TEXT NOT NULL,
    FOREIGN KEY (pull_request_id) REFERENCES pull_requests(id) ON DELETE CASCADE,
    FOREIGN KEY (reviewer_id) REFERENCES users(id) ON DELETE SET NULL
);
CREATE INDEX IF NOT EXISTS idx_reviews_pull_request ON reviews(pull_request_id)";

pub const CREATE_SYNC_HISTORY: &str = "
CREATE TABLE IF NOT EXISTS sync_history (
    id                  TEXT PRIMARY KEY,
    repository_id       TEXT NOT NULL,
    repository_name     TEXT NOT NULL,
    success             INTEGER NOT NULL,
    skipped             INTEGER NOT NULL DEFAULT 0,
    message             TEXT NOT NULL,
    commit_count        INTEGER NOT NULL DEFAULT 0,
    pull_request_count  INTEGER NOT NULL DEFAULT 0,
    review_count        INTEGER NOT NULL DEFAULT 0,
    errors              TEXT NOT NULL DEFAULT '[]',
    started_at          TEXT NOT NULL,
    finished_at         TEXT NOT NULL,
    FOREIGN KEY (repository_id) REFERENCES repositories(id) ON DELETE CASCADE
)";

/// All table creation statements in order.
pub const ALL_TABLES: &[&str] = &[
    CREATE_SCHEMA_VERSION,
    CREATE_REPOSITORIES,
    CREATE_USERS,
    CREATE_TEAMS,
    CREATE_TEAM_MEMBERS,
    CREATE_COMMITS,
    CREATE_PULL_REQUESTS,
    CREATE_REVIEWS,
    CREATE_SYNC_HISTORY,
];
