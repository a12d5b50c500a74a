use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryId(pub Uuid);

impl RepositoryId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for RepositoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RepositoryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("invalid repository id {s}: {e}"))
    }
}

/// Owning tenant. Every repository and team is scoped to exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tracked remote repository and its ingestion watermark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub tenant_id: TenantId,
    pub full_name: String,
    pub owner: String,
    pub name: String,
    pub clone_url: String,
    /// Alternate API base for self-hosted instances.
    pub api_url: Option<url::Url>,
    /// Key used to look up the access token in a credential store.
    pub credential_key: Option<String>,
    /// Everything remote that changed before this instant has been ingested.
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Repository {
    pub fn new(tenant_id: TenantId, full_name: String, clone_url: String) -> Self {
        let parts: Vec<&str> = full_name.splitn(2, '/').collect();
        let (owner, name) = if parts.len() == 2 {
            (parts[0].to_string(), parts[1].to_string())
        } else {
            (String::new(), full_name.clone())
        };
        Self {
            id: RepositoryId::new(),
            tenant_id,
            full_name,
            owner,
            name,
            clone_url,
            api_url: None,
            credential_key: None,
            last_sync_at: None,
            created_at: Utc::now(),
        }
    }

    /// Lower time bound for the next collection. `None` and the epoch both mean full history.
    pub fn watermark(&self) -> DateTime<Utc> {
        self.last_sync_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn needs_full_sync(&self) -> bool {
        self.watermark() == DateTime::<Utc>::UNIX_EPOCH
    }
}
