use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a canonical user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("invalid user id {s}: {e}"))
    }
}

/// Canonical identity shared by every commit, pull request and review it authored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: Option<String>,
    pub login: Option<String>,
    /// Stable numeric id assigned by the hosting service.
    pub remote_id: Option<i64>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Whatever the remote told us about a person, before resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySignal {
    pub name: String,
    pub email: Option<String>,
    pub login: Option<String>,
    pub remote_id: Option<i64>,
    pub avatar_url: Option<String>,
}

impl IdentitySignal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_login(mut self, login: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self
    }

    pub fn with_remote_id(mut self, remote_id: i64) -> Self {
        self.remote_id = Some(remote_id);
        self
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }

    /// Email in the form it is stored and compared in.
    pub fn normalized_email(&self) -> Option<String> {
        self.email
            .as_deref()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
    }

    pub fn normalized_login(&self) -> Option<&str> {
        self.login.as_deref().map(str::trim).filter(|l| !l.is_empty())
    }

    /// A signal is only an identity if it carries at least one resolvable key.
    pub fn is_resolvable(&self) -> bool {
        self.remote_id.is_some()
            || self.normalized_email().is_some()
            || self.normalized_login().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_normalization() {
        let signal = IdentitySignal::new("Ada")
            .with_email("  Ada@Example.COM ")
            .with_login(" ada ");
        assert_eq!(signal.normalized_email().as_deref(), Some("ada@example.com"));
        assert_eq!(signal.normalized_login(), Some("ada"));
        assert!(signal.is_resolvable());
    }

    #[test]
    fn test_name_only_signal_is_not_resolvable() {
        let signal = IdentitySignal::new("ghost").with_email("   ");
        assert!(!signal.is_resolvable());
    }
}
