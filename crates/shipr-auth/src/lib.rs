use std::collections::HashMap;
use std::sync::Mutex;

use shipr_core::error::ShiprError;

/// Keychain service name all shipr tokens live under.
pub const SERVICE: &str = "shipr";

/// Conventional credential key for a repository's access token.
pub fn credential_key(full_name: &str) -> String {
    format!("shipr:{full_name}")
}

/// Trait for credential storage backends.
pub trait CredentialStore: Send + Sync {
    /// Store a token under the given key.
    fn store(&self, key: &str, token: &str) -> Result<(), ShiprError>;

    /// Retrieve a token by key.
    fn get(&self, key: &str) -> Result<Option<String>, ShiprError>;

    /// Delete a stored token.
    fn delete(&self, key: &str) -> Result<(), ShiprError>;

    /// Token for `key` if one is stored, otherwise `fallback`.
    fn resolve(&self, key: Option<&str>, fallback: Option<&str>) -> Result<Option<String>, ShiprError> {
        if let Some(key) = key {
            if let Some(token) = self.get(key)? {
                return Ok(Some(token));
            }
            tracing::debug!("no token stored under {key}, using fallback");
        }
        Ok(fallback.map(str::to_string))
    }
}

/// OS keychain-backed credential store using the `keyring` crate.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, ShiprError> {
        keyring::Entry::new(&self.service, key).map_err(|e| ShiprError::CredentialError {
            message: e.to_string(),
        })
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringStore {
    fn store(&self, key: &str, token: &str) -> Result<(), ShiprError> {
        self.entry(key)?
            .set_password(token)
            .map_err(|e| ShiprError::CredentialError {
                message: e.to_string(),
            })
    }

    fn get(&self, key: &str) -> Result<Option<String>, ShiprError> {
        match self.entry(key)?.get_password() {
            Ok(pw) => Ok(Some(pw)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(ShiprError::CredentialError {
                message: e.to_string(),
            }),
        }
    }

    fn delete(&self, key: &str) -> Result<(), ShiprError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(ShiprError::CredentialError {
                message: e.to_string(),
            }),
        }
    }
}

/// In-memory credential store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CredentialStore for MemoryStore {
    fn store(&self, key: &str, token: &str) -> Result<(), ShiprError> {
        self.tokens().insert(key.to_string(), token.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, ShiprError> {
        Ok(self.tokens().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), ShiprError> {
        self.tokens().remove(key);
        Ok(())
    }
}
