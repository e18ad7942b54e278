#![warn(missing_docs)]

//! # apirun-secret
//!
//! Secret lookup for provider scripts, keyed by `(provider, profile, name)`.
//!
//! Two [`SecretStore`] implementations are provided:
//!
//! - [`KeyringStore`]: durable, backed by the host credential store
//! - [`MemoryStore`]: ephemeral, for tests and throwaway runs
//!
//! A [`SecretResolver`] holds exactly one active store. It is constructed by
//! the caller and passed into the script host, so there is no process-global
//! binding. Lookups hold the read side of the binding lock for the duration of
//! the call; [`SecretResolver::swap`] takes the write side.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use apirun_config::SecretsConfig;
use apirun_error::HostError;

mod keychain;
mod memory;

pub use keychain::KeyringStore;
pub use memory::MemoryStore;

/// A `(provider, profile, name)` triple, externally `"<provider>/<profile>/<name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretKey {
    provider: String,
    profile: String,
    name: String,
}

impl SecretKey {
    /// Build a key, rejecting empty segments and segments containing `/`.
    pub fn new(provider: &str, profile: &str, name: &str) -> Result<Self, HostError> {
        for (label, segment) in [("provider", provider), ("profile", profile), ("name", name)] {
            if segment.is_empty() {
                return Err(HostError::InvalidSecretKey(format!("{label} is empty")));
            }
            if segment.contains('/') {
                return Err(HostError::InvalidSecretKey(format!(
                    "{label} must not contain '/': {segment}"
                )));
            }
        }
        Ok(Self {
            provider: provider.to_string(),
            profile: profile.to_string(),
            name: name.to_string(),
        })
    }

    /// The provider segment.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// The profile segment.
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// The secret name segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn not_found(&self) -> HostError {
        HostError::secret_not_found(&self.provider, &self.profile, &self.name)
    }
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.profile, self.name)
    }
}

impl FromStr for SecretKey {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [provider, profile, name] => Self::new(provider, profile, name),
            _ => Err(HostError::InvalidSecretKey(format!(
                "expected <provider>/<profile>/<name>, got '{s}'"
            ))),
        }
    }
}

/// A secret backend.
///
/// Implementations are synchronous: the sandbox calls them from its own
/// thread while the script is blocked inside `secret()`.
pub trait SecretStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &SecretKey, value: &str) -> Result<(), HostError>;

    /// Fetch the value stored under `key`.
    ///
    /// Fails with [`HostError::SecretNotFound`] when nothing is stored.
    fn get(&self, key: &SecretKey) -> Result<String, HostError>;

    /// Remove the value stored under `key`.
    fn delete(&self, key: &SecretKey) -> Result<(), HostError>;
}

/// The swappable binding to the active [`SecretStore`].
pub struct SecretResolver {
    active: RwLock<Arc<dyn SecretStore>>,
}

impl SecretResolver {
    /// Create a resolver bound to `store`.
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            active: RwLock::new(store),
        }
    }

    /// A resolver backed by an empty [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// A resolver backed by the host keyring under `service`.
    pub fn keyring(service: &str) -> Self {
        Self::new(Arc::new(KeyringStore::new(service)))
    }

    /// Select the backend named in the `[secrets]` config section.
    pub fn from_config(config: &SecretsConfig) -> Result<Self, HostError> {
        match config.backend.as_str() {
            "keyring" => Ok(Self::keyring(&config.service)),
            "memory" => Ok(Self::in_memory()),
            other => Err(HostError::Backend(format!(
                "unsupported secret backend '{other}'"
            ))),
        }
    }

    /// Replace the active store, returning the previous one.
    ///
    /// Blocks until in-flight lookups holding the read lock have finished.
    pub fn swap(&self, store: Arc<dyn SecretStore>) -> Arc<dyn SecretStore> {
        let mut guard = self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tracing::debug!("secret store replaced");
        std::mem::replace(&mut *guard, store)
    }

    /// Store a secret.
    pub fn set(
        &self,
        provider: &str,
        profile: &str,
        name: &str,
        value: &str,
    ) -> Result<(), HostError> {
        let key = SecretKey::new(provider, profile, name)?;
        self.read().set(&key, value)
    }

    /// Look up a secret.
    pub fn get(&self, provider: &str, profile: &str, name: &str) -> Result<String, HostError> {
        let key = SecretKey::new(provider, profile, name)?;
        let result = self.read().get(&key);
        if let Err(e) = &result {
            tracing::debug!(key = %key, error = %e, "secret lookup failed");
        }
        result
    }

    /// Delete a secret.
    pub fn delete(&self, provider: &str, profile: &str, name: &str) -> Result<(), HostError> {
        let key = SecretKey::new(provider, profile, name)?;
        self.read().delete(&key)
    }

    fn read(&self) -> RwLockReadGuard<'_, Arc<dyn SecretStore>> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SecretResolver {
    fn default() -> Self {
        Self::keyring(&SecretsConfig::default().service)
    }
}

impl fmt::Debug for SecretResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretResolver").finish_non_exhaustive()
    }
}
