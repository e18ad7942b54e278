//! Host keychain integration

use apirun_error::HostError;

use crate::{SecretKey, SecretStore};

/// Durable store backed by the platform credential manager.
///
/// Each secret is one keyring entry whose service is the configured service
/// name and whose user is the joined `<provider>/<profile>/<name>` key.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service_name: String,
}

impl KeyringStore {
    /// Create a store writing entries under `service_name`.
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
        }
    }

    /// The keyring service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn entry(&self, key: &SecretKey) -> Result<keyring::Entry, HostError> {
        keyring::Entry::new(&self.service_name, &key.to_string())
            .map_err(|e| HostError::Backend(e.to_string()))
    }
}

impl SecretStore for KeyringStore {
    fn set(&self, key: &SecretKey, value: &str) -> Result<(), HostError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| HostError::Backend(e.to_string()))
    }

    fn get(&self, key: &SecretKey) -> Result<String, HostError> {
        self.entry(key)?.get_password().map_err(|e| match e {
            keyring::Error::NoEntry => key.not_found(),
            _ => HostError::Backend(e.to_string()),
        })
    }

    fn delete(&self, key: &SecretKey) -> Result<(), HostError> {
        match self.entry(key)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(HostError::Backend(e.to_string())),
        }
    }
}
