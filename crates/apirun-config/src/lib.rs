#![warn(missing_docs)]

//! # apirun-config
//!
//! Configuration loading for the apirun provider-script runtime.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [runtime]
//! timeout_secs = 20
//! max_heap_mb = 128
//! describe_timeout_secs = 2
//! describe_heap_mb = 64
//! max_concurrent = 8
//!
//! [http]
//! user_agent = "apirun/0.1"
//!
//! [secrets]
//! backend = "keyring"
//! service = "api-cli"
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Secret backends that can be selected in `[secrets] backend`.
pub const SUPPORTED_SECRET_BACKENDS: &[&str] = &["keyring", "memory"];

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level apirun configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Sandbox limits for invocation and discovery.
    #[serde(default)]
    pub runtime: RuntimeOverrides,

    /// Outbound HTTP settings used by `fetch`.
    #[serde(default)]
    pub http: HttpConfig,

    /// Secret backend selection.
    #[serde(default)]
    pub secrets: SecretsConfig,
}

/// Sandbox limit overrides. Unset values fall back to the runtime defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeOverrides {
    /// Invocation timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Invocation memory ceiling in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Command discovery timeout in seconds.
    #[serde(default)]
    pub describe_timeout_secs: Option<u64>,

    /// Command discovery memory ceiling in megabytes.
    #[serde(default)]
    pub describe_heap_mb: Option<usize>,

    /// Maximum concurrent sandboxes per host.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum provider script size in kilobytes.
    #[serde(default)]
    pub max_script_kb: Option<usize>,
}

/// Outbound HTTP settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpConfig {
    /// `User-Agent` header sent when the script does not set one.
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Secret backend selection.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    /// Backend name: "keyring" (default) or "memory".
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Service name under which keyring entries are stored.
    #[serde(default = "default_service")]
    pub service: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            service: default_service(),
        }
    }
}

fn default_backend() -> String {
    "keyring".to_string()
}

fn default_service() -> String {
    "api-cli".to_string()
}

impl ApiConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: ApiConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let rt = &self.runtime;
        for (field, value) in [
            ("timeout_secs", rt.timeout_secs),
            ("describe_timeout_secs", rt.describe_timeout_secs),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "runtime.{field} must be at least 1"
                )));
            }
        }
        for (field, value) in [
            ("max_heap_mb", rt.max_heap_mb),
            ("describe_heap_mb", rt.describe_heap_mb),
            ("max_concurrent", rt.max_concurrent),
            ("max_script_kb", rt.max_script_kb),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "runtime.{field} must be greater than 0"
                )));
            }
        }

        if !SUPPORTED_SECRET_BACKENDS.contains(&self.secrets.backend.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unsupported secret backend '{}', supported: {}",
                self.secrets.backend,
                SUPPORTED_SECRET_BACKENDS.join(", ")
            )));
        }
        if self.secrets.service.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "secrets.service must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Leave the placeholder if env var not found
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(ch);
        }
    }

    result
}
