//! Per-invocation inputs.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use thiserror::Error;

/// Timeout applied when neither the context nor the host sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// A `key=value` token could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    /// The token has no `=` or an empty key.
    #[error("invalid param: {token}")]
    Malformed {
        /// The offending token.
        token: String,
    },
}

/// Flat string parameters handed to a command's `run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    /// An empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build parameters from `key=value` tokens.
    ///
    /// Positional tokens are applied first, then option-supplied ones, so an
    /// option wins when both name the same key. Empty tokens are ignored.
    pub fn from_tokens<P, O>(positional: P, options: O) -> Result<Self, ParamError>
    where
        P: IntoIterator,
        P::Item: AsRef<str>,
        O: IntoIterator,
        O::Item: AsRef<str>,
    {
        let mut params = Self::new();
        for token in positional {
            params.insert_token(token.as_ref())?;
        }
        for token in options {
            params.insert_token(token.as_ref())?;
        }
        Ok(params)
    }

    fn insert_token(&mut self, token: &str) -> Result<(), ParamError> {
        if token.is_empty() {
            return Ok(());
        }
        match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                self.insert(key, value);
                Ok(())
            }
            _ => Err(ParamError::Malformed {
                token: token.to_string(),
            }),
        }
    }

    /// Set `key`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a parameter.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterate parameters in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Everything one command invocation needs besides the script itself.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Provider id, used for secret scoping and the `provider` global.
    pub provider: String,
    /// Profile id, used for secret scoping and the `profile` global.
    pub profile: String,
    /// Command to dispatch.
    pub command: String,
    /// Parameters passed to `run`.
    pub params: Params,
    /// Environment overrides consulted by `env()` before the process environment.
    pub env: HashMap<String, String>,
    /// Execution timeout; `None` or zero falls back to the host default.
    pub timeout: Option<Duration>,
}

impl ExecutionContext {
    /// Start a context for `command` under `provider`/`profile`.
    pub fn new(
        provider: impl Into<String>,
        profile: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            profile: profile.into(),
            command: command.into(),
            params: Params::new(),
            env: HashMap::new(),
            timeout: None,
        }
    }

    /// Set the command parameters.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Set the environment overrides.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set the execution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The timeout to apply, using `default` when unset or zero.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        match self.timeout {
            Some(t) if !t.is_zero() => t,
            _ => default,
        }
    }
}
