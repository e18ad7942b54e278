//! Typed errors shared by apirun host capabilities.
//!
//! Provides [`HostError`], the error type returned by every capability the
//! sandbox reaches into (`SecretStore`, `RequestExecutor`). The script host
//! maps these onto its own taxonomy when an invocation fails.

use thiserror::Error;

/// Canonical error type for host capability operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HostError {
    /// No secret is stored under the requested key.
    #[error("secret not found: {name}")]
    SecretNotFound {
        /// The secret name as the script asked for it.
        name: String,
        /// The joined `<provider>/<profile>/<name>` key.
        key: String,
    },

    /// A secret key segment was empty or contained a `/`.
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    /// The request could not be built (missing url, bad method).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The HTTP exchange failed before a response was received.
    #[error("request failed: {0}")]
    Transport(String),

    /// The credential backend refused or failed the operation.
    #[error("secret backend error: {0}")]
    Backend(String),

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HostError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SecretNotFound { .. } => "SECRET_NOT_FOUND",
            Self::InvalidSecretKey(_) => "INVALID_SECRET_KEY",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Backend(_) => "SECRET_BACKEND",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the operation may succeed if the script retries it.
    ///
    /// The runtime never retries on its own; this only informs callers.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::SecretNotFound { .. }
            | Self::InvalidSecretKey(_)
            | Self::InvalidRequest(_)
            | Self::Backend(_)
            | Self::Internal(_) => false,
        }
    }

    /// Build a [`HostError::SecretNotFound`] from its key parts.
    pub fn secret_not_found(provider: &str, profile: &str, name: &str) -> Self {
        Self::SecretNotFound {
            name: name.to_string(),
            key: format!("{provider}/{profile}/{name}"),
        }
    }
}

// Compile-time assertion: HostError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<HostError>();
};
