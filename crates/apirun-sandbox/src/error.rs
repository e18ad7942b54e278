//! Error types for the script host.

use std::fmt;
use std::time::Duration;

use apirun_error::HostError;
use thiserror::Error;

/// Which hard limit a sandbox ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimit {
    /// The wall-clock execution timer fired.
    Timeout(Duration),
    /// The allocator ceiling was reached.
    Memory(usize),
}

impl fmt::Display for ResourceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(t) => write!(f, "execution timed out after {}s", t.as_secs()),
            Self::Memory(bytes) => write!(f, "memory limit of {} MiB exceeded", bytes / (1024 * 1024)),
        }
    }
}

/// Errors that can occur while describing or invoking a provider script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script threw while evaluating or while running a command.
    #[error("{message}")]
    Evaluation {
        /// The thrown message, verbatim.
        message: String,
    },

    /// The script did not produce a usable default export.
    #[error("script contract violation: {0}")]
    ContractViolation(String),

    /// The default export has no command with this name.
    #[error("command not found: {command}")]
    CommandNotFound {
        /// The requested command.
        command: String,
    },

    /// The command exists but has no callable `run`.
    #[error("command missing run(): {command}")]
    CommandInvalid {
        /// The requested command.
        command: String,
    },

    /// The sandbox hit its timeout or memory ceiling.
    #[error("resource limit exceeded: {limit}")]
    ResourceExceeded {
        /// The limit that was hit.
        limit: ResourceLimit,
    },

    /// An uncaught `secret()` failure.
    #[error("secret not found: {name}")]
    SecretNotFound {
        /// The secret name the script asked for.
        name: String,
    },

    /// An uncaught `fetch()` transport failure.
    #[error("request failed: {0}")]
    Transport(String),

    /// An uncaught `fetch()` call with unusable arguments.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The script is empty or whitespace only.
    #[error("provider script is empty")]
    EmptyScript,

    /// The script exceeds the configured size limit.
    #[error("script exceeds maximum size of {max} bytes (got {actual})")]
    ScriptTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// Too many sandboxes are already running on this host.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent executions.
        max: usize,
    },

    /// Internal failure outside the script's control.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),
}

impl ScriptError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Evaluation { .. } => "SCRIPT_EVALUATION_ERROR",
            Self::ContractViolation(_) => "SCRIPT_CONTRACT_VIOLATION",
            Self::CommandNotFound { .. } => "COMMAND_NOT_FOUND",
            Self::CommandInvalid { .. } => "COMMAND_INVALID",
            Self::ResourceExceeded { .. } => "RESOURCE_EXCEEDED",
            Self::SecretNotFound { .. } => "SECRET_NOT_FOUND",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::EmptyScript => "EMPTY_SCRIPT",
            Self::ScriptTooLarge { .. } => "SCRIPT_TOO_LARGE",
            Self::ConcurrencyLimit { .. } => "CONCURRENCY_LIMIT",
            Self::Execution(_) => "EXECUTION_ERROR",
        }
    }
}

impl From<HostError> for ScriptError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::SecretNotFound { name, .. } => Self::SecretNotFound { name },
            HostError::Transport(msg) => Self::Transport(msg),
            HostError::InvalidRequest(msg) => Self::InvalidRequest(msg),
            HostError::Internal(e) => Self::Execution(e),
            other => Self::Evaluation {
                message: other.to_string(),
            },
        }
    }
}
