//! Audit logging for script executions.
//!
//! Every `describe` and `invoke` emits an [`AuditEntry`] containing:
//! - Execution ID (UUID)
//! - SHA-256 hash of the script (never the raw script)
//! - A redacted preview of the first 500 chars of the script
//! - `fetch` calls (method, hashed URL, status) and `secret` lookups (name only)
//! - Duration and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use std::sync::Mutex;
use std::time::Instant;

use apirun_error::HostError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::ScriptError;
use crate::redact::redact_error_message;

/// Maximum length of the script preview in audit entries.
const SCRIPT_PREVIEW_MAX: usize = 500;

/// A complete audit record for a single execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique execution identifier.
    pub execution_id: String,
    /// When execution started.
    pub timestamp: DateTime<Utc>,
    /// Whether this was a describe or invoke call.
    pub operation: AuditOperation,
    /// Provider id, for invocations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Profile id, for invocations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// Dispatched command, for invocations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// SHA-256 hash of the submitted script.
    pub script_hash: String,
    /// First N characters of the script, credentials redacted.
    pub script_preview: String,
    /// `fetch` calls made during execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fetches: Vec<FetchAudit>,
    /// `secret` lookups made during execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_lookups: Vec<SecretLookupAudit>,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
    /// Size of the result in bytes.
    pub result_size_bytes: usize,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// The kind of script operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOperation {
    /// Command discovery.
    Describe,
    /// Command invocation.
    Invoke,
}

/// Audit record for one `fetch` call.
#[derive(Debug, Clone, Serialize)]
pub struct FetchAudit {
    /// Effective HTTP method.
    pub method: String,
    /// SHA-256 hash of the URL (URLs can carry credentials in the query).
    pub url_hash: String,
    /// Response status, when a response arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Whether a response arrived.
    pub success: bool,
}

/// Audit record for one `secret` lookup. Values are never recorded.
#[derive(Debug, Clone, Serialize)]
pub struct SecretLookupAudit {
    /// The secret name the script asked for.
    pub name: String,
    /// Whether a value was found.
    pub found: bool,
}

/// The outcome of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// Completed successfully.
    Success,
    /// Failed with an error.
    Error {
        /// Stable error code.
        code: String,
        /// The error message, credentials redacted.
        message: String,
    },
    /// Terminated by the timeout or memory ceiling.
    ResourceExceeded,
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: tokio::sync::Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    /// Recover the sink.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via [`tracing`].
///
/// Entries are logged at `INFO` with `audit = true` for easy filtering.
/// Fetches and secret lookups are summarised as counts.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let outcome = match &entry.outcome {
            AuditOutcome::Success => "success",
            AuditOutcome::Error { .. } => "error",
            AuditOutcome::ResourceExceeded => "resource_exceeded",
        };
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            operation = ?entry.operation,
            provider = entry.provider.as_deref().unwrap_or(""),
            command = entry.command.as_deref().unwrap_or(""),
            script_hash = %entry.script_hash,
            duration_ms = entry.duration_ms,
            result_size_bytes = entry.result_size_bytes,
            fetches = entry.fetches.len(),
            secret_lookups = entry.secret_lookups.len(),
            outcome = outcome,
            "audit"
        );
    }
}

/// Compute the SHA-256 hash of a string, returned as lowercase hex.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// First [`SCRIPT_PREVIEW_MAX`] bytes of a script, cut on a char boundary.
pub fn script_preview(script: &str) -> String {
    if script.len() <= SCRIPT_PREVIEW_MAX {
        return script.to_string();
    }
    let mut end = SCRIPT_PREVIEW_MAX;
    while !script.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &script[..end])
}

/// Calls recorded by the bridge while a script runs.
///
/// Shared between the sandbox thread (which records) and the host (which
/// folds the records into the audit entry). Also remembers the last bridge
/// failure so an uncaught one can be reported with its typed kind.
#[derive(Debug, Default)]
pub(crate) struct BridgeLog {
    fetches: Mutex<Vec<FetchAudit>>,
    secret_lookups: Mutex<Vec<SecretLookupAudit>>,
    failure: Mutex<Option<HostError>>,
}

impl BridgeLog {
    pub(crate) fn record_fetch(&self, audit: FetchAudit) {
        lock(&self.fetches).push(audit);
    }

    pub(crate) fn record_secret_lookup(&self, name: &str, found: bool) {
        lock(&self.secret_lookups).push(SecretLookupAudit {
            name: name.to_string(),
            found,
        });
    }

    /// Remember `err` as the most recent bridge failure.
    pub(crate) fn fail(&self, err: HostError) {
        *lock(&self.failure) = Some(err);
    }

    /// Take the most recent failure if its message is `message`.
    pub(crate) fn take_failure_matching(&self, message: &str) -> Option<HostError> {
        let mut slot = lock(&self.failure);
        match slot.as_ref() {
            Some(err) if err.to_string() == message => slot.take(),
            _ => None,
        }
    }

    fn drain(&self) -> (Vec<FetchAudit>, Vec<SecretLookupAudit>) {
        (
            std::mem::take(&mut *lock(&self.fetches)),
            std::mem::take(&mut *lock(&self.secret_lookups)),
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Builder for constructing audit entries during execution.
pub struct AuditEntryBuilder {
    execution_id: String,
    timestamp: DateTime<Utc>,
    operation: AuditOperation,
    provider: Option<String>,
    profile: Option<String>,
    command: Option<String>,
    script_hash: String,
    script_preview: String,
    fetches: Vec<FetchAudit>,
    secret_lookups: Vec<SecretLookupAudit>,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start building an audit entry for an execution.
    pub fn new(script: &str, operation: AuditOperation) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            operation,
            provider: None,
            profile: None,
            command: None,
            script_hash: sha256_hex(script),
            script_preview: redact_error_message(&script_preview(script)),
            fetches: Vec::new(),
            secret_lookups: Vec::new(),
            start: Instant::now(),
        }
    }

    /// Attach the invocation target.
    pub fn target(mut self, provider: &str, profile: &str, command: &str) -> Self {
        self.provider = Some(provider.to_string());
        self.profile = Some(profile.to_string());
        self.command = Some(command.to_string());
        self
    }

    /// Fold in the calls the bridge recorded.
    pub(crate) fn absorb(&mut self, log: &BridgeLog) {
        let (fetches, secret_lookups) = log.drain();
        self.fetches.extend(fetches);
        self.secret_lookups.extend(secret_lookups);
    }

    /// Finalize the entry. `result` carries the result size on success.
    pub fn finish(self, result: Result<usize, &ScriptError>) -> AuditEntry {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let (result_size_bytes, outcome) = match result {
            Ok(size) => (size, AuditOutcome::Success),
            Err(ScriptError::ResourceExceeded { .. }) => (0, AuditOutcome::ResourceExceeded),
            Err(e) => (
                0,
                AuditOutcome::Error {
                    code: e.code().to_string(),
                    message: redact_error_message(&e.to_string()),
                },
            ),
        };

        AuditEntry {
            execution_id: self.execution_id,
            timestamp: self.timestamp,
            operation: self.operation,
            provider: self.provider,
            profile: self.profile,
            command: self.command,
            script_hash: self.script_hash,
            script_preview: self.script_preview,
            fetches: self.fetches,
            secret_lookups: self.secret_lookups,
            duration_ms,
            result_size_bytes,
            outcome,
        }
    }
}
