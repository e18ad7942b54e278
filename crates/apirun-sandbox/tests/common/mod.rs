//! Shared stubs for the sandbox integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apirun_error::HostError;
use apirun_request::{RequestExecutor, RequestSpec, ResponseEnvelope};
use apirun_sandbox::audit::{AuditEntry, AuditLogger};
use apirun_sandbox::{SandboxConfig, ScriptHost};
use apirun_secret::SecretResolver;

/// Records every request and answers with a canned response or error.
pub struct RecordingExecutor {
    pub requests: Mutex<Vec<RequestSpec>>,
    response: Result<ResponseEnvelope, String>,
}

impl RecordingExecutor {
    pub fn responding(status: u16, body: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            requests: Mutex::new(Vec::new()),
            response: Ok(ResponseEnvelope::new(status, headers, body.as_bytes().to_vec())),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            response: Err(message.to_string()),
        }
    }

    pub fn requests(&self) -> Vec<RequestSpec> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl RequestExecutor for RecordingExecutor {
    async fn execute(
        &self,
        spec: RequestSpec,
        _timeout: Duration,
    ) -> Result<ResponseEnvelope, HostError> {
        self.requests.lock().unwrap().push(spec);
        self.response
            .clone()
            .map_err(HostError::Transport)
    }
}

/// Keeps every audit entry in memory.
#[derive(Default)]
pub struct CollectingAuditLogger {
    pub entries: Mutex<Vec<AuditEntry>>,
}

impl CollectingAuditLogger {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AuditLogger for CollectingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

pub fn host_with(executor: Arc<dyn RequestExecutor>, secrets: Arc<SecretResolver>) -> ScriptHost {
    ScriptHost::new(SandboxConfig::default(), secrets, executor)
}

pub fn stub_host() -> (ScriptHost, Arc<RecordingExecutor>) {
    let executor = Arc::new(RecordingExecutor::responding(200, r#"{"ok":true}"#));
    let host = host_with(executor.clone(), Arc::new(SecretResolver::in_memory()));
    (host, executor)
}
