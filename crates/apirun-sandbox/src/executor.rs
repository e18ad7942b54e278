//! Script host: creates a fresh QuickJS sandbox per call, evaluates the
//! provider script, and either lists or dispatches its commands.
//!
//! QuickJS runtimes are `!Send`, so every sandbox lives on a dedicated thread
//! that also owns a current-thread tokio runtime for `fetch`. The public API
//! is async and `Send`-safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use apirun_config::ApiConfig;
use apirun_request::{RequestExecutor, ReqwestExecutor};
use apirun_secret::SecretResolver;
use rquickjs::convert::Coerced;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Object, Runtime, Value};
use tokio::sync::Semaphore;

use crate::audit::{AuditEntryBuilder, AuditLogger, AuditOperation, BridgeLog, NoopAuditLogger};
use crate::bridge::{self, Bridge};
use crate::coerce::coerce_result;
use crate::context::{ExecutionContext, DEFAULT_TIMEOUT};
use crate::describe::describe_commands;
use crate::heap::CappedAllocator;
use crate::error::{ResourceLimit, ScriptError};
use crate::prepare::{
    normalize_timeout, prepare_script, validate_script, DEFAULT_EXPORT_BINDING,
    DEFAULT_MAX_SCRIPT_SIZE,
};
use crate::redact::redact_error_message;
use crate::{CommandDescriptor, ExecutionResult};

const MIB: usize = 1024 * 1024;

/// Configuration for the script host.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Invocation timeout when the context does not set one.
    pub timeout: Duration,
    /// Invocation memory ceiling in bytes.
    pub max_heap_size: usize,
    /// Discovery timeout.
    pub describe_timeout: Duration,
    /// Discovery memory ceiling in bytes.
    pub describe_heap_size: usize,
    /// Maximum concurrent sandboxes.
    pub max_concurrent: usize,
    /// Maximum script size in bytes.
    pub max_script_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_heap_size: 128 * MIB,
            describe_timeout: Duration::from_secs(2),
            describe_heap_size: 64 * MIB,
            max_concurrent: 8,
            max_script_size: DEFAULT_MAX_SCRIPT_SIZE,
        }
    }
}

impl SandboxConfig {
    /// Apply the `[runtime]` overrides onto the defaults.
    pub fn from_config(config: &ApiConfig) -> Self {
        let rt = &config.runtime;
        let defaults = Self::default();
        Self {
            timeout: rt
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_heap_size: rt
                .max_heap_mb
                .map(|mb| mb.saturating_mul(MIB))
                .unwrap_or(defaults.max_heap_size),
            describe_timeout: rt
                .describe_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.describe_timeout),
            describe_heap_size: rt
                .describe_heap_mb
                .map(|mb| mb.saturating_mul(MIB))
                .unwrap_or(defaults.describe_heap_size),
            max_concurrent: rt.max_concurrent.unwrap_or(defaults.max_concurrent),
            max_script_size: rt
                .max_script_kb
                .map(|kb| kb.saturating_mul(1024))
                .unwrap_or(defaults.max_script_size),
        }
    }
}

/// Evaluates provider scripts. Creates a fresh sandbox for each call.
///
/// This is `Send + Sync`: all QuickJS work is dispatched to a dedicated
/// thread. A semaphore bounds the number of live sandboxes.
pub struct ScriptHost {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    secrets: Arc<SecretResolver>,
    executor: Arc<dyn RequestExecutor>,
    audit_logger: Arc<dyn AuditLogger>,
}

impl ScriptHost {
    /// Create a host with explicit capabilities.
    pub fn new(
        config: SandboxConfig,
        secrets: Arc<SecretResolver>,
        executor: Arc<dyn RequestExecutor>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            secrets,
            executor,
            audit_logger: Arc::new(NoopAuditLogger),
        }
    }

    /// Build a host from configuration: limits, `User-Agent` and secret backend.
    pub fn from_config(config: &ApiConfig) -> Result<Self, ScriptError> {
        let executor = match &config.http.user_agent {
            Some(agent) => ReqwestExecutor::with_user_agent(agent)?,
            None => ReqwestExecutor::new()?,
        };
        let secrets = SecretResolver::from_config(&config.secrets)?;
        Ok(Self::new(
            SandboxConfig::from_config(config),
            Arc::new(secrets),
            Arc::new(executor),
        ))
    }

    /// Send an audit entry for every call to `logger`.
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    /// The active limits.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The secret resolver handed to `secret()`.
    pub fn secrets(&self) -> &Arc<SecretResolver> {
        &self.secrets
    }

    /// Evaluate `script` and list its commands without running any of them.
    pub async fn describe(&self, script: &str) -> Result<Vec<CommandDescriptor>, ScriptError> {
        tracing::info!(script_len = script.len(), "describe: starting");
        let audit = AuditEntryBuilder::new(script, AuditOperation::Describe);

        let result = self.run_describe(script).await;

        let size = result
            .as_ref()
            .map(|commands| commands.iter().map(CommandDescriptor::size).sum());
        self.audit_logger.log(&audit.finish(size)).await;

        match &result {
            Ok(commands) => tracing::info!(commands = commands.len(), "describe: complete"),
            Err(e) => tracing::warn!(
                error = %redact_error_message(&e.to_string()),
                code = e.code(),
                "describe: failed"
            ),
        }
        result
    }

    /// The command names of `script`, in declaration order.
    pub async fn list_commands(&self, script: &str) -> Result<Vec<String>, ScriptError> {
        let commands = self.describe(script).await?;
        Ok(commands.into_iter().map(|c| c.name).collect())
    }

    /// Evaluate `script` and run the command named in `context`.
    pub async fn invoke(
        &self,
        script: &str,
        context: &ExecutionContext,
    ) -> Result<ExecutionResult, ScriptError> {
        tracing::info!(
            provider = %context.provider,
            profile = %context.profile,
            command = %context.command,
            params = context.params.len(),
            "invoke: starting"
        );
        let mut audit = AuditEntryBuilder::new(script, AuditOperation::Invoke).target(
            &context.provider,
            &context.profile,
            &context.command,
        );
        let log = Arc::new(BridgeLog::default());

        let result = self.run_invoke(script, context, log.clone()).await;

        audit.absorb(&log);
        self.audit_logger
            .log(&audit.finish(result.as_ref().map(ExecutionResult::size)))
            .await;

        match &result {
            Ok(r) => tracing::info!(status = ?r.status, body_len = r.body.len(), "invoke: complete"),
            Err(e) => tracing::warn!(
                error = %redact_error_message(&e.to_string()),
                code = e.code(),
                "invoke: failed"
            ),
        }
        result
    }

    async fn run_describe(&self, script: &str) -> Result<Vec<CommandDescriptor>, ScriptError> {
        validate_script(script, self.config.max_script_size)?;
        let _permit = self.acquire()?;

        let limits = Limits {
            timeout: normalize_timeout(self.config.describe_timeout),
            memory: self.config.describe_heap_size,
        };
        let source = prepare_script(script);

        on_sandbox_thread(move || {
            let sandbox = Sandbox::new(limits, None)?;
            sandbox.context.with(|ctx| {
                sandbox.check(&ctx, bridge::install_discovery(&ctx))?;
                let default = sandbox.evaluate(&ctx, source)?;
                sandbox.check(&ctx, describe_commands(&default))
            })
        })
        .await
    }

    async fn run_invoke(
        &self,
        script: &str,
        context: &ExecutionContext,
        log: Arc<BridgeLog>,
    ) -> Result<ExecutionResult, ScriptError> {
        validate_script(script, self.config.max_script_size)?;
        let _permit = self.acquire()?;

        let timeout = context.effective_timeout(self.config.timeout);
        let limits = Limits {
            timeout: normalize_timeout(timeout),
            memory: self.config.max_heap_size,
        };
        let source = prepare_script(script);
        let context = context.clone();
        let secrets = self.secrets.clone();
        let executor = self.executor.clone();

        on_sandbox_thread(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| ScriptError::Execution(e.into()))?;
            let sandbox = Sandbox::new(limits, Some(log.clone()))?;
            let bridge = Arc::new(Bridge::new(
                &context,
                timeout,
                sandbox.deadline,
                secrets,
                executor,
                runtime,
                log,
            ));

            sandbox.context.with(|ctx| {
                sandbox.check(&ctx, bridge::install(&ctx, bridge, &context.params))?;
                let default = sandbox.evaluate(&ctx, source)?;
                dispatch(&sandbox, &ctx, &default, &context)
            })
        })
        .await
    }

    fn acquire(&self) -> Result<tokio::sync::OwnedSemaphorePermit, ScriptError> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| ScriptError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            })
    }
}

/// Look up the command, call its `run` with the params object, coerce the result.
fn dispatch<'js>(
    sandbox: &Sandbox,
    ctx: &Ctx<'js>,
    default: &Object<'js>,
    context: &ExecutionContext,
) -> Result<ExecutionResult, ScriptError> {
    let command: Value = sandbox.check(ctx, default.get(context.command.as_str()))?;
    if command.is_undefined() || command.is_null() {
        return Err(ScriptError::CommandNotFound {
            command: context.command.clone(),
        });
    }

    let run = match command.as_object() {
        Some(obj) => sandbox.check(ctx, obj.get::<_, Value>("run"))?.into_function(),
        None => None,
    };
    let run = run.ok_or_else(|| ScriptError::CommandInvalid {
        command: context.command.clone(),
    })?;

    let params = sandbox.check(ctx, bridge::params_object(ctx, &context.params))?;
    let returned: Value = sandbox.check(ctx, run.call((params,)))?;
    sandbox.enforce_deadline()?;
    sandbox.check(ctx, coerce_result(ctx, returned))
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    timeout: Duration,
    memory: usize,
}

/// One QuickJS runtime and context with hard limits applied.
struct Sandbox {
    // Field order matters: the context must drop before its runtime.
    context: Context,
    _runtime: Runtime,
    limits: Limits,
    deadline: Instant,
    timed_out: Arc<AtomicBool>,
    out_of_memory: Arc<AtomicBool>,
    log: Option<Arc<BridgeLog>>,
}

impl Sandbox {
    fn new(limits: Limits, log: Option<Arc<BridgeLog>>) -> Result<Self, ScriptError> {
        let out_of_memory = Arc::new(AtomicBool::new(false));
        let runtime = Runtime::new_with_alloc(CappedAllocator::new(
            limits.memory,
            out_of_memory.clone(),
        ))
        .map_err(engine_error)?;

        let deadline = Instant::now() + limits.timeout;
        let timed_out = Arc::new(AtomicBool::new(false));
        let flag = timed_out.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            if Instant::now() >= deadline {
                flag.store(true, Ordering::SeqCst);
                true
            } else {
                false
            }
        })));

        let context = Context::full(&runtime).map_err(engine_error)?;
        Ok(Self {
            context,
            _runtime: runtime,
            limits,
            deadline,
            timed_out,
            out_of_memory,
            log,
        })
    }

    /// Evaluate the prepared source and fetch the default export.
    fn evaluate<'js>(&self, ctx: &Ctx<'js>, source: String) -> Result<Object<'js>, ScriptError> {
        self.check(ctx, ctx.eval::<Value, _>(source))?;
        let default: Value = self.check(ctx, ctx.globals().get(DEFAULT_EXPORT_BINDING))?;
        if default.is_undefined() || default.is_null() {
            return Err(ScriptError::ContractViolation(
                "script did not set export default".into(),
            ));
        }
        default.into_object().ok_or_else(|| {
            ScriptError::ContractViolation("default export must be an object".into())
        })
    }

    /// Host calls such as `sleep` can run out the clock without the interrupt
    /// handler ever firing.
    fn enforce_deadline(&self) -> Result<(), ScriptError> {
        if self.timed_out.load(Ordering::SeqCst) || Instant::now() >= self.deadline {
            return Err(ScriptError::ResourceExceeded {
                limit: ResourceLimit::Timeout(self.limits.timeout),
            });
        }
        Ok(())
    }

    /// Catch a pending exception and classify it.
    fn check<'js, T>(&self, ctx: &Ctx<'js>, result: rquickjs::Result<T>) -> Result<T, ScriptError> {
        result.catch(ctx).map_err(|caught| self.classify(caught))
    }

    fn classify(&self, caught: CaughtError<'_>) -> ScriptError {
        if self.timed_out.load(Ordering::SeqCst) {
            return ScriptError::ResourceExceeded {
                limit: ResourceLimit::Timeout(self.limits.timeout),
            };
        }

        if self.out_of_memory.load(Ordering::SeqCst) {
            return ScriptError::ResourceExceeded {
                limit: ResourceLimit::Memory(self.limits.memory),
            };
        }

        let message = match &caught {
            CaughtError::Exception(e) => e.message().unwrap_or_else(|| caught.to_string()),
            CaughtError::Value(v) => v
                .get::<Coerced<String>>()
                .map(|s| s.0)
                .unwrap_or_else(|_| caught.to_string()),
            CaughtError::Error(e) => e.to_string(),
        };

        if let Some(failure) = self
            .log
            .as_ref()
            .and_then(|log| log.take_failure_matching(&message))
        {
            return failure.into();
        }
        ScriptError::Evaluation { message }
    }
}

fn engine_error(err: rquickjs::Error) -> ScriptError {
    ScriptError::Execution(anyhow::anyhow!("failed to create sandbox: {err}"))
}

/// Run `job` on a fresh thread and await its result.
async fn on_sandbox_thread<T, F>(job: F) -> Result<T, ScriptError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ScriptError> + Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name("apirun-sandbox".into())
        .spawn(move || {
            if tx.send(job()).is_err() {
                tracing::warn!("sandbox result receiver dropped before result was sent");
            }
        })
        .map_err(|e| ScriptError::Execution(e.into()))?;

    rx.await
        .map_err(|_| ScriptError::Execution(anyhow::anyhow!("sandbox thread panicked")))?
}
