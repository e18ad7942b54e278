//! Host capabilities installed into the sandbox as global functions.
//!
//! An invocation gets exactly `fetch`, `secret`, `env` and `sleep`, plus the
//! read-only data globals `provider`, `profile` and `params`. Discovery gets a
//! restricted set where I/O throws and `env`/`sleep` are inert.
//!
//! Every function is synchronous from the script's point of view. `fetch`
//! blocks the sandbox thread on its own current-thread tokio runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use apirun_error::HostError;
use apirun_request::{RequestExecutor, RequestOptions, RequestSpec, ResponseEnvelope};
use apirun_secret::SecretResolver;
use rquickjs::convert::Coerced;
use rquickjs::function::{Opt, Rest};
use rquickjs::{Ctx, Exception, Function, Object, Value};

use crate::audit::{sha256_hex, BridgeLog, FetchAudit};
use crate::context::{ExecutionContext, Params};
use crate::redact::redact_url;

/// State behind the invocation bridge functions.
pub(crate) struct Bridge {
    provider: String,
    profile: String,
    env: HashMap<String, String>,
    fetch_timeout: Duration,
    deadline: Instant,
    secrets: Arc<SecretResolver>,
    executor: Arc<dyn RequestExecutor>,
    runtime: tokio::runtime::Runtime,
    log: Arc<BridgeLog>,
}

impl Bridge {
    pub(crate) fn new(
        context: &ExecutionContext,
        fetch_timeout: Duration,
        deadline: Instant,
        secrets: Arc<SecretResolver>,
        executor: Arc<dyn RequestExecutor>,
        runtime: tokio::runtime::Runtime,
        log: Arc<BridgeLog>,
    ) -> Self {
        Self {
            provider: context.provider.clone(),
            profile: context.profile.clone(),
            env: context.env.clone(),
            fetch_timeout,
            deadline,
            secrets,
            executor,
            runtime,
            log,
        }
    }

    /// Record `err` and turn it into a thrown script `Error`.
    fn throw(&self, ctx: &Ctx<'_>, err: HostError) -> rquickjs::Error {
        let message = err.to_string();
        self.log.fail(err);
        Exception::throw_message(ctx, &message)
    }

    fn fetch<'js>(
        &self,
        ctx: &Ctx<'js>,
        target: Option<Value<'js>>,
        overrides: Option<Value<'js>>,
    ) -> rquickjs::Result<Value<'js>> {
        let spec = match build_spec(ctx, target, overrides) {
            Ok(spec) => spec,
            Err(e) => return Err(self.throw(ctx, e)),
        };

        let method = spec.effective_method();
        let url_hash = sha256_hex(&spec.url);
        tracing::debug!(method = %method, url = %redact_url(&spec.url), "fetch");

        let start = Instant::now();
        let result = self
            .runtime
            .block_on(self.executor.execute(spec, self.fetch_timeout));
        self.log.record_fetch(FetchAudit {
            method,
            url_hash,
            status: result.as_ref().ok().map(|r| r.status),
            duration_ms: start.elapsed().as_millis() as u64,
            success: result.is_ok(),
        });

        match result {
            Ok(response) => response_to_js(ctx, &response),
            Err(e) => {
                tracing::debug!(error = %e, "fetch failed");
                Err(self.throw(ctx, e))
            }
        }
    }

    fn secret(&self, ctx: &Ctx<'_>, name: Option<String>) -> rquickjs::Result<String> {
        let Some(name) = name else {
            return Err(self.throw(ctx, HostError::InvalidRequest("secret expects a name".into())));
        };
        match self.secrets.get(&self.provider, &self.profile, &name) {
            Ok(value) => {
                self.log.record_secret_lookup(&name, true);
                Ok(value)
            }
            Err(e) => {
                self.log.record_secret_lookup(&name, false);
                // A name that cannot form a key can never be stored either.
                let e = match e {
                    HostError::InvalidSecretKey(reason) => {
                        tracing::debug!(reason = %reason, "secret name rejected");
                        HostError::secret_not_found(&self.provider, &self.profile, &name)
                    }
                    other => other,
                };
                Err(self.throw(ctx, e))
            }
        }
    }

    // An empty override falls through to the process environment.
    fn env(&self, name: &str) -> String {
        self.env
            .get(name)
            .filter(|v| !v.is_empty())
            .cloned()
            .or_else(|| std::env::var(name).ok())
            .unwrap_or_default()
    }

    // Never sleeps past the execution deadline; the interrupt handler takes
    // over from there.
    fn sleep(&self, ms: f64) {
        let requested = if ms.is_finite() && ms > 0.0 {
            Duration::from_secs_f64(ms / 1000.0)
        } else {
            Duration::ZERO
        };
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(requested.min(remaining));
    }
}

/// Install `fetch`, `secret`, `env`, `sleep` and the data globals.
pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    bridge: Arc<Bridge>,
    params: &Params,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let b = bridge.clone();
    globals.set(
        "fetch",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, target: Opt<Value<'js>>, overrides: Opt<Value<'js>>| {
                b.fetch(&ctx, target.0, overrides.0)
            },
        )?,
    )?;

    let b = bridge.clone();
    globals.set(
        "secret",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: Opt<Coerced<String>>| b.secret(&ctx, name.0.map(|n| n.0)),
        )?,
    )?;

    let b = bridge.clone();
    globals.set(
        "env",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: Opt<Coerced<String>>| -> rquickjs::Result<String> {
                match name.0 {
                    Some(name) => Ok(b.env(&name.0)),
                    None => Err(Exception::throw_message(&ctx, "env expects a name")),
                }
            },
        )?,
    )?;

    let b = bridge.clone();
    globals.set(
        "sleep",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, ms: Opt<Coerced<f64>>| -> rquickjs::Result<()> {
                match ms.0 {
                    Some(ms) => {
                        b.sleep(ms.0);
                        Ok(())
                    }
                    None => Err(Exception::throw_message(&ctx, "sleep expects milliseconds")),
                }
            },
        )?,
    )?;

    globals.set("provider", bridge.provider.as_str())?;
    globals.set("profile", bridge.profile.as_str())?;
    globals.set("params", params_object(ctx, params)?)?;
    Ok(())
}

/// Install the discovery-time stand-ins.
pub(crate) fn install_discovery<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    for name in ["fetch", "secret"] {
        let message = format!("{name}() is not available during command discovery");
        globals.set(
            name,
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, _args: Rest<Value<'js>>| -> rquickjs::Result<()> {
                    Err(Exception::throw_message(&ctx, &message))
                },
            )?,
        )?;
    }
    globals.set(
        "env",
        Function::new(ctx.clone(), |_args: Rest<Value<'js>>| String::new())?,
    )?;
    globals.set(
        "sleep",
        Function::new(ctx.clone(), |_args: Rest<Value<'js>>| {})?,
    )?;
    Ok(())
}

/// A flat `{key: "value"}` object.
pub(crate) fn params_object<'js>(ctx: &Ctx<'js>, params: &Params) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    for (key, value) in params.iter() {
        obj.set(key, value)?;
    }
    Ok(obj)
}

/// Resolve the three `fetch` call shapes into one spec.
fn build_spec<'js>(
    ctx: &Ctx<'js>,
    target: Option<Value<'js>>,
    overrides: Option<Value<'js>>,
) -> Result<RequestSpec, HostError> {
    let overrides = overrides.filter(|v| !v.is_undefined() && !v.is_null());
    let spec = match (target, overrides) {
        (None, _) => {
            return Err(HostError::InvalidRequest(
                "fetch expects a url or options object".into(),
            ))
        }
        (Some(target), None) if target.is_string() => RequestSpec::get(js_string(&target)?),
        (Some(target), None) => RequestSpec::from_options(options_from_value(ctx, target)?),
        (Some(target), Some(overrides)) => {
            if !target.is_string() {
                return Err(HostError::InvalidRequest("fetch url must be a string".into()));
            }
            RequestSpec::get(js_string(&target)?)
                .with_overrides(options_from_value(ctx, overrides)?)
        }
    };
    if spec.url.is_empty() {
        return Err(HostError::InvalidRequest("fetch url is required".into()));
    }
    Ok(spec)
}

fn js_string(value: &Value<'_>) -> Result<String, HostError> {
    value
        .get::<String>()
        .map_err(|e| HostError::InvalidRequest(format!("invalid fetch url: {e}")))
}

// Options cross the boundary through their JSON form.
fn options_from_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<RequestOptions, HostError> {
    let json = ctx
        .json_stringify(value)
        .map_err(|e| HostError::InvalidRequest(format!("invalid fetch options: {e}")))?
        .map(|s| s.to_string())
        .transpose()
        .map_err(|e| HostError::InvalidRequest(format!("invalid fetch options: {e}")))?
        .ok_or_else(|| HostError::InvalidRequest("fetch options are empty".into()))?;
    RequestOptions::from_json(&json)
}

fn response_to_js<'js>(ctx: &Ctx<'js>, response: &ResponseEnvelope) -> rquickjs::Result<Value<'js>> {
    let payload = serde_json::json!({
        "status": response.status,
        "headers": response.headers,
        "body": response.text(),
        "json": response.json,
    });
    ctx.json_parse(payload.to_string())
}
