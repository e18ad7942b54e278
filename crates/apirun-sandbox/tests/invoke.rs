//! Command invocation: dispatch, coercion, bridge functions, typed failures.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use apirun_request::RequestBody;
use apirun_sandbox::audit::{AuditOperation, AuditOutcome};
use apirun_sandbox::{ExecutionContext, Params, ResourceLimit, ScriptError};
use apirun_secret::SecretResolver;
use common::{host_with, stub_host, CollectingAuditLogger, RecordingExecutor};
use serde_json::{json, Value};

fn ctx(command: &str) -> ExecutionContext {
    ExecutionContext::new("acme", "default", command)
}

fn parse(json: &Option<String>) -> Value {
    serde_json::from_str(json.as_deref().expect("json present")).unwrap()
}

// --- dispatch ---

#[tokio::test]
async fn envelope_return_is_copied() {
    let (host, _) = stub_host();
    let script = r#"export default { make: { run: () => ({ status: 201, body: "ok" }) } }"#;

    let result = host.invoke(script, &ctx("make")).await.unwrap();
    assert_eq!(result.status, Some(201));
    assert_eq!(result.body, "ok");
    assert!(!result.is_failure());
}

#[tokio::test]
async fn envelope_with_json_field() {
    let (host, _) = stub_host();
    let script = r#"export default { q: { run: () => ({ status: "404", json: { error: "gone" } }) } }"#;

    let result = host.invoke(script, &ctx("q")).await.unwrap();
    assert_eq!(result.status, Some(404));
    assert!(result.is_failure());
    assert_eq!(parse(&result.json), json!({"error": "gone"}));
    assert_eq!(result.body, "");
}

#[tokio::test]
async fn envelope_without_json_serializes_whole_object() {
    let (host, _) = stub_host();
    let script = r#"export default { q: { run: () => ({ status: 200, body: "hi", extra: 1 }) } }"#;

    let result = host.invoke(script, &ctx("q")).await.unwrap();
    assert_eq!(
        parse(&result.json),
        json!({"status": 200, "body": "hi", "extra": 1})
    );
}

#[tokio::test]
async fn plain_object_populates_body_and_json() {
    let (host, _) = stub_host();
    let script = r#"export default { q: { run: () => ({ items: [1, 2] }) } }"#;

    let result = host.invoke(script, &ctx("q")).await.unwrap();
    assert_eq!(result.status, None);
    assert_eq!(result.body, "[object Object]");
    assert_eq!(parse(&result.json), json!({"items": [1, 2]}));
}

#[tokio::test]
async fn array_populates_json() {
    let (host, _) = stub_host();
    let script = r#"export default { q: { run: () => [1, "two"] } }"#;

    let result = host.invoke(script, &ctx("q")).await.unwrap();
    assert_eq!(result.body, "1,two");
    assert_eq!(parse(&result.json), json!([1, "two"]));
}

#[tokio::test]
async fn primitive_populates_body_only() {
    let (host, _) = stub_host();
    let script = r#"export default { n: { run: () => 42 }, s: { run: () => "hello" } }"#;

    let number = host.invoke(script, &ctx("n")).await.unwrap();
    assert_eq!(number.body, "42");
    assert!(number.json.is_none());

    let string = host.invoke(script, &ctx("s")).await.unwrap();
    assert_eq!(string.body, "hello");
    assert!(string.json.is_none());
}

#[tokio::test]
async fn undefined_return_is_empty() {
    let (host, _) = stub_host();
    let script = r#"export default { nothing: { run: () => {} } }"#;

    let result = host.invoke(script, &ctx("nothing")).await.unwrap();
    assert_eq!(result, Default::default());
}

#[tokio::test]
async fn params_reach_run_and_global() {
    let (host, _) = stub_host();
    let script = r#"export default {
        echo: { run: (p) => ({ json: { arg: p.symbol, global: params.symbol, provider, profile } }) }
    }"#;
    let params = Params::from_tokens(["symbol=AAPL"], Vec::<&str>::new()).unwrap();

    let result = host
        .invoke(script, &ctx("echo").with_params(params))
        .await
        .unwrap();
    assert_eq!(
        parse(&result.json),
        json!({"arg": "AAPL", "global": "AAPL", "provider": "acme", "profile": "default"})
    );
}

#[tokio::test]
async fn top_level_helpers_are_visible_to_run() {
    let (host, _) = stub_host();
    let script = r#"
        function greet(name) { return "hi " + name; }
        export default { greet: { run: (p) => greet(p.name) } };
    "#;
    let params = Params::from_tokens(["name=ada"], Vec::<&str>::new()).unwrap();

    let result = host
        .invoke(script, &ctx("greet").with_params(params))
        .await
        .unwrap();
    assert_eq!(result.body, "hi ada");
}

// --- contract failures ---

#[tokio::test]
async fn missing_default_export_is_contract_violation() {
    let (host, _) = stub_host();
    let err = host.invoke("const x = 1;", &ctx("a")).await.unwrap_err();
    assert!(matches!(err, ScriptError::ContractViolation(_)), "got: {err:?}");
}

#[tokio::test]
async fn non_object_default_export_is_contract_violation() {
    let (host, _) = stub_host();
    let err = host.invoke("export default 5;", &ctx("a")).await.unwrap_err();
    assert!(matches!(err, ScriptError::ContractViolation(_)), "got: {err:?}");
}

#[tokio::test]
async fn unknown_command_is_not_found() {
    let (host, _) = stub_host();
    let script = r#"export default { a: { run: () => 1 }, b: null }"#;

    let err = host.invoke(script, &ctx("zzz")).await.unwrap_err();
    assert!(matches!(err, ScriptError::CommandNotFound { ref command } if command == "zzz"));

    let err = host.invoke(script, &ctx("b")).await.unwrap_err();
    assert!(matches!(err, ScriptError::CommandNotFound { .. }), "got: {err:?}");
}

#[tokio::test]
async fn command_without_callable_run_is_invalid() {
    let (host, _) = stub_host();
    let script = r#"export default { a: { desc: "no run" }, b: { run: "nope" }, c: 7 }"#;

    for command in ["a", "b", "c"] {
        let err = host.invoke(script, &ctx(command)).await.unwrap_err();
        assert!(
            matches!(err, ScriptError::CommandInvalid { .. }),
            "{command}: got {err:?}"
        );
    }
}

#[tokio::test]
async fn thrown_error_message_is_verbatim() {
    let (host, _) = stub_host();
    let script = r#"export default { boom: { run: () => { throw new Error("kaboom 42"); } } }"#;

    let err = host.invoke(script, &ctx("boom")).await.unwrap_err();
    assert!(matches!(err, ScriptError::Evaluation { .. }));
    assert_eq!(err.to_string(), "kaboom 42");
}

#[tokio::test]
async fn syntax_error_is_evaluation_error() {
    let (host, _) = stub_host();
    let err = host.invoke("export default {", &ctx("a")).await.unwrap_err();
    assert!(matches!(err, ScriptError::Evaluation { .. }), "got: {err:?}");
}

// --- env ---

#[tokio::test]
async fn env_override_beats_process_env() {
    std::env::set_var("APIRUN_INVOKE_TEST_BASE", "from-process");
    let (host, _) = stub_host();
    let script = r#"export default { e: { run: () => env("APIRUN_INVOKE_TEST_BASE") } }"#;

    let plain = host.invoke(script, &ctx("e")).await.unwrap();
    assert_eq!(plain.body, "from-process");

    let overrides = HashMap::from([(
        "APIRUN_INVOKE_TEST_BASE".to_string(),
        "from-override".to_string(),
    )]);
    let overridden = host
        .invoke(script, &ctx("e").with_env(overrides))
        .await
        .unwrap();
    assert_eq!(overridden.body, "from-override");
}

#[tokio::test]
async fn empty_env_override_falls_through() {
    std::env::set_var("APIRUN_INVOKE_TEST_EMPTY", "ambient");
    let (host, _) = stub_host();
    let script = r#"export default { e: { run: () => env("APIRUN_INVOKE_TEST_EMPTY") } }"#;
    let overrides = HashMap::from([("APIRUN_INVOKE_TEST_EMPTY".to_string(), String::new())]);

    let result = host
        .invoke(script, &ctx("e").with_env(overrides))
        .await
        .unwrap();
    assert_eq!(result.body, "ambient");
}

#[tokio::test]
async fn env_unset_is_empty_string() {
    let (host, _) = stub_host();
    let script = r#"export default { e: { run: () => "[" + env("APIRUN_DEFINITELY_UNSET_9876") + "]" } }"#;

    let result = host.invoke(script, &ctx("e")).await.unwrap();
    assert_eq!(result.body, "[]");
}

// --- secret ---

#[tokio::test]
async fn secret_is_scoped_to_provider_and_profile() {
    let secrets = Arc::new(SecretResolver::in_memory());
    secrets.set("acme", "default", "token", "s3cr3t").unwrap();
    secrets.set("acme", "other", "token", "wrong").unwrap();
    let executor = Arc::new(RecordingExecutor::responding(200, "{}"));
    let host = host_with(executor, secrets);

    let script = r#"export default { s: { run: () => secret("token") } }"#;
    let result = host.invoke(script, &ctx("s")).await.unwrap();
    assert_eq!(result.body, "s3cr3t");
}

#[tokio::test]
async fn missing_secret_is_catchable() {
    let (host, _) = stub_host();
    let script = r#"export default { s: { run: () => {
        try { secret("absent"); return "unreachable"; }
        catch (e) { return "caught: " + e.message; }
    } } }"#;

    let result = host.invoke(script, &ctx("s")).await.unwrap();
    assert_eq!(result.body, "caught: secret not found: absent");
}

#[tokio::test]
async fn uncaught_missing_secret_is_typed() {
    let (host, _) = stub_host();
    let script = r#"export default { s: { run: () => secret("absent") } }"#;

    let err = host.invoke(script, &ctx("s")).await.unwrap_err();
    assert!(
        matches!(err, ScriptError::SecretNotFound { ref name } if name == "absent"),
        "got: {err:?}"
    );
}

#[tokio::test]
async fn malformed_secret_name_reads_as_not_found() {
    let (host, _) = stub_host();
    let script = r#"export default {
        caught: { run: () => [ "", "a/b" ].map((n) => {
            try { secret(n); return "unreachable"; } catch (e) { return e.message; }
        }) },
        uncaught: { run: () => secret("a/b") },
    }"#;

    let caught = host.invoke(script, &ctx("caught")).await.unwrap();
    assert_eq!(
        parse(&caught.json),
        json!(["secret not found: ", "secret not found: a/b"])
    );

    let err = host.invoke(script, &ctx("uncaught")).await.unwrap_err();
    assert!(
        matches!(err, ScriptError::SecretNotFound { ref name } if name == "a/b"),
        "got: {err:?}"
    );
}

#[tokio::test]
async fn rethrown_with_new_message_is_evaluation_error() {
    let (host, _) = stub_host();
    let script = r#"export default { s: { run: () => {
        try { secret("absent"); } catch (e) { throw new Error("login required"); }
    } } }"#;

    let err = host.invoke(script, &ctx("s")).await.unwrap_err();
    assert!(matches!(err, ScriptError::Evaluation { .. }), "got: {err:?}");
    assert_eq!(err.to_string(), "login required");
}

// --- fetch ---

#[tokio::test]
async fn fetch_url_string_and_object_build_identical_specs() {
    let (host, executor) = stub_host();
    let script = r#"export default {
        a: { run: () => fetch("http://h/x") },
        b: { run: () => fetch({ url: "http://h/x" }) },
    }"#;

    host.invoke(script, &ctx("a")).await.unwrap();
    host.invoke(script, &ctx("b")).await.unwrap();

    let requests = executor.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], requests[1]);
    assert_eq!(requests[0].effective_method(), "GET");
    assert!(requests[0].headers.is_empty());
    assert!(requests[0].body.is_none());
}

#[tokio::test]
async fn fetch_overrides_apply_to_url_string() {
    let (host, executor) = stub_host();
    let script = r#"export default { post: { run: () => fetch("http://h/orders", {
        method: "POST",
        headers: { "X-Test": "ok" },
        body: { v: 1 },
    }) } }"#;

    host.invoke(script, &ctx("post")).await.unwrap();

    let requests = executor.requests();
    assert_eq!(requests[0].url, "http://h/orders");
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].headers.get("X-Test").map(String::as_str), Some("ok"));
    assert_eq!(requests[0].body, Some(RequestBody::Json(json!({"v": 1}))));
}

#[tokio::test]
async fn fetch_response_is_returned_to_script() {
    let (host, _) = stub_host();
    let script = r#"export default { r: { run: () => {
        const res = fetch("http://h/x");
        return { status: res.status, json: { ok: res.json.ok, ct: res.headers["content-type"], body: res.body } };
    } } }"#;

    let result = host.invoke(script, &ctx("r")).await.unwrap();
    assert_eq!(result.status, Some(200));
    assert_eq!(
        parse(&result.json),
        json!({"ok": true, "ct": "application/json", "body": "{\"ok\":true}"})
    );
}

#[tokio::test]
async fn returning_fetch_response_directly_keeps_status() {
    let executor = Arc::new(RecordingExecutor::responding(404, r#"{"error":"nope"}"#));
    let host = host_with(executor, Arc::new(SecretResolver::in_memory()));
    let script = r#"export default { r: { run: () => fetch("http://h/x") } }"#;

    let result = host.invoke(script, &ctx("r")).await.unwrap();
    assert_eq!(result.status, Some(404));
    assert_eq!(result.body, r#"{"error":"nope"}"#);
    assert_eq!(parse(&result.json), json!({"error": "nope"}));
    assert!(result.is_failure());
}

#[tokio::test]
async fn fetch_argument_errors_are_typed() {
    let (host, executor) = stub_host();
    let script = r#"export default {
        none: { run: () => fetch() },
        nourl: { run: () => fetch({ method: "GET" }) },
        badurl: { run: () => fetch(42, { method: "POST" }) },
    }"#;

    for command in ["none", "nourl", "badurl"] {
        let err = host.invoke(script, &ctx(command)).await.unwrap_err();
        assert!(
            matches!(err, ScriptError::InvalidRequest(_)),
            "{command}: got {err:?}"
        );
    }
    assert!(executor.requests().is_empty());
}

#[tokio::test]
async fn transport_failure_is_catchable_and_typed_when_uncaught() {
    let executor = Arc::new(RecordingExecutor::failing("connection refused"));
    let host = host_with(executor, Arc::new(SecretResolver::in_memory()));
    let script = r#"export default {
        caught: { run: () => { try { fetch("http://h/x"); } catch (e) { return e.message; } } },
        uncaught: { run: () => fetch("http://h/x") },
    }"#;

    let caught = host.invoke(script, &ctx("caught")).await.unwrap();
    assert_eq!(caught.body, "request failed: connection refused");

    let err = host.invoke(script, &ctx("uncaught")).await.unwrap_err();
    assert!(matches!(err, ScriptError::Transport(_)), "got: {err:?}");
}

// --- sleep ---

#[tokio::test]
async fn sleep_blocks_for_the_requested_time() {
    let (host, _) = stub_host();
    let script = r#"export default { nap: { run: () => { sleep(-5); sleep(150); return "awake"; } } }"#;

    let start = Instant::now();
    let result = host.invoke(script, &ctx("nap")).await.unwrap();
    assert_eq!(result.body, "awake");
    assert!(start.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn sleep_past_deadline_is_timeout() {
    let (host, _) = stub_host();
    let script = r#"export default { nap: { run: () => { sleep(60000); return "late"; } } }"#;

    let start = Instant::now();
    let err = host
        .invoke(script, &ctx("nap").with_timeout(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            ScriptError::ResourceExceeded {
                limit: ResourceLimit::Timeout(_)
            }
        ),
        "got: {err:?}"
    );
    assert!(start.elapsed() < Duration::from_secs(5));
}

// --- isolation ---

#[tokio::test]
async fn no_state_survives_between_invocations() {
    let (host, _) = stub_host();
    let script = r#"
        globalThis.counter = (globalThis.counter || 0) + 1;
        export default { count: { run: () => counter } };
    "#;

    for _ in 0..3 {
        let result = host.invoke(script, &ctx("count")).await.unwrap();
        assert_eq!(result.body, "1");
    }
}

#[tokio::test]
async fn no_ambient_module_or_process_access() {
    let (host, _) = stub_host();
    let script = r#"export default { globals: { run: () => [
        typeof require, typeof process, typeof Deno, typeof console,
    ] } }"#;

    let result = host.invoke(script, &ctx("globals")).await.unwrap();
    assert_eq!(
        parse(&result.json),
        json!(["undefined", "undefined", "undefined", "undefined"])
    );
}

// --- audit ---

#[tokio::test]
async fn audit_records_fetches_and_secret_names_without_values() {
    let secrets = Arc::new(SecretResolver::in_memory());
    secrets.set("acme", "default", "token", "s3cr3t-value").unwrap();
    let executor = Arc::new(RecordingExecutor::responding(200, "{}"));
    let logger = Arc::new(CollectingAuditLogger::default());
    let host = host_with(executor, secrets).with_audit_logger(logger.clone());

    let script = r#"export default { call: { run: () => fetch("http://h/x?key=" + secret("token")) } }"#;
    host.invoke(script, &ctx("call")).await.unwrap();

    let entries = logger.entries();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.operation, AuditOperation::Invoke);
    assert_eq!(entry.command.as_deref(), Some("call"));
    assert_eq!(entry.outcome, AuditOutcome::Success);
    assert_eq!(entry.fetches.len(), 1);
    assert_eq!(entry.fetches[0].status, Some(200));
    assert_eq!(entry.secret_lookups.len(), 1);
    assert_eq!(entry.secret_lookups[0].name, "token");

    let serialized = serde_json::to_string(entry).unwrap();
    assert!(!serialized.contains("s3cr3t-value"));
}

#[tokio::test]
async fn audit_records_failures() {
    let logger = Arc::new(CollectingAuditLogger::default());
    let (host, _) = stub_host();
    let host = host.with_audit_logger(logger.clone());

    let _ = host
        .invoke(r#"export default { a: { run: () => 1 } }"#, &ctx("missing"))
        .await;

    let entries = logger.entries();
    assert_eq!(entries.len(), 1);
    assert!(matches!(
        entries[0].outcome,
        AuditOutcome::Error { ref code, .. } if code == "COMMAND_NOT_FOUND"
    ));
}
