//! Normalize whatever `run` returned into an [`ExecutionResult`].

use rquickjs::convert::Coerced;
use rquickjs::{Ctx, Object, Value};

use crate::ExecutionResult;

/// Coerce a command's return value.
///
/// - `undefined` gives an empty result.
/// - An object with any of `status`, `body` or `json` defined is an envelope:
///   each field is copied as given, and without a `json` field the whole
///   object is serialized instead.
/// - Anything else is string-coerced into `body`; objects and arrays are
///   also serialized into `json`, primitives are not.
pub(crate) fn coerce_result<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<ExecutionResult> {
    if value.is_undefined() {
        return Ok(ExecutionResult::default());
    }
    if let Some(obj) = value.as_object() {
        if let Some(result) = coerce_envelope(ctx, obj)? {
            return Ok(result);
        }
    }

    let body = value.get::<Coerced<String>>()?.0;
    let json = if value.is_object() {
        stringify(ctx, value)?
    } else {
        None
    };
    Ok(ExecutionResult {
        status: None,
        body,
        json,
    })
}

fn coerce_envelope<'js>(ctx: &Ctx<'js>, obj: &Object<'js>) -> rquickjs::Result<Option<ExecutionResult>> {
    let status: Value = obj.get("status")?;
    let body: Value = obj.get("body")?;
    let json: Value = obj.get("json")?;
    if status.is_undefined() && body.is_undefined() && json.is_undefined() {
        return Ok(None);
    }

    let status = if status.is_undefined() {
        None
    } else {
        Some(status.get::<Coerced<i32>>()?.0)
    };
    let body = if body.is_undefined() || body.is_null() {
        String::new()
    } else {
        body.get::<Coerced<String>>()?.0
    };
    let json = if json.is_undefined() || json.is_null() {
        stringify(ctx, obj.clone().into_value())?
    } else {
        stringify(ctx, json)?
    };
    Ok(Some(ExecutionResult { status, body, json }))
}

fn stringify<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Option<String>> {
    ctx.json_stringify(value)?
        .map(|s| s.to_string())
        .transpose()
}
