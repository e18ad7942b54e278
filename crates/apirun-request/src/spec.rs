//! Request and response shapes exchanged with the executor.

use std::collections::BTreeMap;

use apirun_error::HostError;
use serde::Deserialize;
use serde_json::Value;

/// The body of an outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Sent verbatim as UTF-8.
    Text(String),
    /// Sent verbatim.
    Bytes(Vec<u8>),
    /// Serialized as JSON; implies `Content-Type: application/json` unless set.
    Json(Value),
}

impl RequestBody {
    /// Map a script-supplied body value: strings stay text, everything else is JSON.
    ///
    /// `null` means no body.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(Self::Text(s)),
            other => Some(Self::Json(other)),
        }
    }
}

/// A declarative HTTP request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestSpec {
    /// HTTP method; empty means GET.
    pub method: String,
    /// Absolute URL. Must be non-empty before dispatch.
    pub url: String,
    /// Request headers, applied verbatim.
    pub headers: BTreeMap<String, String>,
    /// Optional body.
    pub body: Option<RequestBody>,
}

/// Raw `fetch` options as a script writes them.
///
/// Every field is optional; `null` is treated the same as absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestOptions {
    /// Target URL.
    #[serde(default)]
    pub url: Option<String>,
    /// HTTP method.
    #[serde(default)]
    pub method: Option<String>,
    /// Header map.
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    /// Body: string, or any JSON value.
    #[serde(default)]
    pub body: Option<Value>,
}

impl RequestOptions {
    /// Parse options from their JSON form.
    pub fn from_json(json: &str) -> Result<Self, HostError> {
        serde_json::from_str(json)
            .map_err(|e| HostError::InvalidRequest(format!("invalid fetch options: {e}")))
    }
}

impl RequestSpec {
    /// A bare GET for `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Build a full spec from an options object.
    pub fn from_options(options: RequestOptions) -> Self {
        let spec = Self::get(options.url.clone().unwrap_or_default());
        spec.with_overrides(options)
    }

    /// Replace method, headers and body with the ones supplied in `overrides`.
    ///
    /// The URL is never taken from overrides.
    pub fn with_overrides(mut self, overrides: RequestOptions) -> Self {
        if let Some(method) = overrides.method.filter(|m| !m.is_empty()) {
            self.method = method;
        }
        if let Some(headers) = overrides.headers {
            self.headers = headers;
        }
        if let Some(body) = overrides.body {
            self.body = RequestBody::from_value(body);
        }
        self
    }

    /// Set a header, returning the spec.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The effective method: upper-cased, GET when empty.
    pub fn effective_method(&self) -> String {
        if self.method.trim().is_empty() {
            "GET".to_string()
        } else {
            self.method.trim().to_ascii_uppercase()
        }
    }

    /// Whether a `Content-Type` header was set, in any casing.
    pub fn has_content_type(&self) -> bool {
        self.headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("content-type"))
    }

    /// Encode the body, adding `Content-Type: application/json` for structured
    /// bodies when the script did not set a content type.
    pub fn encode_body(&mut self) -> Result<Option<Vec<u8>>, HostError> {
        match self.body.take() {
            None => Ok(None),
            Some(RequestBody::Text(text)) => Ok(Some(text.into_bytes())),
            Some(RequestBody::Bytes(bytes)) => Ok(Some(bytes)),
            Some(RequestBody::Json(value)) => {
                let encoded = serde_json::to_vec(&value).map_err(|e| {
                    HostError::InvalidRequest(format!("body is not serializable: {e}"))
                })?;
                if !self.has_content_type() {
                    self.headers
                        .insert("Content-Type".to_string(), "application/json".to_string());
                }
                Ok(Some(encoded))
            }
        }
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, first value per lower-cased name.
    pub headers: BTreeMap<String, String>,
    /// Raw body bytes.
    pub body: Vec<u8>,
    /// The parsed body, present only if it is syntactically valid JSON.
    pub json: Option<Value>,
}

impl ResponseEnvelope {
    /// Build an envelope, parsing the body as JSON on a best-effort basis.
    pub fn new(status: u16, headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
        let json = parse_json_body(&body);
        Self {
            status,
            headers,
            body,
            json,
        }
    }

    /// The body as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn parse_json_body(body: &[u8]) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice(body).ok()
}
