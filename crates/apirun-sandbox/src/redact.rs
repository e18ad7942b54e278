//! Credential redaction for logs and audit records.
//!
//! Script-visible messages are never rewritten; these helpers only shape what
//! the host writes to `tracing` and audit sinks.

use std::sync::LazyLock;

use regex::Regex;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"https?://[^\s'")\]}>]+"#).unwrap());

static USERINFO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<scheme>[a-zA-Z][a-zA-Z0-9+.\-]*://)[^/?#@]*@").unwrap());

static QUERY_VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?P<key>[?&][^=&#]+)=[^&#]*").unwrap());

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(Bearer\s+\S+|Basic\s+[A-Za-z0-9+/=]{8,}|api_?key\s*[=:]\s*\S+|token\s*[=:]\s*\S+|password\s*[=:]\s*\S+|secret\s*[=:]\s*\S+)",
    )
    .unwrap()
});

/// JWTs: three base64url segments separated by dots.
static JWT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"eyJ[a-zA-Z0-9_-]+\.eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+").unwrap());

static GITHUB_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:ghp_|gho_|ghs_|ghr_|github_pat_)[a-zA-Z0-9_]{20,}").unwrap());

static HEX_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{32,}\b").unwrap());

/// Strip userinfo and query values from a URL.
///
/// `https://u:p@api.example.com/v1?key=abc&page=2` becomes
/// `https://api.example.com/v1?key=[REDACTED]&page=[REDACTED]`.
pub fn redact_url(url: &str) -> String {
    let without_userinfo = USERINFO_RE.replace(url, "$scheme");
    QUERY_VALUE_RE
        .replace_all(&without_userinfo, "$key=[REDACTED]")
        .into_owned()
}

/// Redact credentials from a free-form message.
///
/// JWTs, GitHub tokens, bearer/basic credentials, `key=value` secrets and long
/// hex strings become `[REDACTED]`; embedded URLs go through [`redact_url`].
pub fn redact_error_message(message: &str) -> String {
    let mut msg = JWT_RE.replace_all(message, "[REDACTED]").into_owned();
    msg = GITHUB_TOKEN_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg = URL_RE
        .replace_all(&msg, |caps: &regex::Captures<'_>| redact_url(&caps[0]))
        .into_owned();
    msg = CREDENTIAL_RE.replace_all(&msg, "[REDACTED]").into_owned();
    HEX_TOKEN_RE.replace_all(&msg, "[REDACTED]").into_owned()
}
