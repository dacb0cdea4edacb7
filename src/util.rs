use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use serde_json::Value;
use url::Url;

use crate::error::{FailureEnvelope, TransportErrorKind};

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn merge_headers(default_headers: &HeaderMap, request_headers: &HeaderMap) -> HeaderMap {
    let mut merged = default_headers.clone();
    for (name, value) in request_headers {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

pub(crate) fn is_absolute_url(path: &str) -> bool {
    let lower = path.get(..8).unwrap_or(path).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

/// Resolves `path` against `base_url`; an absolute `path` ignores the base.
pub(crate) fn resolve_url(base_url: &str, path: &str) -> Result<Url, FailureEnvelope> {
    let url_text = if is_absolute_url(path) {
        path.to_owned()
    } else {
        join_base_path(base_url, path)
    };
    let url = Url::parse(&url_text)
        .map_err(|source| FailureEnvelope::config(format!("invalid request url {url_text}: {source}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(FailureEnvelope::config(format!(
            "invalid request url {url_text}: expected an http(s) url with a host"
        )));
    }
    Ok(url)
}

/// Renders a query parameter value, or `None` when the parameter is omitted.
pub(crate) fn query_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        other => Some(other.to_string()),
    }
}

/// Appends parameters after any query already present in the URL, keeping
/// caller order.
pub(crate) fn append_query_params(url: &mut Url, params: &[(String, Value)]) {
    let rendered = params
        .iter()
        .filter_map(|(name, value)| query_value(value).map(|value| (name, value)))
        .collect::<Vec<_>>();
    if rendered.is_empty() {
        return;
    }
    let mut pairs = url.query_pairs_mut();
    for (name, value) in rendered {
        pairs.append_pair(name, &value);
    }
}

pub(crate) fn url_without_query(url: &Url) -> String {
    let mut stripped = url.clone();
    stripped.set_query(None);
    stripped.set_fragment(None);
    stripped.to_string()
}

pub(crate) fn redact_url_for_logs(url: &Url) -> String {
    let mut redacted = url.clone();
    let _ = redacted.set_username("");
    let _ = redacted.set_password(None);
    redacted.set_query(None);
    redacted.set_fragment(None);
    redacted.to_string()
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, FailureEnvelope> {
    name.parse()
        .map_err(|source| FailureEnvelope::config(format!("invalid header name {name}: {source}")))
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, FailureEnvelope> {
    value.parse().map_err(|source| {
        FailureEnvelope::config(format!("invalid header value for {name}: {source}"))
    })
}

pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    let raw_value = value.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    match date.duration_since(now) {
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}

pub(crate) fn classify_transport_error(
    error: &hyper_util::client::legacy::Error,
) -> TransportErrorKind {
    let text = format!("{error:?}").to_ascii_lowercase();
    if error.is_connect() {
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
        || text.contains("incomplete")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}
