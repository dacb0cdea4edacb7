use std::collections::BTreeMap;
use std::time::Duration;

use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};

use crate::ReqflowResult;
use crate::descriptor::{CachePolicy, RequestBody, RequestDescriptor, RequestOptions};
use crate::error::FailureEnvelope;
use crate::retry::RetryPolicy;
use crate::util::{append_query_params, merge_headers, parse_header_name, parse_header_value, resolve_url};

pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);
pub(crate) const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(60_000);

/// Serializable client settings; every field has a default so partial
/// documents deserialize.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub cache_ttl_ms: u64,
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
    pub retry_application_failures: bool,
    pub cacheable_methods: Vec<String>,
    pub default_headers: BTreeMap<String, String>,
    pub allow_credentials: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            cache_ttl_ms: DEFAULT_CACHE_TTL.as_millis() as u64,
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ratio: 0.0,
            retry_application_failures: true,
            cacheable_methods: vec!["GET".to_owned()],
            default_headers: BTreeMap::new(),
            allow_credentials: false,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(text: &str) -> ReqflowResult<Self> {
        serde_json::from_str(text)
            .map_err(|source| FailureEnvelope::config(format!("invalid client config: {source}")))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::standard()
            .max_attempts(self.max_attempts)
            .base_backoff(Duration::from_millis(self.base_delay_ms))
            .max_backoff(Duration::from_millis(self.max_delay_ms))
            .jitter_ratio(self.jitter_ratio)
            .retry_application_failures(self.retry_application_failures)
    }

    pub fn parsed_cacheable_methods(&self) -> ReqflowResult<Vec<Method>> {
        self.cacheable_methods
            .iter()
            .map(|name| {
                Method::from_bytes(name.to_ascii_uppercase().as_bytes()).map_err(|source| {
                    FailureEnvelope::config(format!("invalid cacheable method {name}: {source}"))
                })
            })
            .collect()
    }

    pub fn parsed_default_headers(&self) -> ReqflowResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.default_headers {
            let header_name = parse_header_name(name)?;
            let header_value = parse_header_value(name, value)?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }
}

/// Settings the Config Builder applies to every request of one client.
#[derive(Clone, Debug)]
pub(crate) struct DescriptorDefaults {
    pub base_url: String,
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub allow_credentials: bool,
}

/// Turns a logical request into a transport-ready descriptor with an
/// absolute URL.
pub(crate) fn build_descriptor(
    defaults: &DescriptorDefaults,
    method: Method,
    path: &str,
    body: RequestBody,
    options: &RequestOptions,
) -> ReqflowResult<RequestDescriptor> {
    let mut url = resolve_url(&defaults.base_url, path)?;
    append_query_params(&mut url, &options.params);

    let mut headers = merge_headers(&defaults.headers, &options.headers);
    if method != Method::GET && !body.is_binary() && !headers.contains_key(CONTENT_TYPE) {
        match &body {
            RequestBody::Json(_) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            RequestBody::Form(_) => {
                headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/x-www-form-urlencoded"),
                );
            }
            RequestBody::Text(_) => {
                headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                );
            }
            RequestBody::Empty | RequestBody::Binary(_) => {}
        }
    }

    Ok(RequestDescriptor {
        url,
        method,
        body,
        headers,
        timeout: options.timeout.unwrap_or(defaults.timeout),
        allow_credentials: options
            .allow_credentials
            .unwrap_or(defaults.allow_credentials),
        cache_policy: options.cache_policy.unwrap_or(CachePolicy::Default),
    })
}
