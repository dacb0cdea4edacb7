use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

/// How a request interacts with the response cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    /// Serve fresh entries, store successful responses.
    #[default]
    Default,
    /// Skip the lookup but still store the fresh response.
    NoCache,
    /// Serve any stored entry regardless of age.
    ForceCache,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
    Text(String),
    Binary(Bytes),
}

impl RequestBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Binary payloads carry their own framing (multipart boundaries, file
    /// uploads) and never get a forced content type.
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    pub(crate) fn to_bytes(&self) -> Bytes {
        match self {
            Self::Empty => Bytes::new(),
            Self::Json(value) => Bytes::from(value.to_string()),
            Self::Form(pairs) => {
                let mut serializer = url::form_urlencoded::Serializer::new(String::new());
                for (name, value) in pairs {
                    serializer.append_pair(name, value);
                }
                Bytes::from(serializer.finish())
            }
            Self::Text(text) => Bytes::from(text.clone()),
            Self::Binary(bytes) => bytes.clone(),
        }
    }

    /// Serialization that is identical for logically identical bodies,
    /// independent of object key order.
    pub(crate) fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Self::Empty => Vec::new(),
            Self::Json(value) => {
                let mut out = String::from("json:");
                write_canonical_json(value, &mut out);
                out.into_bytes()
            }
            Self::Form(_) => [b"form:".as_slice(), &self.to_bytes()].concat(),
            Self::Text(text) => [b"text:".as_slice(), text.as_bytes()].concat(),
            Self::Binary(bytes) => [b"binary:".as_slice(), bytes.as_ref()].concat(),
        }
    }
}

fn write_canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical_json(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// A transport-ready request.
///
/// Interceptors receive descriptors by value and hand back a (possibly new)
/// descriptor; the pipeline never shares one mutable instance between
/// concurrent requests.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    pub url: Url,
    pub method: Method,
    pub body: RequestBody,
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub allow_credentials: bool,
    pub cache_policy: CachePolicy,
}

impl RequestDescriptor {
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Query pairs in the order they appear in the resolved URL.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.url
            .query_pairs()
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect()
    }
}

/// Per-call options recognized by every caller-facing method.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    pub params: Vec<(String, Value)>,
    pub timeout: Option<Duration>,
    pub cache_policy: Option<CachePolicy>,
    pub allow_credentials: Option<bool>,
    pub cancellation: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn with_header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Adds a query parameter. `Value::Null` parameters are dropped when the
    /// URL is built; other scalars are rendered as plain strings.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn with_cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = Some(cache_policy);
        self
    }

    pub fn with_allow_credentials(mut self, allow_credentials: bool) -> Self {
        self.allow_credentials = Some(allow_credentials);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}
