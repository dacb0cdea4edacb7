use std::time::Duration;

use bytes::Bytes;
use http::Method;
use http::header::{HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::client::HttpClient;
use crate::descriptor::{CachePolicy, RequestBody, RequestDescriptor, RequestOptions};
use crate::error::FailureEnvelope;
use crate::response::ResponseEnvelope;
use crate::util::{parse_header_name, parse_header_value};
use crate::{IDEMPOTENCY_KEY_HEADER, ReqflowResult};

/// Collects one logical request before it enters the pipeline.
pub struct RequestBuilder<'a> {
    client: &'a HttpClient,
    method: Method,
    path: String,
    body: RequestBody,
    options: RequestOptions,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a HttpClient, method: Method, path: String) -> Self {
        Self {
            client,
            method,
            path,
            body: RequestBody::Empty,
            options: RequestOptions::default(),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.options.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> ReqflowResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    /// Requests carrying different idempotency keys never share an
    /// in-flight outcome.
    pub fn idempotency_key(self, key: &str) -> ReqflowResult<Self> {
        self.try_header(IDEMPOTENCY_KEY_HEADER, key)
    }

    /// Appends a query parameter; `Value::Null` is dropped.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.params.push((name.into(), value.into()));
        self
    }

    pub fn params<K, V, I>(mut self, params: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.options.params.extend(
            params
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    pub fn query<T>(mut self, params: &T) -> ReqflowResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params).map_err(|source| {
            FailureEnvelope::config(format!("failed to serialize query params: {source}"))
        })?;
        self.options.params.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), Value::String(value.into_owned()))),
        );
        Ok(self)
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn body_bytes(self, body: impl Into<Bytes>) -> Self {
        self.body(RequestBody::Binary(body.into()))
    }

    pub fn text(self, body: impl Into<String>) -> Self {
        self.body(RequestBody::Text(body.into()))
    }

    pub fn json<T>(self, payload: &T) -> ReqflowResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(payload).map_err(|source| {
            FailureEnvelope::config(format!("failed to serialize request json: {source}"))
        })?;
        Ok(self.body(RequestBody::Json(value)))
    }

    pub fn form<T>(self, payload: &T) -> ReqflowResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(payload).map_err(|source| {
            FailureEnvelope::config(format!("failed to serialize request form: {source}"))
        })?;
        let fields = url::form_urlencoded::parse(encoded.as_bytes())
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        Ok(self.body(RequestBody::Form(fields)))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_timeout(timeout);
        self
    }

    pub fn cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.options.cache_policy = Some(cache_policy);
        self
    }

    pub fn allow_credentials(mut self, allow_credentials: bool) -> Self {
        self.options.allow_credentials = Some(allow_credentials);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.options.cancellation = Some(token);
        self
    }

    /// Replaces every option set so far.
    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(&self) -> ReqflowResult<RequestDescriptor> {
        self.client
            .build_descriptor(self.method.clone(), &self.path, self.body.clone(), &self.options)
    }

    pub async fn send(self) -> ReqflowResult<ResponseEnvelope> {
        let descriptor = self.build()?;
        let cancellation = self.options.cancellation.unwrap_or_default();
        self.client
            .execute_cancellable(descriptor, cancellation)
            .await
    }

    pub async fn send_json<T>(self) -> ReqflowResult<T>
    where
        T: DeserializeOwned,
    {
        self.send().await?.json()
    }
}

impl std::fmt::Debug for RequestBuilder<'_> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestBuilder")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("body", &self.body)
            .field("options", &self.options)
            .finish()
    }
}
