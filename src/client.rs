use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::ReqflowResult;
use crate::cache::ResponseCache;
use crate::config::{ClientConfig, DescriptorDefaults, build_descriptor};
use crate::descriptor::{CachePolicy, RequestBody, RequestDescriptor, RequestOptions};
use crate::error::{FailureEnvelope, FailureKind};
use crate::fingerprint::{Fingerprint, resource_key};
use crate::inflight::InFlightRegistry;
use crate::interceptor::{
    ErrorDisposition, ErrorInterceptor, InterceptorHandle, Interceptors, RequestInterceptor,
    ResponseInterceptor, run_error_chain, run_request_chain, run_response_chain,
};
use crate::metrics::{PipelineMetrics, PipelineMetricsSnapshot};
use crate::request::RequestBuilder;
use crate::response::ResponseEnvelope;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transport::{HyperTransport, Transport, execute_attempt};
use crate::util::{
    lock_unpoisoned, parse_header_name, parse_header_value, parse_retry_after, redact_url_for_logs,
    resolve_url,
};

type Outcome = Result<ResponseEnvelope, FailureEnvelope>;

static DEFAULT_CLIENT: OnceLock<HttpClient> = OnceLock::new();

/// Process-wide client built from [`ClientConfig::default`] on first use.
///
/// It has no base URL, so callers pass absolute URLs. Tests should build
/// their own client with [`HttpClient::builder`] instead.
pub fn default_client() -> ReqflowResult<HttpClient> {
    if let Some(client) = DEFAULT_CLIENT.get() {
        return Ok(client.clone());
    }
    let client = HttpClient::from_config(ClientConfig::default())?;
    Ok(DEFAULT_CLIENT.get_or_init(|| client).clone())
}

pub struct HttpClientBuilder {
    config: ClientConfig,
    default_headers: HeaderMap,
    retry_policy: Option<RetryPolicy>,
    transport: Option<Arc<dyn Transport>>,
}

impl HttpClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self::from_config(ClientConfig::new(base_url))
    }

    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            default_headers: HeaderMap::new(),
            retry_policy: None,
            transport: None,
        }
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.config.request_timeout_ms = request_timeout.as_millis().max(1) as u64;
        self
    }

    pub fn cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.config.cache_ttl_ms = cache_ttl.as_millis() as u64;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn retry_config(mut self, max_attempts: usize, base_delay: Duration) -> Self {
        self.config.max_attempts = max_attempts;
        self.config.base_delay_ms = base_delay.as_millis() as u64;
        self.retry_policy = None;
        self
    }

    pub fn cacheable_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.config.cacheable_methods = methods
            .into_iter()
            .map(|method| method.as_str().to_owned())
            .collect();
        self
    }

    pub fn allow_credentials(mut self, allow_credentials: bool) -> Self {
        self.config.allow_credentials = allow_credentials;
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> ReqflowResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn transport<T>(self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport_arc(Arc::new(transport))
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn try_build(self) -> ReqflowResult<HttpClient> {
        if !self.config.base_url.is_empty() {
            resolve_url(&self.config.base_url, "")?;
        }
        let mut headers = self.config.parsed_default_headers()?;
        for (name, value) in &self.default_headers {
            headers.insert(name.clone(), value.clone());
        }
        let cacheable_methods = self.config.parsed_cacheable_methods()?;
        let retry_policy = self
            .retry_policy
            .unwrap_or_else(|| self.config.retry_policy());
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new()?),
        };

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                defaults: DescriptorDefaults {
                    base_url: self.config.base_url.clone(),
                    headers,
                    timeout: self.config.request_timeout(),
                    allow_credentials: self.config.allow_credentials,
                },
                cacheable_methods,
                retry_policy: Mutex::new(retry_policy),
                cache: ResponseCache::new(self.config.cache_ttl()),
                in_flight: InFlightRegistry::new(),
                interceptors: Interceptors::new(),
                transport,
                metrics: PipelineMetrics::default(),
            }),
        })
    }
}

struct ClientInner {
    defaults: DescriptorDefaults,
    cacheable_methods: Vec<Method>,
    retry_policy: Mutex<RetryPolicy>,
    cache: ResponseCache,
    in_flight: InFlightRegistry<Outcome>,
    interceptors: Interceptors,
    transport: Arc<dyn Transport>,
    metrics: PipelineMetrics,
}

/// How the transport loop settled successfully.
enum Settled {
    Fresh(ResponseEnvelope),
    Recovered(ResponseEnvelope),
}

/// Entry point of the request pipeline.
///
/// Cloning is cheap and every clone shares one cache, in-flight registry,
/// interceptor set and transport.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClient")
            .field("base_url", &self.inner.defaults.base_url)
            .field("cacheable_methods", &self.inner.cacheable_methods)
            .field("cache_ttl", &self.inner.cache.ttl())
            .field("retry_policy", &self.retry_policy())
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn builder(base_url: impl Into<String>) -> HttpClientBuilder {
        HttpClientBuilder::new(base_url)
    }

    pub fn from_config(config: ClientConfig) -> ReqflowResult<Self> {
        HttpClientBuilder::from_config(config).try_build()
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    /// Resolves a logical request into a descriptor without sending it.
    pub fn build_descriptor(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
        options: &RequestOptions,
    ) -> ReqflowResult<RequestDescriptor> {
        build_descriptor(&self.inner.defaults, method, path, body, options)
    }

    pub async fn execute(&self, descriptor: RequestDescriptor) -> ReqflowResult<ResponseEnvelope> {
        self.execute_cancellable(descriptor, CancellationToken::new())
            .await
    }

    /// Runs the full pipeline. Cancelling `cancellation` stops the active
    /// attempt, skips further retries and settles every caller sharing this
    /// request with a [`FailureKind::Cancelled`] failure.
    pub async fn execute_cancellable(
        &self,
        descriptor: RequestDescriptor,
        cancellation: CancellationToken,
    ) -> ReqflowResult<ResponseEnvelope> {
        self.inner.metrics.record_request_started();
        let result = self.run_pipeline(descriptor, cancellation).await;
        self.inner.metrics.record_request_completed(&result);
        result
    }

    pub fn add_request_interceptor<I>(&self, interceptor: I) -> InterceptorHandle
    where
        I: RequestInterceptor + 'static,
    {
        self.add_request_interceptor_arc(Arc::new(interceptor))
    }

    pub fn add_request_interceptor_arc(
        &self,
        interceptor: Arc<dyn RequestInterceptor>,
    ) -> InterceptorHandle {
        self.inner.interceptors.request.register(interceptor)
    }

    pub fn add_response_interceptor<I>(&self, interceptor: I) -> InterceptorHandle
    where
        I: ResponseInterceptor + 'static,
    {
        self.add_response_interceptor_arc(Arc::new(interceptor))
    }

    pub fn add_response_interceptor_arc(
        &self,
        interceptor: Arc<dyn ResponseInterceptor>,
    ) -> InterceptorHandle {
        self.inner.interceptors.response.register(interceptor)
    }

    pub fn add_error_interceptor<I>(&self, interceptor: I) -> InterceptorHandle
    where
        I: ErrorInterceptor + 'static,
    {
        self.add_error_interceptor_arc(Arc::new(interceptor))
    }

    pub fn add_error_interceptor_arc(
        &self,
        interceptor: Arc<dyn ErrorInterceptor>,
    ) -> InterceptorHandle {
        self.inner.interceptors.error.register(interceptor)
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Drops cached `GET` responses for `path`, across query strings.
    pub fn invalidate_cache(&self, path: &str) -> ReqflowResult<usize> {
        self.invalidate_cache_for(Method::GET, path)
    }

    pub fn invalidate_cache_for(&self, method: Method, path: &str) -> ReqflowResult<usize> {
        let url = resolve_url(&self.inner.defaults.base_url, path)?;
        let removed = self
            .inner
            .cache
            .invalidate_resource(&resource_key(&method, &url));
        debug!(
            method = %method,
            uri = %redact_url_for_logs(&url),
            removed,
            "invalidated cached responses"
        );
        Ok(removed)
    }

    pub fn set_cache_ttl(&self, ttl: Duration) {
        self.inner.cache.set_ttl(ttl);
    }

    pub fn cache_ttl(&self) -> Duration {
        self.inner.cache.ttl()
    }

    /// Applies to requests that start after the call.
    pub fn set_retry_config(&self, max_attempts: usize, base_delay: Duration) {
        let mut policy = lock_unpoisoned(&self.inner.retry_policy);
        *policy = policy
            .clone()
            .max_attempts(max_attempts)
            .base_backoff(base_delay);
    }

    pub fn set_retry_policy(&self, retry_policy: RetryPolicy) {
        *lock_unpoisoned(&self.inner.retry_policy) = retry_policy;
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        lock_unpoisoned(&self.inner.retry_policy).clone()
    }

    pub fn metrics_snapshot(&self) -> PipelineMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn cached_entry_count(&self) -> usize {
        self.inner.cache.len()
    }

    /// Clears the cache and forgets in-flight entries. Pending callers keep
    /// awaiting their outcomes; new requests no longer join them.
    pub fn reset(&self) {
        self.inner.cache.clear();
        self.inner.in_flight.clear();
    }

    fn is_cacheable(&self, method: &Method) -> bool {
        self.inner.cacheable_methods.contains(method)
    }

    async fn run_pipeline(
        &self,
        descriptor: RequestDescriptor,
        cancellation: CancellationToken,
    ) -> Outcome {
        let prepared = run_request_chain(&self.inner.interceptors.request, descriptor).await;
        let descriptor = match prepared {
            Ok(descriptor) => descriptor,
            Err(failure) => match run_error_chain(&self.inner.interceptors.error, failure).await {
                ErrorDisposition::Fail(failure) => return Err(failure),
                ErrorDisposition::Recover(response) => return Ok(response),
                ErrorDisposition::Retry(replacement) => {
                    debug!("error interceptor supplied a replacement request descriptor");
                    replacement
                }
            },
        };

        let fingerprint = Fingerprint::of(&descriptor);
        let producer_client = self.clone();
        let producer_fingerprint = fingerprint.clone();
        let producer_cancellation = cancellation.clone();
        let reservation = self.inner.in_flight.reserve_or_join(&fingerprint, move || {
            producer_client.resolve(descriptor, producer_fingerprint, producer_cancellation)
        });
        if reservation.is_joined() {
            self.inner.metrics.record_dedup_join();
            debug!(fingerprint = %fingerprint, "joined in-flight request");
        }
        let outcome = reservation.into_outcome();

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(FailureEnvelope::cancelled()),
            result = outcome => result,
        }
    }

    /// Producer behind an in-flight entry: cache lookup, transport with
    /// retries, response interceptors, cache write.
    async fn resolve(
        self,
        descriptor: RequestDescriptor,
        fingerprint: Fingerprint,
        cancellation: CancellationToken,
    ) -> Outcome {
        let cacheable = self.is_cacheable(&descriptor.method);
        if cacheable {
            let cached = match descriptor.cache_policy {
                CachePolicy::Default => self.inner.cache.get(&fingerprint),
                CachePolicy::ForceCache => self.inner.cache.get_stale(&fingerprint),
                CachePolicy::NoCache => None,
            };
            if let Some(body) = cached {
                self.inner.metrics.record_cache_hit();
                debug!(fingerprint = %fingerprint, "served from response cache");
                return Ok(ResponseEnvelope::cached(body, descriptor));
            }
            self.inner.metrics.record_cache_miss();
        }

        let response = match self.send_with_retry(descriptor, &cancellation).await? {
            Settled::Fresh(response) => response,
            Settled::Recovered(response) => return Ok(response),
        };

        let response = match run_response_chain(&self.inner.interceptors.response, response).await
        {
            Ok(response) => response,
            Err(failure) => return self.surface(failure).await,
        };

        if cacheable && response.status.is_success() {
            self.inner.cache.set(&fingerprint, response.body.clone());
        }
        Ok(response)
    }

    /// Final pass of the error chain over a failure that is about to reach
    /// the caller. A replacement descriptor is no longer honored here.
    async fn surface(&self, failure: FailureEnvelope) -> Outcome {
        match run_error_chain(&self.inner.interceptors.error, failure.clone()).await {
            ErrorDisposition::Fail(failure) => Err(failure),
            ErrorDisposition::Recover(response) => Ok(response),
            ErrorDisposition::Retry(_) => {
                warn!(failure = %failure, "retry requested during final failure pass; surfacing failure");
                Err(failure)
            }
        }
    }

    /// The retry state machine. Each iteration is one `Attempt(n)`; only the
    /// transport step repeats, with the descriptor fixed after the request
    /// interceptors ran.
    async fn send_with_retry(
        &self,
        mut descriptor: RequestDescriptor,
        cancellation: &CancellationToken,
    ) -> Result<Settled, FailureEnvelope> {
        let retry_policy = self.retry_policy();
        let max_attempts = retry_policy.configured_max_attempts();
        let mut attempt = 0_usize;
        let mut replacement_used = false;

        loop {
            let redacted_uri = redact_url_for_logs(&descriptor.url);
            let span = info_span!(
                "reqflow.attempt",
                method = %descriptor.method,
                uri = %redacted_uri,
                attempt = attempt,
                max_attempts = max_attempts
            );
            self.inner.metrics.record_transport_call();
            let failure = match execute_attempt(
                self.inner.transport.as_ref(),
                &descriptor,
                cancellation,
            )
            .instrument(span)
            .await
            {
                Ok(response) => return Ok(Settled::Fresh(response)),
                Err(failure) => failure,
            };
            self.inner.metrics.record_attempt_failure(&failure);

            let observed = failure.clone();
            let failure = match run_error_chain(&self.inner.interceptors.error, failure).await {
                ErrorDisposition::Fail(failure) => failure,
                ErrorDisposition::Recover(response) => return Ok(Settled::Recovered(response)),
                ErrorDisposition::Retry(replacement) => {
                    if !replacement_used && observed.kind != FailureKind::Cancelled {
                        replacement_used = true;
                        attempt = 0;
                        descriptor = replacement;
                        debug!("error interceptor restarted the request with a new descriptor");
                        continue;
                    }
                    warn!(failure = %observed, "ignoring repeated retry request from error interceptor");
                    observed
                }
            };

            let decision = RetryDecision::for_failure(
                attempt,
                max_attempts,
                &descriptor.method,
                &redacted_uri,
                &failure,
            );
            if !retry_policy.should_retry(&decision) {
                return self.surface(failure).await.map(Settled::Recovered);
            }

            let delay = retry_delay(&retry_policy, attempt, &failure);
            warn!(
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                failure = %failure,
                "retrying request"
            );
            self.inner.metrics.record_retry();
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    return Err(FailureEnvelope::cancelled().with_request(descriptor));
                }
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Exponential delay, or the server's `Retry-After` for throttling statuses,
/// capped at the policy maximum.
fn retry_delay(retry_policy: &RetryPolicy, attempt: usize, failure: &FailureEnvelope) -> Duration {
    let throttled = matches!(
        failure.status,
        Some(StatusCode::TOO_MANY_REQUESTS) | Some(StatusCode::SERVICE_UNAVAILABLE)
    );
    if throttled
        && let Some(delay) = parse_retry_after(&failure.headers, SystemTime::now())
    {
        return delay.min(retry_policy.configured_max_backoff());
    }
    retry_policy.backoff_for_retry(attempt)
}
