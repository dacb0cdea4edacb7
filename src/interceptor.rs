use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::{BoxFuture, FutureExt};
use tracing::warn;

use crate::descriptor::RequestDescriptor;
use crate::error::FailureEnvelope;
use crate::response::ResponseEnvelope;
use crate::util::lock_unpoisoned;

/// Transforms a request before it is fingerprinted and sent.
pub trait RequestInterceptor: Send + Sync {
    fn intercept(
        &self,
        request: RequestDescriptor,
    ) -> BoxFuture<'static, Result<RequestDescriptor, FailureEnvelope>>;
}

/// Transforms a successful response before it is cached and returned.
pub trait ResponseInterceptor: Send + Sync {
    fn intercept(
        &self,
        response: ResponseEnvelope,
    ) -> BoxFuture<'static, Result<ResponseEnvelope, FailureEnvelope>>;
}

/// Observes or transforms a failure.
pub trait ErrorInterceptor: Send + Sync {
    fn intercept(&self, failure: FailureEnvelope) -> BoxFuture<'static, ErrorDisposition>;
}

/// What an error interceptor decided about a failure.
#[derive(Clone, Debug)]
pub enum ErrorDisposition {
    /// Keep failing, possibly with a transformed envelope. Later error
    /// interceptors receive it.
    Fail(FailureEnvelope),
    /// Substitute a successful outcome; the rest of the chain is skipped.
    Recover(ResponseEnvelope),
    /// Restart the transport loop at attempt 0 with this descriptor. Honored
    /// once per logical request; used by credential-refresh collaborators.
    Retry(RequestDescriptor),
}

impl<F, Fut> RequestInterceptor for F
where
    F: Fn(RequestDescriptor) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RequestDescriptor, FailureEnvelope>> + Send + 'static,
{
    fn intercept(
        &self,
        request: RequestDescriptor,
    ) -> BoxFuture<'static, Result<RequestDescriptor, FailureEnvelope>> {
        self(request).boxed()
    }
}

impl<F, Fut> ResponseInterceptor for F
where
    F: Fn(ResponseEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ResponseEnvelope, FailureEnvelope>> + Send + 'static,
{
    fn intercept(
        &self,
        response: ResponseEnvelope,
    ) -> BoxFuture<'static, Result<ResponseEnvelope, FailureEnvelope>> {
        self(response).boxed()
    }
}

impl<F, Fut> ErrorInterceptor for F
where
    F: Fn(FailureEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = ErrorDisposition> + Send + 'static,
{
    fn intercept(&self, failure: FailureEnvelope) -> BoxFuture<'static, ErrorDisposition> {
        self(failure).boxed()
    }
}

trait DetachFrom: Send + Sync {
    fn detach(&self, id: u64);
}

/// Removes exactly one interceptor registration. Detaching twice, or after
/// the client is gone, does nothing.
pub struct InterceptorHandle {
    chain: Weak<dyn DetachFrom>,
    id: u64,
    detached: AtomicBool,
}

impl InterceptorHandle {
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(chain) = self.chain.upgrade() {
            chain.detach(self.id);
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for InterceptorHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("InterceptorHandle")
            .field("id", &self.id)
            .field("detached", &self.is_detached())
            .finish()
    }
}

struct ChainInner<I: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Arc<I>)>>,
}

impl<I: ?Sized + Send + Sync> DetachFrom for ChainInner<I> {
    fn detach(&self, id: u64) {
        lock_unpoisoned(&self.entries).retain(|(entry_id, _)| *entry_id != id);
    }
}

/// Ordered, append-only list of interceptors of one kind.
pub(crate) struct InterceptorChain<I: ?Sized> {
    inner: Arc<ChainInner<I>>,
}

impl<I: ?Sized + Send + Sync + 'static> InterceptorChain<I> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ChainInner {
                next_id: AtomicU64::new(0),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn register(&self, interceptor: Arc<I>) -> InterceptorHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock_unpoisoned(&self.inner.entries).push((id, interceptor));
        let inner: Arc<dyn DetachFrom> = self.inner.clone();
        InterceptorHandle {
            chain: Arc::downgrade(&inner),
            id,
            detached: AtomicBool::new(false),
        }
    }

    /// Registration-ordered copy; a chain run is unaffected by concurrent
    /// registration or detachment.
    pub(crate) fn snapshot(&self) -> Vec<Arc<I>> {
        lock_unpoisoned(&self.inner.entries)
            .iter()
            .map(|(_, interceptor)| Arc::clone(interceptor))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock_unpoisoned(&self.inner.entries).len()
    }
}

/// The three chains owned by one client.
pub(crate) struct Interceptors {
    pub(crate) request: InterceptorChain<dyn RequestInterceptor>,
    pub(crate) response: InterceptorChain<dyn ResponseInterceptor>,
    pub(crate) error: InterceptorChain<dyn ErrorInterceptor>,
}

impl Interceptors {
    pub(crate) fn new() -> Self {
        Self {
            request: InterceptorChain::new(),
            response: InterceptorChain::new(),
            error: InterceptorChain::new(),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_owned();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "interceptor panicked".to_owned()
}

/// Runs one interceptor step, turning a panic (while building or polling its
/// future) into an error message.
async fn guarded<T>(invoke: impl FnOnce() -> BoxFuture<'static, T>) -> Result<T, String> {
    let future = std::panic::catch_unwind(AssertUnwindSafe(invoke)).map_err(panic_message)?;
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(panic_message)
}

fn with_request_if_missing(
    mut failure: FailureEnvelope,
    request: &RequestDescriptor,
) -> FailureEnvelope {
    if failure.request.is_none() {
        failure.request = Some(Box::new(request.clone()));
    }
    failure
}

pub(crate) async fn run_request_chain(
    chain: &InterceptorChain<dyn RequestInterceptor>,
    mut request: RequestDescriptor,
) -> Result<RequestDescriptor, FailureEnvelope> {
    for interceptor in chain.snapshot() {
        let original = request.clone();
        request = match guarded(|| interceptor.intercept(request)).await {
            Ok(result) => result.map_err(|failure| with_request_if_missing(failure, &original))?,
            Err(message) => {
                warn!(panic = %message, "request interceptor panicked");
                return Err(FailureEnvelope::application(format!(
                    "request interceptor panicked: {message}"
                ))
                .with_request(original));
            }
        };
    }
    Ok(request)
}

pub(crate) async fn run_response_chain(
    chain: &InterceptorChain<dyn ResponseInterceptor>,
    mut response: ResponseEnvelope,
) -> Result<ResponseEnvelope, FailureEnvelope> {
    for interceptor in chain.snapshot() {
        let status = response.status;
        let original_request = response.request.clone();
        response = match guarded(|| interceptor.intercept(response)).await {
            Ok(result) => {
                result.map_err(|failure| with_request_if_missing(failure, &original_request))?
            }
            Err(message) => {
                warn!(panic = %message, "response interceptor panicked");
                return Err(FailureEnvelope::application(format!(
                    "response interceptor panicked: {message}"
                ))
                .with_status(status)
                .with_request(original_request));
            }
        };
    }
    Ok(response)
}

/// Folds a failure through the error chain. A panicking interceptor is
/// logged and skipped; the failure it received carries on unchanged.
pub(crate) async fn run_error_chain(
    chain: &InterceptorChain<dyn ErrorInterceptor>,
    mut failure: FailureEnvelope,
) -> ErrorDisposition {
    for interceptor in chain.snapshot() {
        let received = failure.clone();
        match guarded(|| interceptor.intercept(failure)).await {
            Ok(ErrorDisposition::Fail(next)) => failure = next,
            Ok(other) => return other,
            Err(message) => {
                warn!(panic = %message, failure = %received, "error interceptor panicked");
                failure = received;
            }
        }
    }
    ErrorDisposition::Fail(failure)
}
