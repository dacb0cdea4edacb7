use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ReqflowResult;
use crate::descriptor::RequestDescriptor;
use crate::error::{FailureEnvelope, TransportErrorKind};
use crate::response::{ResponseBody, ResponseEnvelope};
use crate::util::{classify_transport_error, redact_url_for_logs};

/// Raw outcome of one network round trip, before status interpretation.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Performs the network call for a fully prepared descriptor.
///
/// Implementations report only network-level failures
/// ([`FailureKind::Network`](crate::FailureKind::Network)); deadlines,
/// cancellation and status handling are applied around them.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: RequestDescriptor,
    ) -> BoxFuture<'static, Result<TransportResponse, FailureEnvelope>>;
}

type HyperClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Default transport: hyper with rustls (ring, webpki roots) over HTTP/1.1
/// and HTTP/2.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient,
}

impl HyperTransport {
    pub fn new() -> ReqflowResult<Self> {
        let connector = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| {
                FailureEnvelope::config(format!("failed to initialize tls backend: {source}"))
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self { client })
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

impl Transport for HyperTransport {
    fn send(
        &self,
        request: RequestDescriptor,
    ) -> BoxFuture<'static, Result<TransportResponse, FailureEnvelope>> {
        let client = self.client.clone();
        async move {
            let mut http_request = Request::builder()
                .method(request.method.clone())
                .uri(request.url.as_str())
                .body(Full::new(request.body.to_bytes()))
                .map_err(|source| {
                    FailureEnvelope::config(format!("failed to build http request: {source}"))
                })?;
            *http_request.headers_mut() = request.headers.clone();

            let response = round_trip(&client, http_request).await.map_err(|source| {
                let kind = classify_transport_error(&source);
                FailureEnvelope::network(kind, format!("http transport error ({kind}): {source}"))
            })?;
            collect_response(response).await
        }
        .boxed()
    }
}

async fn round_trip(
    client: &HyperClient,
    request: Request<Full<Bytes>>,
) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
    client.request(request).await
}

/// Buffers the whole body; a failure while streaming it is a `Read` error.
async fn collect_response<B>(response: Response<B>) -> Result<TransportResponse, FailureEnvelope>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|source| {
            FailureEnvelope::network(
                TransportErrorKind::Read,
                format!("failed to read response body: {source}"),
            )
        })?
        .to_bytes();
    Ok(TransportResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    })
}

/// One attempt: the transport call raced against the descriptor's timeout
/// and the caller's cancellation token. Dropping the losing branch aborts
/// the call and releases its timer.
pub(crate) async fn execute_attempt(
    transport: &dyn Transport,
    descriptor: &RequestDescriptor,
    cancellation: &CancellationToken,
) -> Result<ResponseEnvelope, FailureEnvelope> {
    let call = transport.send(descriptor.clone());
    let outcome = tokio::select! {
        biased;
        _ = cancellation.cancelled() => {
            return Err(FailureEnvelope::cancelled().with_request(descriptor.clone()));
        }
        outcome = timeout(descriptor.timeout, call) => outcome,
    };

    let raw = match outcome {
        Ok(Ok(raw)) => raw,
        Ok(Err(failure)) => return Err(failure.with_request(descriptor.clone())),
        Err(_elapsed) => {
            debug!(
                uri = %redact_url_for_logs(&descriptor.url),
                timeout_ms = descriptor.timeout.as_millis() as u64,
                "attempt timed out"
            );
            return Err(FailureEnvelope::timeout(descriptor.timeout.as_millis())
                .with_request(descriptor.clone()));
        }
    };

    let body = ResponseBody::decode(&raw.headers, raw.body);
    if !raw.status.is_success() {
        return Err(
            FailureEnvelope::http_status(raw.status, raw.headers, body)
                .with_request(descriptor.clone()),
        );
    }
    Ok(ResponseEnvelope::new(
        raw.status,
        raw.headers,
        body,
        descriptor.clone(),
    ))
}
