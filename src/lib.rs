//! `reqflow` is an HTTP request pipeline for API SDKs: interceptor chains,
//! a TTL response cache, in-flight deduplication and retry with exponential
//! backoff in front of a hyper transport.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqflow::prelude::{HttpClient, ResponseEnvelope};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Document {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::builder("https://api.example.com")
//!         .request_timeout(Duration::from_secs(5))
//!         .retry_config(3, Duration::from_millis(200))
//!         .try_build()?;
//!
//!     client.add_request_interceptor(|mut request: reqflow::RequestDescriptor| async move {
//!         request.headers.insert(
//!             http::header::AUTHORIZATION,
//!             http::HeaderValue::from_static("Bearer demo-token"),
//!         );
//!         Ok::<_, reqflow::FailureEnvelope>(request)
//!     });
//!
//!     let documents: Vec<Document> = client
//!         .get("/documents")
//!         .param("owned", true)
//!         .send_json()
//!         .await?;
//!     println!("documents={}", documents.len());
//!
//!     let created: ResponseEnvelope = client
//!         .post("/documents")
//!         .idempotency_key("create-document-001")?
//!         .json(&serde_json::json!({ "title": "draft" }))?
//!         .send()
//!         .await?;
//!     client.invalidate_cache("/documents")?;
//!     println!("status={}", created.status());
//!     Ok(())
//! }
//! ```
//!
//! # Pipeline
//!
//! Every request runs: request interceptors, fingerprint, in-flight join or
//! reserve, cache lookup, transport attempts with retries, response
//! interceptors, cache write. Failures at any stage are folded through the
//! error interceptors and reach the caller as one [`FailureEnvelope`].

pub(crate) const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

mod cache;
mod client;
mod config;
mod descriptor;
mod error;
mod fingerprint;
mod inflight;
mod interceptor;
mod metrics;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::cache::ResponseCache;
pub use crate::client::{HttpClient, HttpClientBuilder, default_client};
pub use crate::config::ClientConfig;
pub use crate::descriptor::{CachePolicy, RequestBody, RequestDescriptor, RequestOptions};
pub use crate::error::{FailureEnvelope, FailureKind, TransportErrorKind};
pub use crate::fingerprint::Fingerprint;
pub use crate::interceptor::{
    ErrorDisposition, ErrorInterceptor, InterceptorHandle, RequestInterceptor,
    ResponseInterceptor,
};
pub use crate::metrics::PipelineMetricsSnapshot;
pub use crate::request::RequestBuilder;
pub use crate::response::{ResponseBody, ResponseEnvelope};
pub use crate::retry::{RetryClassifier, RetryDecision, RetryPolicy};
pub use crate::transport::{HyperTransport, Transport, TransportResponse};

pub type ReqflowResult<T> = std::result::Result<T, FailureEnvelope>;

pub mod prelude {
    pub use crate::{
        CachePolicy, ClientConfig, ErrorDisposition, FailureEnvelope, FailureKind, HttpClient,
        InterceptorHandle, ReqflowResult, RequestBody, RequestDescriptor, RequestOptions,
        ResponseBody, ResponseEnvelope, RetryPolicy, Transport, TransportResponse,
    };
}
