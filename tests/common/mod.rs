#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use reqflow::{
    FailureEnvelope, HttpClient, RequestDescriptor, RetryPolicy, Transport, TransportErrorKind,
    TransportResponse,
};
use tokio::time::Instant;

pub const BASE_URL: &str = "https://api.example.com";

/// One scripted transport outcome.
#[derive(Clone, Debug)]
pub enum Step {
    Respond {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: String,
        delay: Duration,
    },
    Fail(TransportErrorKind),
}

impl Step {
    pub fn json(status: u16, body: &str) -> Self {
        Self::Respond {
            status,
            headers: vec![("content-type", "application/json".to_owned())],
            body: body.to_owned(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self::Respond {
            status,
            headers: Vec::new(),
            body: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_header(self, name: &'static str, value: &str) -> Self {
        match self {
            Self::Respond {
                status,
                mut headers,
                body,
                delay,
            } => {
                headers.push((name, value.to_owned()));
                Self::Respond {
                    status,
                    headers,
                    body,
                    delay,
                }
            }
            other => other,
        }
    }

    pub fn delayed(self, by: Duration) -> Self {
        match self {
            Self::Respond {
                status,
                headers,
                body,
                ..
            } => Self::Respond {
                status,
                headers,
                body,
                delay: by,
            },
            other => other,
        }
    }
}

/// In-memory transport replaying a script. The last step repeats once the
/// script runs out.
#[derive(Clone)]
pub struct ScriptedTransport {
    inner: Arc<ScriptedInner>,
}

struct ScriptedInner {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    captured: Mutex<Vec<RequestDescriptor>>,
    call_times: Mutex<Vec<Instant>>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Self {
        assert!(!steps.is_empty(), "script needs at least one step");
        Self {
            inner: Arc::new(ScriptedInner {
                steps: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
                captured: Mutex::new(Vec::new()),
                call_times: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RequestDescriptor> {
        self.inner.captured.lock().expect("lock captured").clone()
    }

    /// Gaps between consecutive transport calls.
    pub fn call_gaps(&self) -> Vec<Duration> {
        let times = self.inner.call_times.lock().expect("lock call times");
        times
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect()
    }

    fn next_step(&self) -> Step {
        let mut steps = self.inner.steps.lock().expect("lock steps");
        if steps.len() > 1 {
            steps.pop_front().expect("non-empty script")
        } else {
            steps.front().cloned().expect("non-empty script")
        }
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        request: RequestDescriptor,
    ) -> BoxFuture<'static, Result<TransportResponse, FailureEnvelope>> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .call_times
            .lock()
            .expect("lock call times")
            .push(Instant::now());
        self.inner
            .captured
            .lock()
            .expect("lock captured")
            .push(request);
        let step = self.next_step();

        async move {
            match step {
                Step::Respond {
                    status,
                    headers,
                    body,
                    delay,
                } => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let mut header_map = HeaderMap::new();
                    for (name, value) in headers {
                        header_map.insert(
                            HeaderName::from_static(name),
                            HeaderValue::from_str(&value).expect("valid scripted header"),
                        );
                    }
                    Ok(TransportResponse {
                        status: StatusCode::from_u16(status).expect("valid scripted status"),
                        headers: header_map,
                        body: Bytes::from(body),
                    })
                }
                Step::Fail(kind) => Err(FailureEnvelope::network(kind, "scripted network failure")),
            }
        }
        .boxed()
    }
}

pub fn client_with(transport: &ScriptedTransport) -> HttpClient {
    HttpClient::builder(BASE_URL)
        .transport(transport.clone())
        .try_build()
        .expect("client should build")
}

pub fn client_with_retry(transport: &ScriptedTransport, retry_policy: RetryPolicy) -> HttpClient {
    HttpClient::builder(BASE_URL)
        .transport(transport.clone())
        .retry_policy(retry_policy)
        .try_build()
        .expect("client should build")
}

pub fn json_content_type(request: &RequestDescriptor) -> Option<&str> {
    request
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
}
