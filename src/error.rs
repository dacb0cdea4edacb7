use http::{HeaderMap, StatusCode};
use thiserror::Error;

use crate::descriptor::RequestDescriptor;
use crate::response::ResponseBody;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Classification of a failed request, decided once where the failure is
/// first observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailureKind {
    /// Malformed URL, header or body; never retried.
    Config,
    /// No response was received at all.
    Network,
    /// The per-attempt deadline elapsed before a response arrived.
    Timeout,
    /// A response arrived with a status outside `[200, 300)`.
    HttpStatus,
    /// Raised by an interceptor.
    Application,
    /// The caller cancelled the request.
    Cancelled,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::HttpStatus => "http_status",
            Self::Application => "application",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// The single structured failure a caller observes.
///
/// Envelopes are plain values: they are cloned out of a shared in-flight
/// outcome to every joined caller, and error interceptors receive and return
/// them by value.
#[derive(Clone, Debug, Error)]
#[error("{kind} failure: {message}")]
pub struct FailureEnvelope {
    pub kind: FailureKind,
    pub message: String,
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Option<ResponseBody>,
    pub transport_error_kind: Option<TransportErrorKind>,
    pub request: Option<Box<RequestDescriptor>>,
}

impl FailureEnvelope {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            headers: HeaderMap::new(),
            body: None,
            transport_error_kind: None,
            request: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Config, message)
    }

    pub fn network(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        let mut failure = Self::new(FailureKind::Network, message);
        failure.transport_error_kind = Some(kind);
        failure
    }

    pub fn timeout(timeout_ms: u128) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("request timed out after {timeout_ms}ms"),
        )
    }

    pub fn http_status(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        let reason = status.canonical_reason().unwrap_or("unknown status");
        let mut failure = Self::new(
            FailureKind::HttpStatus,
            format!("http status {} {reason}", status.as_u16()),
        );
        failure.status = Some(status);
        failure.headers = headers;
        failure.body = Some(body);
        failure
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Application, message)
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "request cancelled by caller")
    }

    pub fn with_request(mut self, request: RequestDescriptor) -> Self {
        self.request = Some(Box::new(request));
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status.map(|status| status.as_u16())
    }

    /// Stable code used for metrics and logs, e.g. `http_status:503`.
    pub fn code(&self) -> String {
        match (self.kind, self.status, self.transport_error_kind) {
            (FailureKind::HttpStatus, Some(status), _) => {
                format!("http_status:{}", status.as_u16())
            }
            (FailureKind::Network, _, Some(kind)) => format!("network:{kind}"),
            (kind, _, _) => kind.as_str().to_owned(),
        }
    }
}
